use std::path::PathBuf;
use std::time::Duration;

use backup_core::{DestinationKind, EngineSettings};
use clap::{Args, Parser, Subcommand};

/// Configuration for the backupctl binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "backupctl")]
#[command(about = "Build backups and distribute them to storage destinations in short, resumable steps")]
pub struct Config {
    /// Directory holding jobs, sessions, destinations and locks
    #[arg(long, env = "BACKUP_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Directory where artifacts are built
    #[arg(long, env = "BACKUP_STAGING_DIR", global = true)]
    pub staging_dir: Option<PathBuf>,

    /// Consecutive retryable failures before a destination gives up
    #[arg(long, default_value = "10", env = "BACKUP_MAX_RETRIES", global = true)]
    pub max_retries: u32,

    /// Wall-clock budget of one step, in seconds (0 = one chunk per step)
    #[arg(long, default_value = "20", env = "BACKUP_STEP_BUDGET_SECS", global = true)]
    pub step_budget_secs: u64,

    /// Upper bound on bytes one transfer step may move
    #[arg(long, env = "BACKUP_SLICE_BYTES", global = true)]
    pub slice_bytes: Option<u64>,

    /// Expiry of record locks, in seconds
    #[arg(long, default_value = "900", env = "BACKUP_LOCK_TTL_SECS", global = true)]
    pub lock_ttl_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Get the effective state directory.
    pub fn effective_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("backupctl")
        })
    }

    /// Get the effective staging directory.
    pub fn effective_staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.effective_state_dir().join("staging"))
    }

    pub fn step_budget(&self) -> Duration {
        Duration::from_secs(self.step_budget_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_retries: self.max_retries.max(1),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            slice_bytes: self.slice_bytes,
            ..EngineSettings::default()
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Manage storage destinations
    #[command(subcommand)]
    Destination(DestinationCommand),

    /// Create a backup job and print its id
    Create(CreateArgs),

    /// Create a backup job and step it until it finishes
    #[command(visible_alias = "run")]
    Build(CreateArgs),

    /// Run one step of a job, or every step with --until-done
    Advance {
        job_id: String,
        #[arg(long)]
        until_done: bool,
    },

    /// Request cancellation; the next step acts on it
    Cancel { job_id: String },

    /// Show one job, or all of them
    Status {
        job_id: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check that completed jobs still have an artifact somewhere
    Reconcile {
        /// Skip jobs checked more recently than this
        #[arg(long, default_value = "600")]
        min_interval_secs: u64,
        /// Delete jobs whose artifacts are gone everywhere
        #[arg(long)]
        delete: bool,
        /// Keep going until every due job has been checked
        #[arg(long)]
        all: bool,
    },

    /// Fetch an artifact back from a destination
    Download {
        destination: String,
        remote_path: String,
        target: PathBuf,
    },

    /// Delete a finished job
    Delete { job_id: String },

    /// Inspect the engine lock
    #[command(subcommand)]
    Lock(LockCommand),
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Artifact name prefix
    pub name: String,
    /// Directory or file to back up
    pub source: String,
    /// Destination ids, in transfer order
    #[arg(short, long = "destination", required = true)]
    pub destinations: Vec<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum DestinationCommand {
    /// Add or replace a destination
    Add(DestinationArgs),
    /// List configured destinations
    List,
    /// Remove a destination
    Remove { id: String },
    /// Initialize a destination and check it is usable
    Check { id: String },
}

#[derive(Args, Debug, Clone)]
pub struct DestinationArgs {
    pub id: String,

    #[arg(long, default_value = "local")]
    pub kind: DestinationKindArg,

    /// Directory, key prefix or remote path prefix
    #[arg(long, default_value = "")]
    pub root: String,

    /// Sub-folder under the root for artifacts
    #[arg(long)]
    pub folder: Option<String>,

    /// Service URL (S3-compatible endpoint or HTTP upload service)
    #[arg(long)]
    pub endpoint: Option<String>,

    #[arg(long)]
    pub bucket: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    /// Environment variable holding the bearer token
    #[arg(long)]
    pub token_env: Option<String>,

    /// Keep only this many recent artifacts per job name
    #[arg(long)]
    pub keep_recent: Option<u32>,

    #[arg(long)]
    pub chunk_size: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum LockCommand {
    /// Show the lock kind and current holder
    Status,
    /// Re-run the file lock capability probe and record the result
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DestinationKindArg {
    Local,
    S3,
    Http,
}

impl From<DestinationKindArg> for DestinationKind {
    fn from(kind: DestinationKindArg) -> Self {
        match kind {
            DestinationKindArg::Local => DestinationKind::Local,
            DestinationKindArg::S3 => DestinationKind::S3,
            DestinationKindArg::Http => DestinationKind::Http,
        }
    }
}

impl std::fmt::Display for DestinationKindArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", DestinationKind::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build() {
        let config = Config::try_parse_from([
            "backupctl",
            "--state-dir",
            "/tmp/state",
            "build",
            "site",
            "/srv/www",
            "-d",
            "nas",
            "-d",
            "offsite",
        ])
        .unwrap();
        assert_eq!(config.effective_staging_dir(), PathBuf::from("/tmp/state/staging"));
        match config.command {
            Command::Build(args) => assert_eq!(args.destinations, vec!["nas", "offsite"]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_build_requires_a_destination() {
        assert!(Config::try_parse_from(["backupctl", "build", "site", "/srv/www"]).is_err());
    }

    #[test]
    fn test_run_is_an_alias_of_build() {
        let config =
            Config::try_parse_from(["backupctl", "run", "site", "/srv/www", "-d", "nas"]).unwrap();
        assert!(matches!(config.command, Command::Build(_)));
    }

    #[test]
    fn test_destination_kind() {
        let config = Config::try_parse_from([
            "backupctl",
            "destination",
            "add",
            "offsite",
            "--kind",
            "s3",
            "--bucket",
            "backups",
        ])
        .unwrap();
        match config.command {
            Command::Destination(DestinationCommand::Add(args)) => {
                assert_eq!(DestinationKind::from(args.kind), DestinationKind::S3);
                assert_eq!(args.bucket.as_deref(), Some("backups"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_engine_settings() {
        let config = Config::try_parse_from([
            "backupctl",
            "--max-retries",
            "3",
            "--slice-bytes",
            "1048576",
            "lock",
            "status",
        ])
        .unwrap();
        let settings = config.engine_settings();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.slice_bytes, Some(1048576));
        assert_eq!(settings.lock_name, "backup-engine");
    }
}
