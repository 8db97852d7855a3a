use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use backup_core::{
    AdapterFactory, AdvanceOutcome, DestinationKind, Engine, JobSnapshot, JobStore, LockKind,
    LockManager, RecordLock, StorageDestination,
};
use backup_storage_local::{
    probe_and_record, select_lock_manager, FileLock, JsonStateStore, StagingBuilder,
};
use tracing::{info, warn};

use crate::config::{Config, CreateArgs, DestinationArgs, DestinationCommand, LockCommand};
use crate::registry::DefaultAdapterFactory;

/// Everything one invocation works with.
pub struct Context {
    pub engine: Engine,
    pub store: Arc<JsonStateStore>,
    pub state_dir: PathBuf,
    pub budget: Duration,
}

impl Context {
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let state_dir = config.effective_state_dir();
        let staging_dir = config.effective_staging_dir();
        info!("  State dir: {}", state_dir.display());
        info!("  Staging dir: {}", staging_dir.display());

        let store = Arc::new(JsonStateStore::new(&state_dir));
        let lock = select_lock_manager(store.clone(), &state_dir)
            .await
            .context("selecting a lock manager")?;
        info!("  Lock: {}", lock.lock_kind());

        let engine = Engine::new(
            store.clone(),
            store.clone(),
            lock,
            Arc::new(DefaultAdapterFactory),
            Arc::new(StagingBuilder::new(&staging_dir)),
        )
        .with_settings(config.engine_settings());

        Ok(Self {
            engine,
            store,
            state_dir,
            budget: config.step_budget(),
        })
    }
}

// =============================================================================
// Destinations
// =============================================================================

fn destination_from_args(args: DestinationArgs) -> StorageDestination {
    let mut destination = StorageDestination::new(args.id, args.kind.into(), args.root);
    destination.folder = args.folder;
    destination.endpoint = args.endpoint;
    destination.bucket = args.bucket;
    destination.region = args.region;
    destination.token_env = args.token_env;
    destination.keep_recent = args.keep_recent;
    destination.chunk_size = args.chunk_size;
    destination
}

pub async fn destination(ctx: &Context, command: DestinationCommand) -> anyhow::Result<()> {
    match command {
        DestinationCommand::Add(args) => {
            let destination = destination_from_args(args);
            match destination.kind {
                DestinationKind::S3 if destination.bucket.is_none() => {
                    bail!("s3 destinations need --bucket")
                }
                DestinationKind::Http if destination.endpoint.is_none() => {
                    bail!("http destinations need --endpoint")
                }
                DestinationKind::Local if destination.root.is_empty() => {
                    bail!("local destinations need --root")
                }
                _ => {}
            }
            ctx.store.save_destination(&destination).await?;
            println!("Saved destination {} ({})", destination.id, destination.kind);
        }
        DestinationCommand::List => {
            for d in ctx.store.list_destinations().await? {
                let location = match d.kind {
                    DestinationKind::Local => d.root.clone(),
                    DestinationKind::S3 => format!(
                        "s3://{}/{}",
                        d.bucket.as_deref().unwrap_or("?"),
                        d.root
                    ),
                    DestinationKind::Http => d.endpoint.clone().unwrap_or_default(),
                };
                println!(
                    "{:<16} {:<6} {} folder={} keep={}",
                    d.id,
                    d.kind.as_str(),
                    location,
                    d.artifact_folder(),
                    d.keep_recent
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "all".to_string())
                );
            }
        }
        DestinationCommand::Remove { id } => {
            if ctx.store.delete_destination(&id).await? {
                println!("Removed destination {}", id);
            } else {
                bail!("no destination {}", id);
            }
        }
        DestinationCommand::Check { id } => {
            let destination = ctx
                .store
                .load_destination(&id)
                .await?
                .with_context(|| format!("no destination {}", id))?;
            let adapter = DefaultAdapterFactory.adapter_for(&destination).await?;
            adapter.initialize().await?;
            if !adapter.is_valid().await {
                bail!("destination {} is not usable", id);
            }
            println!("Destination {} is ready", id);
        }
    }
    Ok(())
}

// =============================================================================
// Jobs
// =============================================================================

pub async fn create(ctx: &Context, args: &CreateArgs) -> anyhow::Result<String> {
    let source = Path::new(&args.source);
    let source = source
        .canonicalize()
        .with_context(|| format!("source {}", source.display()))?;
    let snapshot = ctx
        .engine
        .create_job(&args.name, &source.to_string_lossy(), &args.destinations)
        .await?;
    println!("{}", snapshot.job_id);
    Ok(snapshot.job_id)
}

/// Step a job once, or until it reaches a terminal phase.
pub async fn advance(
    ctx: &Context,
    job_id: &str,
    until_done: bool,
) -> anyhow::Result<JobSnapshot> {
    loop {
        let snapshot = match ctx.engine.advance(job_id, ctx.budget).await? {
            AdvanceOutcome::Busy => {
                warn!("Another invocation holds the engine lock; try again later");
                return Ok(ctx.engine.snapshot(job_id).await?);
            }
            AdvanceOutcome::Advanced { snapshot, .. } => snapshot,
        };
        if !until_done || snapshot.phase.is_terminal() {
            return Ok(snapshot);
        }
    }
}

pub async fn cancel(ctx: &Context, job_id: &str) -> anyhow::Result<()> {
    if ctx.engine.request_cancel(job_id).await? {
        println!("Cancellation of {} requested", job_id);
    } else {
        println!("Job {} already finished", job_id);
    }
    Ok(())
}

pub async fn delete(ctx: &Context, job_id: &str) -> anyhow::Result<()> {
    match ctx.engine.delete_job(job_id).await? {
        Some(()) => println!("Deleted job {}", job_id),
        None => bail!("the engine is busy; try again later"),
    }
    Ok(())
}

pub fn print_snapshot(snapshot: &JobSnapshot) {
    println!(
        "{} {} [{}] retries={} updated={}",
        snapshot.job_id,
        snapshot.name,
        snapshot.phase,
        snapshot.retry_count,
        snapshot.updated_at.to_rfc3339()
    );
    if let Some(artifact) = &snapshot.artifact {
        println!(
            "  artifact {} ({} bytes{})",
            artifact.file_name,
            artifact.size,
            artifact
                .sha256
                .as_deref()
                .map(|s| format!(", sha256 {}", s))
                .unwrap_or_default()
        );
    }
    if let Some(error) = &snapshot.last_error {
        println!("  error: {}", error);
    }
    if snapshot.marked_for_deletion {
        println!("  no copy of the artifact is left at any destination");
    }
    for d in &snapshot.destinations {
        let exists = match d.exists {
            Some(true) => "present",
            Some(false) => "missing",
            None => "unchecked",
        };
        println!(
            "  {:<16} {:<11} {:>5.1}% {} bytes retries={} {}{}",
            d.destination_id,
            d.status.as_str(),
            d.percent,
            d.bytes_transferred,
            d.retry_count,
            exists,
            d.last_error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
}

pub async fn status(ctx: &Context, job_id: Option<&str>, json: bool) -> anyhow::Result<()> {
    let snapshots = match job_id {
        Some(id) => vec![ctx.engine.snapshot(id).await?],
        None => ctx.engine.list_jobs().await?,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }
    for snapshot in &snapshots {
        print_snapshot(snapshot);
    }
    Ok(())
}

pub async fn reconcile(
    ctx: &Context,
    min_interval: Duration,
    prune: bool,
    all: bool,
) -> anyhow::Result<()> {
    let reconciler = ctx.engine.reconciler();
    let (mut processed, mut marked, mut purged) = (0, 0, 0);
    loop {
        let report = reconciler.process_next_chunk(min_interval, prune).await?;
        if report.busy {
            warn!("Another invocation holds the engine lock; try again later");
            break;
        }
        processed += report.processed;
        marked += report.marked;
        purged += report.purged;
        if !all || report.processed == 0 {
            break;
        }
    }
    println!(
        "Checked {} job(s): {} without any copy, {} deleted",
        processed, marked, purged
    );
    Ok(())
}

pub async fn download(
    ctx: &Context,
    destination_id: &str,
    remote_path: &str,
    target: &Path,
) -> anyhow::Result<()> {
    let max_retries = ctx.engine.settings().max_retries;
    let mut failures = 0;
    loop {
        let Some(progress) = ctx
            .engine
            .download(destination_id, remote_path, target, ctx.budget)
            .await?
        else {
            bail!("the engine is busy; try again later");
        };
        if progress.complete {
            println!(
                "Downloaded {} bytes to {}",
                progress.total_size,
                target.display()
            );
            return Ok(());
        }
        match progress.interrupted {
            Some(reason) => {
                failures += 1;
                if failures >= max_retries {
                    bail!("download gave up after {} attempts: {}", failures, reason);
                }
                warn!("Download interrupted ({}/{}): {}", failures, max_retries, reason);
            }
            None => failures = 0,
        }
        info!(
            "Downloaded {}/{} bytes",
            progress.bytes_transferred, progress.total_size
        );
    }
}

// =============================================================================
// Lock
// =============================================================================

pub async fn lock(ctx: &Context, command: LockCommand) -> anyhow::Result<()> {
    let name = ctx.engine.settings().lock_name.clone();
    match command {
        LockCommand::Probe => {
            let kind = probe_and_record(ctx.store.as_ref(), &ctx.state_dir).await?;
            let verdict = match kind {
                LockKind::File => "work",
                LockKind::Record => "are not reliable",
            };
            println!("File locks {}; using {} locks", verdict, kind);
        }
        LockCommand::Status => {
            let settings = ctx.store.load_settings().await?;
            let kind = ctx.engine.lock_manager().lock_kind();
            println!(
                "Lock kind: {} (probed {})",
                kind,
                settings
                    .probed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            match kind {
                LockKind::Record => {
                    match RecordLock::new(ctx.store.clone()).holder(&name).await? {
                        Some(record) => println!(
                            "Held by {} since {} (expires {})",
                            record.holder_id,
                            record.acquired_at.to_rfc3339(),
                            record.expires_at.to_rfc3339()
                        ),
                        None => println!("Free"),
                    }
                }
                LockKind::File => {
                    let probe = FileLock::new(&ctx.state_dir);
                    let holder = Engine::new_holder_id();
                    let result = probe.acquire(&name, &holder, Duration::from_secs(1)).await?;
                    if result.acquired {
                        probe.release(&name, &holder).await?;
                        println!("Free");
                    } else {
                        println!("Held by another process");
                    }
                }
            }
        }
    }
    Ok(())
}
