use std::fmt::Display;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use backup_core::{
    Artifact, ArtifactBuilder, BackupJob, BuildError, BuildProgress, ScanProgress, SliceBudget,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::store::{read_json, write_json};

const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// File extension of built artifacts.
pub const ARTIFACT_EXTENSION: &str = "bundle";

/// A file found by the scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestEntry {
    /// `/`-separated path inside the source tree
    name: String,
    source: PathBuf,
    size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
    /// Directories still to enumerate, relative to the source root
    pending_dirs: Vec<String>,
    complete: bool,
}

/// Where the build stopped last time.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BuildState {
    entry: usize,
    entry_offset: u64,
    header_written: bool,
    /// Bytes of the artifact known to be good
    written: u64,
    #[serde(default)]
    sha256: Option<String>,
}

/// Header line written before each file's content.
#[derive(Debug, Serialize)]
struct EntryHeader<'a> {
    path: &'a str,
    size: u64,
}

/// Builds a single-file bundle out of a local directory (or file) named by
/// `job.source`.
///
/// Each job gets `{staging_root}/{job_id}/` holding the scan manifest, the
/// build cursor and the artifact itself. Every call resumes from the cursor,
/// so an invocation killed mid-slice only loses the bytes written after the
/// last saved cursor; those are truncated away on the next call.
///
/// The bundle is a sequence of `{"path":..,"size":..}\n` headers, each
/// followed by that many bytes of content.
#[derive(Debug, Clone)]
pub struct StagingBuilder {
    staging_root: PathBuf,
    chunk_size: usize,
}

fn retryable(context: &str, e: impl Display) -> BuildError {
    BuildError::Retryable(format!("{}: {}", context, e))
}

impl StagingBuilder {
    pub fn new(staging_root: impl AsRef<Path>) -> Self {
        Self {
            staging_root: staging_root.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.staging_root.join(job_id)
    }

    fn manifest_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("manifest.json")
    }

    fn state_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("build.json")
    }

    /// Artifact file name; stable for the lifetime of the job.
    pub fn artifact_name(job: &BackupJob) -> String {
        format!(
            "{}-{}.{}",
            job.name,
            job.created_at.format("%Y%m%d-%H%M%S"),
            ARTIFACT_EXTENSION
        )
    }

    async fn initial_manifest(source: &Path) -> Result<Manifest, BuildError> {
        let meta = match fs::metadata(source).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BuildError::Fatal(format!(
                    "Source {} does not exist",
                    source.display()
                )))
            }
            Err(e) => return Err(retryable("Failed to stat source", e)),
        };

        if meta.is_file() {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "source".to_string());
            return Ok(Manifest {
                entries: vec![ManifestEntry {
                    name,
                    source: source.to_path_buf(),
                    size: meta.len(),
                }],
                pending_dirs: vec![],
                complete: true,
            });
        }
        if !meta.is_dir() {
            return Err(BuildError::Fatal(format!(
                "Source {} is neither a file nor a directory",
                source.display()
            )));
        }
        Ok(Manifest {
            pending_dirs: vec![String::new()],
            ..Default::default()
        })
    }

    async fn scan_dir(
        source_root: &Path,
        relative: &str,
        manifest: &mut Manifest,
    ) -> Result<(), BuildError> {
        let dir = if relative.is_empty() {
            source_root.to_path_buf()
        } else {
            source_root.join(relative)
        };
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| retryable(&format!("Failed to read {}", dir.display()), e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| retryable(&format!("Failed to read {}", dir.display()), e))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let name = if relative.is_empty() {
                file_name
            } else {
                format!("{}/{}", relative, file_name)
            };
            // Symlinks are not followed
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            if meta.is_dir() {
                manifest.pending_dirs.push(name);
            } else if meta.is_file() {
                manifest.entries.push(ManifestEntry {
                    name,
                    source: entry.path(),
                    size: meta.len(),
                });
            }
        }
        Ok(())
    }

    async fn load_manifest(&self, job_id: &str) -> Result<Manifest, BuildError> {
        read_json(&self.manifest_path(job_id))
            .await
            .map_err(|e| retryable("Failed to load manifest", e))?
            .ok_or_else(|| BuildError::Fatal(format!("Job {} has not been scanned", job_id)))
    }

    /// Write the remaining content of `entry`, one chunk at a time, until the
    /// entry is done or the budget runs out. Returns true once the entry is
    /// fully written.
    async fn copy_entry(
        &self,
        entry: &ManifestEntry,
        out: &mut fs::File,
        state: &mut BuildState,
        budget: &SliceBudget,
    ) -> Result<bool, BuildError> {
        if !state.header_written {
            let header = serde_json::to_string(&EntryHeader {
                path: &entry.name,
                size: entry.size,
            })
            .map_err(|e| BuildError::Fatal(format!("Failed to encode header: {}", e)))?;
            let line = format!("{}\n", header);
            out.write_all(line.as_bytes())
                .await
                .map_err(|e| retryable("Failed to write artifact", e))?;
            state.written += line.len() as u64;
            state.header_written = true;
        }

        if state.entry_offset >= entry.size {
            return Ok(true);
        }

        let mut input = match fs::File::open(&entry.source).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BuildError::Fatal(format!(
                    "{} disappeared during the build",
                    entry.source.display()
                )))
            }
            Err(e) => return Err(retryable("Failed to open source", e)),
        };
        input
            .seek(SeekFrom::Start(state.entry_offset))
            .await
            .map_err(|e| retryable("Failed to seek source", e))?;

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let want = (entry.size - state.entry_offset).min(self.chunk_size as u64) as usize;
            let n = input
                .read(&mut buf[..want])
                .await
                .map_err(|e| retryable("Failed to read source", e))?;
            if n == 0 {
                return Err(BuildError::Fatal(format!(
                    "{} shrank during the build ({} of {} bytes)",
                    entry.source.display(),
                    state.entry_offset,
                    entry.size
                )));
            }
            out.write_all(&buf[..n])
                .await
                .map_err(|e| retryable("Failed to write artifact", e))?;
            state.entry_offset += n as u64;
            state.written += n as u64;

            if state.entry_offset >= entry.size {
                return Ok(true);
            }
            if budget.should_stop() {
                return Ok(false);
            }
        }
    }

    async fn checksum(path: &Path) -> Result<String, BuildError> {
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| retryable("Failed to open artifact", e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| retryable("Failed to read artifact", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl ArtifactBuilder for StagingBuilder {
    #[instrument(skip(self, job), level = "debug", fields(job = %job.id))]
    async fn scan(&self, job: &BackupJob, budget: Duration) -> Result<ScanProgress, BuildError> {
        let path = self.manifest_path(&job.id);
        let source = PathBuf::from(&job.source);
        let mut manifest = match read_json::<Manifest>(&path)
            .await
            .map_err(|e| retryable("Failed to load manifest", e))?
        {
            Some(manifest) => manifest,
            None => Self::initial_manifest(&source).await?,
        };

        let budget = SliceBudget::start(budget);
        while let Some(dir) = manifest.pending_dirs.pop() {
            if let Err(e) = Self::scan_dir(&source, &dir, &mut manifest).await {
                manifest.pending_dirs.push(dir);
                return Err(e);
            }
            if budget.should_stop() {
                break;
            }
        }

        if manifest.pending_dirs.is_empty() && !manifest.complete {
            manifest.entries.sort_by(|a, b| a.name.cmp(&b.name));
            manifest.complete = true;
            info!(
                "Scanned {} files ({} bytes) for job {}",
                manifest.entries.len(),
                manifest.entries.iter().map(|e| e.size).sum::<u64>(),
                job.id
            );
        }

        write_json(&path, &manifest)
            .await
            .map_err(|e| retryable("Failed to save manifest", e))?;

        Ok(if manifest.complete {
            ScanProgress::Done
        } else {
            ScanProgress::Pending
        })
    }

    #[instrument(skip(self, job), level = "debug", fields(job = %job.id))]
    async fn build(&self, job: &BackupJob, budget: Duration) -> Result<BuildProgress, BuildError> {
        let manifest = self.load_manifest(&job.id).await?;
        if !manifest.complete {
            return Err(BuildError::Fatal(format!(
                "Job {} scan is not finished",
                job.id
            )));
        }

        let file_name = Self::artifact_name(job);
        let artifact_path = self.job_dir(&job.id).join(&file_name);
        let state_path = self.state_path(&job.id);
        let mut state: BuildState = read_json(&state_path)
            .await
            .map_err(|e| retryable("Failed to load build state", e))?
            .unwrap_or_default();

        if let Some(sha256) = &state.sha256 {
            return Ok(BuildProgress::Materialized(Artifact {
                file_name,
                path: artifact_path,
                size: state.written,
                sha256: Some(sha256.clone()),
            }));
        }

        let mut out = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&artifact_path)
            .await
            .map_err(|e| retryable("Failed to open artifact", e))?;
        // Drop anything written after the last saved cursor
        out.set_len(state.written)
            .await
            .map_err(|e| retryable("Failed to truncate artifact", e))?;
        out.seek(SeekFrom::Start(state.written))
            .await
            .map_err(|e| retryable("Failed to seek artifact", e))?;

        let budget = SliceBudget::start(budget);
        while state.entry < manifest.entries.len() {
            let entry = &manifest.entries[state.entry];
            let done = self.copy_entry(entry, &mut out, &mut state, &budget).await?;
            if done {
                state.entry += 1;
                state.entry_offset = 0;
                state.header_written = false;
            }
            if state.entry < manifest.entries.len() && budget.should_stop() {
                break;
            }
        }

        out.sync_data()
            .await
            .map_err(|e| retryable("Failed to sync artifact", e))?;
        drop(out);

        if state.entry < manifest.entries.len() {
            debug!(
                "Built {} bytes, {} of {} files",
                state.written,
                state.entry,
                manifest.entries.len()
            );
            write_json(&state_path, &state)
                .await
                .map_err(|e| retryable("Failed to save build state", e))?;
            return Ok(BuildProgress::Pending);
        }

        let sha256 = Self::checksum(&artifact_path).await?;
        state.sha256 = Some(sha256.clone());
        write_json(&state_path, &state)
            .await
            .map_err(|e| retryable("Failed to save build state", e))?;
        info!(
            "Materialized {} ({} bytes, sha256 {})",
            file_name, state.written, sha256
        );

        Ok(BuildProgress::Materialized(Artifact {
            file_name,
            path: artifact_path,
            size: state.written,
            sha256: Some(sha256),
        }))
    }

    #[instrument(skip(self, job), level = "debug", fields(job = %job.id))]
    async fn discard(&self, job: &BackupJob) -> Result<(), BuildError> {
        let dir = self.job_dir(&job.id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Removed staging dir {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(retryable(&format!("Failed to remove {}", dir.display()), e)),
        }
    }
}
