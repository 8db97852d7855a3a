use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use backup_core::adapter::window_end;
use backup_core::path::{segments, validate_relative};
use backup_core::retention::PARTIAL_SUFFIX;
use backup_core::{
    ContinuationToken, CopyOutcome, DestinationKind, DirEntry, SliceBudget, StorageAdapter,
    StorageDestination, StorageError, TransferError, TransferSession,
};
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Default chunk size for local copies.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Destination backed by a directory tree.
///
/// In-flight uploads are written to `<dest>.part`; that file is the
/// continuation token and its length is the authoritative offset. The final
/// rename publishes the artifact in one step.
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    root: PathBuf,
    chunk_size: u64,
}

impl LocalAdapter {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn from_destination(destination: &StorageDestination) -> Self {
        Self::new(&destination.root)
            .with_chunk_size(destination.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE))
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_relative(path)?;
        Ok(segments(path).fold(self.root.clone(), |acc, s| acc.join(s)))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Io(format!("Failed to {} {}: {}", action, path.display(), e))
}

async fn file_len(path: &Path) -> Result<Option<u64>, StorageError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("stat", path, e)),
    }
}

/// Which side of a copy failed.
#[derive(Debug, Clone, Copy)]
enum Side {
    /// Reading from the source
    Read,
    /// Writing to the partial file
    Write,
}

/// Bring `session` in line with the partial file and return the start offset.
///
/// A fresh session truncates any leftover partial file. An existing session
/// takes the partial file's length as the truth.
async fn prepare_partial(
    part: &Path,
    final_path: &Path,
    handle: String,
    session: &mut TransferSession,
) -> Result<u64, TransferError> {
    if session.is_fresh() {
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create dir", parent, e))?;
        }
        fs::File::create(part)
            .await
            .map_err(|e| io_error("create", part, e))?;
        session.establish(ContinuationToken::new(handle));
        return Ok(0);
    }

    match file_len(part).await? {
        Some(len) if len <= session.total_size => {
            session.resync(len);
            Ok(len)
        }
        Some(len) => Err(TransferError::SizeMismatch {
            expected: session.total_size,
            actual: len,
        }),
        None => {
            // Finalized by an invocation that died before recording it.
            if file_len(final_path).await? == Some(session.total_size) {
                session.resync(session.total_size);
                return Ok(session.total_size);
            }
            Err(TransferError::SessionExpired(format!(
                "partial file {} is gone",
                part.display()
            )))
        }
    }
}

/// Append `[start, end)` of `source` to `part`, chunk by chunk, within `budget`.
async fn pump(
    source: &Path,
    part: &Path,
    start: u64,
    end: u64,
    chunk_size: u64,
    budget: SliceBudget,
    session: &mut TransferSession,
) -> Result<(u64, Option<String>), TransferError> {
    if start >= end {
        return Ok((0, None));
    }
    let mut reader = fs::File::open(source)
        .await
        .map_err(|e| TransferError::Source(format!("{}: {}", source.display(), e)))?;
    reader
        .seek(SeekFrom::Start(start))
        .await
        .map_err(|e| TransferError::Source(format!("{}: {}", source.display(), e)))?;
    let mut writer = fs::OpenOptions::new()
        .append(true)
        .open(part)
        .await
        .map_err(|e| io_error("open", part, e))?;

    let mut position = start;
    let mut moved = 0u64;
    let mut buf = vec![0u8; chunk_size.min(end - start) as usize];
    while position < end {
        let n = (end - position).min(chunk_size) as usize;
        let step = async {
            reader
                .read_exact(&mut buf[..n])
                .await
                .map_err(|e| (Side::Read, e))?;
            writer.write_all(&buf[..n]).await.map_err(|e| (Side::Write, e))?;
            writer.flush().await.map_err(|e| (Side::Write, e))
        };
        match step.await {
            Ok(()) => {}
            Err((Side::Read, e)) => {
                return Err(TransferError::Source(format!("{}: {}", source.display(), e)))
            }
            Err((Side::Write, e)) => {
                warn!("Write to {} interrupted: {}", part.display(), e);
                return Ok((moved, Some(format!("write failed: {}", e))));
            }
        }
        position += n as u64;
        moved += n as u64;
        session.advance(n as u64);
        debug!("Copied chunk {}..{} to {}", position - n as u64, position, part.display());

        if budget.should_stop() {
            break;
        }
    }
    Ok((moved, None))
}

/// Publish the partial file and verify its size.
async fn finalize(part: &Path, final_path: &Path, expected: u64) -> Result<(), TransferError> {
    if file_len(part).await?.is_some() {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(part)
            .await
            .map_err(|e| io_error("open", part, e))?;
        file.sync_all().await.map_err(|e| io_error("sync", part, e))?;
        fs::rename(part, final_path)
            .await
            .map_err(|e| io_error("rename", part, e))?;
    }
    let actual = file_len(final_path).await?.unwrap_or(0);
    if actual != expected {
        return Err(TransferError::SizeMismatch { expected, actual });
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn resumable_copy(
    source: &Path,
    final_path: &Path,
    handle: String,
    offset: u64,
    length: u64,
    budget: Duration,
    chunk_size: u64,
    session: &mut TransferSession,
) -> Result<CopyOutcome, TransferError> {
    let budget = SliceBudget::start(budget);
    let source_len = file_len(source)
        .await?
        .ok_or_else(|| TransferError::Source(format!("{} does not exist", source.display())))?;
    if source_len != session.total_size {
        return Err(TransferError::Source(format!(
            "{} is {} bytes, session expects {}",
            source.display(),
            source_len,
            session.total_size
        )));
    }

    let part = partial_path(final_path);
    let start = prepare_partial(&part, final_path, handle, session).await?;
    if start != offset {
        debug!("Copy of {} resumes at {} instead of {}", final_path.display(), start, offset);
    }
    // The window starts where the destination actually is
    let end = window_end(start, length, session.total_size);

    let (bytes, interrupted) = pump(source, &part, start, end, chunk_size, budget, session).await?;
    if interrupted.is_some() || !session.is_complete() {
        return Ok(CopyOutcome {
            bytes,
            complete: false,
            interrupted,
        });
    }

    finalize(&part, final_path, session.total_size).await?;
    Ok(CopyOutcome {
        bytes,
        complete: true,
        interrupted: None,
    })
}

fn modified_at(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl StorageAdapter for LocalAdapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Local
    }

    #[instrument(skip(self), level = "debug")]
    async fn initialize(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error("create dir", &self.root, e))
    }

    async fn is_valid(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        fs::try_exists(&full)
            .await
            .map_err(|e| io_error("stat", &full, e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        validate_relative(path)?;
        let mut current = self.root.clone();
        for segment in segments(path) {
            current.push(segment);
            match fs::create_dir(&current).await {
                Ok(()) => debug!("Created {}", current.display()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let meta = fs::metadata(&current)
                        .await
                        .map_err(|e| io_error("stat", &current, e))?;
                    if !meta.is_dir() {
                        return Err(StorageError::AlreadyExists(format!(
                            "{} exists and is not a directory",
                            current.display()
                        )));
                    }
                }
                Err(e) => return Err(io_error("create dir", &current, e)),
            }
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(StorageError::InvalidArgument(
                "refusing to delete the destination root".to_string(),
            ));
        }
        let meta = match fs::symlink_metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error("stat", &full, e)),
        };
        let result = if !meta.is_dir() {
            fs::remove_file(&full).await
        } else if recursive {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_dir(&full).await
        };
        result.map_err(|e| io_error("delete", &full, e))?;
        debug!("Deleted {}", full.display());
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if fs::try_exists(&target)
            .await
            .map_err(|e| io_error("stat", &target, e))?
        {
            return Err(StorageError::AlreadyExists(to.to_string()));
        }
        fs::rename(&source, &target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(from.to_string())
            } else {
                io_error("move", &source, e)
            }
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn scan_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let dir = self.resolve(path)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => return Err(io_error("read dir", &dir, e)),
        };

        let mut list = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read dir", &dir, e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| io_error("stat", &entry.path(), e))?;
            list.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified_at: modified_at(&meta),
            });
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    #[instrument(skip(self, session), level = "debug", fields(bytes = session.bytes_transferred))]
    async fn copy_to_storage(
        &self,
        source: &Path,
        dest_path: &str,
        offset: u64,
        length: u64,
        budget: Duration,
        session: &mut TransferSession,
    ) -> Result<CopyOutcome, TransferError> {
        let final_path = self.resolve(dest_path)?;
        let handle = format!("{}{}", dest_path, PARTIAL_SUFFIX);
        resumable_copy(
            source,
            &final_path,
            handle,
            offset,
            length,
            budget,
            self.chunk_size,
            session,
        )
        .await
    }

    #[instrument(skip(self, session), level = "debug", fields(bytes = session.bytes_transferred))]
    async fn copy_from_storage(
        &self,
        dest_path: &str,
        target: &Path,
        offset: u64,
        length: u64,
        budget: Duration,
        session: &mut TransferSession,
    ) -> Result<CopyOutcome, TransferError> {
        let source = self.resolve(dest_path)?;
        let handle = partial_path(target).to_string_lossy().to_string();
        resumable_copy(
            &source,
            target,
            handle,
            offset,
            length,
            budget,
            self.chunk_size,
            session,
        )
        .await
    }

    #[instrument(skip(self, session), level = "debug")]
    async fn abort_session(&self, session: &TransferSession) -> Result<(), StorageError> {
        let Some(token) = &session.token else {
            return Ok(());
        };
        let part = if Path::new(&token.handle).is_absolute() {
            PathBuf::from(&token.handle)
        } else {
            self.resolve(&token.handle)?
        };
        match fs::remove_file(&part).await {
            Ok(()) => {
                debug!("Removed partial file {}", part.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &part, e)),
        }
    }
}
