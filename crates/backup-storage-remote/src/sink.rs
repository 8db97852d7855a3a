//! Local ends of remote transfers: the source file of an upload and the
//! `.part` file a download grows into.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use backup_core::retention::PARTIAL_SUFFIX;
use backup_core::{ContinuationToken, StorageError, TransferError, TransferSession};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

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

/// Open the upload source and check it still matches the session.
pub(crate) async fn open_source(
    source: &Path,
    session: &TransferSession,
) -> Result<fs::File, TransferError> {
    let file = fs::File::open(source)
        .await
        .map_err(|e| TransferError::Source(format!("{}: {}", source.display(), e)))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| TransferError::Source(format!("{}: {}", source.display(), e)))?
        .len();
    if len != session.total_size {
        return Err(TransferError::Source(format!(
            "{} is {} bytes, session expects {}",
            source.display(),
            len,
            session.total_size
        )));
    }
    Ok(file)
}

/// Read `len` bytes at `offset`.
pub(crate) async fn read_chunk(
    file: &mut fs::File,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, TransferError> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| TransferError::Source(e.to_string()))?;
    file.read_exact(&mut buf)
        .await
        .map_err(|e| TransferError::Source(e.to_string()))?;
    Ok(buf)
}

/// The `.part` file a download is written to before being renamed into place.
#[derive(Debug)]
pub(crate) struct PartialTarget {
    part: PathBuf,
    target: PathBuf,
}

impl PartialTarget {
    pub(crate) fn new(target: &Path) -> Self {
        let mut name = target.as_os_str().to_owned();
        name.push(PARTIAL_SUFFIX);
        Self {
            part: PathBuf::from(name),
            target: target.to_path_buf(),
        }
    }

    /// Align `session` with the partial file and return where to resume.
    pub(crate) async fn prepare(&self, session: &mut TransferSession) -> Result<u64, TransferError> {
        if session.is_fresh() {
            if let Some(parent) = self.part.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("create dir", parent, e))?;
            }
            fs::File::create(&self.part)
                .await
                .map_err(|e| io_error("create", &self.part, e))?;
            session.establish(ContinuationToken::new(self.part.to_string_lossy()));
            return Ok(0);
        }

        match file_len(&self.part).await? {
            Some(len) if len <= session.total_size => {
                session.resync(len);
                Ok(len)
            }
            Some(len) => Err(TransferError::SizeMismatch {
                expected: session.total_size,
                actual: len,
            }),
            None if file_len(&self.target).await? == Some(session.total_size) => {
                session.resync(session.total_size);
                Ok(session.total_size)
            }
            None => Err(TransferError::SessionExpired(format!(
                "partial file {} is gone",
                self.part.display()
            ))),
        }
    }

    pub(crate) async fn append(&self, data: &[u8]) -> Result<(), StorageError> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.part)
            .await
            .map_err(|e| io_error("open", &self.part, e))?;
        file.write_all(data)
            .await
            .map_err(|e| io_error("write", &self.part, e))?;
        file.flush().await.map_err(|e| io_error("flush", &self.part, e))
    }

    /// Rename the partial file into place and verify the result.
    pub(crate) async fn finalize(&self, expected: u64) -> Result<(), TransferError> {
        if file_len(&self.part).await?.is_some() {
            fs::rename(&self.part, &self.target)
                .await
                .map_err(|e| io_error("rename", &self.part, e))?;
        }
        let actual = file_len(&self.target).await?.unwrap_or(0);
        if actual != expected {
            return Err(TransferError::SizeMismatch { expected, actual });
        }
        Ok(())
    }

    /// Remove a partial download named by a session token.
    pub(crate) async fn remove(handle: &str) -> Result<(), StorageError> {
        let part = Path::new(handle);
        match fs::remove_file(part).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", part, e)),
        }
    }
}
