use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::destination::{DestinationKind, StorageDestination};
use crate::error::{StorageError, TransferError};
use crate::session::TransferSession;

/// An entry returned by [`StorageAdapter::scan_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Result of one resumable copy call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Bytes moved by this call
    pub bytes: u64,
    /// The file is fully transferred and its size verified
    pub complete: bool,
    /// Set when a transient destination failure cut the call short
    pub interrupted: Option<String>,
}

impl CopyOutcome {
    pub fn made_progress(&self) -> bool {
        self.bytes > 0 || self.complete
    }
}

/// Caller-supplied time budget for one copy call.
///
/// A zero budget means "exactly one chunk". Otherwise chunks keep flowing until
/// the elapsed time reaches the budget.
#[derive(Debug, Clone, Copy)]
pub struct SliceBudget {
    started: Instant,
    budget: Duration,
}

impl SliceBudget {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn single_chunk(&self) -> bool {
        self.budget.is_zero()
    }

    /// Whether the caller must stop after the chunk just sent.
    pub fn should_stop(&self) -> bool {
        self.single_chunk() || self.started.elapsed() >= self.budget
    }
}

/// Uniform capability surface every destination type implements.
///
/// Paths are `/`-separated and relative to the adapter's configured root.
///
/// The two copy operations are resumable. `offset` is the caller's view of how
/// many bytes the other side already holds and `length` bounds how much this
/// call may move. When `session` carries no continuation token the transfer
/// starts fresh from zero and `offset` is ignored. If the destination reports a
/// different position than the session, the adapter queries the destination and
/// resynchronizes `session.bytes_transferred` instead of failing. Transient
/// failures return `Ok` with `interrupted` set.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> DestinationKind;

    /// Prepare the destination root (create it, check the bucket, etc).
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Cheap validity check of the configuration and credentials.
    async fn is_valid(&self) -> bool;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Create `path` segment by segment. Existing segments are reused.
    async fn create_dir(&self, path: &str) -> Result<(), StorageError>;

    /// Delete a file or directory. Returns whether something was removed.
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, StorageError>;

    /// Rename `from` to `to`. Fails with `AlreadyExists` if `to` exists.
    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn scan_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError>;

    async fn copy_to_storage(
        &self,
        source: &Path,
        dest_path: &str,
        offset: u64,
        length: u64,
        budget: Duration,
        session: &mut TransferSession,
    ) -> Result<CopyOutcome, TransferError>;

    async fn copy_from_storage(
        &self,
        dest_path: &str,
        target: &Path,
        offset: u64,
        length: u64,
        budget: Duration,
        session: &mut TransferSession,
    ) -> Result<CopyOutcome, TransferError>;

    /// Release destination-side resources held by an abandoned session.
    async fn abort_session(&self, _session: &TransferSession) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Maps a configured destination to the adapter for its kind.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn adapter_for(
        &self,
        destination: &StorageDestination,
    ) -> Result<Arc<dyn StorageAdapter>, StorageError>;
}

/// End of the byte window a copy call may reach.
pub fn window_end(offset: u64, length: u64, total: u64) -> u64 {
    offset.saturating_add(length).min(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_budget_stops_after_one_chunk() {
        let budget = SliceBudget::start(Duration::ZERO);
        assert!(budget.single_chunk());
        assert!(budget.should_stop());
    }

    #[test]
    fn test_budget_keeps_going_until_elapsed() {
        let budget = SliceBudget::start(Duration::from_secs(3600));
        assert!(!budget.should_stop());
    }

    #[test]
    fn test_window_end() {
        assert_eq!(window_end(0, 10, 100), 10);
        assert_eq!(window_end(95, 10, 100), 100);
        assert_eq!(window_end(5, u64::MAX, 100), 100);
    }
}
