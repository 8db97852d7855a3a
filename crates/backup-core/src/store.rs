use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::destination::StorageDestination;
use crate::error::StorageError;
use crate::job::BackupJob;
use crate::session::{SessionKey, TransferSession};

/// When a job's artifacts were last re-validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCursor {
    pub job_id: String,
    pub last_checked_at: DateTime<Utc>,
}

impl ReconcileCursor {
    pub fn new(job_id: impl Into<String>, last_checked_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            last_checked_at,
        }
    }

    /// A job is due once `min_interval` has fully elapsed since the last check.
    pub fn is_due(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        let elapsed = now.signed_duration_since(self.last_checked_at);
        match elapsed.to_std() {
            Ok(elapsed) => elapsed >= min_interval,
            // Checked "in the future": clock skew, treat as just checked.
            Err(_) => min_interval.is_zero(),
        }
    }
}

/// Which lock implementation an environment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// OS advisory lock on a file
    File,
    /// Named lock record in the state store
    Record,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::File => write!(f, "file"),
            LockKind::Record => write!(f, "record"),
        }
    }
}

/// Per-environment configuration persisted alongside the state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    /// Lock implementation chosen by the capability probe
    #[serde(default)]
    pub lock_kind: Option<LockKind>,
    #[serde(default)]
    pub probed_at: Option<DateTime<Utc>>,
}

/// The single active holder of a named lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Durable job, destination, cursor and cancellation state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Returns the store identifier (e.g., "json", "memory").
    fn store_name(&self) -> &'static str;

    // =========================================================================
    // Jobs
    // =========================================================================

    async fn load_job(&self, job_id: &str) -> Result<Option<BackupJob>, StorageError>;

    async fn save_job(&self, job: &BackupJob) -> Result<(), StorageError>;

    async fn delete_job(&self, job_id: &str) -> Result<bool, StorageError>;

    async fn list_jobs(&self) -> Result<Vec<BackupJob>, StorageError>;

    // =========================================================================
    // Destinations
    // =========================================================================

    async fn load_destination(
        &self,
        destination_id: &str,
    ) -> Result<Option<StorageDestination>, StorageError>;

    async fn save_destination(&self, destination: &StorageDestination) -> Result<(), StorageError>;

    async fn delete_destination(&self, destination_id: &str) -> Result<bool, StorageError>;

    async fn list_destinations(&self) -> Result<Vec<StorageDestination>, StorageError>;

    // =========================================================================
    // Cancellation flags
    // =========================================================================

    /// Raise the cancel flag. Kept apart from the job record so a concurrent
    /// `advance` writing the job back cannot clobber it.
    async fn request_cancel(&self, job_id: &str) -> Result<(), StorageError>;

    async fn cancel_requested(&self, job_id: &str) -> Result<bool, StorageError>;

    async fn clear_cancel(&self, job_id: &str) -> Result<(), StorageError>;

    // =========================================================================
    // Reconcile cursors
    // =========================================================================

    async fn load_cursor(&self, job_id: &str) -> Result<Option<ReconcileCursor>, StorageError>;

    async fn save_cursor(&self, cursor: &ReconcileCursor) -> Result<(), StorageError>;

    async fn delete_cursor(&self, job_id: &str) -> Result<bool, StorageError>;

    // =========================================================================
    // Settings
    // =========================================================================

    async fn load_settings(&self) -> Result<EnvironmentSettings, StorageError>;

    async fn save_settings(&self, settings: &EnvironmentSettings) -> Result<(), StorageError>;
}

/// Durable transfer sessions keyed by (job, destination, file).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, key: &SessionKey) -> Result<Option<TransferSession>, StorageError>;

    async fn save_session(&self, session: &TransferSession) -> Result<(), StorageError>;

    async fn delete_session(&self, key: &SessionKey) -> Result<bool, StorageError>;

    async fn list_job_sessions(&self, job_id: &str) -> Result<Vec<TransferSession>, StorageError>;

    /// Remove every session of a job. Returns how many were removed.
    async fn delete_job_sessions(&self, job_id: &str) -> Result<usize, StorageError>;
}

/// Atomic named lock records, the backing of [`RecordLock`](crate::RecordLock).
#[async_trait]
pub trait LockRecordStore: Send + Sync {
    /// Insert `record` under `name` unless a live record exists.
    ///
    /// Returns `None` when the record was written, or the live record that
    /// prevented it. An expired record is replaced.
    async fn try_insert_lock(
        &self,
        name: &str,
        record: &LockRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, StorageError>;

    async fn read_lock(&self, name: &str) -> Result<Option<LockRecord>, StorageError>;

    /// Remove the record if `holder_id` owns it.
    async fn remove_lock(&self, name: &str, holder_id: &str) -> Result<bool, StorageError>;
}
