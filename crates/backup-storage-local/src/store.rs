use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use backup_core::path::validate_id;
use backup_core::{
    BackupJob, EnvironmentSettings, JobStore, LockRecord, LockRecordStore, ReconcileCursor,
    SessionKey, SessionStore, StorageDestination, StorageError, TransferSession,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// A lock record nobody can parse is considered abandoned after this long.
const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(60);

/// State store keeping one JSON document per record under a state directory.
///
/// ```text
/// {state_dir}/
///   settings.json
///   jobs/{job_id}.json
///   destinations/{destination_id}.json
///   sessions/{job_id}/{hash(destination, file)}.json
///   cursors/{job_id}.json
///   cancel/{job_id}.flag
///   locks/{name}.json
/// ```
///
/// Every write goes through a temp file and a rename, so a process killed
/// mid-write leaves the previous version in place.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    state_dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn job_path(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        validate_id(job_id)?;
        Ok(self.state_dir.join("jobs").join(format!("{}.json", job_id)))
    }

    fn destination_path(&self, destination_id: &str) -> Result<PathBuf, StorageError> {
        validate_id(destination_id)?;
        Ok(self
            .state_dir
            .join("destinations")
            .join(format!("{}.json", destination_id)))
    }

    fn job_sessions_dir(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        validate_id(job_id)?;
        Ok(self.state_dir.join("sessions").join(job_id))
    }

    /// Session files are named by a digest of (destination, file) so that any
    /// logical file name maps to a safe, fixed-length file name.
    fn session_path(&self, key: &SessionKey) -> Result<PathBuf, StorageError> {
        let mut hasher = Sha256::new();
        hasher.update(key.destination_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.file.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Ok(self
            .job_sessions_dir(&key.job_id)?
            .join(format!("{}.json", &digest[..32])))
    }

    fn cursor_path(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        validate_id(job_id)?;
        Ok(self.state_dir.join("cursors").join(format!("{}.json", job_id)))
    }

    fn cancel_path(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        validate_id(job_id)?;
        Ok(self.state_dir.join("cancel").join(format!("{}.flag", job_id)))
    }

    fn lock_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_id(name)?;
        Ok(self.state_dir.join("locks").join(format!("{}.json", name)))
    }

    fn settings_path(&self) -> PathBuf {
        self.state_dir.join("settings.json")
    }
}

// =============================================================================
// JSON file helpers
// =============================================================================

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await.map_err(|e| {
            StorageError::Io(format!("Failed to create dir {}: {}", dir.display(), e))
        })?;
    }
    Ok(())
}

pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
            StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    ensure_parent(path).await?;
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize: {}", e)))?;

    let temp_path = temp_sibling(path);
    fs::write(&temp_path, json).await.map_err(|e| {
        StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
    })?;
    fs::rename(&temp_path, path).await.map_err(|e| {
        StorageError::Io(format!("Failed to rename to {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Unique temp path next to `path`. Concurrent writers never share one.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

async fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Io(format!(
            "Failed to delete {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Parse every `*.json` document of a directory, skipping unreadable ones.
async fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StorageError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(StorageError::Io(format!(
                "Failed to read dir {}: {}",
                dir.display(),
                e
            )))
        }
    };

    let mut values = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::Io(format!("Failed to read dir entry: {}", e)))?
    {
        let path = entry.path();
        let is_document = path.extension().is_some_and(|ext| ext == "json")
            && !entry.file_name().to_string_lossy().starts_with('.');
        if !is_document {
            continue;
        }
        match read_json::<T>(&path).await {
            Ok(Some(value)) => values.push(value),
            Ok(None) => {}
            Err(e) => warn!("Skipping unreadable record: {}", e),
        }
    }
    Ok(values)
}

#[async_trait]
impl JobStore for JsonStateStore {
    fn store_name(&self) -> &'static str {
        "json"
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn load_job(&self, job_id: &str) -> Result<Option<BackupJob>, StorageError> {
        read_json(&self.job_path(job_id)?).await
    }

    #[instrument(skip(self, job), level = "debug", fields(job_id = %job.id, phase = %job.phase))]
    async fn save_job(&self, job: &BackupJob) -> Result<(), StorageError> {
        write_json(&self.job_path(&job.id)?, job).await?;
        debug!("Saved job {}", job.id);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_job(&self, job_id: &str) -> Result<bool, StorageError> {
        remove_if_exists(&self.job_path(job_id)?).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_jobs(&self) -> Result<Vec<BackupJob>, StorageError> {
        let mut jobs: Vec<BackupJob> = read_json_dir(&self.state_dir.join("jobs")).await?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        debug!("Listed {} jobs", jobs.len());
        Ok(jobs)
    }

    // =========================================================================
    // Destinations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn load_destination(
        &self,
        destination_id: &str,
    ) -> Result<Option<StorageDestination>, StorageError> {
        read_json(&self.destination_path(destination_id)?).await
    }

    #[instrument(skip(self, destination), level = "debug", fields(destination_id = %destination.id))]
    async fn save_destination(&self, destination: &StorageDestination) -> Result<(), StorageError> {
        write_json(&self.destination_path(&destination.id)?, destination).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_destination(&self, destination_id: &str) -> Result<bool, StorageError> {
        remove_if_exists(&self.destination_path(destination_id)?).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_destinations(&self) -> Result<Vec<StorageDestination>, StorageError> {
        let mut list: Vec<StorageDestination> =
            read_json_dir(&self.state_dir.join("destinations")).await?;
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    // =========================================================================
    // Cancellation flags
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn request_cancel(&self, job_id: &str) -> Result<(), StorageError> {
        let path = self.cancel_path(job_id)?;
        ensure_parent(&path).await?;
        fs::write(&path, Utc::now().to_rfc3339()).await.map_err(|e| {
            StorageError::Io(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    async fn cancel_requested(&self, job_id: &str) -> Result<bool, StorageError> {
        let path = self.cancel_path(job_id)?;
        fs::try_exists(&path).await.map_err(|e| {
            StorageError::Io(format!("Failed to stat {}: {}", path.display(), e))
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn clear_cancel(&self, job_id: &str) -> Result<(), StorageError> {
        remove_if_exists(&self.cancel_path(job_id)?).await.map(|_| ())
    }

    // =========================================================================
    // Reconcile cursors
    // =========================================================================

    async fn load_cursor(&self, job_id: &str) -> Result<Option<ReconcileCursor>, StorageError> {
        read_json(&self.cursor_path(job_id)?).await
    }

    async fn save_cursor(&self, cursor: &ReconcileCursor) -> Result<(), StorageError> {
        write_json(&self.cursor_path(&cursor.job_id)?, cursor).await
    }

    async fn delete_cursor(&self, job_id: &str) -> Result<bool, StorageError> {
        remove_if_exists(&self.cursor_path(job_id)?).await
    }

    // =========================================================================
    // Settings
    // =========================================================================

    async fn load_settings(&self) -> Result<EnvironmentSettings, StorageError> {
        Ok(read_json(&self.settings_path()).await?.unwrap_or_default())
    }

    #[instrument(skip(self), level = "debug")]
    async fn save_settings(&self, settings: &EnvironmentSettings) -> Result<(), StorageError> {
        write_json(&self.settings_path(), settings).await
    }
}

#[async_trait]
impl SessionStore for JsonStateStore {
    #[instrument(skip(self), level = "debug")]
    async fn load_session(&self, key: &SessionKey) -> Result<Option<TransferSession>, StorageError> {
        let session: Option<TransferSession> = read_json(&self.session_path(key)?).await?;
        // A digest collision would surface as a foreign key
        Ok(session.filter(|s| &s.key == key))
    }

    #[instrument(
        skip(self, session),
        level = "debug",
        fields(job_id = %session.key.job_id, destination_id = %session.key.destination_id, bytes = session.bytes_transferred)
    )]
    async fn save_session(&self, session: &TransferSession) -> Result<(), StorageError> {
        write_json(&self.session_path(&session.key)?, session).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_session(&self, key: &SessionKey) -> Result<bool, StorageError> {
        remove_if_exists(&self.session_path(key)?).await
    }

    async fn list_job_sessions(&self, job_id: &str) -> Result<Vec<TransferSession>, StorageError> {
        let mut sessions: Vec<TransferSession> =
            read_json_dir(&self.job_sessions_dir(job_id)?).await?;
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(sessions)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_job_sessions(&self, job_id: &str) -> Result<usize, StorageError> {
        let dir = self.job_sessions_dir(job_id)?;
        let count = self.list_job_sessions(job_id).await?.len();
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to delete {}: {}",
                dir.display(),
                e
            ))),
        }
    }
}

// =============================================================================
// Lock records
// =============================================================================

enum Existing {
    Missing,
    Live(LockRecord),
    Stale,
}

impl JsonStateStore {
    /// Write the record only if no file exists (`O_CREAT | O_EXCL`).
    async fn create_lock_file(&self, path: &Path, record: &LockRecord) -> Result<bool, StorageError> {
        ensure_parent(path).await?;
        let json = serde_json::to_vec(record)
            .map_err(|e| StorageError::Serialization(format!("Failed to serialize lock: {}", e)))?;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to create lock {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        file.write_all(&json).await.map_err(|e| {
            StorageError::Io(format!("Failed to write lock {}: {}", path.display(), e))
        })?;
        file.sync_all().await.map_err(|e| {
            StorageError::Io(format!("Failed to sync lock {}: {}", path.display(), e))
        })?;
        Ok(true)
    }

    async fn inspect_lock(&self, path: &Path, now: DateTime<Utc>) -> Result<Existing, StorageError> {
        match read_json::<LockRecord>(path).await {
            Ok(None) => Ok(Existing::Missing),
            Ok(Some(record)) if record.is_live(now) => Ok(Existing::Live(record)),
            Ok(Some(_)) => Ok(Existing::Stale),
            Err(StorageError::Serialization(e)) => {
                // A writer may be between create and write; give it time.
                let age = fs::metadata(path)
                    .await
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .unwrap_or_default();
                if age >= UNREADABLE_LOCK_GRACE {
                    warn!("Unreadable lock record {} treated as stale: {}", path.display(), e);
                    Ok(Existing::Stale)
                } else {
                    Ok(Existing::Live(LockRecord {
                        holder_id: "unknown".to_string(),
                        acquired_at: now,
                        expires_at: now,
                    }))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Move a stale record out of the way. Another process may have replaced
    /// it in the meantime, in which case the live record is put back.
    async fn retire_stale_lock(&self, path: &Path, now: DateTime<Utc>) -> Result<Option<LockRecord>, StorageError> {
        let tombstone = temp_sibling(path).with_extension("stale");
        match fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to retire lock {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        let retired = read_json::<LockRecord>(&tombstone).await.ok().flatten();
        let result = match retired {
            Some(record) if record.is_live(now) => {
                // We raced a fresh holder: restore its record unless the slot is taken.
                match fs::hard_link(&tombstone, path).await {
                    Ok(()) => debug!("Restored live lock record {}", path.display()),
                    Err(e) => debug!("Could not restore lock record {}: {}", path.display(), e),
                }
                Some(record)
            }
            _ => None,
        };
        remove_if_exists(&tombstone).await?;
        Ok(result)
    }
}

#[async_trait]
impl LockRecordStore for JsonStateStore {
    #[instrument(skip(self, record), level = "debug", fields(holder_id = %record.holder_id))]
    async fn try_insert_lock(
        &self,
        name: &str,
        record: &LockRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, StorageError> {
        let path = self.lock_path(name)?;

        // One takeover attempt: create, else inspect, retire if stale, create again.
        for _ in 0..2 {
            if self.create_lock_file(&path, record).await? {
                return Ok(None);
            }
            match self.inspect_lock(&path, now).await? {
                Existing::Live(existing) => return Ok(Some(existing)),
                Existing::Missing => continue,
                Existing::Stale => {
                    if let Some(live) = self.retire_stale_lock(&path, now).await? {
                        return Ok(Some(live));
                    }
                    debug!("Took over stale lock record {}", name);
                }
            }
        }

        if self.create_lock_file(&path, record).await? {
            return Ok(None);
        }
        match self.inspect_lock(&path, now).await? {
            Existing::Live(existing) => Ok(Some(existing)),
            Existing::Missing | Existing::Stale => Err(StorageError::Lock(format!(
                "Lock record {} is contended",
                name
            ))),
        }
    }

    async fn read_lock(&self, name: &str) -> Result<Option<LockRecord>, StorageError> {
        read_json(&self.lock_path(name)?).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove_lock(&self, name: &str, holder_id: &str) -> Result<bool, StorageError> {
        let path = self.lock_path(name)?;
        match read_json::<LockRecord>(&path).await {
            Ok(Some(record)) if record.holder_id == holder_id => remove_if_exists(&path).await,
            Ok(_) => Ok(false),
            Err(StorageError::Serialization(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
