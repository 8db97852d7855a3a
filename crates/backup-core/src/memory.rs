use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use crate::destination::StorageDestination;
use crate::error::StorageError;
use crate::job::BackupJob;
use crate::session::{SessionKey, TransferSession};
use crate::store::{
    EnvironmentSettings, JobStore, LockRecord, LockRecordStore, ReconcileCursor, SessionStore,
};

/// State store held entirely in memory.
///
/// Suitable for embedding the engine in a long-lived process and for tests.
/// Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    jobs: DashMap<String, BackupJob>,
    destinations: DashMap<String, StorageDestination>,
    sessions: DashMap<SessionKey, TransferSession>,
    cursors: DashMap<String, ReconcileCursor>,
    cancels: DashSet<String>,
    locks: DashMap<String, LockRecord>,
    settings: Mutex<EnvironmentSettings>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStateStore {
    fn store_name(&self) -> &'static str {
        "memory"
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<BackupJob>, StorageError> {
        Ok(self.jobs.get(job_id).map(|j| j.clone()))
    }

    async fn save_job(&self, job: &BackupJob) -> Result<(), StorageError> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool, StorageError> {
        Ok(self.jobs.remove(job_id).is_some())
    }

    async fn list_jobs(&self) -> Result<Vec<BackupJob>, StorageError> {
        let mut jobs: Vec<BackupJob> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn load_destination(
        &self,
        destination_id: &str,
    ) -> Result<Option<StorageDestination>, StorageError> {
        Ok(self.destinations.get(destination_id).map(|d| d.clone()))
    }

    async fn save_destination(&self, destination: &StorageDestination) -> Result<(), StorageError> {
        self.destinations
            .insert(destination.id.clone(), destination.clone());
        Ok(())
    }

    async fn delete_destination(&self, destination_id: &str) -> Result<bool, StorageError> {
        Ok(self.destinations.remove(destination_id).is_some())
    }

    async fn list_destinations(&self) -> Result<Vec<StorageDestination>, StorageError> {
        let mut list: Vec<StorageDestination> =
            self.destinations.iter().map(|d| d.value().clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn request_cancel(&self, job_id: &str) -> Result<(), StorageError> {
        self.cancels.insert(job_id.to_string());
        Ok(())
    }

    async fn cancel_requested(&self, job_id: &str) -> Result<bool, StorageError> {
        Ok(self.cancels.contains(job_id))
    }

    async fn clear_cancel(&self, job_id: &str) -> Result<(), StorageError> {
        self.cancels.remove(job_id);
        Ok(())
    }

    async fn load_cursor(&self, job_id: &str) -> Result<Option<ReconcileCursor>, StorageError> {
        Ok(self.cursors.get(job_id).map(|c| c.clone()))
    }

    async fn save_cursor(&self, cursor: &ReconcileCursor) -> Result<(), StorageError> {
        self.cursors.insert(cursor.job_id.clone(), cursor.clone());
        Ok(())
    }

    async fn delete_cursor(&self, job_id: &str) -> Result<bool, StorageError> {
        Ok(self.cursors.remove(job_id).is_some())
    }

    async fn load_settings(&self) -> Result<EnvironmentSettings, StorageError> {
        self.settings
            .lock()
            .map(|s| s.clone())
            .map_err(|e| StorageError::Internal(format!("Settings mutex poisoned: {}", e)))
    }

    async fn save_settings(&self, settings: &EnvironmentSettings) -> Result<(), StorageError> {
        let mut current = self
            .settings
            .lock()
            .map_err(|e| StorageError::Internal(format!("Settings mutex poisoned: {}", e)))?;
        *current = settings.clone();
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStateStore {
    async fn load_session(&self, key: &SessionKey) -> Result<Option<TransferSession>, StorageError> {
        Ok(self.sessions.get(key).map(|s| s.clone()))
    }

    async fn save_session(&self, session: &TransferSession) -> Result<(), StorageError> {
        self.sessions.insert(session.key.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<bool, StorageError> {
        Ok(self.sessions.remove(key).is_some())
    }

    async fn list_job_sessions(&self, job_id: &str) -> Result<Vec<TransferSession>, StorageError> {
        let mut list: Vec<TransferSession> = self
            .sessions
            .iter()
            .filter(|s| s.key().job_id == job_id)
            .map(|s| s.value().clone())
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(list)
    }

    async fn delete_job_sessions(&self, job_id: &str) -> Result<usize, StorageError> {
        let before = self.sessions.len();
        self.sessions.retain(|key, _| key.job_id != job_id);
        Ok(before.saturating_sub(self.sessions.len()))
    }
}

#[async_trait]
impl LockRecordStore for MemoryStateStore {
    async fn try_insert_lock(
        &self,
        name: &str,
        record: &LockRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, StorageError> {
        match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    Ok(Some(entry.get().clone()))
                } else {
                    entry.insert(record.clone());
                    Ok(None)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(record.clone());
                Ok(None)
            }
        }
    }

    async fn read_lock(&self, name: &str) -> Result<Option<LockRecord>, StorageError> {
        Ok(self.locks.get(name).map(|r| r.clone()))
    }

    async fn remove_lock(&self, name: &str, holder_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .locks
            .remove_if(name, |_, record| record.holder_id == holder_id)
            .is_some())
    }
}
