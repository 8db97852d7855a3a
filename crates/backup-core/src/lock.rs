use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::error::StorageError;
use crate::store::{LockKind, LockRecord, LockRecordStore};

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockAcquireResult {
    /// Whether the lock was acquired.
    pub acquired: bool,
    /// Current holder when the lock was refused, if known.
    pub current_holder: Option<String>,
}

impl LockAcquireResult {
    /// Create a successful acquisition result.
    pub fn acquired() -> Self {
        Self {
            acquired: true,
            current_holder: None,
        }
    }

    /// Create a failed acquisition result (lock held by another).
    pub fn not_acquired(current_holder: Option<String>) -> Self {
        Self {
            acquired: false,
            current_holder,
        }
    }
}

/// System-wide, non-blocking mutual exclusion.
///
/// A failed `acquire` means another invocation is active and the caller should
/// do nothing this round. Holders must be unique per invocation.
#[async_trait]
pub trait LockManager: Send + Sync {
    fn lock_kind(&self) -> LockKind;

    /// Attempt to acquire the lock `name` for `holder_id`.
    ///
    /// `ttl` bounds how long an orphaned holder can block others, for
    /// implementations that cannot rely on the OS to clean up.
    async fn acquire(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError>;

    /// Release the lock if `holder_id` holds it. Returns whether it was released.
    async fn release(&self, name: &str, holder_id: &str) -> Result<bool, StorageError>;
}

/// Named lock backed by an atomic record in the state store.
///
/// Used where OS file locks are not observable across invocations (network
/// filesystems, some shared hosts). Records expire after their TTL so a
/// crashed holder cannot block the environment forever.
pub struct RecordLock {
    store: Arc<dyn LockRecordStore>,
    clock: Arc<dyn Clock>,
}

impl RecordLock {
    pub fn new(store: Arc<dyn LockRecordStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current holder of `name`, if any.
    pub async fn holder(&self, name: &str) -> Result<Option<LockRecord>, StorageError> {
        let now = self.clock.now();
        Ok(self
            .store
            .read_lock(name)
            .await?
            .filter(|record| record.is_live(now)))
    }
}

#[async_trait]
impl LockManager for RecordLock {
    fn lock_kind(&self) -> LockKind {
        LockKind::Record
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::InvalidArgument(format!("Invalid lock TTL: {}", e)))?;
        let record = LockRecord {
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };

        match self.store.try_insert_lock(name, &record, now).await? {
            None => {
                debug!("Acquired lock record {} for {}", name, holder_id);
                Ok(LockAcquireResult::acquired())
            }
            Some(existing) => {
                debug!(
                    "Lock record {} held by {} since {} (requested by {})",
                    name, existing.holder_id, existing.acquired_at, holder_id
                );
                Ok(LockAcquireResult::not_acquired(Some(existing.holder_id)))
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(&self, name: &str, holder_id: &str) -> Result<bool, StorageError> {
        let released = self.store.remove_lock(name, holder_id).await?;
        if released {
            debug!("Released lock record {} by {}", name, holder_id);
        } else {
            debug!("Lock record {} not held by {} (no-op)", name, holder_id);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStateStore;

    fn setup() -> (RecordLock, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let store = Arc::new(MemoryStateStore::new());
        let lock = RecordLock::new(store).with_clock(clock.clone());
        (lock, clock)
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (lock, _clock) = setup();
        let ttl = Duration::from_secs(60);

        let result = lock.acquire("engine", "holder-1", ttl).await.unwrap();
        assert!(result.acquired);

        let result2 = lock.acquire("engine", "holder-2", ttl).await.unwrap();
        assert!(!result2.acquired);
        assert_eq!(result2.current_holder, Some("holder-1".to_string()));

        assert!(lock.release("engine", "holder-1").await.unwrap());

        let result3 = lock.acquire("engine", "holder-2", ttl).await.unwrap();
        assert!(result3.acquired);
    }

    #[tokio::test]
    async fn test_release_not_owner() {
        let (lock, _clock) = setup();
        let ttl = Duration::from_secs(60);

        lock.acquire("engine", "holder-1", ttl).await.unwrap();
        assert!(!lock.release("engine", "holder-2").await.unwrap());

        let result = lock.acquire("engine", "holder-2", ttl).await.unwrap();
        assert!(!result.acquired);
        assert_eq!(
            lock.holder("engine").await.unwrap().unwrap().holder_id,
            "holder-1"
        );
    }

    #[tokio::test]
    async fn test_expired_record_is_taken_over() {
        let (lock, clock) = setup();

        lock.acquire("engine", "crashed", Duration::from_secs(30))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(31));

        let result = lock
            .acquire("engine", "holder-2", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(result.acquired);
        // The crashed holder can no longer release what it lost
        assert!(!lock.release("engine", "crashed").await.unwrap());
    }

    #[tokio::test]
    async fn test_independent_names() {
        let (lock, _clock) = setup();
        let ttl = Duration::from_secs(60);
        assert!(lock.acquire("engine", "h", ttl).await.unwrap().acquired);
        assert!(lock.acquire("reconcile", "h2", ttl).await.unwrap().acquired);
    }
}
