use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use backup_core::path::validate_id;
use backup_core::{LockAcquireResult, LockKind, LockManager, StorageError};
use fs2::FileExt;
use tracing::{debug, instrument};

/// Lock manager using OS-level exclusive file locks.
///
/// - The lock file is opened and locked with `try_lock_exclusive` (flock on
///   Unix, LockFileEx on Windows)
/// - The handle is held while the lock is held; closing it releases the lock
/// - A crashed process releases its locks when the OS closes its descriptors
///
/// Lock files are stored at `{state_dir}/locks/{name}.lock`.
#[derive(Debug)]
pub struct FileLock {
    state_dir: PathBuf,
    /// Active lock handles: name -> (holder_id, File)
    handles: Mutex<HashMap<String, (String, File)>>,
}

impl FileLock {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", name))
    }

    fn handles(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, File)>>, StorageError> {
        self.handles
            .lock()
            .map_err(|e| StorageError::Lock(format!("Lock handle table poisoned: {}", e)))
    }
}

#[async_trait]
impl LockManager for FileLock {
    fn lock_kind(&self) -> LockKind {
        LockKind::File
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        name: &str,
        holder_id: &str,
        _ttl: Duration, // the OS releases the lock when the holder dies
    ) -> Result<LockAcquireResult, StorageError> {
        validate_id(name)?;

        {
            let handles = self.handles()?;
            if let Some((existing_holder, _)) = handles.get(name) {
                if existing_holder == holder_id {
                    debug!("Lock {} already held by {}", name, holder_id);
                    return Ok(LockAcquireResult::acquired());
                }
                debug!(
                    "Lock {} held by {} in this process (requested by {})",
                    name, existing_holder, holder_id
                );
                return Ok(LockAcquireResult::not_acquired(Some(existing_holder.clone())));
            }
        }

        let dir = self.locks_dir();
        std::fs::create_dir_all(&dir).map_err(|e| {
            StorageError::Io(format!("Failed to create locks dir {}: {}", dir.display(), e))
        })?;

        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::Io(format!("Failed to open lock file {}: {}", path.display(), e)))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                self.handles()?
                    .insert(name.to_string(), (holder_id.to_string(), file));
                debug!("Acquired lock {} for {}", name, holder_id);
                Ok(LockAcquireResult::acquired())
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!("Lock {} held by another process (requested by {})", name, holder_id);
                Ok(LockAcquireResult::not_acquired(None))
            }
            Err(e) => Err(StorageError::Lock(format!("Failed to acquire lock {}: {}", name, e))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(&self, name: &str, holder_id: &str) -> Result<bool, StorageError> {
        let mut handles = self.handles()?;
        match handles.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().0 != holder_id {
                    debug!(
                        "Cannot release lock {}: held by {} not {}",
                        name,
                        entry.get().0,
                        holder_id
                    );
                    return Ok(false);
                }
                let (_, file) = entry.remove();
                if let Err(e) = FileExt::unlock(&file) {
                    debug!("Explicit unlock of {} failed, dropping handle: {}", name, e);
                }
                debug!("Released lock {} by {}", name, holder_id);
                Ok(true)
            }
            Entry::Vacant(_) => {
                debug!("Lock {} not held for release by {}", name, holder_id);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (FileLock, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let lock = FileLock::new(temp_dir.path());
        (lock, temp_dir)
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (lock_mgr, _temp) = setup();
        let ttl = Duration::from_secs(60);

        let result = lock_mgr.acquire("engine", "holder-1", ttl).await.unwrap();
        assert!(result.acquired);

        // Same holder can re-acquire
        assert!(lock_mgr.acquire("engine", "holder-1", ttl).await.unwrap().acquired);

        let result = lock_mgr.acquire("engine", "holder-2", ttl).await.unwrap();
        assert!(!result.acquired);
        assert_eq!(result.current_holder.as_deref(), Some("holder-1"));

        assert!(lock_mgr.release("engine", "holder-1").await.unwrap());
        assert!(lock_mgr.acquire("engine", "holder-2", ttl).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_release_not_owner() {
        let (lock_mgr, _temp) = setup();
        let ttl = Duration::from_secs(60);

        lock_mgr.acquire("engine", "holder-1", ttl).await.unwrap();
        assert!(!lock_mgr.release("engine", "holder-2").await.unwrap());
        assert!(!lock_mgr.acquire("engine", "holder-2", ttl).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_independent_instances_exclude_each_other() {
        let temp = TempDir::new().unwrap();
        let first = FileLock::new(temp.path());
        let second = FileLock::new(temp.path());
        let ttl = Duration::from_secs(60);

        assert!(first.acquire("engine", "a", ttl).await.unwrap().acquired);
        let result = second.acquire("engine", "b", ttl).await.unwrap();
        assert!(!result.acquired);
        assert!(result.current_holder.is_none());

        first.release("engine", "a").await.unwrap();
        assert!(second.acquire("engine", "b", ttl).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let (lock_mgr, _temp) = setup();
        assert!(lock_mgr
            .acquire("../engine", "a", Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_locking() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let temp = TempDir::new().unwrap();
        const NUM_TASKS: usize = 10;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let inside = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..NUM_TASKS {
            // One lock manager per task, as separate invocations would have
            let lock_mgr = FileLock::new(temp.path());
            let barrier = Arc::clone(&barrier);
            let inside = Arc::clone(&inside);
            let counter = Arc::clone(&counter);
            let holder_id = format!("holder-{}", i);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                for attempt in 0..200u64 {
                    if attempt > 0 {
                        tokio::time::sleep(Duration::from_millis(5 + attempt)).await;
                    }
                    let result = lock_mgr
                        .acquire("engine", &holder_id, Duration::from_secs(30))
                        .await
                        .expect("acquire failed");
                    if result.acquired {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock_mgr.release("engine", &holder_id).await.expect("release failed");
                        return;
                    }
                }
                panic!("task {} never acquired the lock", i);
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }
        assert_eq!(counter.load(Ordering::SeqCst), NUM_TASKS);
    }
}
