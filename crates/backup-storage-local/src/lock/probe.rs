use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backup_core::{
    EnvironmentSettings, JobStore, LockKind, LockManager, LockRecordStore, RecordLock,
    StorageError,
};
use chrono::Utc;
use tracing::{info, warn};

use super::file::FileLock;

const PROBE_LOCK_NAME: &str = "capability-probe";

/// Check whether file locks taken through one handle are observed by another.
///
/// Some shared hosts and network filesystems silently accept `flock` without
/// enforcing it. Two independent lock managers stand in for two invocations:
/// the second must be refused while the first holds the lock, and succeed
/// once it is released.
pub async fn probe_file_locking(state_dir: &Path) -> Result<bool, StorageError> {
    let first = FileLock::new(state_dir);
    let second = FileLock::new(state_dir);
    let ttl = Duration::from_secs(5);

    if !first.acquire(PROBE_LOCK_NAME, "probe-a", ttl).await?.acquired {
        warn!("Lock probe could not take its own lock");
        return Ok(false);
    }
    let contended = second.acquire(PROBE_LOCK_NAME, "probe-b", ttl).await;
    first.release(PROBE_LOCK_NAME, "probe-a").await?;

    let observed = match contended {
        Ok(result) if result.acquired => {
            second.release(PROBE_LOCK_NAME, "probe-b").await?;
            false
        }
        Ok(_) => {
            let after = second.acquire(PROBE_LOCK_NAME, "probe-b", ttl).await?;
            if after.acquired {
                second.release(PROBE_LOCK_NAME, "probe-b").await?;
            }
            after.acquired
        }
        Err(e) => {
            warn!("Lock probe failed: {}", e);
            false
        }
    };

    let probe_file = state_dir.join("locks").join(format!("{}.lock", PROBE_LOCK_NAME));
    if let Err(e) = tokio::fs::remove_file(&probe_file).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", probe_file.display(), e);
        }
    }
    Ok(observed)
}

/// Run the probe and persist its verdict.
pub async fn probe_and_record(
    settings_store: &dyn JobStore,
    state_dir: &Path,
) -> Result<LockKind, StorageError> {
    let kind = if probe_file_locking(state_dir).await? {
        LockKind::File
    } else {
        LockKind::Record
    };
    let mut settings = settings_store.load_settings().await?;
    settings.lock_kind = Some(kind);
    settings.probed_at = Some(Utc::now());
    settings_store.save_settings(&settings).await?;
    info!("Lock capability probe selected {} locks", kind);
    Ok(kind)
}

/// The lock manager for this environment.
///
/// The first call probes and records the choice; later calls reuse it so
/// the same logical lock is never split across two mechanisms.
pub async fn select_lock_manager<S>(
    store: Arc<S>,
    state_dir: &Path,
) -> Result<Arc<dyn LockManager>, StorageError>
where
    S: JobStore + LockRecordStore + 'static,
{
    let settings: EnvironmentSettings = store.load_settings().await?;
    let kind = match settings.lock_kind {
        Some(kind) => kind,
        None => probe_and_record(store.as_ref(), state_dir).await?,
    };
    Ok(match kind {
        LockKind::File => Arc::new(FileLock::new(state_dir)),
        LockKind::Record => Arc::new(RecordLock::new(store)),
    })
}
