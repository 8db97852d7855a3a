use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapter::{AdapterFactory, StorageAdapter};
use crate::builder::{ArtifactBuilder, BuildProgress, ScanProgress};
use crate::clock::{Clock, SystemClock};
use crate::destination::StorageDestination;
use crate::error::{BuildError, EngineError, StorageError, TransferError};
use crate::job::{Artifact, BackupJob, JobPhase, JobSnapshot, TransferStatus};
use crate::lock::LockManager;
use crate::path::{file_name, join_path, parent_dir, validate_id, validate_relative};
use crate::retention::apply_retention;
use crate::session::{SessionKey, TransferSession};
use crate::store::{JobStore, LockKind, SessionStore};

/// Default bound on consecutive retryable failures.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Name of the lock serializing every engine invocation.
pub const DEFAULT_LOCK_NAME: &str = "backup-engine";

/// Job id under which restore sessions are persisted.
pub const RESTORE_SESSION_JOB: &str = "restore";

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Consecutive retryable failures before a destination (or a build) gives up
    pub max_retries: u32,
    pub lock_name: String,
    /// How long a crashed holder can block others when the lock cannot rely on the OS
    pub lock_ttl: Duration,
    /// Jobs checked per reconcile chunk
    pub reconcile_batch: usize,
    /// Upper bound on bytes moved by one transfer slice
    pub slice_bytes: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lock_ttl: Duration::from_secs(15 * 60),
            reconcile_batch: 10,
            slice_bytes: None,
        }
    }
}

/// Result of one `advance` call.
#[derive(Debug, Clone)]
pub enum AdvanceOutcome {
    /// Another invocation holds the lock. Nothing was read or written.
    Busy,
    Advanced {
        snapshot: JobSnapshot,
        /// Whether a unit of work (or a phase change) happened
        work_done: bool,
    },
}

/// Progress of one restore slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub complete: bool,
    pub interrupted: Option<String>,
}

/// Explicit context for every job operation.
///
/// Constructed once per process from its collaborators. Every mutating call
/// runs under the environment-wide lock and reads its state fresh from the
/// stores, so independent processes can drive the same jobs.
pub struct Engine {
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) lock: Arc<dyn LockManager>,
    pub(crate) adapters: Arc<dyn AdapterFactory>,
    builder: Arc<dyn ArtifactBuilder>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: EngineSettings,
}

impl Engine {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        sessions: Arc<dyn SessionStore>,
        lock: Arc<dyn LockManager>,
        adapters: Arc<dyn AdapterFactory>,
        builder: Arc<dyn ArtifactBuilder>,
    ) -> Self {
        Self {
            jobs,
            sessions,
            lock,
            adapters,
            builder,
            clock: Arc::new(SystemClock),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.lock
    }

    /// Lock holder id, unique per invocation.
    pub fn new_holder_id() -> String {
        format!("{}-{}", std::process::id(), Uuid::new_v4())
    }

    /// A record lock can be taken over once `lock_ttl` passes, and adapters
    /// only look at the budget between chunks, so a step must fit well inside
    /// the TTL.
    fn check_budget(&self, budget: Duration) -> Result<(), EngineError> {
        if self.lock.lock_kind() == LockKind::Record
            && budget.saturating_mul(2) > self.settings.lock_ttl
        {
            return Err(EngineError::InvalidArgument(format!(
                "step budget of {}s needs a lock TTL of at least {}s (have {}s)",
                budget.as_secs(),
                budget.saturating_mul(2).as_secs(),
                self.settings.lock_ttl.as_secs()
            )));
        }
        Ok(())
    }

    /// Run `work` while holding the engine lock. `None` means the lock was busy.
    ///
    /// The lock is released on every path, including errors from `work`.
    pub(crate) async fn run_exclusive<T>(
        &self,
        work: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<Option<T>, EngineError> {
        let holder = Self::new_holder_id();
        let name = self.settings.lock_name.as_str();
        let acquired = self
            .lock
            .acquire(name, &holder, self.settings.lock_ttl)
            .await?;
        if !acquired.acquired {
            debug!(
                "Lock {} busy (held by {})",
                name,
                acquired.current_holder.as_deref().unwrap_or("unknown")
            );
            return Ok(None);
        }

        let result = work.await;

        match self.lock.release(name, &holder).await {
            Ok(true) => {}
            Ok(false) => warn!("Lock {} was no longer held by {} at release", name, holder),
            Err(e) => warn!("Failed to release lock {}: {}", name, e),
        }
        result.map(Some)
    }

    // =========================================================================
    // Job management
    // =========================================================================

    /// Create a job targeting `destination_ids`, in order.
    #[instrument(skip(self), level = "debug")]
    pub async fn create_job(
        &self,
        name: &str,
        source: &str,
        destination_ids: &[String],
    ) -> Result<JobSnapshot, EngineError> {
        validate_id(name).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if destination_ids.is_empty() {
            return Err(EngineError::InvalidArgument(
                "a job needs at least one destination".to_string(),
            ));
        }
        for (i, id) in destination_ids.iter().enumerate() {
            if destination_ids[..i].contains(id) {
                return Err(EngineError::InvalidArgument(format!(
                    "destination {} listed twice",
                    id
                )));
            }
            if self.jobs.load_destination(id).await?.is_none() {
                return Err(EngineError::DestinationNotFound(id.clone()));
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        let job = BackupJob::new(id, name, source, destination_ids, self.clock.now());
        self.jobs.save_job(&job).await?;
        info!(job = %job.id, "Created job {} for {} destination(s)", name, destination_ids.len());
        Ok(job.snapshot())
    }

    pub async fn snapshot(&self, job_id: &str) -> Result<JobSnapshot, EngineError> {
        Ok(self.load_job(job_id).await?.snapshot())
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobSnapshot>, EngineError> {
        Ok(self
            .jobs
            .list_jobs()
            .await?
            .iter()
            .map(BackupJob::snapshot)
            .collect())
    }

    /// Raise the durable cancel flag. Returns `false` for a job already terminal.
    ///
    /// Does not take the lock: the flag is observed by the next `advance`.
    #[instrument(skip(self), level = "debug")]
    pub async fn request_cancel(&self, job_id: &str) -> Result<bool, EngineError> {
        let job = self.load_job(job_id).await?;
        if job.phase.is_terminal() {
            return Ok(false);
        }
        self.jobs.request_cancel(job_id).await?;
        info!(job = %job_id, "Cancellation requested in phase {}", job.phase);
        Ok(true)
    }

    /// Delete a terminal job with its sessions, cursor and staging state.
    ///
    /// Returns `None` when the lock is busy.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_job(&self, job_id: &str) -> Result<Option<()>, EngineError> {
        self.run_exclusive(async {
            let job = self.load_job(job_id).await?;
            if !job.phase.is_terminal() {
                return Err(EngineError::InvalidArgument(format!(
                    "job {} is still {}",
                    job_id, job.phase
                )));
            }
            self.purge_job(&job).await
        })
        .await
    }

    pub(crate) async fn purge_job(&self, job: &BackupJob) -> Result<(), EngineError> {
        let sessions = self.sessions.delete_job_sessions(&job.id).await?;
        self.jobs.delete_cursor(&job.id).await?;
        self.jobs.clear_cancel(&job.id).await?;
        if let Err(e) = self.builder.discard(job).await {
            warn!(job = %job.id, "Failed to discard staging state: {}", e);
        }
        self.jobs.delete_job(&job.id).await?;
        info!(job = %job.id, "Deleted job ({} session(s) removed)", sessions);
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<BackupJob, EngineError> {
        self.jobs
            .load_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    // =========================================================================
    // Advance
    // =========================================================================

    /// Perform at most one bounded unit of work on the job.
    #[instrument(skip(self), level = "debug")]
    pub async fn advance(&self, job_id: &str, budget: Duration) -> Result<AdvanceOutcome, EngineError> {
        self.check_budget(budget)?;
        let outcome = self.run_exclusive(self.advance_locked(job_id, budget)).await?;
        Ok(match outcome {
            Some((snapshot, work_done)) => AdvanceOutcome::Advanced {
                snapshot,
                work_done,
            },
            None => AdvanceOutcome::Busy,
        })
    }

    async fn advance_locked(
        &self,
        job_id: &str,
        budget: Duration,
    ) -> Result<(JobSnapshot, bool), EngineError> {
        let mut job = self.load_job(job_id).await?;
        if job.phase.is_terminal() {
            return Ok((job.snapshot(), false));
        }

        if job.phase != JobPhase::PendingCancel && self.jobs.cancel_requested(job_id).await? {
            job.cancelled_from = Some(job.phase);
            self.transition(&mut job, JobPhase::PendingCancel)?;
            self.jobs.save_job(&job).await?;
            return Ok((job.snapshot(), true));
        }

        let work_done = match job.phase {
            JobPhase::Created => {
                self.transition(&mut job, JobPhase::Scanning)?;
                true
            }
            JobPhase::Scanning => self.scan_step(&mut job, budget).await?,
            JobPhase::Building => self.build_step(&mut job, budget).await?,
            JobPhase::TransferringStorages => self.transfer_step(&mut job, budget).await?,
            JobPhase::PendingCancel => self.cancel_step(&mut job).await?,
            _ => false,
        };

        self.jobs.save_job(&job).await?;
        if job.phase.is_terminal() && job.cancelled_from.is_some() {
            self.jobs.clear_cancel(&job.id).await?;
        }
        Ok((job.snapshot(), work_done))
    }

    fn transition(&self, job: &mut BackupJob, next: JobPhase) -> Result<(), EngineError> {
        let from = job.phase;
        job.transition(next, self.clock.now())?;
        info!(job = %job.id, "Job {} -> {}", from, next);
        Ok(())
    }

    async fn scan_step(&self, job: &mut BackupJob, budget: Duration) -> Result<bool, EngineError> {
        match self.builder.scan(job, budget).await {
            Ok(ScanProgress::Pending) => debug!(job = %job.id, "Scan slice done"),
            Ok(ScanProgress::Done) => self.transition(job, JobPhase::Building)?,
            Err(e) => self.build_failed(job, e).await?,
        }
        job.updated_at = self.clock.now();
        Ok(true)
    }

    async fn build_step(&self, job: &mut BackupJob, budget: Duration) -> Result<bool, EngineError> {
        match self.builder.build(job, budget).await {
            Ok(BuildProgress::Pending) => debug!(job = %job.id, "Build slice done"),
            Ok(BuildProgress::Materialized(artifact)) => self.begin_transfers(job, artifact).await?,
            Err(e) => self.build_failed(job, e).await?,
        }
        job.updated_at = self.clock.now();
        Ok(true)
    }

    async fn build_failed(&self, job: &mut BackupJob, error: BuildError) -> Result<(), EngineError> {
        match error {
            BuildError::Retryable(reason) => {
                job.retry_count += 1;
                if job.retry_count >= self.settings.max_retries {
                    warn!(job = %job.id, "Build retry budget exhausted after {} attempts: {}", job.retry_count, reason);
                    job.last_error = Some(format!(
                        "build retry budget exhausted after {} attempts: {}",
                        job.retry_count, reason
                    ));
                    if let Err(e) = self.builder.discard(job).await {
                        warn!(job = %job.id, "Failed to discard staging state: {}", e);
                    }
                    self.transition(job, JobPhase::BuildCancelled)?;
                } else {
                    warn!(
                        job = %job.id,
                        "Build step failed (retry {}/{}): {}",
                        job.retry_count, self.settings.max_retries, reason
                    );
                    job.last_error = Some(reason);
                }
            }
            BuildError::Fatal(reason) => {
                warn!(job = %job.id, "Build failed: {}", reason);
                job.last_error = Some(reason);
                self.transition(job, JobPhase::Error)?;
            }
        }
        Ok(())
    }

    async fn begin_transfers(&self, job: &mut BackupJob, artifact: Artifact) -> Result<(), EngineError> {
        let now = self.clock.now();
        info!(
            job = %job.id,
            "Artifact {} materialized ({} bytes)",
            artifact.file_name, artifact.size
        );
        for index in 0..job.destinations.len() {
            let destination_id = job.destinations[index].destination_id.clone();
            match self.jobs.load_destination(&destination_id).await? {
                Some(destination) => {
                    let key = SessionKey::new(&job.id, &destination_id, &artifact.file_name);
                    self.sessions
                        .save_session(&TransferSession::new(key, artifact.size, now))
                        .await?;
                    job.destinations[index].remote_path =
                        Some(destination.remote_path(&artifact.file_name));
                }
                None => self.fail_destination(job, index, "destination is no longer configured"),
            }
        }
        job.artifact = Some(artifact);
        self.transition(job, JobPhase::TransferringStorages)?;
        self.settle(job)
    }

    /// Give one destination a transfer slice, round robin.
    async fn transfer_step(&self, job: &mut BackupJob, budget: Duration) -> Result<bool, EngineError> {
        let Some(index) = job.next_pending_destination() else {
            self.settle(job)?;
            return Ok(true);
        };
        job.transfer_cursor = (index + 1) % job.destinations.len();
        job.updated_at = self.clock.now();

        let artifact = job.artifact.clone().ok_or_else(|| {
            StorageError::Internal(format!("job {} is transferring without an artifact", job.id))
        })?;
        let destination_id = job.destinations[index].destination_id.clone();

        let Some(destination) = self.jobs.load_destination(&destination_id).await? else {
            self.fail_destination(job, index, "destination is no longer configured");
            self.settle(job)?;
            return Ok(true);
        };
        let adapter = match self.adapters.adapter_for(&destination).await {
            Ok(adapter) => adapter,
            Err(e) => {
                self.fail_destination(job, index, &format!("adapter unavailable: {}", e));
                self.settle(job)?;
                return Ok(true);
            }
        };

        let remote_path = job.destinations[index]
            .remote_path
            .clone()
            .unwrap_or_else(|| destination.remote_path(&artifact.file_name));

        if job.destinations[index].status == TransferStatus::Pending {
            if let Some(parent) = parent_dir(&remote_path) {
                if let Err(e) = adapter.create_dir(&parent).await {
                    self.count_retry(job, index, &format!("create_dir {}: {}", parent, e));
                    self.settle(job)?;
                    return Ok(true);
                }
            }
            let progress = &mut job.destinations[index];
            progress.status = TransferStatus::InProgress;
            progress.remote_path = Some(remote_path.clone());
            info!(job = %job.id, destination = %destination_id, "Transfer to {} started", remote_path);
        }

        let key = SessionKey::new(&job.id, &destination_id, &artifact.file_name);
        let now = self.clock.now();
        let mut session = match self.sessions.load_session(&key).await? {
            Some(session) if session.total_size == artifact.size => session,
            Some(_) | None => TransferSession::new(key.clone(), artifact.size, now),
        };

        if session.token_expired(now) {
            self.discard_session(adapter.as_ref(), &session).await?;
            job.destinations[index].bytes_transferred = 0;
            self.count_retry(job, index, "continuation token expired");
            self.settle(job)?;
            return Ok(true);
        }

        let offset = session.bytes_transferred;
        let length = self.settings.slice_bytes.unwrap_or(u64::MAX);
        let result = adapter
            .copy_to_storage(&artifact.path, &remote_path, offset, length, budget, &mut session)
            .await;

        let mut discarded = false;
        match result {
            Ok(outcome) => {
                let progressed = outcome.made_progress();
                job.destinations[index].bytes_transferred = session.bytes_transferred;
                if outcome.complete {
                    self.sessions.delete_session(&key).await?;
                    self.complete_destination(job, index);
                    let name = job.name.clone();
                    if let Err(e) =
                        apply_retention(adapter.as_ref(), &destination, &name, &artifact.file_name).await
                    {
                        warn!(destination = %destination_id, "Retention sweep failed: {}", e);
                    }
                } else {
                    self.sessions.save_session(&session).await?;
                    match outcome.interrupted {
                        Some(reason) if !progressed => self.count_retry(job, index, &reason),
                        Some(reason) => {
                            job.retry_count += 1;
                            let progress = &mut job.destinations[index];
                            progress.retry_count = 0;
                            progress.last_error = Some(reason);
                        }
                        None => job.destinations[index].retry_count = 0,
                    }
                    debug!(
                        job = %job.id,
                        destination = %destination_id,
                        "Slice moved {} bytes ({}/{})",
                        outcome.bytes, session.bytes_transferred, session.total_size
                    );
                }
            }
            Err(e) if e.is_recoverable() => {
                warn!(job = %job.id, destination = %destination_id, "{}; restarting from 0", e);
                self.discard_session(adapter.as_ref(), &session).await?;
                discarded = true;
                job.destinations[index].bytes_transferred = 0;
                self.count_retry(job, index, &e.to_string());
            }
            Err(e) => {
                self.fail_destination(job, index, &e.to_string());
            }
        }

        if job.destinations[index].status == TransferStatus::Failed && !discarded {
            self.discard_session(adapter.as_ref(), &session).await?;
        }

        self.settle(job)?;
        Ok(true)
    }

    async fn discard_session(
        &self,
        adapter: &dyn StorageAdapter,
        session: &TransferSession,
    ) -> Result<(), EngineError> {
        if session.token.is_some() {
            if let Err(e) = adapter.abort_session(session).await {
                warn!(destination = %session.key.destination_id, "Failed to abort upload session: {}", e);
            }
        }
        self.sessions.delete_session(&session.key).await?;
        Ok(())
    }

    fn complete_destination(&self, job: &mut BackupJob, index: usize) {
        let now = self.clock.now();
        let size = job.artifact.as_ref().map(|a| a.size).unwrap_or_default();
        let progress = &mut job.destinations[index];
        progress.status = TransferStatus::Complete;
        progress.bytes_transferred = size;
        progress.exists = Some(true);
        progress.completed_at = Some(now);
        progress.last_error = None;
        info!(job = %job.id, destination = %progress.destination_id, "Transfer complete ({} bytes)", size);
    }

    /// Count a retryable failure. The destination fails once its budget is spent.
    fn count_retry(&self, job: &mut BackupJob, index: usize, reason: &str) {
        job.retry_count += 1;
        let max = self.settings.max_retries;
        let progress = &mut job.destinations[index];
        progress.retry_count += 1;
        if progress.retry_count >= max {
            warn!(
                job = %job.id,
                destination = %progress.destination_id,
                "Retry budget exhausted after {} attempts: {}",
                progress.retry_count, reason
            );
            progress.status = TransferStatus::Failed;
            progress.last_error = Some(format!(
                "retry budget exhausted after {} attempts: {}",
                progress.retry_count, reason
            ));
        } else {
            warn!(
                job = %job.id,
                destination = %progress.destination_id,
                "Transfer interrupted (retry {}/{}): {}",
                progress.retry_count, max, reason
            );
            progress.last_error = Some(reason.to_string());
        }
    }

    fn fail_destination(&self, job: &mut BackupJob, index: usize, reason: &str) {
        let progress = &mut job.destinations[index];
        warn!(
            job = %job.id,
            destination = %progress.destination_id,
            "Transfer failed after {} retries: {}",
            progress.retry_count, reason
        );
        progress.status = TransferStatus::Failed;
        progress.last_error = Some(reason.to_string());
    }

    /// Move the job to its final phase once no destination is pending.
    fn settle(&self, job: &mut BackupJob) -> Result<(), EngineError> {
        if job.phase != JobPhase::TransferringStorages || !job.all_destinations_settled() {
            return Ok(());
        }
        if job.all_destinations_complete() {
            job.last_error = None;
            return self.transition(job, JobPhase::Complete);
        }

        let summary = job
            .destinations
            .iter()
            .filter(|d| d.status == TransferStatus::Failed)
            .map(|d| {
                format!(
                    "{}: {} (retries: {})",
                    d.destination_id,
                    d.last_error.as_deref().unwrap_or("unknown error"),
                    d.retry_count
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        job.last_error = Some(summary);
        self.transition(job, JobPhase::Error)
    }

    async fn cancel_step(&self, job: &mut BackupJob) -> Result<bool, EngineError> {
        for session in self.sessions.list_job_sessions(&job.id).await? {
            if session.token.is_none() {
                continue;
            }
            let Some(destination) = self.jobs.load_destination(&session.key.destination_id).await? else {
                continue;
            };
            match self.adapters.adapter_for(&destination).await {
                Ok(adapter) => {
                    if let Err(e) = adapter.abort_session(&session).await {
                        warn!(destination = %destination.id, "Failed to abort upload session: {}", e);
                    }
                }
                Err(e) => warn!(destination = %destination.id, "Adapter unavailable during cancel: {}", e),
            }
        }
        let removed = self.sessions.delete_job_sessions(&job.id).await?;
        debug!(job = %job.id, "Removed {} transfer session(s)", removed);

        if let Err(e) = self.builder.discard(job).await {
            warn!(job = %job.id, "Failed to discard staging state: {}", e);
        }

        let next = match job.cancelled_from {
            Some(JobPhase::TransferringStorages) => JobPhase::StorageCancelled,
            _ => JobPhase::BuildCancelled,
        };
        self.transition(job, next)?;
        Ok(true)
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Pull `remote_path` from a destination into `target`, one bounded slice.
    ///
    /// Progress is kept in a session so repeated calls resume. Returns `None`
    /// when the lock is busy.
    #[instrument(skip(self), level = "debug")]
    pub async fn download(
        &self,
        destination_id: &str,
        remote_path: &str,
        target: &Path,
        budget: Duration,
    ) -> Result<Option<DownloadProgress>, EngineError> {
        self.check_budget(budget)?;
        self.run_exclusive(self.download_locked(destination_id, remote_path, target, budget))
            .await
    }

    async fn download_locked(
        &self,
        destination_id: &str,
        remote_path: &str,
        target: &Path,
        budget: Duration,
    ) -> Result<DownloadProgress, EngineError> {
        validate_relative(remote_path)?;
        let destination = self.destination(destination_id).await?;
        let adapter = self.adapters.adapter_for(&destination).await?;
        let total = remote_size(adapter.as_ref(), remote_path).await?;

        let key = SessionKey::new(RESTORE_SESSION_JOB, destination_id, remote_path);
        let mut session = match self.sessions.load_session(&key).await? {
            Some(session) if session.total_size == total => session,
            Some(_) | None => TransferSession::new(key.clone(), total, self.clock.now()),
        };

        let offset = session.bytes_transferred;
        let length = self.settings.slice_bytes.unwrap_or(u64::MAX);
        let outcome = match adapter
            .copy_from_storage(remote_path, target, offset, length, budget, &mut session)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.sessions.delete_session(&key).await?;
                return Err(e.into());
            }
        };

        if outcome.complete {
            self.sessions.delete_session(&key).await?;
            info!(destination = %destination_id, "Downloaded {} ({} bytes)", remote_path, total);
        } else {
            self.sessions.save_session(&session).await?;
        }
        Ok(DownloadProgress {
            bytes_transferred: session.bytes_transferred,
            total_size: total,
            complete: outcome.complete,
            interrupted: outcome.interrupted,
        })
    }

    async fn destination(&self, destination_id: &str) -> Result<StorageDestination, EngineError> {
        self.jobs
            .load_destination(destination_id)
            .await?
            .ok_or_else(|| EngineError::DestinationNotFound(destination_id.to_string()))
    }
}

/// Size of a remote file, found through its parent listing.
async fn remote_size(adapter: &dyn StorageAdapter, remote_path: &str) -> Result<u64, TransferError> {
    let name = file_name(remote_path)
        .ok_or_else(|| StorageError::InvalidArgument(format!("not a file path: {}", remote_path)))?;
    let parent = parent_dir(remote_path).unwrap_or_default();
    adapter
        .scan_dir(&parent)
        .await?
        .into_iter()
        .find(|e| !e.is_dir && e.name == name)
        .map(|e| e.size)
        .ok_or_else(|| StorageError::NotFound(join_path(&parent, name)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, ids, run_to_end, step, Step};

    #[tokio::test]
    async fn test_job_completes_on_every_destination() {
        let h = harness(&["a", "b"], EngineSettings::default()).await;
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a", "b"])).await.unwrap();

        let phases = run_to_end(&h.engine, &job.job_id).await;
        assert_eq!(phases.last(), Some(&JobPhase::Complete));
        assert!(phases.windows(2).all(|w| w[0].rank() <= w[1].rank()));

        let snapshot = h.engine.snapshot(&job.job_id).await.unwrap();
        for dest in &snapshot.destinations {
            assert_eq!(dest.status, TransferStatus::Complete);
            assert_eq!(dest.percent, 100.0);
            assert_eq!(dest.exists, Some(true));
        }
        assert!(h.store.list_job_sessions(&job.job_id).await.unwrap().is_empty());
        assert!(h.factory.adapter("a").has_file("backups/nightly-0001.tar"));
    }

    #[tokio::test]
    async fn test_terminal_job_is_not_acted_on() {
        let h = harness(&["a"], EngineSettings::default()).await;
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();
        run_to_end(&h.engine, &job.job_id).await;
        let copies = h.factory.adapter("a").copies();

        match h.engine.advance(&job.job_id, Duration::ZERO).await.unwrap() {
            AdvanceOutcome::Advanced { snapshot, work_done } => {
                assert!(!work_done);
                assert_eq!(snapshot.phase, JobPhase::Complete);
            }
            AdvanceOutcome::Busy => panic!("lock unexpectedly busy"),
        }
        assert_eq!(h.factory.adapter("a").copies(), copies);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_destination_and_job() {
        let settings = EngineSettings {
            max_retries: 3,
            ..EngineSettings::default()
        };
        let h = harness(&["flaky", "good"], settings).await;
        h.factory.adapter("flaky").always(Step::Interrupt);
        let job = h
            .engine
            .create_job("nightly", "/srv", &ids(&["flaky", "good"]))
            .await
            .unwrap();

        let phases = run_to_end(&h.engine, &job.job_id).await;
        assert_eq!(phases.last(), Some(&JobPhase::Error));

        let snapshot = h.engine.snapshot(&job.job_id).await.unwrap();
        let flaky = &snapshot.destinations[0];
        assert_eq!(flaky.status, TransferStatus::Failed);
        assert_eq!(flaky.retry_count, 3);
        assert!(flaky.last_error.as_deref().unwrap().contains("retry budget exhausted"));
        // Partial success is preserved
        assert_eq!(snapshot.destinations[1].status, TransferStatus::Complete);
        assert!(snapshot.last_error.unwrap().contains("flaky"));
        assert_eq!(h.factory.adapter("flaky").copies(), 3);
    }

    #[tokio::test]
    async fn test_progress_resets_retry_counter() {
        let settings = EngineSettings {
            max_retries: 2,
            slice_bytes: Some(10),
            ..EngineSettings::default()
        };
        let h = harness(&["a"], settings).await;
        h.factory.adapter("a").script([
            Step::Interrupt,
            Step::Accept(10),
            Step::Interrupt,
            Step::Accept(10),
        ]);
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();

        let phases = run_to_end(&h.engine, &job.job_id).await;
        assert_eq!(phases.last(), Some(&JobPhase::Complete));
        let snapshot = h.engine.snapshot(&job.job_id).await.unwrap();
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.destinations[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_expired_session_restarts_from_zero() {
        let settings = EngineSettings {
            slice_bytes: Some(40),
            ..EngineSettings::default()
        };
        let h = harness(&["a"], settings).await;
        h.factory.adapter("a").script([Step::Accept(40), Step::Expire]);
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();

        // Created, Scanning, Building, first slice
        for _ in 0..4 {
            step(&h.engine, &job.job_id).await;
        }
        let snapshot = step(&h.engine, &job.job_id).await;
        assert_eq!(snapshot.phase, JobPhase::TransferringStorages);
        assert_eq!(snapshot.destinations[0].bytes_transferred, 0);
        assert_eq!(snapshot.retry_count, 1);
        let key = SessionKey::new(&job.job_id, "a", "nightly-0001.tar");
        assert!(h.store.load_session(&key).await.unwrap().is_none());

        let phases = run_to_end(&h.engine, &job.job_id).await;
        assert_eq!(phases.last(), Some(&JobPhase::Complete));
        assert_eq!(h.factory.adapter("a").tokens_established(), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_unrecoverable() {
        let h = harness(&["a", "b"], EngineSettings::default()).await;
        h.factory.adapter("b").script([Step::Reject]);
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a", "b"])).await.unwrap();

        let phases = run_to_end(&h.engine, &job.job_id).await;
        assert_eq!(phases.last(), Some(&JobPhase::Error));
        let snapshot = h.engine.snapshot(&job.job_id).await.unwrap();
        assert_eq!(snapshot.destinations[0].status, TransferStatus::Complete);
        assert_eq!(snapshot.destinations[1].status, TransferStatus::Failed);
        assert_eq!(snapshot.destinations[1].retry_count, 0);
        assert!(h.factory.adapter("b").aborted() >= 1);
    }

    #[tokio::test]
    async fn test_cancel_during_transfer() {
        let settings = EngineSettings {
            slice_bytes: Some(10),
            ..EngineSettings::default()
        };
        let h = harness(&["a"], settings).await;
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();
        for _ in 0..4 {
            step(&h.engine, &job.job_id).await;
        }
        assert!(h.engine.request_cancel(&job.job_id).await.unwrap());

        let snapshot = step(&h.engine, &job.job_id).await;
        assert_eq!(snapshot.phase, JobPhase::PendingCancel);
        // Persisted progress survives the cancellation request
        assert_eq!(snapshot.destinations[0].bytes_transferred, 10);

        let snapshot = step(&h.engine, &job.job_id).await;
        assert_eq!(snapshot.phase, JobPhase::StorageCancelled);
        assert!(h.store.list_job_sessions(&job.job_id).await.unwrap().is_empty());
        assert!(!h.store.cancel_requested(&job.job_id).await.unwrap());
        assert_eq!(h.factory.adapter("a").aborted(), 1);
        assert_eq!(h.builder.discarded(), 1);
        assert!(!h.engine.request_cancel(&job.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_during_build() {
        let h = harness(&["a"], EngineSettings::default()).await;
        h.builder.pending_builds(5);
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();
        for _ in 0..3 {
            step(&h.engine, &job.job_id).await;
        }
        h.engine.request_cancel(&job.job_id).await.unwrap();

        let phases = run_to_end(&h.engine, &job.job_id).await;
        assert_eq!(phases, vec![JobPhase::PendingCancel, JobPhase::BuildCancelled]);
        assert_eq!(h.factory.adapter("a").copies(), 0);
    }

    #[tokio::test]
    async fn test_build_retry_exhaustion_cancels() {
        let settings = EngineSettings {
            max_retries: 2,
            ..EngineSettings::default()
        };
        let h = harness(&["a"], settings).await;
        h.builder.fail_builds(2);
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();

        let phases = run_to_end(&h.engine, &job.job_id).await;
        assert_eq!(phases.last(), Some(&JobPhase::BuildCancelled));
        assert!(!phases.contains(&JobPhase::PendingCancel));
        assert_eq!(h.builder.discarded(), 1);
        let snapshot = h.engine.snapshot(&job.job_id).await.unwrap();
        assert_eq!(snapshot.retry_count, 2);
        assert!(snapshot.last_error.unwrap().contains("build retry budget exhausted"));
    }

    #[tokio::test]
    async fn test_losing_invocation_mutates_nothing() {
        let h = harness(&["a"], EngineSettings::default()).await;
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();
        let before = h.store.load_job(&job.job_id).await.unwrap();

        h.lock
            .acquire(DEFAULT_LOCK_NAME, "other-process", Duration::from_secs(60))
            .await
            .unwrap();
        let outcome = h.engine.advance(&job.job_id, Duration::ZERO).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Busy));
        assert_eq!(h.store.load_job(&job.job_id).await.unwrap(), before);

        h.lock.release(DEFAULT_LOCK_NAME, "other-process").await.unwrap();
        let snapshot = step(&h.engine, &job.job_id).await;
        assert_eq!(snapshot.phase, JobPhase::Scanning);
    }

    #[tokio::test]
    async fn test_budget_must_fit_inside_lock_ttl() {
        let settings = EngineSettings {
            lock_ttl: Duration::from_secs(60),
            ..EngineSettings::default()
        };
        let h = harness(&["a"], settings).await;
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();
        let before = h.store.load_job(&job.job_id).await.unwrap();

        let err = h
            .engine
            .advance(&job.job_id, Duration::from_secs(31))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert!(h.lock.holder(DEFAULT_LOCK_NAME).await.unwrap().is_none());
        assert_eq!(h.store.load_job(&job.job_id).await.unwrap(), before);
        assert!(h
            .engine
            .download("a", "backups/x.tar", Path::new("/tmp/x"), Duration::from_secs(61))
            .await
            .is_err());

        // A holder within the TTL still excludes a second invocation
        let outcome = h.engine.advance(&job.job_id, Duration::from_secs(30)).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Advanced { .. }));
        h.lock
            .acquire(DEFAULT_LOCK_NAME, "other-process", Duration::from_secs(60))
            .await
            .unwrap();
        h.clock.advance(Duration::from_secs(30));
        let outcome = h.engine.advance(&job.job_id, Duration::from_secs(30)).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Busy));
    }

    #[tokio::test]
    async fn test_lock_released_on_error() {
        let h = harness(&["a"], EngineSettings::default()).await;
        let err = h.engine.advance("missing", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound(_)));
        assert!(h.lock.holder(DEFAULT_LOCK_NAME).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_job_validates_destinations() {
        let h = harness(&["a"], EngineSettings::default()).await;
        assert!(matches!(
            h.engine.create_job("nightly", "/srv", &ids(&["zzz"])).await,
            Err(EngineError::DestinationNotFound(_))
        ));
        assert!(h.engine.create_job("nightly", "/srv", &[]).await.is_err());
        assert!(h.engine.create_job("a/b", "/srv", &ids(&["a"])).await.is_err());
        assert!(h
            .engine
            .create_job("nightly", "/srv", &ids(&["a", "a"]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_job_requires_terminal_phase() {
        let h = harness(&["a"], EngineSettings::default()).await;
        let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();
        assert!(h.engine.delete_job(&job.job_id).await.is_err());

        run_to_end(&h.engine, &job.job_id).await;
        h.engine.delete_job(&job.job_id).await.unwrap().unwrap();
        assert!(matches!(
            h.engine.snapshot(&job.job_id).await,
            Err(EngineError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_download_resumes_across_calls() {
        let settings = EngineSettings {
            slice_bytes: Some(30),
            ..EngineSettings::default()
        };
        let h = harness(&["a"], settings).await;
        h.factory.adapter("a").put_file("backups/old-1.tar", 70);
        let target = Path::new("/nonexistent/restore.tar");

        let mut calls = 0;
        loop {
            calls += 1;
            let progress = h
                .engine
                .download("a", "backups/old-1.tar", target, Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
            if progress.complete {
                assert_eq!(progress.bytes_transferred, 70);
                break;
            }
        }
        assert_eq!(calls, 3);
        let key = SessionKey::new(RESTORE_SESSION_JOB, "a", "backups/old-1.tar");
        assert!(h.store.load_session(&key).await.unwrap().is_none());
    }
}
