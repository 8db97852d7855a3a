//! In-memory collaborators and an engine harness for unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::adapter::{window_end, AdapterFactory, CopyOutcome, DirEntry, StorageAdapter};
use crate::builder::{ArtifactBuilder, BuildProgress, ScanProgress};
use crate::clock::ManualClock;
use crate::destination::{DestinationKind, StorageDestination};
use crate::error::{BuildError, StorageError, TransferError};
use crate::engine::{AdvanceOutcome, Engine, EngineSettings};
use crate::job::{Artifact, BackupJob, JobPhase, JobSnapshot};
use crate::lock::RecordLock;
use crate::memory::MemoryStateStore;
use crate::path::{join_path, parent_dir, segments};
use crate::session::{ContinuationToken, TransferSession};
use crate::store::JobStore;

/// What the next `copy_to_storage` call does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Accept up to this many bytes
    Accept(u64),
    /// Transient failure before any byte
    Interrupt,
    Expire,
    Reject,
}

#[derive(Default)]
pub struct ScriptedAdapter {
    steps: Mutex<VecDeque<Step>>,
    fallback: Mutex<Option<Step>>,
    files: Mutex<BTreeMap<String, u64>>,
    fail_exists: AtomicBool,
    copies: AtomicUsize,
    aborted: AtomicUsize,
    tokens: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.steps.lock().unwrap().extend(steps);
    }

    /// Repeat `step` once the script is exhausted.
    pub fn always(&self, step: Step) {
        *self.fallback.lock().unwrap() = Some(step);
    }

    pub fn fail_exists(&self, fail: bool) {
        self.fail_exists.store(fail, Ordering::SeqCst);
    }

    pub fn put_file(&self, path: &str, size: u64) {
        self.files.lock().unwrap().insert(join_path("", path), size);
    }

    pub fn remove_file(&self, path: &str) {
        self.files.lock().unwrap().remove(&join_path("", path));
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(&join_path("", path))
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn tokens_established(&self) -> usize {
        self.tokens.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.lock().unwrap().clone())
            .unwrap_or(Step::Accept(u64::MAX))
    }

    fn ensure_token(&self, session: &mut TransferSession, path: &str) {
        if session.is_fresh() {
            let n = self.tokens.fetch_add(1, Ordering::SeqCst);
            session.establish(ContinuationToken::new(format!("{}#{}", path, n)));
        }
    }
}

#[async_trait]
impl StorageAdapter for ScriptedAdapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Local
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        if self.fail_exists.load(Ordering::SeqCst) {
            return Err(StorageError::Io("connection reset".to_string()));
        }
        Ok(self.has_file(path))
    }

    async fn create_dir(&self, _path: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete(&self, path: &str, _recursive: bool) -> Result<bool, StorageError> {
        Ok(self.files.lock().unwrap().remove(&join_path("", path)).is_some())
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(to) {
            return Err(StorageError::AlreadyExists(to.to_string()));
        }
        let size = files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), size);
        Ok(())
    }

    async fn scan_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let dir = join_path("", path);
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| parent_dir(p).unwrap_or_default() == dir)
            .filter_map(|(p, size)| {
                segments(p).last().map(|name| DirEntry {
                    name: name.to_string(),
                    is_dir: false,
                    size: *size,
                    modified_at: None,
                })
            })
            .collect())
    }

    async fn copy_to_storage(
        &self,
        _source: &Path,
        dest_path: &str,
        _offset: u64,
        length: u64,
        _budget: Duration,
        session: &mut TransferSession,
    ) -> Result<CopyOutcome, TransferError> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.ensure_token(session, dest_path);
        match self.next_step() {
            Step::Accept(n) => {
                let start = session.bytes_transferred;
                let end = window_end(start, length.min(n), session.total_size);
                session.advance(end - start);
                let complete = session.is_complete();
                if complete {
                    self.put_file(dest_path, session.total_size);
                }
                Ok(CopyOutcome {
                    bytes: end - start,
                    complete,
                    interrupted: None,
                })
            }
            Step::Interrupt => Ok(CopyOutcome {
                bytes: 0,
                complete: false,
                interrupted: Some("503 Service Unavailable".to_string()),
            }),
            Step::Expire => Err(TransferError::SessionExpired(dest_path.to_string())),
            Step::Reject => Err(TransferError::Rejected("403 Forbidden".to_string())),
        }
    }

    async fn copy_from_storage(
        &self,
        dest_path: &str,
        _target: &Path,
        _offset: u64,
        length: u64,
        _budget: Duration,
        session: &mut TransferSession,
    ) -> Result<CopyOutcome, TransferError> {
        self.ensure_token(session, dest_path);
        let start = session.bytes_transferred;
        let end = window_end(start, length, session.total_size);
        session.advance(end - start);
        Ok(CopyOutcome {
            bytes: end - start,
            complete: session.is_complete(),
            interrupted: None,
        })
    }

    async fn abort_session(&self, _session: &TransferSession) -> Result<(), StorageError> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedFactory {
    adapters: HashMap<String, Arc<ScriptedAdapter>>,
}

impl ScriptedFactory {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            adapters: ids
                .iter()
                .map(|id| (id.to_string(), Arc::new(ScriptedAdapter::default())))
                .collect(),
        }
    }

    pub fn adapter(&self, id: &str) -> Arc<ScriptedAdapter> {
        self.adapters[id].clone()
    }
}

#[async_trait]
impl AdapterFactory for ScriptedFactory {
    async fn adapter_for(
        &self,
        destination: &StorageDestination,
    ) -> Result<Arc<dyn StorageAdapter>, StorageError> {
        self.adapters
            .get(&destination.id)
            .map(|a| a.clone() as Arc<dyn StorageAdapter>)
            .ok_or_else(|| StorageError::NotFound(destination.id.clone()))
    }
}

/// Builder whose artifact is ready after a configurable number of slices.
pub struct ReadyBuilder {
    artifact: Artifact,
    pending_builds: AtomicUsize,
    failing_builds: AtomicUsize,
    discarded: AtomicUsize,
}

impl ReadyBuilder {
    pub fn new(file_name: &str, size: u64) -> Self {
        Self {
            artifact: Artifact {
                file_name: file_name.to_string(),
                path: PathBuf::from("/staging").join(file_name),
                size,
                sha256: None,
            },
            pending_builds: AtomicUsize::new(0),
            failing_builds: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    pub fn pending_builds(&self, n: usize) {
        self.pending_builds.store(n, Ordering::SeqCst);
    }

    pub fn fail_builds(&self, n: usize) {
        self.failing_builds.store(n, Ordering::SeqCst);
    }

    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ArtifactBuilder for ReadyBuilder {
    async fn scan(&self, _job: &BackupJob, _budget: Duration) -> Result<ScanProgress, BuildError> {
        Ok(ScanProgress::Done)
    }

    async fn build(&self, _job: &BackupJob, _budget: Duration) -> Result<BuildProgress, BuildError> {
        if take_one(&self.failing_builds) {
            return Err(BuildError::Retryable("disk busy".to_string()));
        }
        if take_one(&self.pending_builds) {
            return Ok(BuildProgress::Pending);
        }
        Ok(BuildProgress::Materialized(self.artifact.clone()))
    }

    async fn discard(&self, _job: &BackupJob) -> Result<(), BuildError> {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStateStore>,
    pub lock: Arc<RecordLock>,
    pub factory: Arc<ScriptedFactory>,
    pub builder: Arc<ReadyBuilder>,
    pub clock: Arc<ManualClock>,
}

/// Engine over an in-memory store with one scripted adapter per destination.
///
/// Destinations place artifacts under `backups/`.
pub async fn harness(destinations: &[&str], settings: EngineSettings) -> Harness {
    let store = Arc::new(MemoryStateStore::new());
    for id in destinations {
        let mut dest = StorageDestination::new(*id, DestinationKind::Local, "/");
        dest.folder = Some("backups".to_string());
        store.save_destination(&dest).await.unwrap();
    }
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let lock = Arc::new(RecordLock::new(store.clone()).with_clock(clock.clone()));
    let factory = Arc::new(ScriptedFactory::new(destinations));
    let builder = Arc::new(ReadyBuilder::new("nightly-0001.tar", 100));
    let engine = Engine::new(
        store.clone(),
        store.clone(),
        lock.clone(),
        factory.clone(),
        builder.clone(),
    )
    .with_settings(settings)
    .with_clock(clock.clone());
    Harness {
        engine,
        store,
        lock,
        factory,
        builder,
        clock,
    }
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub async fn step(engine: &Engine, job_id: &str) -> JobSnapshot {
    match engine.advance(job_id, Duration::ZERO).await.unwrap() {
        AdvanceOutcome::Advanced { snapshot, .. } => snapshot,
        AdvanceOutcome::Busy => panic!("lock unexpectedly busy"),
    }
}

/// Advance until terminal, returning every observed phase.
pub async fn run_to_end(engine: &Engine, job_id: &str) -> Vec<JobPhase> {
    let mut phases = Vec::new();
    for _ in 0..200 {
        let snapshot = step(engine, job_id).await;
        phases.push(snapshot.phase);
        if snapshot.phase.is_terminal() {
            return phases;
        }
    }
    panic!("job {} never reached a terminal phase", job_id);
}
