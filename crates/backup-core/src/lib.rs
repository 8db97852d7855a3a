//! Job lifecycle, resumable transfer contracts and remote-existence
//! reconciliation for backups driven by short, bounded invocations.

pub mod adapter;
pub mod builder;
pub mod clock;
pub mod destination;
pub mod engine;
pub mod error;
pub mod job;
pub mod lock;
pub mod memory;
pub mod path;
pub mod reconcile;
pub mod retention;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use adapter::{AdapterFactory, CopyOutcome, DirEntry, SliceBudget, StorageAdapter};
pub use builder::{ArtifactBuilder, BuildProgress, ScanProgress};
pub use clock::{Clock, ManualClock, SystemClock};
pub use destination::{DestinationKind, StorageDestination};
pub use engine::{AdvanceOutcome, DownloadProgress, Engine, EngineSettings};
pub use error::{BuildError, EngineError, StorageError, TransferError};
pub use job::{
    Artifact, BackupJob, DestinationProgress, DestinationSnapshot, JobPhase, JobSnapshot,
    TransferStatus,
};
pub use lock::{LockAcquireResult, LockManager, RecordLock};
pub use memory::MemoryStateStore;
pub use reconcile::{ReconcileReport, Reconciler};
pub use session::{ContinuationToken, SessionKey, TransferSession};
pub use store::{
    EnvironmentSettings, JobStore, LockKind, LockRecord, LockRecordStore, ReconcileCursor,
    SessionStore,
};
