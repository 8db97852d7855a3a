use thiserror::Error;

use crate::job::JobPhase;

/// Errors that can occur in the storage and state layers.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by a resumable copy.
///
/// Transient failures and range mismatches never show up here: adapters absorb
/// them and report partial progress instead.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Continuation token expired: {0}")]
    SessionExpired(String),

    #[error("Size mismatch: expected {expected} bytes, destination holds {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Destination rejected the transfer: {0}")]
    Rejected(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TransferError {
    /// Whether the session can be recreated and the transfer retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransferError::SessionExpired(_))
    }
}

/// Errors reported by an [`ArtifactBuilder`](crate::ArtifactBuilder).
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build step failed, will retry: {0}")]
    Retryable(String),

    #[error("Build failed: {0}")]
    Fatal(String),
}

/// Errors returned by the engine to its driver.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    #[error("Invalid phase transition {from} -> {to}")]
    InvalidTransition { from: JobPhase, to: JobPhase },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
