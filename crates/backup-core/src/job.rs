use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Lifecycle phase of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Created,
    Scanning,
    Building,
    TransferringStorages,
    PendingCancel,
    Complete,
    Error,
    BuildCancelled,
    StorageCancelled,
}

impl JobPhase {
    /// Terminal phases are never acted on by `advance`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobPhase::Complete
                | JobPhase::Error
                | JobPhase::BuildCancelled
                | JobPhase::StorageCancelled
        )
    }

    /// Position in the transition graph. Every edge strictly increases it.
    pub fn rank(self) -> u8 {
        match self {
            JobPhase::Created => 0,
            JobPhase::Scanning => 1,
            JobPhase::Building => 2,
            JobPhase::TransferringStorages => 3,
            JobPhase::PendingCancel => 4,
            JobPhase::Complete
            | JobPhase::Error
            | JobPhase::BuildCancelled
            | JobPhase::StorageCancelled => 5,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Created, Scanning)
                | (Scanning, Building)
                | (Building, TransferringStorages)
                | (TransferringStorages, Complete)
                | (Created | Scanning | Building | TransferringStorages, Error)
                | (Created | Scanning | Building | TransferringStorages, PendingCancel)
                | (Created | Scanning | Building, BuildCancelled)
                | (PendingCancel, BuildCancelled | StorageCancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Created => "created",
            JobPhase::Scanning => "scanning",
            JobPhase::Building => "building",
            JobPhase::TransferringStorages => "transferring_storages",
            JobPhase::PendingCancel => "pending_cancel",
            JobPhase::Complete => "complete",
            JobPhase::Error => "error",
            JobPhase::BuildCancelled => "build_cancelled",
            JobPhase::StorageCancelled => "storage_cancelled",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer state of one destination within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl TransferStatus {
    /// Settled destinations receive no further transfer slices.
    pub fn is_settled(self) -> bool {
        matches!(self, TransferStatus::Complete | TransferStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Complete => "complete",
            TransferStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fully materialized build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name used at every destination
    pub file_name: String,
    /// Local path of the materialized artifact
    pub path: PathBuf,
    /// Size in bytes, known once the build finishes
    pub size: u64,
    /// Hex SHA-256 of the content, when the builder computed one
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Per-destination progress of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationProgress {
    pub destination_id: String,
    pub status: TransferStatus,
    #[serde(default)]
    pub bytes_transferred: u64,
    /// Consecutive retryable failures since the last forward progress
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Path of the artifact relative to the destination root
    #[serde(default)]
    pub remote_path: Option<String>,
    /// Last existence check result from the reconciler
    #[serde(default)]
    pub exists: Option<bool>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DestinationProgress {
    pub fn new(destination_id: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            retry_count: 0,
            last_error: None,
            remote_path: None,
            exists: None,
            completed_at: None,
        }
    }
}

/// One backup build-and-distribute task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    /// Artifact name prefix, also used to match older artifacts for retention
    pub name: String,
    /// Opaque source descriptor handed to the artifact builder
    pub source: String,
    pub phase: JobPhase,
    /// Total retryable failures the job has absorbed
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Target destinations, in the order selected at creation
    pub destinations: Vec<DestinationProgress>,
    #[serde(default)]
    pub artifact: Option<Artifact>,
    /// Phase the job was in when cancellation was observed
    #[serde(default)]
    pub cancelled_from: Option<JobPhase>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Round-robin position for the next transfer slice
    #[serde(default)]
    pub transfer_cursor: usize,
    #[serde(default)]
    pub marked_for_deletion: bool,
}

impl BackupJob {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
        destination_ids: &[String],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source: source.into(),
            phase: JobPhase::Created,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            destinations: destination_ids
                .iter()
                .map(DestinationProgress::new)
                .collect(),
            artifact: None,
            cancelled_from: None,
            last_error: None,
            transfer_cursor: 0,
            marked_for_deletion: false,
        }
    }

    /// Move to `next`, rejecting any edge outside the transition graph.
    pub fn transition(&mut self, next: JobPhase, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.phase.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn destination(&self, destination_id: &str) -> Option<&DestinationProgress> {
        self.destinations
            .iter()
            .find(|d| d.destination_id == destination_id)
    }

    /// Index of the next unsettled destination, starting at the round-robin cursor.
    pub fn next_pending_destination(&self) -> Option<usize> {
        let len = self.destinations.len();
        (0..len)
            .map(|step| (self.transfer_cursor + step) % len)
            .find(|&i| !self.destinations[i].status.is_settled())
    }

    pub fn all_destinations_complete(&self) -> bool {
        self.destinations
            .iter()
            .all(|d| d.status == TransferStatus::Complete)
    }

    pub fn all_destinations_settled(&self) -> bool {
        self.destinations.iter().all(|d| d.status.is_settled())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let size = self.artifact.as_ref().map(|a| a.size);
        JobSnapshot {
            job_id: self.id.clone(),
            name: self.name.clone(),
            phase: self.phase,
            retry_count: self.retry_count,
            updated_at: self.updated_at,
            artifact: self.artifact.clone(),
            last_error: self.last_error.clone(),
            marked_for_deletion: self.marked_for_deletion,
            destinations: self
                .destinations
                .iter()
                .map(|d| DestinationSnapshot {
                    destination_id: d.destination_id.clone(),
                    status: d.status,
                    bytes_transferred: d.bytes_transferred,
                    percent: percent(d, size),
                    retry_count: d.retry_count,
                    last_error: d.last_error.clone(),
                    exists: d.exists,
                })
                .collect(),
        }
    }
}

fn percent(progress: &DestinationProgress, size: Option<u64>) -> f64 {
    if progress.status == TransferStatus::Complete {
        return 100.0;
    }
    match size {
        Some(0) | None => 0.0,
        Some(size) => (progress.bytes_transferred as f64 / size as f64 * 100.0).min(100.0),
    }
}

/// Read-only view of a job returned to drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub name: String,
    pub phase: JobPhase,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
    pub artifact: Option<Artifact>,
    pub last_error: Option<String>,
    pub marked_for_deletion: bool,
    pub destinations: Vec<DestinationSnapshot>,
}

/// Per-destination part of a [`JobSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationSnapshot {
    pub destination_id: String,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub percent: f64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub exists: Option<bool>,
}
