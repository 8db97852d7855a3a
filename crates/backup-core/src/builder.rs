use std::time::Duration;

use async_trait::async_trait;

use crate::error::BuildError;
use crate::job::{Artifact, BackupJob};

/// Progress of one scan slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanProgress {
    /// More scanning is needed
    Pending,
    /// The source has been fully enumerated
    Done,
}

/// Progress of one build slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildProgress {
    /// More building is needed
    Pending,
    /// The artifact is complete on local disk and its size is final
    Materialized(Artifact),
}

/// Produces the backup artifact for a job, one bounded slice at a time.
///
/// Implementations keep their own progress between calls (a staging
/// directory, a manifest) and must tolerate being interrupted at any point.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn scan(&self, job: &BackupJob, budget: Duration) -> Result<ScanProgress, BuildError>;

    async fn build(&self, job: &BackupJob, budget: Duration) -> Result<BuildProgress, BuildError>;

    /// Remove staging state of a cancelled job.
    async fn discard(&self, _job: &BackupJob) -> Result<(), BuildError> {
        Ok(())
    }
}
