use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::job::{BackupJob, JobPhase, TransferStatus};
use crate::store::ReconcileCursor;

/// Default minimum interval between two checks of the same job.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(600);

/// Outcome of one reconcile chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Jobs checked in this chunk. Zero means the sweep is done for now.
    pub processed: usize,
    /// Jobs with no surviving artifact at any destination
    pub marked: usize,
    /// Marked jobs deleted because pruning was requested
    pub purged: usize,
    /// The engine lock was held by another invocation
    pub busy: bool,
}

/// Rate-limited sweep re-validating completed jobs against their destinations.
pub struct Reconciler<'a> {
    engine: &'a Engine,
}

impl Engine {
    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler { engine: self }
    }
}

impl Reconciler<'_> {
    /// Check the next batch of due jobs.
    ///
    /// Call repeatedly until `processed` is zero. With `prune`, jobs whose
    /// artifact exists at no destination are deleted instead of only marked.
    #[instrument(skip(self), level = "debug")]
    pub async fn process_next_chunk(
        &self,
        min_interval: Duration,
        prune: bool,
    ) -> Result<ReconcileReport, EngineError> {
        let report = self
            .engine
            .run_exclusive(self.process_locked(min_interval, prune))
            .await?;
        Ok(report.unwrap_or(ReconcileReport {
            busy: true,
            ..ReconcileReport::default()
        }))
    }

    async fn process_locked(
        &self,
        min_interval: Duration,
        prune: bool,
    ) -> Result<ReconcileReport, EngineError> {
        let now = self.engine.clock.now();
        let mut due: Vec<(Option<DateTime<Utc>>, BackupJob)> = Vec::new();
        for job in self.engine.jobs.list_jobs().await? {
            if job.phase != JobPhase::Complete {
                continue;
            }
            let cursor = self.engine.jobs.load_cursor(&job.id).await?;
            if cursor.as_ref().is_some_and(|c| !c.is_due(now, min_interval)) {
                continue;
            }
            due.push((cursor.map(|c| c.last_checked_at), job));
        }

        // Never-checked jobs first, then the stalest.
        due.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.created_at.cmp(&b.1.created_at))
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        due.truncate(self.engine.settings.reconcile_batch.max(1));

        let mut report = ReconcileReport::default();
        for (_, job) in due {
            self.check_job(job, prune, now, &mut report).await?;
            report.processed += 1;
        }
        if report.processed > 0 {
            info!(
                "Reconciled {} job(s): {} marked, {} purged",
                report.processed, report.marked, report.purged
            );
        }
        Ok(report)
    }

    async fn check_job(
        &self,
        mut job: BackupJob,
        prune: bool,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), EngineError> {
        let file_name = job.artifact.as_ref().map(|a| a.file_name.clone());
        let mut confirmed = 0usize;
        let mut unknown = 0usize;

        for progress in job
            .destinations
            .iter_mut()
            .filter(|d| d.status == TransferStatus::Complete)
        {
            let Some(destination) = self
                .engine
                .jobs
                .load_destination(&progress.destination_id)
                .await?
            else {
                debug!(job = %job.id, "Destination {} no longer configured", progress.destination_id);
                progress.exists = Some(false);
                continue;
            };
            let path = match (&progress.remote_path, &file_name) {
                (Some(path), _) => path.clone(),
                (None, Some(name)) => destination.remote_path(name),
                (None, None) => {
                    progress.exists = Some(false);
                    continue;
                }
            };
            let adapter = match self.engine.adapters.adapter_for(&destination).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(job = %job.id, destination = %destination.id, "Adapter unavailable: {}", e);
                    unknown += 1;
                    continue;
                }
            };
            match adapter.exists(&path).await {
                Ok(true) => {
                    confirmed += 1;
                    progress.exists = Some(true);
                }
                Ok(false) => {
                    warn!(job = %job.id, destination = %destination.id, "Artifact {} is gone", path);
                    progress.exists = Some(false);
                }
                Err(e) => {
                    warn!(job = %job.id, destination = %destination.id, "Existence check failed: {}", e);
                    unknown += 1;
                }
            }
        }

        if confirmed == 0 && unknown == 0 {
            job.marked_for_deletion = true;
            report.marked += 1;
            if prune {
                self.engine.purge_job(&job).await?;
                report.purged += 1;
                return Ok(());
            }
        } else if confirmed > 0 {
            job.marked_for_deletion = false;
        }

        self.engine.jobs.save_job(&job).await?;
        self.engine
            .jobs
            .save_cursor(&ReconcileCursor::new(&job.id, now))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineSettings, DEFAULT_LOCK_NAME};
    use crate::lock::LockManager;
    use crate::store::JobStore;
    use crate::testing::{harness, ids, run_to_end, Harness};

    const ARTIFACT: &str = "backups/nightly-0001.tar";

    async fn completed(destinations: &[&str], settings: EngineSettings) -> (Harness, String) {
        let h = harness(destinations, settings).await;
        let job = h
            .engine
            .create_job("nightly", "/srv", &ids(destinations))
            .await
            .unwrap();
        assert_eq!(
            run_to_end(&h.engine, &job.job_id).await.last(),
            Some(&JobPhase::Complete)
        );
        (h, job.job_id)
    }

    #[tokio::test]
    async fn test_throttled_by_min_interval() {
        let (h, _job) = completed(&["a"], EngineSettings::default()).await;
        let reconciler = h.engine.reconciler();

        let first = reconciler.process_next_chunk(DEFAULT_MIN_INTERVAL, false).await.unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(
            reconciler.process_next_chunk(DEFAULT_MIN_INTERVAL, false).await.unwrap().processed,
            0
        );

        h.clock.advance(Duration::from_secs(599));
        assert_eq!(
            reconciler.process_next_chunk(DEFAULT_MIN_INTERVAL, false).await.unwrap().processed,
            0
        );

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(
            reconciler.process_next_chunk(DEFAULT_MIN_INTERVAL, false).await.unwrap().processed,
            1
        );
    }

    #[tokio::test]
    async fn test_missing_everywhere_marks_then_prunes() {
        let (h, job_id) = completed(&["a", "b"], EngineSettings::default()).await;
        h.factory.adapter("a").remove_file(ARTIFACT);
        h.factory.adapter("b").remove_file(ARTIFACT);
        let reconciler = h.engine.reconciler();

        let report = reconciler.process_next_chunk(DEFAULT_MIN_INTERVAL, false).await.unwrap();
        assert_eq!(report.marked, 1);
        assert_eq!(report.purged, 0);
        let snapshot = h.engine.snapshot(&job_id).await.unwrap();
        assert!(snapshot.marked_for_deletion);
        assert!(snapshot.destinations.iter().all(|d| d.exists == Some(false)));

        h.clock.advance(DEFAULT_MIN_INTERVAL);
        let report = reconciler.process_next_chunk(DEFAULT_MIN_INTERVAL, true).await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(h.store.load_job(&job_id).await.unwrap().is_none());
        assert!(h.store.load_cursor(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_surviving_copy_keeps_job() {
        let (h, job_id) = completed(&["a", "b"], EngineSettings::default()).await;
        h.factory.adapter("a").remove_file(ARTIFACT);

        let report = h
            .engine
            .reconciler()
            .process_next_chunk(DEFAULT_MIN_INTERVAL, true)
            .await
            .unwrap();
        assert_eq!(report, ReconcileReport { processed: 1, ..ReconcileReport::default() });
        let snapshot = h.engine.snapshot(&job_id).await.unwrap();
        assert!(!snapshot.marked_for_deletion);
        assert_eq!(snapshot.destinations[0].exists, Some(false));
        assert_eq!(snapshot.destinations[1].exists, Some(true));
    }

    #[tokio::test]
    async fn test_failed_check_never_marks() {
        let (h, job_id) = completed(&["a"], EngineSettings::default()).await;
        h.factory.adapter("a").fail_exists(true);

        let report = h
            .engine
            .reconciler()
            .process_next_chunk(DEFAULT_MIN_INTERVAL, true)
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.marked, 0);
        assert!(h.store.load_job(&job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_chunks_are_bounded_by_batch_size() {
        let settings = EngineSettings {
            reconcile_batch: 2,
            ..EngineSettings::default()
        };
        let h = harness(&["a"], settings).await;
        for _ in 0..3 {
            let job = h.engine.create_job("nightly", "/srv", &ids(&["a"])).await.unwrap();
            run_to_end(&h.engine, &job.job_id).await;
        }
        let reconciler = h.engine.reconciler();
        let sizes: Vec<usize> = {
            let mut sizes = Vec::new();
            loop {
                let report = reconciler.process_next_chunk(DEFAULT_MIN_INTERVAL, false).await.unwrap();
                sizes.push(report.processed);
                if report.processed == 0 {
                    break sizes;
                }
            }
        };
        assert_eq!(sizes, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_busy_lock_reports_busy() {
        let (h, _job) = completed(&["a"], EngineSettings::default()).await;
        h.lock
            .acquire(DEFAULT_LOCK_NAME, "other", Duration::from_secs(60))
            .await
            .unwrap();
        let report = h
            .engine
            .reconciler()
            .process_next_chunk(DEFAULT_MIN_INTERVAL, false)
            .await
            .unwrap();
        assert!(report.busy);
        assert_eq!(report.processed, 0);
    }
}
