//! Queue watchdog.
//!
//! Runs on its own timer, independently of the processor. Each cycle reclaims
//! jobs that have been Processing for too long (the worker most likely died)
//! and prunes terminal jobs past the retention window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::blocking;
use super::job_store::AnalysisJobStore;
use super::models::StaleResetReport;
use crate::config::WatchdogSettings;
use crate::metrics;

/// What a single watchdog cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogReport {
    pub stale: StaleResetReport,
    pub pruned: usize,
}

pub struct QueueWatchdog {
    store: Arc<dyn AnalysisJobStore>,
    interval: Duration,
    stale_after: Duration,
    retention: Duration,
    max_attempts: i32,
}

impl QueueWatchdog {
    /// # Arguments
    /// * `store` - Queue store shared with the processor
    /// * `settings` - Timer, stale threshold and retention window
    /// * `max_attempts` - Claims after which a stale job is failed instead of retried
    pub fn new(
        store: Arc<dyn AnalysisJobStore>,
        settings: &WatchdogSettings,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            interval: Duration::from_secs(settings.interval_secs),
            stale_after: Duration::from_secs(settings.stale_after_secs),
            retention: Duration::from_secs(settings.retention_hours * 3600),
            max_attempts: max_attempts as i32,
        }
    }

    /// Reset jobs stuck in Processing longer than the stale threshold.
    pub async fn reclaim_stale(&self) -> Result<StaleResetReport> {
        let store = self.store.clone();
        let stale_after = self.stale_after.as_secs() as i64;
        let max_attempts = self.max_attempts;
        let report = blocking(move || store.reset_stale(stale_after, max_attempts)).await?;
        metrics::record_watchdog_reclaim(report.reset, report.failed);
        Ok(report)
    }

    /// Delete Completed and Failed jobs older than the retention window.
    pub async fn prune_completed(&self) -> Result<usize> {
        let store = self.store.clone();
        let older_than = self.retention.as_secs() as i64;
        let pruned = blocking(move || store.prune_terminal(older_than)).await?;
        if pruned > 0 {
            info!("Pruned {} finished analysis jobs", pruned);
        }
        metrics::record_watchdog_pruned(pruned);
        Ok(pruned)
    }

    pub async fn run_cycle(&self) -> Result<WatchdogReport> {
        let stale = self.reclaim_stale().await?;
        let pruned = self.prune_completed().await?;
        Ok(WatchdogReport { stale, pruned })
    }

    /// Sleep, run a cycle, repeat until shutdown. A failed cycle is logged and
    /// the next one runs on schedule.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Queue watchdog starting (interval={}s, stale_after={}s, retention={}h)",
            self.interval.as_secs(),
            self.stale_after.as_secs(),
            self.retention.as_secs() / 3600
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => break,
            }

            match self.run_cycle().await {
                Ok(report) => debug!("Watchdog cycle finished: {:?}", report),
                Err(e) => error!("Watchdog cycle failed: {:#}", e),
            }
        }

        info!("Queue watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_queue::job_store::SqliteAnalysisStore;
    use crate::analysis_queue::models::{AnalysisJob, JobStatus, SubjectRef};

    fn job(report_id: &str) -> AnalysisJob {
        AnalysisJob::new(
            SubjectRef {
                report_id: report_id.to_string(),
                visit_id: "v".to_string(),
                patient_id: "p".to_string(),
                doctor_id: "d".to_string(),
            },
            1,
        )
    }

    fn watchdog(store: Arc<SqliteAnalysisStore>) -> QueueWatchdog {
        QueueWatchdog::new(store, &WatchdogSettings::default(), 3)
    }

    #[tokio::test]
    async fn test_reclaim_stale_is_idempotent() {
        let store = Arc::new(SqliteAnalysisStore::in_memory().unwrap());
        let j = job("r1");
        store.enqueue(j.clone()).unwrap();
        store.try_claim(&j.id).unwrap();
        store.backdate_started_at(&j.id, 3 * 3600).unwrap();
        let watchdog = watchdog(store.clone());

        let first = watchdog.reclaim_stale().await.unwrap();
        assert_eq!(first.reset, 1);
        let reclaimed = store.get_job(&j.id).unwrap().unwrap();
        assert_eq!(reclaimed.status, JobStatus::Pending);
        assert!(reclaimed.started_at.is_none());

        let second = watchdog.reclaim_stale().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.get_job(&j.id).unwrap().unwrap(), reclaimed);
    }

    #[tokio::test]
    async fn test_recent_processing_jobs_are_left_alone() {
        let store = Arc::new(SqliteAnalysisStore::in_memory().unwrap());
        let j = job("r1");
        store.enqueue(j.clone()).unwrap();
        store.try_claim(&j.id).unwrap();
        store.backdate_started_at(&j.id, 3600).unwrap();

        let report = watchdog(store.clone()).reclaim_stale().await.unwrap();

        assert!(report.is_empty());
        assert_eq!(
            store.get_job(&j.id).unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_run_cycle_reclaims_and_prunes() {
        let store = Arc::new(SqliteAnalysisStore::in_memory().unwrap());
        let stale = job("stale");
        let done = job("done");
        store.enqueue(stale.clone()).unwrap();
        store.enqueue(done.clone()).unwrap();
        store.try_claim(&stale.id).unwrap();
        store.backdate_started_at(&stale.id, 3 * 3600).unwrap();
        store.try_claim(&done.id).unwrap();
        store
            .set_terminal(&done.id, JobStatus::Completed, None)
            .unwrap();
        store.backdate_completed_at(&done.id, 25 * 3600).unwrap();

        let report = watchdog(store.clone()).run_cycle().await.unwrap();

        assert_eq!(report.stale.reset, 1);
        assert_eq!(report.pruned, 1);
        assert!(store.get_job(&done.id).unwrap().is_none());

        let again = watchdog(store).run_cycle().await.unwrap();
        assert_eq!(again, WatchdogReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sleeps_first_and_stops_on_shutdown() {
        let store = Arc::new(SqliteAnalysisStore::in_memory().unwrap());
        let j = job("r1");
        store.enqueue(j.clone()).unwrap();
        store.try_claim(&j.id).unwrap();
        store.backdate_started_at(&j.id, 3 * 3600).unwrap();

        let watchdog = Arc::new(watchdog(store.clone()));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let watchdog = watchdog.clone();
            let shutdown = shutdown.clone();
            async move { watchdog.run(shutdown).await }
        });

        // Nothing happens before the first interval elapses
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            store.get_job(&j.id).unwrap().unwrap().status,
            JobStatus::Processing
        );

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(
            store.get_job(&j.id).unwrap().unwrap().status,
            JobStatus::Pending
        );

        shutdown.cancel();
        handle.await.unwrap();
    }
}
