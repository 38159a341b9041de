//! The analysis scheduler.
//!
//! Polls the queue on a fixed interval, claims the next batch of pending jobs in
//! priority order and runs them through the [`WorkerPool`]. Each job ends in a
//! terminal state unless the process dies mid-job, in which case the watchdog
//! picks it up later.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::blocking;
use super::job_store::{AnalysisJobStore, AnalysisResultStore};
use super::models::{AnalysisJob, AnalysisRecord, JobStatus, ProcessingStats};
use super::provider::AnalysisProvider;
use super::resolver::SubjectResolver;
use super::worker_pool::{BatchReport, UnitResult, WorkerPool};
use crate::config::AnalysisSettings;
use crate::metrics;

/// What happened to a single dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The provider produced a result.
    Completed,
    /// A successful result already existed, the provider was not called.
    AlreadyAnalyzed,
    Failed(String),
    /// The job was claimed first, or another job for the same subject is in progress.
    ClaimLost,
    /// Shutdown was requested before the provider call; the job is pending again.
    Released,
}

impl JobOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::AlreadyAnalyzed => "already_analyzed",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::ClaimLost => "claim_lost",
            JobOutcome::Released => "released",
        }
    }
}

pub struct AnalysisProcessor {
    job_store: Arc<dyn AnalysisJobStore>,
    result_store: Arc<dyn AnalysisResultStore>,
    resolver: Arc<dyn SubjectResolver>,
    provider: Arc<dyn AnalysisProvider>,
    pool: WorkerPool,
    poll_interval: Duration,
    batch_size: usize,
    /// Process-wide shutdown. Once cancelled the processor cannot be restarted.
    root: CancellationToken,
    /// Token of the current run, replaced on restart after a [`stop`](Self::stop).
    shutdown: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl AnalysisProcessor {
    pub fn new(
        job_store: Arc<dyn AnalysisJobStore>,
        result_store: Arc<dyn AnalysisResultStore>,
        resolver: Arc<dyn SubjectResolver>,
        provider: Arc<dyn AnalysisProvider>,
        settings: &AnalysisSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            job_store,
            result_store,
            resolver,
            provider,
            pool: WorkerPool::new(settings.max_concurrency),
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            batch_size: settings.batch_size,
            shutdown: Mutex::new(shutdown.child_token()),
            root: shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the polling loop on the runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Restart the polling loop after a [`stop`](Self::stop).
    ///
    /// Returns `None` when the loop is already running or the process is
    /// shutting down.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.root.is_cancelled() {
            warn!("Analysis processor cannot start during shutdown");
            return None;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Analysis processor already running");
            return None;
        }
        {
            let mut token = self.lock_token();
            if token.is_cancelled() {
                *token = self.root.child_token();
            }
        }
        info!("Starting analysis processor");
        Some(self.spawn())
    }

    /// Main polling loop. Returns once [`stop`](Self::stop) is called.
    ///
    /// A failing cycle is logged and the loop carries on at the next tick.
    pub async fn run(self: Arc<Self>) {
        let shutdown = self.token();
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Analysis processor starting (poll_interval={}s, batch_size={}, max_concurrency={})",
            self.poll_interval.as_secs(),
            self.batch_size,
            self.pool.max_concurrency()
        );

        while !shutdown.is_cancelled() {
            match self.process_pending(self.batch_size).await {
                Ok(report) if report.total() > 0 => {
                    info!(
                        "Analysis cycle done: {} succeeded, {} skipped, {} failed, {} panicked",
                        report.succeeded, report.skipped, report.failed, report.panicked
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Analysis processing cycle failed: {:#}", e),
            }
            self.refresh_queue_gauges().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Analysis processor stopped");
    }

    /// Ask the loop to exit. Jobs already past their pre-provider checkpoint
    /// run to completion.
    pub fn stop(&self) {
        info!("Stopping analysis processor");
        self.token().cancel();
    }

    fn lock_token(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.shutdown.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token(&self) -> CancellationToken {
        self.lock_token().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fetch up to `limit` pending jobs and run them through the worker pool.
    pub async fn process_pending(self: &Arc<Self>, limit: usize) -> Result<BatchReport> {
        let store = self.job_store.clone();
        let jobs = blocking(move || store.fetch_pending(limit)).await?;
        if jobs.is_empty() {
            debug!("No pending analysis jobs");
            return Ok(BatchReport::default());
        }

        info!("Processing {} pending analysis jobs", jobs.len());
        let report = self
            .pool
            .run_batch(jobs, |job| {
                let this = self.clone();
                async move {
                    match this.process_one(job).await? {
                        JobOutcome::Completed | JobOutcome::AlreadyAnalyzed => {
                            Ok(UnitResult::Succeeded)
                        }
                        JobOutcome::ClaimLost | JobOutcome::Released => Ok(UnitResult::Skipped),
                        JobOutcome::Failed(message) => Err(anyhow!(message)),
                    }
                }
            })
            .await;
        Ok(report)
    }

    /// Claim and process a single job.
    ///
    /// Errors and panics inside the job body turn into a Failed job. An error is
    /// returned only when even that terminal write failed, leaving the job in
    /// Processing for the watchdog.
    pub async fn process_one(&self, job: AnalysisJob) -> Result<JobOutcome> {
        let store = self.job_store.clone();
        let id = job.id.clone();
        if !blocking(move || store.try_claim(&id)).await? {
            info!(
                "Analysis job {} not claimable (claimed or same subject in progress), skipping",
                job.id
            );
            metrics::record_job_outcome(JobOutcome::ClaimLost.metric_label());
            return Ok(JobOutcome::ClaimLost);
        }

        info!(
            "Processing analysis job {} for report {}",
            job.id, job.subject.report_id
        );

        let outcome = match AssertUnwindSafe(self.execute(&job)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let message = format!("Processing error: {:#}", e);
                error!("Analysis job {} failed: {}", job.id, message);
                self.finish(&job.id, JobStatus::Failed, Some(message.clone()))
                    .await?;
                JobOutcome::Failed(message)
            }
            Err(panic) => {
                let message = format!("Processing panicked: {}", panic_message(&*panic));
                error!("Analysis job {} {}", job.id, message);
                self.finish(&job.id, JobStatus::Failed, Some(message.clone()))
                    .await?;
                JobOutcome::Failed(message)
            }
        };

        metrics::record_job_outcome(outcome.metric_label());
        Ok(outcome)
    }

    async fn execute(&self, job: &AnalysisJob) -> Result<JobOutcome> {
        let results = self.result_store.clone();
        let subject = job.subject.clone();
        if blocking(move || results.has_completed_result(&subject)).await? {
            info!(
                "Analysis already exists for report {}, marking job {} completed",
                job.subject.report_id, job.id
            );
            self.finish(&job.id, JobStatus::Completed, None).await?;
            return Ok(JobOutcome::AlreadyAnalyzed);
        }

        let document = match self.resolver.resolve(&job.subject).await {
            Ok(document) => document,
            Err(e) => {
                let message = e.to_string();
                warn!("Analysis job {}: {}", job.id, message);
                self.finish(&job.id, JobStatus::Failed, Some(message.clone()))
                    .await?;
                return Ok(JobOutcome::Failed(message));
            }
        };

        if self.token().is_cancelled() {
            let store = self.job_store.clone();
            let id = job.id.clone();
            blocking(move || store.release_claim(&id)).await?;
            info!("Shutdown requested, released analysis job {}", job.id);
            return Ok(JobOutcome::Released);
        }

        let started = Instant::now();
        let result = self.provider.analyze(&document).await;
        let elapsed = started.elapsed();
        let processing_time_ms = elapsed.as_millis() as i64;
        metrics::record_analysis_duration(elapsed);

        match result {
            Ok(outcome) => {
                let record =
                    AnalysisRecord::succeeded(job.subject.clone(), outcome, processing_time_ms);
                let results = self.result_store.clone();
                blocking(move || results.save_result(&record)).await?;
                self.finish(&job.id, JobStatus::Completed, None).await?;
                info!(
                    "Analysis job {} completed for report {} in {}ms",
                    job.id, job.subject.report_id, processing_time_ms
                );
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Analysis job {} failed: {}", job.id, message);
                let record = AnalysisRecord::failed(
                    job.subject.clone(),
                    self.provider.model(),
                    message.clone(),
                    processing_time_ms,
                );
                let results = self.result_store.clone();
                if let Err(save_err) = blocking(move || results.save_result(&record)).await {
                    warn!(
                        "Could not record failed analysis for job {}: {:#}",
                        job.id, save_err
                    );
                }
                self.finish(&job.id, JobStatus::Failed, Some(message.clone()))
                    .await?;
                Ok(JobOutcome::Failed(message))
            }
        }
    }

    async fn finish(&self, id: &str, status: JobStatus, error: Option<String>) -> Result<()> {
        let store = self.job_store.clone();
        let id = id.to_string();
        blocking(move || store.set_terminal(&id, status, error.as_deref())).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<ProcessingStats> {
        let store = self.job_store.clone();
        let queue = blocking(move || store.get_queue_stats()).await?;
        Ok(ProcessingStats {
            queue,
            processor_running: self.is_running(),
        })
    }

    async fn refresh_queue_gauges(&self) {
        match self.stats().await {
            Ok(stats) => metrics::set_queue_gauges(&stats.queue),
            Err(e) => debug!("Could not refresh queue gauges: {:#}", e),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_queue::job_store::SqliteAnalysisStore;
    use crate::analysis_queue::models::{AnalysisDocument, AnalysisOutcome, SubjectRef};
    use crate::analysis_queue::provider::ProviderError;
    use crate::analysis_queue::resolver::ResolveError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeResolver;

    #[async_trait]
    impl SubjectResolver for FakeResolver {
        async fn resolve(&self, subject: &SubjectRef) -> Result<AnalysisDocument, ResolveError> {
            if subject.report_id.starts_with("missing") {
                return Err(ResolveError::MissingData("report not found".to_string()));
            }
            if subject.report_id.starts_with("explode") {
                panic!("resolver blew up");
            }
            Ok(AnalysisDocument {
                file_content: subject.report_id.as_bytes().to_vec(),
                file_name: format!("{}.pdf", subject.report_id),
                file_type: "application/pdf".to_string(),
                patient_context: serde_json::Value::Null,
                visit_context: serde_json::Value::Null,
                doctor_context: serde_json::Value::Null,
            })
        }
    }

    /// Fails every document whose name starts with "fatal".
    struct FakeProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AnalysisProvider for FakeProvider {
        fn model(&self) -> &str {
            "fake-model"
        }

        async fn analyze(
            &self,
            document: &AnalysisDocument,
        ) -> Result<AnalysisOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if document.file_name.starts_with("fatal") {
                return Err(ProviderError::Fatal("unsupported document".to_string()));
            }
            Ok(AnalysisOutcome {
                model_used: "fake-model".to_string(),
                raw_analysis: format!("analysis of {}", document.file_name),
                structured: serde_json::Value::Null,
                confidence_score: 0.7,
                key_findings: vec![],
            })
        }
    }

    struct Harness {
        store: Arc<SqliteAnalysisStore>,
        provider: Arc<FakeProvider>,
        processor: Arc<AnalysisProcessor>,
        shutdown: CancellationToken,
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteAnalysisStore::in_memory().unwrap());
        let provider = Arc::new(FakeProvider {
            calls: AtomicU32::new(0),
        });
        let shutdown = CancellationToken::new();
        let processor = Arc::new(AnalysisProcessor::new(
            store.clone(),
            store.clone(),
            Arc::new(FakeResolver),
            provider.clone(),
            &AnalysisSettings::default(),
            shutdown.clone(),
        ));
        Harness {
            store,
            provider,
            processor,
            shutdown,
        }
    }

    fn job(report_id: &str) -> AnalysisJob {
        AnalysisJob::new(
            SubjectRef {
                report_id: report_id.to_string(),
                visit_id: "v1".to_string(),
                patient_id: "p1".to_string(),
                doctor_id: "d1".to_string(),
            },
            1,
        )
    }

    fn enqueue(h: &Harness, report_id: &str) -> AnalysisJob {
        let j = job(report_id);
        h.store.enqueue(j.clone()).unwrap();
        j
    }

    fn status_of(h: &Harness, j: &AnalysisJob) -> JobStatus {
        h.store.get_job(&j.id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_successful_job_completes_and_saves_result() {
        let h = harness();
        let j = enqueue(&h, "r1");

        let outcome = h.processor.process_one(j.clone()).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(status_of(&h, &j), JobStatus::Completed);
        assert!(h.store.has_completed_result(&j.subject).unwrap());
    }

    #[tokio::test]
    async fn test_existing_result_skips_provider() {
        let h = harness();
        let first = enqueue(&h, "r1");
        h.processor.process_one(first).await.unwrap();
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);

        let duplicate = enqueue(&h, "r1");
        let outcome = h.processor.process_one(duplicate.clone()).await.unwrap();

        assert_eq!(outcome, JobOutcome::AlreadyAnalyzed);
        assert_eq!(status_of(&h, &duplicate), JobStatus::Completed);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_data_fails_without_provider_call() {
        let h = harness();
        let j = enqueue(&h, "missing-report");

        let outcome = h.processor.process_one(j.clone()).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Failed(ref m) if m.contains("Missing required data")));
        let stored = h.store.get_job(&j.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().contains("report not found"));
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_marks_failed() {
        let h = harness();
        let j = enqueue(&h, "fatal-report");

        let outcome = h.processor.process_one(j.clone()).await.unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Failed("unsupported document".to_string())
        );
        let stored = h.store.get_job(&j.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("unsupported document"));
        assert!(!h.store.has_completed_result(&j.subject).unwrap());
    }

    #[tokio::test]
    async fn test_panic_in_job_body_marks_failed() {
        let h = harness();
        let j = enqueue(&h, "explode");

        let outcome = h.processor.process_one(j.clone()).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Failed(ref m) if m.contains("resolver blew up")));
        assert_eq!(status_of(&h, &j), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_already_claimed_job_is_skipped() {
        let h = harness();
        let j = enqueue(&h, "r1");
        h.store.try_claim(&j.id).unwrap();

        let outcome = h.processor.process_one(j.clone()).await.unwrap();

        assert_eq!(outcome, JobOutcome::ClaimLost);
        assert_eq!(status_of(&h, &j), JobStatus::Processing);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_before_provider_call_releases_claim() {
        let h = harness();
        let j = enqueue(&h, "r1");
        h.processor.stop();

        let outcome = h.processor.process_one(j.clone()).await.unwrap();

        assert_eq!(outcome, JobOutcome::Released);
        let stored = h.store.get_job(&j.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_process_pending_isolates_failures() {
        let h = harness();
        let jobs = vec![
            enqueue(&h, "r1"),
            enqueue(&h, "fatal-2"),
            enqueue(&h, "r3"),
            enqueue(&h, "missing-4"),
            enqueue(&h, "r5"),
        ];

        let report = h.processor.process_pending(10).await.unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 2);
        for j in &jobs {
            assert!(status_of(&h, j).is_terminal());
        }
        let stats = h.processor.stats().await.unwrap();
        assert_eq!(stats.queue.completed, 3);
        assert_eq!(stats.queue.failed, 2);
    }

    #[tokio::test]
    async fn test_released_jobs_count_as_skipped() {
        let h = harness();
        let jobs = vec![enqueue(&h, "r1"), enqueue(&h, "r2")];
        h.processor.stop();

        let report = h.processor.process_pending(10).await.unwrap();

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.total(), 2);
        for j in &jobs {
            assert_eq!(status_of(&h, j), JobStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_process_pending_with_empty_queue_is_noop() {
        let h = harness();
        let report = h.processor.process_pending(10).await.unwrap();
        assert_eq!(report, BatchReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_processes_and_stops() {
        let h = harness();
        let j = enqueue(&h, "r1");

        let handle = h.processor.spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.processor.is_running());
        assert_eq!(status_of(&h, &j), JobStatus::Completed);

        // A job queued later is picked up on the next tick
        let later = enqueue(&h, "r2");
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(status_of(&h, &later), JobStatus::Completed);

        h.shutdown.cancel();
        handle.await.unwrap();
        assert!(!h.processor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_processes_new_jobs() {
        let h = harness();
        let handle = h.processor.spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;

        h.processor.stop();
        handle.await.unwrap();
        assert!(!h.processor.is_running());

        let j = enqueue(&h, "r1");
        let handle = h.processor.start().expect("processor should restart");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.processor.is_running());
        assert!(h.processor.start().is_none());
        assert_eq!(status_of(&h, &j), JobStatus::Completed);

        h.processor.stop();
        handle.await.unwrap();
        assert!(!h.processor.is_running());
    }

    #[tokio::test]
    async fn test_start_refused_after_process_shutdown() {
        let h = harness();
        h.shutdown.cancel();

        assert!(h.processor.start().is_none());
        assert!(!h.processor.is_running());
    }
}
