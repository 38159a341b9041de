//! Bounded fan-out / fan-in execution of a batch of units.

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// What a unit reports when it returns normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitResult {
    Succeeded,
    /// The unit had nothing to do, e.g. its work item was taken elsewhere.
    Skipped,
}

/// How a batch went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub panicked: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed + self.panicked
    }
}

/// Runs every unit of a batch as its own task and waits for all of them.
///
/// At most `max_concurrency` units run at once, independently of the batch
/// size. A unit that errors or panics is counted and logged; it never cancels
/// or delays its siblings.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub async fn run_batch<T, F, Fut>(&self, items: Vec<T>, work: F) -> BatchReport
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<UnitResult>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for item in items {
            let semaphore = self.semaphore.clone();
            let unit = work(item);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow!("worker pool semaphore closed"))?;
                unit.await
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(UnitResult::Succeeded)) => report.succeeded += 1,
                Ok(Ok(UnitResult::Skipped)) => report.skipped += 1,
                Ok(Err(e)) => {
                    warn!("Worker unit failed: {:#}", e);
                    report.failed += 1;
                }
                Err(e) if e.is_panic() => {
                    error!("Worker unit panicked: {}", e);
                    report.panicked += 1;
                }
                Err(e) => {
                    warn!("Worker unit was cancelled: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}
