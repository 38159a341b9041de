//! Background analysis queue.
//!
//! Jobs are persisted in SQLite, picked up in priority order by the
//! [`AnalysisProcessor`], analyzed through an [`AnalysisProvider`] with bounded
//! concurrency, and kept healthy by the [`QueueWatchdog`].

mod job_store;
mod models;
mod processor;
mod provider;
mod resolver;
mod retry_policy;
mod schema;
mod watchdog;
mod worker_pool;

pub use job_store::{AnalysisJobStore, AnalysisResultStore, SqliteAnalysisStore};
pub use models::{
    AnalysisDocument, AnalysisJob, AnalysisOutcome, AnalysisRecord, JobStatus, ProcessingStats,
    QueueStats, StaleResetReport, SubjectRef,
};
pub use processor::{AnalysisProcessor, JobOutcome};
pub use provider::{
    is_resource_exhausted, AnalysisProvider, HttpAnalysisProvider, ProviderError,
    RetryClassifier, RetryingProvider,
};
pub use resolver::{HttpSubjectResolver, RecordCache, ResolveError, SubjectResolver};
pub use retry_policy::{retry, RetryError, RetryPolicy};
pub use watchdog::{QueueWatchdog, WatchdogReport};
pub use worker_pool::{BatchReport, UnitResult, WorkerPool};

use anyhow::{Context, Result};

/// Run a synchronous store call on the blocking thread pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Store task panicked")?
}
