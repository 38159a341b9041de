use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::analysis_queue::QueueStats;

/// Metric name prefix for all analysis worker metrics
const PREFIX: &str = "clinic_analysis";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Job Metrics
    pub static ref JOBS_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_processed_total"), "Dispatched jobs by outcome"),
        &["outcome"]
    ).expect("Failed to create jobs_processed_total metric");

    pub static ref QUEUE_JOBS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_jobs"), "Jobs currently in the queue by status"),
        &["status"]
    ).expect("Failed to create queue_jobs metric");

    pub static ref ANALYSIS_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_duration_seconds"),
            "Provider analysis duration in seconds, retries included"
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0])
    ).expect("Failed to create duration_seconds metric");

    // Provider Metrics
    pub static ref PROVIDER_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_provider_attempts_total"), "Provider calls by result"),
        &["result"]
    ).expect("Failed to create provider_attempts_total metric");

    // Watchdog Metrics
    pub static ref WATCHDOG_JOBS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_watchdog_jobs_total"), "Jobs touched by the queue watchdog"),
        &["action"]
    ).expect("Failed to create watchdog_jobs_total metric");

    // Cache Metrics
    pub static ref CACHE_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_cache_lookups_total"), "Cache lookups by cache and result"),
        &["cache", "result"]
    ).expect("Failed to create cache_lookups_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_PROCESSED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_JOBS.clone()));
    let _ = REGISTRY.register(Box::new(ANALYSIS_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(PROVIDER_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(WATCHDOG_JOBS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_LOOKUPS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_outcome(outcome: &str) {
    JOBS_PROCESSED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_analysis_duration(duration: Duration) {
    ANALYSIS_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn set_queue_gauges(stats: &QueueStats) {
    QUEUE_JOBS
        .with_label_values(&["pending"])
        .set(stats.pending as f64);
    QUEUE_JOBS
        .with_label_values(&["processing"])
        .set(stats.processing as f64);
    QUEUE_JOBS
        .with_label_values(&["completed"])
        .set(stats.completed as f64);
    QUEUE_JOBS
        .with_label_values(&["failed"])
        .set(stats.failed as f64);
}

/// `result` is one of "success", "retryable" or "fatal".
pub fn record_provider_attempt(result: &str) {
    PROVIDER_ATTEMPTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_watchdog_reclaim(reset: usize, failed: usize) {
    WATCHDOG_JOBS_TOTAL
        .with_label_values(&["reset"])
        .inc_by(reset as f64);
    WATCHDOG_JOBS_TOTAL
        .with_label_values(&["failed"])
        .inc_by(failed as f64);
}

pub fn record_watchdog_pruned(pruned: usize) {
    WATCHDOG_JOBS_TOTAL
        .with_label_values(&["pruned"])
        .inc_by(pruned as f64);
}

pub fn record_cache_lookup(cache: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[cache, result]).inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
