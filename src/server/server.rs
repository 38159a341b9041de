use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::state::{GuardedJobStore, GuardedProcessor, GuardedRecordCache, ServerState};
use crate::analysis_queue::{blocking, AnalysisJob, JobStatus, SubjectRef};
use crate::metrics::metrics_handler;

#[derive(Serialize)]
struct HealthStatus {
    pub status: &'static str,
    pub uptime: String,
    pub processor_running: bool,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

#[derive(Deserialize, Debug)]
struct EnqueueBody {
    #[serde(flatten)]
    pub subject: SubjectRef,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Serialize)]
struct EnqueueResponse {
    pub id: String,
    pub status: JobStatus,
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthStatus {
        status: "ok",
        uptime: format_uptime(state.start_time.elapsed()),
        processor_running: state.processor.is_running(),
    })
}

async fn get_analysis_stats(State(processor): State<GuardedProcessor>) -> Response {
    match processor.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!("Failed to read queue stats: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_cache_stats(State(cache): State<GuardedRecordCache>) -> Response {
    Json(cache.stats().await).into_response()
}

async fn enqueue_job(
    State(job_store): State<GuardedJobStore>,
    Json(body): Json<EnqueueBody>,
) -> Response {
    let subject = body.subject;
    let ids = [
        &subject.report_id,
        &subject.visit_id,
        &subject.patient_id,
        &subject.doctor_id,
    ];
    if ids.iter().any(|id| id.trim().is_empty()) {
        return (
            StatusCode::BAD_REQUEST,
            "report_id, visit_id, patient_id and doctor_id are required",
        )
            .into_response();
    }

    let job = AnalysisJob::new(subject, body.priority);
    let id = job.id.clone();
    let report_id = job.subject.report_id.clone();
    match blocking(move || job_store.enqueue(job)).await {
        Ok(()) => {
            info!("Enqueued analysis job {} for report {}", id, report_id);
            (
                StatusCode::CREATED,
                Json(EnqueueResponse {
                    id,
                    status: JobStatus::Pending,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to enqueue analysis job: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn stop_processor(State(processor): State<GuardedProcessor>) -> StatusCode {
    processor.stop();
    StatusCode::ACCEPTED
}

async fn start_processor(State(processor): State<GuardedProcessor>) -> StatusCode {
    match processor.start() {
        Some(_) => StatusCode::ACCEPTED,
        None => StatusCode::CONFLICT,
    }
}

pub fn make_app(state: ServerState) -> Router {
    let analysis_routes: Router = Router::new()
        .route("/stats", get(get_analysis_stats))
        .route("/jobs", post(enqueue_job))
        .route("/stop", post(stop_processor))
        .route("/start", post(start_processor))
        .with_state(state.clone());

    let cache_routes: Router = Router::new()
        .route("/stats", get(get_cache_stats))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .nest("/v1/analysis", analysis_routes)
        .nest("/v1/cache", cache_routes)
}

/// Serve the admin routes until `shutdown` is cancelled.
pub async fn run_server(state: ServerState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind admin server on port {}", port))?;
    info!("Admin server listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
