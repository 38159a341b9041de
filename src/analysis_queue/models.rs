//! Data models for the analysis queue.
//!
//! Defines queued jobs, their statuses, the subject they point at, and the
//! results produced by the analysis provider.

use serde::{Deserialize, Serialize};

/// Status of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed, // terminal
    Failed,    // terminal
}

impl JobStatus {
    /// Returns true if this is a terminal state (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// The artifact a job analyzes: one uploaded report, in the context of the
/// visit, patient and doctor it belongs to.
///
/// The scheduler never looks inside it; only the resolver and the result store do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub report_id: String,
    pub visit_id: String,
    pub patient_id: String,
    pub doctor_id: String,
}

/// A row in the analysis queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub subject: SubjectRef,
    pub status: JobStatus,
    /// Higher values are dispatched first.
    pub priority: i32,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
    /// Number of times the job has been claimed for processing.
    pub attempt_count: i32,
}

impl AnalysisJob {
    /// Create a new pending job with a fresh id, queued now.
    pub fn new(subject: SubjectRef, priority: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject,
            status: JobStatus::Pending,
            priority,
            queued_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error_message: None,
            attempt_count: 0,
        }
    }

    /// Override the queue timestamp, mostly useful to seed ordering in tests.
    pub fn with_queued_at(mut self, queued_at: i64) -> Self {
        self.queued_at = queued_at;
        self
    }
}

/// Everything the provider needs to analyze one report.
///
/// Built by a [`SubjectResolver`](super::resolver::SubjectResolver) right before
/// the provider call. The context fields are passed through untouched.
#[derive(Debug, Clone)]
pub struct AnalysisDocument {
    pub file_content: Vec<u8>,
    pub file_name: String,
    pub file_type: String,
    pub patient_context: serde_json::Value,
    pub visit_context: serde_json::Value,
    pub doctor_context: serde_json::Value,
}

/// Successful provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub model_used: String,
    pub raw_analysis: String,
    #[serde(default)]
    pub structured: serde_json::Value,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub key_findings: Vec<String>,
}

/// A persisted analysis result, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub subject: SubjectRef,
    pub model_used: String,
    pub confidence_score: f64,
    pub raw_analysis: String,
    pub structured: serde_json::Value,
    pub key_findings: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
    pub processing_time_ms: i64,
    pub analyzed_at: i64,
}

impl AnalysisRecord {
    pub fn succeeded(subject: SubjectRef, outcome: AnalysisOutcome, processing_time_ms: i64) -> Self {
        Self {
            subject,
            model_used: outcome.model_used,
            confidence_score: outcome.confidence_score,
            raw_analysis: outcome.raw_analysis,
            structured: outcome.structured,
            key_findings: outcome.key_findings,
            success: true,
            error: None,
            processing_time_ms,
            analyzed_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn failed(
        subject: SubjectRef,
        model_used: &str,
        error: String,
        processing_time_ms: i64,
    ) -> Self {
        Self {
            subject,
            model_used: model_used.to_string(),
            confidence_score: 0.0,
            raw_analysis: String::new(),
            structured: serde_json::Value::Null,
            key_findings: Vec::new(),
            success: false,
            error: Some(error),
            processing_time_ms,
            analyzed_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// Queue counts plus processor liveness, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStats {
    #[serde(flatten)]
    pub queue: QueueStats,
    pub processor_running: bool,
}

/// Result of a watchdog stale-job pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StaleResetReport {
    /// Jobs moved back to Pending.
    pub reset: usize,
    /// Jobs that had used up their attempts and were marked Failed.
    pub failed: usize,
}

impl StaleResetReport {
    pub fn is_empty(&self) -> bool {
        self.reset == 0 && self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> SubjectRef {
        SubjectRef {
            report_id: "r1".to_string(),
            visit_id: "v1".to_string(),
            patient_id: "p1".to_string(),
            doctor_id: "d1".to_string(),
        }
    }

    #[test]
    fn status_db_strings_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_db_str(status.as_db_str()), Some(status));
        }
        assert_eq!(JobStatus::from_db_str("PENDING"), None);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn new_job_starts_pending_with_no_attempts() {
        let job = AnalysisJob::new(subject(), 5);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 5);
        assert_eq!(job.attempt_count, 0);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.error_message.is_none());
        assert!(!job.id.is_empty());
    }

    #[test]
    fn failed_record_carries_error_and_no_findings() {
        let record = AnalysisRecord::failed(subject(), "model-x", "boom".to_string(), 12);

        assert!(!record.success);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.key_findings.is_empty());
        assert_eq!(record.processing_time_ms, 12);
    }

    #[test]
    fn processing_stats_serializes_flat() {
        let stats = ProcessingStats {
            queue: QueueStats {
                pending: 1,
                processing: 2,
                completed: 3,
                failed: 4,
                total: 10,
            },
            processor_running: true,
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["pending"], 1);
        assert_eq!(json["total"], 10);
        assert_eq!(json["processor_running"], true);
    }
}
