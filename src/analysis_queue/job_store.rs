//! Storage for analysis jobs and their results.
//!
//! Every status transition is a single conditional UPDATE checked by its
//! affected-row count, so concurrent schedulers can never double-dispatch a job.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use super::models::{
    AnalysisJob, AnalysisRecord, JobStatus, QueueStats, StaleResetReport, SubjectRef,
};
use super::schema::ANALYSIS_QUEUE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned;

/// Queue side of the store.
pub trait AnalysisJobStore: Send + Sync {
    /// Insert a new job.
    fn enqueue(&self, job: AnalysisJob) -> Result<()>;

    fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>>;

    /// Up to `limit` pending jobs, highest priority first, FIFO within a priority.
    fn fetch_pending(&self, limit: usize) -> Result<Vec<AnalysisJob>>;

    /// Atomically move a job from Pending to Processing.
    ///
    /// Sets `started_at` and bumps `attempt_count`. Returns false if the job
    /// was not Pending anymore (someone else claimed it), or if another job for
    /// the same report and doctor is Processing. In that case the job stays
    /// Pending for a later cycle.
    fn try_claim(&self, id: &str) -> Result<bool>;

    /// Give a claimed job back to the queue (Processing -> Pending).
    fn release_claim(&self, id: &str) -> Result<bool>;

    /// Move a Processing job to Completed or Failed.
    ///
    /// Returns false if the job was no longer Processing, e.g. because the
    /// watchdog reclaimed it in the meantime.
    fn set_terminal(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<bool>;

    /// Reclaim jobs stuck in Processing for longer than `stale_after_secs`.
    ///
    /// Jobs whose `attempt_count` reached `max_attempts` are failed, the rest
    /// go back to Pending with `started_at` cleared.
    fn reset_stale(&self, stale_after_secs: i64, max_attempts: i32) -> Result<StaleResetReport>;

    /// Delete terminal jobs that finished more than `older_than_secs` ago.
    fn prune_terminal(&self, older_than_secs: i64) -> Result<usize>;

    fn get_queue_stats(&self) -> Result<QueueStats>;
}

/// Result side of the store, used for idempotency and persistence of outcomes.
pub trait AnalysisResultStore: Send + Sync {
    /// True if a successful analysis already exists for the subject's report.
    fn has_completed_result(&self, subject: &SubjectRef) -> Result<bool>;

    fn save_result(&self, record: &AnalysisRecord) -> Result<()>;
}

/// SQLite-backed implementation of both the job and the result store.
#[derive(Clone)]
pub struct SqliteAnalysisStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAnalysisStore {
    /// Opens an existing database or creates a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(
            db_path.as_ref(),
            ANALYSIS_QUEUE_VERSIONED_SCHEMAS,
            "analysis queue",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store, handy for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        ANALYSIS_QUEUE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("analysis queue connection mutex poisoned"))
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<AnalysisJob> {
        Ok(AnalysisJob {
            id: row.get("id")?,
            subject: SubjectRef {
                report_id: row.get("report_id")?,
                visit_id: row.get("visit_id")?,
                patient_id: row.get("patient_id")?,
                doctor_id: row.get("doctor_id")?,
            },
            status: Self::status_from_row(row)?,
            priority: row.get("priority")?,
            queued_at: row.get("queued_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error_message: row.get("error_message")?,
            attempt_count: row.get("attempt_count")?,
        })
    }

    fn status_from_row(row: &rusqlite::Row) -> rusqlite::Result<JobStatus> {
        let raw: String = row.get("status")?;
        JobStatus::from_db_str(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                row.as_ref().column_index("status").unwrap_or(0),
                rusqlite::types::Type::Text,
                format!("Unknown analysis job status: {}", raw).into(),
            )
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Move a job's `started_at` into the past. Test helper for stale detection.
    #[cfg(test)]
    pub(crate) fn backdate_started_at(&self, id: &str, secs: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE analysis_queue SET started_at = started_at - ?1 WHERE id = ?2",
            params![secs, id],
        )?;
        Ok(())
    }

    /// Move a job's `completed_at` into the past. Test helper for pruning.
    #[cfg(test)]
    pub(crate) fn backdate_completed_at(&self, id: &str, secs: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE analysis_queue SET completed_at = completed_at - ?1 WHERE id = ?2",
            params![secs, id],
        )?;
        Ok(())
    }
}

impl AnalysisJobStore for SqliteAnalysisStore {
    fn enqueue(&self, job: AnalysisJob) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"INSERT INTO analysis_queue (
                id, report_id, visit_id, patient_id, doctor_id, status, priority,
                queued_at, started_at, completed_at, error_message, attempt_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                job.id,
                job.subject.report_id,
                job.subject.visit_id,
                job.subject.patient_id,
                job.subject.doctor_id,
                job.status.as_db_str(),
                job.priority,
                job.queued_at,
                job.started_at,
                job.completed_at,
                job.error_message,
                job.attempt_count,
            ],
        )
        .with_context(|| format!("Failed to enqueue analysis job {}", job.id))?;
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                "SELECT * FROM analysis_queue WHERE id = ?1",
                [id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn fetch_pending(&self, limit: usize) -> Result<Vec<AnalysisJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM analysis_queue
               WHERE status = 'pending'
               ORDER BY priority DESC, queued_at ASC, rowid ASC
               LIMIT ?1"#,
        )?;
        let jobs = stmt
            .query_map([limit as i64], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn try_claim(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            r#"UPDATE analysis_queue
               SET status = 'processing', started_at = ?1, attempt_count = attempt_count + 1
               WHERE id = ?2 AND status = 'pending'
                 AND NOT EXISTS (
                     SELECT 1 FROM analysis_queue AS sibling
                     WHERE sibling.report_id = analysis_queue.report_id
                       AND sibling.doctor_id = analysis_queue.doctor_id
                       AND sibling.status = 'processing'
                 )"#,
            params![Self::now(), id],
        )?;
        Ok(updated > 0)
    }

    fn release_claim(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            r#"UPDATE analysis_queue
               SET status = 'pending', started_at = NULL
               WHERE id = ?1 AND status = 'processing'"#,
            [id],
        )?;
        Ok(updated > 0)
    }

    fn set_terminal(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<bool> {
        if !status.is_terminal() {
            bail!(
                "Cannot finish job {} with non-terminal status {}",
                id,
                status.as_db_str()
            );
        }
        let conn = self.lock()?;
        let updated = conn.execute(
            r#"UPDATE analysis_queue
               SET status = ?1, completed_at = ?2, error_message = ?3
               WHERE id = ?4 AND status = 'processing'"#,
            params![status.as_db_str(), Self::now(), error, id],
        )?;
        if updated == 0 {
            warn!(
                "Job {} was not processing anymore, {} transition dropped",
                id,
                status.as_db_str()
            );
        }
        Ok(updated > 0)
    }

    fn reset_stale(&self, stale_after_secs: i64, max_attempts: i32) -> Result<StaleResetReport> {
        let now = Self::now();
        let cutoff = now - stale_after_secs;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let failed = tx.execute(
            r#"UPDATE analysis_queue
               SET status = 'failed', completed_at = ?1,
                   error_message = 'Abandoned while processing after ' || attempt_count || ' attempts'
               WHERE status = 'processing' AND started_at < ?2 AND attempt_count >= ?3"#,
            params![now, cutoff, max_attempts],
        )?;
        let reset = tx.execute(
            r#"UPDATE analysis_queue
               SET status = 'pending', started_at = NULL
               WHERE status = 'processing' AND started_at < ?1"#,
            [cutoff],
        )?;
        tx.commit()?;

        if reset > 0 || failed > 0 {
            info!(
                "Reclaimed stale analysis jobs: {} reset to pending, {} failed",
                reset, failed
            );
        }
        Ok(StaleResetReport { reset, failed })
    }

    fn prune_terminal(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = Self::now() - older_than_secs;
        let conn = self.lock()?;
        let deleted = conn.execute(
            r#"DELETE FROM analysis_queue
               WHERE status IN ('completed', 'failed') AND completed_at < ?1"#,
            [cutoff],
        )?;
        Ok(deleted)
    }

    fn get_queue_stats(&self) -> Result<QueueStats> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM analysis_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match JobStatus::from_db_str(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                None => warn!("Unknown analysis job status in store: {}", status),
            }
            stats.total += count;
        }
        Ok(stats)
    }
}

impl AnalysisResultStore for SqliteAnalysisStore {
    fn has_completed_result(&self, subject: &SubjectRef) -> Result<bool> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            r#"SELECT EXISTS(
                SELECT 1 FROM analysis_results
                WHERE report_id = ?1 AND doctor_id = ?2 AND success = 1
            )"#,
            params![subject.report_id, subject.doctor_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn save_result(&self, record: &AnalysisRecord) -> Result<()> {
        let structured = if record.structured.is_null() {
            None
        } else {
            Some(serde_json::to_string(&record.structured)?)
        };
        let key_findings = serde_json::to_string(&record.key_findings)?;

        let conn = self.lock()?;
        conn.execute(
            r#"INSERT INTO analysis_results (
                report_id, visit_id, patient_id, doctor_id, model_used, confidence_score,
                raw_analysis, structured_analysis, key_findings, success, error_message,
                processing_time_ms, analyzed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            params![
                record.subject.report_id,
                record.subject.visit_id,
                record.subject.patient_id,
                record.subject.doctor_id,
                record.model_used,
                record.confidence_score,
                record.raw_analysis,
                structured,
                key_findings,
                record.success,
                record.error,
                record.processing_time_ms,
                record.analyzed_at,
            ],
        )
        .with_context(|| {
            format!(
                "Failed to save analysis result for report {}",
                record.subject.report_id
            )
        })?;
        Ok(())
    }
}
