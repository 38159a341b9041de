use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use clinic_analysis_worker::analysis_queue::{
    AnalysisJob, AnalysisJobStore, AnalysisProcessor, AnalysisProvider, JobStatus,
    SqliteAnalysisStore, SubjectRef, SubjectResolver,
};
use clinic_analysis_worker::config::AnalysisSettings;

pub fn subject(report_id: &str) -> SubjectRef {
    SubjectRef {
        report_id: report_id.to_string(),
        visit_id: format!("visit-{}", report_id),
        patient_id: "patient-1".to_string(),
        doctor_id: "doctor-1".to_string(),
    }
}

/// An on-disk analysis queue living in a temporary directory.
pub struct TestQueue {
    _dir: TempDir,
    pub db_path: PathBuf,
    pub store: Arc<SqliteAnalysisStore>,
}

impl TestQueue {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("analysis_queue.db");
        let store = Arc::new(SqliteAnalysisStore::new(&db_path).unwrap());
        Self {
            _dir: dir,
            db_path,
            store,
        }
    }

    pub fn enqueue(&self, report_id: &str, priority: i32) -> AnalysisJob {
        let job = AnalysisJob::new(subject(report_id), priority);
        self.store.enqueue(job.clone()).unwrap();
        job
    }

    pub fn enqueue_at(&self, report_id: &str, priority: i32, queued_at: i64) -> AnalysisJob {
        let job = AnalysisJob::new(subject(report_id), priority).with_queued_at(queued_at);
        self.store.enqueue(job.clone()).unwrap();
        job
    }

    pub fn status(&self, id: &str) -> JobStatus {
        self.store.get_job(id).unwrap().unwrap().status
    }

    /// Pretend a job was claimed `secs` seconds earlier than it was.
    pub fn backdate_started_at(&self, id: &str, secs: i64) {
        let conn = Connection::open(&self.db_path).unwrap();
        conn.execute(
            "UPDATE analysis_queue SET started_at = started_at - ?1 WHERE id = ?2",
            params![secs, id],
        )
        .unwrap();
    }

    pub fn processor(
        &self,
        resolver: Arc<dyn SubjectResolver>,
        provider: Arc<dyn AnalysisProvider>,
        max_concurrency: usize,
    ) -> Arc<AnalysisProcessor> {
        let settings = AnalysisSettings {
            max_concurrency,
            ..Default::default()
        };
        Arc::new(AnalysisProcessor::new(
            self.store.clone(),
            self.store.clone(),
            resolver,
            provider,
            &settings,
            CancellationToken::new(),
        ))
    }
}
