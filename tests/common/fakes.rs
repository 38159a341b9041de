use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clinic_analysis_worker::analysis_queue::{
    AnalysisDocument, AnalysisOutcome, AnalysisProvider, ProviderError, ResolveError,
    SubjectRef, SubjectResolver,
};

/// Resolves every subject to `{report_id}.pdf`, except reports whose id starts
/// with "missing".
#[derive(Default)]
pub struct FakeResolver {
    pub calls: AtomicU32,
}

impl FakeResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SubjectResolver for FakeResolver {
    async fn resolve(&self, subject: &SubjectRef) -> Result<AnalysisDocument, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if subject.report_id.starts_with("missing") {
            return Err(ResolveError::MissingData("report not found".to_string()));
        }
        Ok(AnalysisDocument {
            file_content: format!("contents of {}", subject.report_id).into_bytes(),
            file_name: format!("{}.pdf", subject.report_id),
            file_type: "application/pdf".to_string(),
            patient_context: serde_json::json!({"id": subject.patient_id}),
            visit_context: serde_json::json!({"id": subject.visit_id}),
            doctor_context: serde_json::json!({"id": subject.doctor_id}),
        })
    }
}

/// Provider keyed on the file name:
/// `fatal*` fails permanently, `ratelimited*` is rate limited on every call,
/// anything else succeeds after `delay`.
pub struct FakeProvider {
    pub calls: AtomicU32,
    pub seen: Mutex<Vec<String>>,
    delay: Duration,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalysisProvider for FakeProvider {
    fn model(&self) -> &str {
        "fake-model"
    }

    async fn analyze(&self, document: &AnalysisDocument) -> Result<AnalysisOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(document.file_name.clone());

        if document.file_name.starts_with("fatal") {
            return Err(ProviderError::Fatal("unsupported document".to_string()));
        }
        if document.file_name.starts_with("ratelimited") {
            return Err(ProviderError::Retryable("429 Too Many Requests".to_string()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(AnalysisOutcome {
            model_used: "fake-model".to_string(),
            raw_analysis: format!("analysis of {}", document.file_name),
            structured: serde_json::json!({"summary": "normal"}),
            confidence_score: 0.9,
            key_findings: vec!["normal".to_string()],
        })
    }
}
