//! Resolution of a job's subject into a document the provider can analyze.
//!
//! The HTTP resolver reads report, visit, patient and doctor records from the
//! clinic data API and downloads the report file. Patient and doctor records
//! change rarely and are shared by many reports, so they go through a
//! [`BoundedCache`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use super::models::{AnalysisDocument, SubjectRef};
use crate::cache::BoundedCache;

/// Why a subject could not be turned into a document. All of these are fatal
/// for the job: retrying would hit the same wall.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Missing required data: {0}")]
    MissingData(String),

    #[error("Failed to download report file: {0}")]
    Download(String),

    #[error("Data lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait SubjectResolver: Send + Sync {
    async fn resolve(&self, subject: &SubjectRef) -> Result<AnalysisDocument, ResolveError>;
}

/// Shared cache type for reference records.
pub type RecordCache = BoundedCache<String, serde_json::Value>;

pub struct HttpSubjectResolver {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    cache: Arc<RecordCache>,
}

impl HttpSubjectResolver {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
        cache: Arc<RecordCache>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
            cache,
        }
    }

    async fn fetch_record(&self, kind: &str, path: &str) -> Result<serde_json::Value, ResolveError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "Fetching {} record", kind);

        let mut req_builder = self.client.get(&url).timeout(self.timeout);
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| ResolveError::Lookup(format!("{} request failed: {}", kind, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ResolveError::MissingData(format!("{} not found", kind))),
            status if !status.is_success() => Err(ResolveError::Lookup(format!(
                "{} lookup returned {}",
                kind,
                status.as_u16()
            ))),
            _ => {
                let value: serde_json::Value = response.json().await.map_err(|e| {
                    ResolveError::Lookup(format!("Invalid {} record: {}", kind, e))
                })?;
                if value.is_null() {
                    return Err(ResolveError::MissingData(format!("{} not found", kind)));
                }
                Ok(value)
            }
        }
    }

    async fn fetch_cached(&self, kind: &str, path: String) -> Result<serde_json::Value, ResolveError> {
        let key = format!("{}:{}", kind, path);
        self.cache
            .get_or_try_insert_with(key, || self.fetch_record(kind, &path))
            .await
    }

    async fn download(&self, file_url: &str) -> Result<Vec<u8>, ResolveError> {
        let response = self
            .client
            .get(file_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ResolveError::Download(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Download(format!("HTTP {}", status.as_u16())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ResolveError::Download(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ResolveError::Download("empty file".to_string()));
        }
        Ok(bytes.to_vec())
    }
}

fn required_str<'a>(record: &'a serde_json::Value, field: &str) -> Result<&'a str, ResolveError> {
    record
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResolveError::MissingData(format!("report has no {}", field)))
}

#[async_trait]
impl SubjectResolver for HttpSubjectResolver {
    async fn resolve(&self, subject: &SubjectRef) -> Result<AnalysisDocument, ResolveError> {
        let doctor = &subject.doctor_id;
        let report_path = format!("/doctors/{}/reports/{}", doctor, subject.report_id);
        let visit_path = format!("/doctors/{}/visits/{}", doctor, subject.visit_id);
        let (report, visit, patient, doctor_record) = tokio::try_join!(
            self.fetch_record("report", &report_path),
            self.fetch_record("visit", &visit_path),
            self.fetch_cached(
                "patient",
                format!("/doctors/{}/patients/{}", doctor, subject.patient_id)
            ),
            self.fetch_cached("doctor", format!("/doctors/{}", doctor)),
        )?;

        let file_url = required_str(&report, "file_url")?;
        let file_name = required_str(&report, "file_name")?.to_string();
        let file_type = report
            .get("file_type")
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();

        let file_content = self.download(file_url).await?;

        Ok(AnalysisDocument {
            file_content,
            file_name,
            file_type,
            patient_context: patient,
            visit_context: visit,
            doctor_context: doctor_record,
        })
    }
}
