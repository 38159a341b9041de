//! Analysis provider abstraction.
//!
//! The provider is the externally billed, rate-limited call that turns a report
//! into an analysis. [`RetryingProvider`] wraps any provider with the backoff
//! policy; [`HttpAnalysisProvider`] talks to a hosted analysis endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::models::{AnalysisDocument, AnalysisOutcome};
use super::retry_policy::{retry, RetryError, RetryPolicy};
use crate::metrics;

/// Errors that can come out of a provider call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// Transient: the provider is rate limiting us or out of quota.
    #[error("Provider resource exhausted: {0}")]
    Retryable(String),

    #[error("{0}")]
    Fatal(String),

    /// Every attempt hit a retryable error.
    #[error("Rate limit exceeded after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }
}

impl From<RetryError<ProviderError>> for ProviderError {
    fn from(err: RetryError<ProviderError>) -> Self {
        match err {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => ProviderError::Exhausted {
                attempts,
                message: last.to_string(),
            },
        }
    }
}

/// Trait for analysis providers.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Model identifier recorded alongside results.
    fn model(&self) -> &str;

    /// Analyze one document.
    async fn analyze(&self, document: &AnalysisDocument) -> Result<AnalysisOutcome, ProviderError>;
}

#[async_trait]
impl<P: AnalysisProvider + ?Sized> AnalysisProvider for Arc<P> {
    fn model(&self) -> &str {
        (**self).model()
    }

    async fn analyze(&self, document: &AnalysisDocument) -> Result<AnalysisOutcome, ProviderError> {
        (**self).analyze(document).await
    }
}

/// Decorator applying a [`RetryPolicy`] to retryable provider errors.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: AnalysisProvider> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<P: AnalysisProvider> AnalysisProvider for RetryingProvider<P> {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn analyze(&self, document: &AnalysisDocument) -> Result<AnalysisOutcome, ProviderError> {
        let inner = &self.inner;
        let result = retry(
            &self.policy,
            move |attempt| async move {
                debug!(attempt, file = %document.file_name, "Calling analysis provider");
                let result = inner.analyze(document).await;
                metrics::record_provider_attempt(match &result {
                    Ok(_) => "success",
                    Err(e) if e.is_retryable() => "retryable",
                    Err(_) => "fatal",
                });
                result
            },
            ProviderError::is_retryable,
        )
        .await;
        result.map_err(ProviderError::from)
    }
}

/// Decides whether an HTTP error response is worth retrying.
pub type RetryClassifier = Arc<dyn Fn(u16, &str) -> bool + Send + Sync>;

/// Default classification: HTTP 429 or a resource-exhausted body.
pub fn is_resource_exhausted(status: u16, body: &str) -> bool {
    status == 429 || body.contains("RESOURCE_EXHAUSTED") || body.contains("Resource exhausted")
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    model: &'a str,
    file_name: &'a str,
    file_type: &'a str,
    file_content_base64: String,
    patient_context: &'a serde_json::Value,
    visit_context: &'a serde_json::Value,
    doctor_context: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    model_used: Option<String>,
    raw_analysis: String,
    #[serde(default)]
    structured_analysis: serde_json::Value,
    #[serde(default)]
    confidence_score: f64,
    #[serde(default)]
    key_findings: Vec<String>,
}

/// Provider backed by a hosted analysis endpoint (`POST {base_url}/analyze`).
pub struct HttpAnalysisProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    classify: RetryClassifier,
}

impl HttpAnalysisProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            timeout,
            classify: Arc::new(is_resource_exhausted),
        }
    }

    /// Replace the retryable-error classifier.
    pub fn with_classifier(mut self, classify: RetryClassifier) -> Self {
        self.classify = classify;
        self
    }
}

#[async_trait]
impl AnalysisProvider for HttpAnalysisProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, document: &AnalysisDocument) -> Result<AnalysisOutcome, ProviderError> {
        let url = format!("{}/analyze", self.base_url);
        let request = AnalyzeRequest {
            model: &self.model,
            file_name: &document.file_name,
            file_type: &document.file_type,
            file_content_base64: base64::engine::general_purpose::STANDARD
                .encode(&document.file_content),
            patient_context: &document.patient_context,
            visit_context: &document.visit_context,
            doctor_context: &document.doctor_context,
        };

        debug!(
            model = %self.model,
            file = %document.file_name,
            bytes = document.file_content.len(),
            "Sending analysis request"
        );

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Fatal("Analysis request timed out".to_string())
                } else {
                    ProviderError::Fatal(format!("Analysis request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Provider returned {}: {}", status.as_u16(), body);
            return if (self.classify)(status.as_u16(), &body) {
                Err(ProviderError::Retryable(message))
            } else {
                Err(ProviderError::Fatal(message))
            };
        }

        let parsed: AnalyzeResponse = response.json().await.map_err(|e| {
            ProviderError::Fatal(format!("Failed to parse analysis response: {}", e))
        })?;

        Ok(AnalysisOutcome {
            model_used: parsed.model_used.unwrap_or_else(|| self.model.clone()),
            raw_analysis: parsed.raw_analysis,
            structured: parsed.structured_analysis,
            confidence_score: parsed.confidence_score,
            key_findings: parsed.key_findings,
        })
    }
}
