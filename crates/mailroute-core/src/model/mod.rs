pub mod error;
pub mod mock;
pub mod types;

pub use error::ModelError;
pub use mock::MockModelApi;
pub use types::{
    Classification, ClassifyRequest, Entities, EntityKind, Label, ModelOutcome, ReplyRequest,
};

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::ModelConfig;

pub const METHOD_API_UNAVAILABLE: &str = "api_unavailable";
pub const METHOD_API_ERROR: &str = "api_error";

/// Classifier and reply generator. Implementations never fail; problems
/// come back as [`ModelOutcome::Degraded`] with a safe default.
#[async_trait]
pub trait ModelApi: Send + Sync {
    async fn classify(&self, request: ClassifyRequest) -> ModelOutcome<Classification>;

    async fn generate_reply(&self, request: ReplyRequest) -> ModelOutcome<String>;
}

/// HTTP client for the classification service.
#[derive(Debug, Clone)]
pub struct ModelApiClient {
    http: reqwest::Client,
    base_url: String,
    classify_timeout: Duration,
    reply_timeout: Duration,
    health_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ReplyResponse {
    #[serde(default)]
    reply: Option<String>,
}

impl ModelApiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            classify_timeout: Duration::from_secs(420),
            reply_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(http: reqwest::Client, config: &ModelConfig) -> Self {
        Self {
            classify_timeout: Duration::from_secs(config.classify_timeout_secs),
            reply_timeout: Duration::from_secs(config.reply_timeout_secs),
            health_timeout: Duration::from_secs(config.health_timeout_secs),
            ..Self::new(http, config.api_url.clone())
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn health_check(&self) -> bool {
        match self
            .http
            .get(&self.base_url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(err) => {
                warn!(error = %err, "model api health check failed");
                false
            }
        }
    }

    async fn try_classify(&self, request: &ClassifyRequest) -> Result<Classification, ModelError> {
        if !self.health_check().await {
            return Err(ModelError::Unavailable);
        }

        let response = self
            .http
            .post(self.endpoint("/api/classify"))
            .timeout(self.classify_timeout)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ModelError::Status { status, body });
        }

        let payload: Value = serde_json::from_str(&body)?;
        let succeeded = payload.get("status").and_then(Value::as_str) == Some("success");
        let first = payload
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first());

        match (succeeded, first) {
            (true, Some(first)) => Ok(serde_json::from_value(first.clone())?),
            _ => Err(ModelError::UnexpectedResponse(truncate(&body, 200))),
        }
    }

    async fn try_generate_reply(&self, request: &ReplyRequest) -> Result<String, ModelError> {
        if !self.health_check().await {
            return Err(ModelError::Unavailable);
        }

        let response = self
            .http
            .post(self.endpoint("/api/generate_reply"))
            .timeout(self.reply_timeout)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ModelError::Status { status, body });
        }

        let payload: ReplyResponse = serde_json::from_str(&body)?;
        Ok(payload.reply.unwrap_or_default())
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

#[async_trait]
impl ModelApi for ModelApiClient {
    async fn classify(&self, request: ClassifyRequest) -> ModelOutcome<Classification> {
        match self.try_classify(&request).await {
            Ok(classification) => {
                info!(
                    label = %classification.label,
                    confidence = classification.confidence,
                    method = %classification.method,
                    "classification api returned"
                );
                ModelOutcome::Ok(classification)
            }
            Err(ModelError::Unavailable) => {
                warn!("classification api not available, using fallback classification");
                ModelOutcome::degraded(
                    Classification::fallback(METHOD_API_UNAVAILABLE),
                    ModelError::Unavailable.to_string(),
                )
            }
            Err(err) => {
                error!(error = %err, "error calling classification api");
                ModelOutcome::degraded(Classification::fallback(METHOD_API_ERROR), err.to_string())
            }
        }
    }

    async fn generate_reply(&self, request: ReplyRequest) -> ModelOutcome<String> {
        if !request.label.is_response_eligible() {
            return ModelOutcome::Ok(String::new());
        }

        match self.try_generate_reply(&request).await {
            Ok(reply) => {
                info!(reply_len = reply.len(), label = %request.label, "reply generation api returned");
                ModelOutcome::Ok(reply)
            }
            Err(err) => {
                error!(error = %err, label = %request.label, "error calling reply generation api");
                ModelOutcome::degraded(String::new(), err.to_string())
            }
        }
    }
}
