use reqwest::StatusCode;
use thiserror::Error;

/// Failures talking to the model API. These stay inside the client and are
/// turned into degraded outcomes before reaching the pipeline.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model api unavailable")]
    Unavailable,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model api returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),
}
