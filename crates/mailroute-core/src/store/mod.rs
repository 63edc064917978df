pub mod repository;

pub use repository::RecordRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::DbError;
use crate::graph::types::Header;
use crate::model::{Entities, EntityKind, Label};
use crate::normalize::ContentSource;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfOfficeInfo {
    pub ooo_person: Value,
    pub contact_person: Value,
    pub ooo_dates: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeftCompanyInfo {
    pub left_person: Value,
    pub replacement: Value,
}

/// Derived figures stored alongside each record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub headers_count: usize,
    pub recipients_count: usize,
    pub body_length: usize,
    #[serde(default)]
    pub matching_patterns: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_of_office: Option<OutOfOfficeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_company: Option<LeftCompanyInfo>,
}

impl RecordMetadata {
    pub fn derive(
        headers: &[Header],
        recipients: &[String],
        body: &str,
        entities: &Entities,
        matching_patterns: &[Value],
    ) -> Self {
        let mut metadata = Self {
            headers_count: headers.len(),
            recipients_count: recipients.len(),
            body_length: body.chars().count(),
            matching_patterns: matching_patterns.to_vec(),
            out_of_office: None,
            left_company: None,
        };

        match &entities.kind {
            EntityKind::OutOfOffice {
                person,
                contact_person,
                dates,
            } => {
                metadata.out_of_office = Some(OutOfOfficeInfo {
                    ooo_person: person.clone(),
                    contact_person: contact_person.clone(),
                    ooo_dates: dates.clone(),
                });
            }
            EntityKind::LeftCompany {
                person,
                replacement,
            } => {
                metadata.left_company = Some(LeftCompanyInfo {
                    left_person: person.clone(),
                    replacement: replacement.clone(),
                });
            }
            EntityKind::None => {}
        }

        metadata
    }
}

/// The persisted outcome of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRecord {
    /// Tracked id; patched when the message moves folders.
    pub message_id: String,
    pub original_message_id: String,
    pub batch_id: String,
    pub conversation_id: Option<String>,
    pub sender: String,
    pub recipient: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub received_at: Option<String>,
    pub has_attachments: bool,
    pub headers: Vec<Header>,
    pub content_source: ContentSource,
    pub had_threads: bool,
    pub label: Label,
    pub confidence: f64,
    pub method: String,
    pub entities: Map<String, Value>,
    pub metadata: RecordMetadata,
    pub reply: String,
    pub needs_manual_review: bool,
    pub save_as_draft: bool,
    pub draft_saved: bool,
    /// `Some(false)` when a reply is waiting to go out, `None` when there is
    /// nothing to send.
    pub response_sent: Option<bool>,
    pub processed_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Success,
    Stopped,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Success => "success",
            BatchStatus::Stopped => "stopped",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(BatchStatus::Running),
            "success" => Some(BatchStatus::Success),
            "stopped" => Some(BatchStatus::Stopped),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

/// Counters written when a batch is finalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub status: BatchStatus,
    pub processed: u64,
    pub classified: u64,
    pub skipped: u64,
    pub errored: u64,
    pub moved: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub processed: u64,
    pub classified: u64,
    pub skipped: u64,
    pub errored: u64,
    pub moved: u64,
    pub draft_count: u64,
}

/// Persistence seam used by the pipeline.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Registers a batch, reusing `batch_id` when given, and returns its id.
    async fn create_batch(&self, batch_id: Option<&str>) -> Result<String, StoreError>;

    /// True when a record exists under this id, either tracked or original.
    async fn exists(&self, message_id: &str) -> Result<bool, StoreError>;

    async fn insert(&self, record: &ProcessingRecord) -> Result<(), StoreError>;

    async fn update_message_id(&self, old_id: &str, new_id: &str) -> Result<(), StoreError>;

    /// Stamps the batch's records as synchronised and returns how many.
    async fn sync_batch(&self, batch_id: &str) -> Result<u64, StoreError>;

    async fn finalize_batch(&self, batch_id: &str, summary: &BatchSummary)
    -> Result<(), StoreError>;
}
