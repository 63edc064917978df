use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BatchRun, BatchStatus, BatchSummary, ProcessingRecord, RecordStore, StoreError};
use crate::db::Database;
use crate::model::Label;

const RECORD_COLUMNS: &str = "message_id, original_message_id, batch_id, conversation_id, sender, recipient, recipients_json, subject, body, received_at, has_attachments, headers_json, content_source, had_threads, label, confidence, method, entities_json, metadata_json, reply, needs_manual_review, save_as_draft, draft_saved, response_sent, processed_at, synced_at";

const BATCH_COLUMNS: &str =
    "id, started_at, finished_at, status, processed, classified, skipped, errored, moved, draft_count";

/// libsql-backed [`RecordStore`].
#[derive(Clone)]
pub struct RecordRepository {
    db: Database,
}

impl RecordRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<ProcessingRecord, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM processing_records WHERE message_id = ?1"),
                params![message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_record(row),
            None => Err(StoreError::NotFound(message_id.to_string())),
        }
    }

    pub async fn list_for_batch(&self, batch_id: &str) -> Result<Vec<ProcessingRecord>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM processing_records WHERE batch_id = ?1 ORDER BY processed_at, message_id"
                ),
                params![batch_id],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<BatchRun, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {BATCH_COLUMNS} FROM batch_runs WHERE id = ?1"),
                params![batch_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_batch(row),
            None => Err(StoreError::NotFound(batch_id.to_string())),
        }
    }
}

#[async_trait]
impl RecordStore for RecordRepository {
    async fn create_batch(&self, batch_id: Option<&str>) -> Result<String, StoreError> {
        let id = batch_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO batch_runs (id, started_at, status) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![id.clone(), now_rfc3339(), BatchStatus::Running.as_str()],
        )
        .await?;
        info!(batch_id = %id, "registered batch");
        Ok(id)
    }

    async fn exists(&self, message_id: &str) -> Result<bool, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM processing_records WHERE message_id = ?1 OR original_message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await?;

        Ok(rows.next().await?.is_some())
    }

    async fn insert(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        let recipients_json = serde_json::to_string(&record.recipients)?;
        let headers_json = serde_json::to_string(&record.headers)?;
        let entities_json = serde_json::to_string(&record.entities)?;
        let metadata_json = serde_json::to_string(&record.metadata)?;

        let conn = self.db.connection().await?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO processing_records (id, {RECORD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, NULL)
                     ON CONFLICT(message_id) DO NOTHING"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    record.message_id.clone(),
                    record.original_message_id.clone(),
                    record.batch_id.clone(),
                    record.conversation_id.clone(),
                    record.sender.clone(),
                    record.recipient.clone(),
                    recipients_json,
                    record.subject.clone(),
                    record.body.clone(),
                    record.received_at.clone(),
                    i64::from(record.has_attachments),
                    headers_json,
                    record.content_source.as_str(),
                    i64::from(record.had_threads),
                    record.label.as_str(),
                    record.confidence,
                    record.method.clone(),
                    entities_json,
                    metadata_json,
                    record.reply.clone(),
                    i64::from(record.needs_manual_review),
                    i64::from(record.save_as_draft),
                    i64::from(record.draft_saved),
                    record.response_sent.map(i64::from),
                    to_rfc3339(record.processed_at)
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(StoreError::Duplicate(record.message_id.clone()));
        }
        debug!(message_id = %record.message_id, "stored processing record");
        Ok(())
    }

    async fn update_message_id(&self, old_id: &str, new_id: &str) -> Result<(), StoreError> {
        let conn = self.db.connection().await?;
        let updated = conn
            .execute(
                "UPDATE processing_records SET message_id = ?2 WHERE message_id = ?1",
                params![old_id, new_id],
            )
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(old_id.to_string()));
        }
        debug!(old_id, new_id, "updated tracked message id");
        Ok(())
    }

    async fn sync_batch(&self, batch_id: &str) -> Result<u64, StoreError> {
        let conn = self.db.connection().await?;
        let synced = conn
            .execute(
                "UPDATE processing_records SET synced_at = ?2 WHERE batch_id = ?1",
                params![batch_id, now_rfc3339()],
            )
            .await?;
        Ok(synced)
    }

    async fn finalize_batch(
        &self,
        batch_id: &str,
        summary: &BatchSummary,
    ) -> Result<(), StoreError> {
        let conn = self.db.connection().await?;
        let updated = conn
            .execute(
                "UPDATE batch_runs SET
                    finished_at = ?2,
                    status = ?3,
                    processed = ?4,
                    classified = ?5,
                    skipped = ?6,
                    errored = ?7,
                    moved = ?8,
                    draft_count = (
                        SELECT COUNT(*) FROM processing_records
                        WHERE batch_id = ?1 AND save_as_draft = 1 AND reply != ''
                    )
                 WHERE id = ?1",
                params![
                    batch_id,
                    now_rfc3339(),
                    summary.status.as_str(),
                    summary.processed as i64,
                    summary.classified as i64,
                    summary.skipped as i64,
                    summary.errored as i64,
                    summary.moved as i64
                ],
            )
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(batch_id.to_string()));
        }
        Ok(())
    }
}

fn row_to_record(row: Row) -> Result<ProcessingRecord, StoreError> {
    let recipients_json: String = row.get(6)?;
    let has_attachments: i64 = row.get(10)?;
    let headers_json: String = row.get(11)?;
    let content_source: String = row.get(12)?;
    let had_threads: i64 = row.get(13)?;
    let label: String = row.get(14)?;
    let entities_json: String = row.get(17)?;
    let metadata_json: String = row.get(18)?;
    let needs_manual_review: i64 = row.get(20)?;
    let save_as_draft: i64 = row.get(21)?;
    let draft_saved: i64 = row.get(22)?;
    let response_sent: Option<i64> = row.get(23)?;
    let processed_at: String = row.get(24)?;
    let synced_at: Option<String> = row.get(25)?;

    Ok(ProcessingRecord {
        message_id: row.get(0)?,
        original_message_id: row.get(1)?,
        batch_id: row.get(2)?,
        conversation_id: row.get(3)?,
        sender: row.get(4)?,
        recipient: row.get(5)?,
        recipients: serde_json::from_str(&recipients_json)?,
        subject: row.get(7)?,
        body: row.get(8)?,
        received_at: row.get(9)?,
        has_attachments: has_attachments != 0,
        headers: serde_json::from_str(&headers_json)?,
        content_source: serde_json::from_value(Value::String(content_source))?,
        had_threads: had_threads != 0,
        label: Label::coerce(&label),
        confidence: row.get(15)?,
        method: row.get(16)?,
        entities: serde_json::from_str(&entities_json)?,
        metadata: serde_json::from_str(&metadata_json)?,
        reply: row.get(19)?,
        needs_manual_review: needs_manual_review != 0,
        save_as_draft: save_as_draft != 0,
        draft_saved: draft_saved != 0,
        response_sent: response_sent.map(|value| value != 0),
        processed_at: parse_timestamp(&processed_at)?,
        synced_at: synced_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn row_to_batch(row: Row) -> Result<BatchRun, StoreError> {
    let started_at: String = row.get(1)?;
    let finished_at: Option<String> = row.get(2)?;
    let status: String = row.get(3)?;
    let count = |idx: i32| -> Result<u64, StoreError> {
        let value: i64 = row.get(idx)?;
        Ok(value.max(0) as u64)
    };

    Ok(BatchRun {
        id: row.get(0)?,
        started_at: parse_timestamp(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
        status: BatchStatus::parse(&status).unwrap_or(BatchStatus::Failed),
        processed: count(4)?,
        classified: count(5)?,
        skipped: count(6)?,
        errored: count(7)?,
        moved: count(8)?,
        draft_count: count(9)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
