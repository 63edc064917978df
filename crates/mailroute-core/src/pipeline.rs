use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::DeliveryConfig;
use crate::folders::{FolderError, FolderManager, FolderMap};
use crate::graph::{GraphClient, RemoteMessage};
use crate::model::{ClassifyRequest, Entities, Label, ModelApi, ModelOutcome, ReplyRequest};
use crate::normalize::ContentNormalizer;
use crate::store::{
    BatchStatus, BatchSummary, ProcessingRecord, RecordMetadata, RecordStore, StoreError,
};

pub const DEFAULT_BATCH_SIZE: usize = 125;

/// Counters for one run. Never shared across runs.
///
/// `clean_text_extracted` counts every fetched message whose text came from
/// the thread-free body, including ones later skipped as duplicates.
/// `classified` counts every classification answer, degraded fallbacks
/// included; `errored` is the place to look for failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMetrics {
    pub processed: u64,
    pub classified: u64,
    pub skipped: u64,
    pub errored: u64,
    pub moved: u64,
    pub clean_text_extracted: u64,
}

impl RunMetrics {
    pub fn summary(&self, status: BatchStatus) -> BatchSummary {
        BatchSummary {
            status,
            processed: self.processed,
            classified: self.classified,
            skipped: self.skipped,
            errored: self.errored,
            moved: self.moved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub batch_id: String,
    pub metrics: RunMetrics,
    pub stopped_early: bool,
}

/// Failures that end a run before any message is processed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Authentication(#[source] FolderError),
    #[error("folder mapping unavailable: {0}")]
    FolderMapUnavailable(#[source] FolderError),
    #[error("folder mapping is empty")]
    EmptyFolderMap,
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

/// Review and draft handling for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DraftFlags {
    pub needs_manual_review: bool,
    pub save_as_draft: bool,
}

impl DraftFlags {
    pub fn resolve(label: Label, delivery: DeliveryConfig) -> Self {
        let needs_manual_review = label.needs_manual_review();
        Self {
            needs_manual_review,
            save_as_draft: needs_manual_review || delivery.drafts_forced(),
        }
    }
}

/// Runs one classification and routing pass over the unread inbox.
pub struct EmailProcessor {
    graph: Arc<GraphClient>,
    model: Arc<dyn ModelApi>,
    store: Arc<dyn RecordStore>,
    folders: FolderManager,
    normalizer: ContentNormalizer,
    delivery: DeliveryConfig,
    batch_size: usize,
    batch_id: Option<String>,
}

impl EmailProcessor {
    pub fn new(
        graph: Arc<GraphClient>,
        model: Arc<dyn ModelApi>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            graph,
            model,
            store,
            folders: FolderManager::default(),
            normalizer: ContentNormalizer::default(),
            delivery: DeliveryConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_id: None,
        }
    }

    pub fn with_folder_manager(mut self, folders: FolderManager) -> Self {
        self.folders = folders;
        self
    }

    pub fn with_normalizer(mut self, normalizer: ContentNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Process up to one batch of unread messages. Cancellation is checked
    /// between messages; the message in flight always completes.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport, PipelineError> {
        if self.delivery.is_conflicting() {
            warn!(
                mail_send_enabled = self.delivery.mail_send_enabled,
                force_drafts = self.delivery.force_drafts,
                "configuration conflict: sending is enabled but drafts are forced, replies will be saved as drafts"
            );
        }

        let batch_id = self.store.create_batch(self.batch_id.as_deref()).await?;
        let span = info_span!("pipeline_run", batch_id = %batch_id);
        self.run_batch(batch_id, cancel).instrument(span).await
    }

    async fn run_batch(
        &self,
        batch_id: String,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let mut metrics = RunMetrics::default();

        let folder_map = match self.folders.ensure(&self.graph).await {
            Ok(map) => map,
            Err(err) => {
                error!(error = %err, "could not build folder mapping, aborting run");
                self.finish(&batch_id, &metrics, BatchStatus::Failed).await;
                return Err(if err.is_auth() {
                    PipelineError::Authentication(err)
                } else {
                    PipelineError::FolderMapUnavailable(err)
                });
            }
        };
        if folder_map.is_empty() {
            error!("folder mapping is empty, aborting run");
            self.finish(&batch_id, &metrics, BatchStatus::Failed).await;
            return Err(PipelineError::EmptyFolderMap);
        }

        let messages = self.graph.list_unread(self.batch_size).await;
        let mut stopped_early = false;

        for (index, message) in messages.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(remaining = messages.len() - index, "stop requested, ending batch early");
                stopped_early = true;
                break;
            }

            let span = info_span!("process_message", message_id = %message.id);
            if let Err(err) = self
                .process_message(message, &folder_map, &batch_id, &mut metrics)
                .instrument(span)
                .await
            {
                error!(message_id = %message.id, error = %err, "unhandled error processing message");
                metrics.errored += 1;
            }
        }

        let status = if stopped_early {
            BatchStatus::Stopped
        } else {
            BatchStatus::Success
        };
        self.finish(&batch_id, &metrics, status).await;

        info!(
            processed = metrics.processed,
            classified = metrics.classified,
            skipped = metrics.skipped,
            errored = metrics.errored,
            moved = metrics.moved,
            clean_text_extracted = metrics.clean_text_extracted,
            stopped_early,
            "batch complete"
        );

        Ok(RunReport {
            batch_id,
            metrics,
            stopped_early,
        })
    }

    async fn process_message(
        &self,
        message: &RemoteMessage,
        folder_map: &FolderMap,
        batch_id: &str,
        metrics: &mut RunMetrics,
    ) -> Result<(), StoreError> {
        let content = self.normalizer.normalize(message);
        if content.source.is_unique() {
            metrics.clean_text_extracted += 1;
        }

        if self.store.exists(&message.id).await? {
            info!("skipping already-processed message");
            metrics.skipped += 1;
            return Ok(());
        }

        let sender = message.sender_address().to_string();
        let subject = message.subject().to_string();
        let recipients = message.recipient_addresses();
        info!(
            sender = %sender,
            subject = %subject,
            content_source = %content.source,
            clean_text_len = content.clean_text.len(),
            had_threads = content.had_threads,
            "processing message"
        );

        let outcome = self
            .model
            .classify(ClassifyRequest {
                subject: subject.clone(),
                body: content.clean_text.clone(),
                headers: message.internet_message_headers.clone(),
                sender_email: sender.clone(),
                recipient_emails: recipients.clone(),
                has_attachments: message.has_attachments,
                had_threads: content.had_threads,
            })
            .await;

        let degraded = outcome.is_degraded();
        if let ModelOutcome::Degraded { reason, .. } = &outcome {
            warn!(reason = %reason, "classification degraded, defaulting to uncategorised");
        }
        let classification = outcome.into_value();

        let mut label = if degraded {
            Label::Uncategorised
        } else {
            classification.label()
        };
        if !degraded && label.as_str() != classification.label {
            warn!(raw_label = %classification.label, "classifier returned non-allowed label, using uncategorised");
        }
        let confidence = if degraded {
            0.0
        } else {
            classification.clamped_confidence()
        };
        metrics.classified += 1;
        info!(label = %label, confidence, had_threads = content.had_threads, "message classified");

        let entities = Entities::from_map(&classification.entities);

        let mut reply = String::new();
        if label.is_response_eligible() {
            info!(label = %label, "generating reply");
            let outcome = self
                .model
                .generate_reply(ReplyRequest {
                    subject: subject.clone(),
                    body: content.clean_text.clone(),
                    label,
                    entities: entities.to_map(),
                })
                .await;
            match outcome {
                ModelOutcome::Ok(text) => {
                    if text.is_empty() {
                        warn!("empty reply generated");
                    }
                    reply = text;
                }
                ModelOutcome::Degraded { reason, .. } => {
                    warn!(reason = %reason, "reply generation failed, degrading to uncategorised");
                    label = Label::Uncategorised;
                }
            }
        }

        let flags = DraftFlags::resolve(label, self.delivery);
        if flags.save_as_draft && !flags.needs_manual_review {
            debug!("forcing draft handling due to configuration");
        }

        let metadata = RecordMetadata::derive(
            &message.internet_message_headers,
            &recipients,
            &content.clean_text,
            &entities,
            &classification.matching_patterns,
        );
        let record = ProcessingRecord {
            message_id: message.id.clone(),
            original_message_id: message.id.clone(),
            batch_id: batch_id.to_string(),
            conversation_id: message.conversation_id.clone(),
            sender,
            recipient: message.primary_recipient().map(str::to_string),
            recipients,
            subject,
            body: content.clean_text,
            received_at: message.received_date_time.clone(),
            has_attachments: message.has_attachments,
            headers: message.internet_message_headers.clone(),
            content_source: content.source,
            had_threads: content.had_threads,
            label,
            confidence,
            method: classification.method,
            entities: classification.entities,
            metadata,
            response_sent: (!reply.is_empty()).then_some(false),
            reply,
            needs_manual_review: flags.needs_manual_review,
            save_as_draft: flags.save_as_draft,
            draft_saved: false,
            processed_at: Utc::now(),
            synced_at: None,
        };
        self.store.insert(&record).await?;
        info!(content_source = %record.content_source, "stored processing record");

        let mut current_id = message.id.clone();
        match folder_map.get(label) {
            Some(folder_id) => match self.graph.move_message(&current_id, folder_id).await {
                Ok(new_id) if !new_id.is_empty() => {
                    self.store.update_message_id(&current_id, &new_id).await?;
                    info!(label = %label, folder_id, new_id = %new_id, "message moved");
                    current_id = new_id;
                    metrics.moved += 1;
                }
                Ok(_) => warn!(label = %label, "move returned no id, message left in place"),
                Err(err) => warn!(label = %label, error = %err, "move failed, message left in place"),
            },
            None => warn!(label = %label, "no folder mapping for label, message left in inbox"),
        }

        let is_read = !label.needs_manual_review();
        if let Err(err) = self.graph.set_read(&current_id, is_read).await {
            warn!(message_id = %current_id, is_read, error = %err, "could not update read state, message left as is");
        }

        metrics.processed += 1;
        Ok(())
    }

    async fn finish(&self, batch_id: &str, metrics: &RunMetrics, status: BatchStatus) {
        match self.store.sync_batch(batch_id).await {
            Ok(synced) => info!(synced, "synchronised batch records"),
            Err(err) => error!(error = %err, "failed to synchronise batch records"),
        }

        if let Err(err) = self
            .store
            .finalize_batch(batch_id, &metrics.summary(status))
            .await
        {
            error!(error = %err, "failed to finalise batch");
        } else {
            info!(status = status.as_str(), "batch finalised");
        }
    }
}
