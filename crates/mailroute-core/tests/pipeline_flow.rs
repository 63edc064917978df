use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailroute_core::config::DeliveryConfig;
use mailroute_core::migrations::run_migrations;
use mailroute_core::model::ModelOutcome;
use mailroute_core::store::{BatchStatus, BatchSummary, ProcessingRecord};
use mailroute_core::{
    AppCredentials, ContentSource, Database, EmailProcessor, GraphClient, Label, MockModelApi,
    PipelineError, RecordRepository, RecordStore, RetryPolicy, StoreError, TokenManager,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER: &str = "/v1.0/users/ar@example.com";

struct Harness {
    server: MockServer,
    repo: RecordRepository,
    model: MockModelApi,
    graph: Arc<GraphClient>,
    _dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join(format!("db_{}.sqlite", uuid::Uuid::new_v4())))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");

        let tokens = TokenManager::new(
            reqwest::Client::new(),
            AppCredentials {
                tenant_id: "tenant".into(),
                client_id: "client".into(),
                client_secret: "secret".into(),
            },
            server.uri(),
        );
        let graph = GraphClient::new(reqwest::Client::new(), "ar@example.com", Arc::new(tokens))
            .with_api_base(format!("{}/v1.0", server.uri()))
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1)));

        Self {
            server,
            repo: RecordRepository::new(db),
            model: MockModelApi::new(),
            graph: Arc::new(graph),
            _dir: dir,
        }
    }

    fn processor(&self) -> EmailProcessor {
        EmailProcessor::new(
            self.graph.clone(),
            Arc::new(self.model.clone()),
            Arc::new(self.repo.clone()),
        )
        .with_batch_size(10)
    }

    async fn mount_token(&self) {
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "expires_in": 3600})),
            )
            .mount(&self.server)
            .await;
    }

    /// Parent folder plus one existing child per label.
    async fn mount_folders(&self) {
        Mock::given(method("GET"))
            .and(path(format!("{USER}/mailFolders")))
            .and(query_param("$top", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"id": "inbox", "displayName": "Inbox"},
                    {"id": "p-1", "displayName": "Email Classification"}
                ]
            })))
            .mount(&self.server)
            .await;

        let children: Vec<_> = Label::ALL
            .iter()
            .map(|label| {
                json!({
                    "id": folder_id(*label),
                    "displayName": label.display_name(),
                    "parentFolderId": "p-1"
                })
            })
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("{USER}/mailFolders/p-1/childFolders")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": children})))
            .mount(&self.server)
            .await;
    }

    async fn mount_inbox(&self, messages: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(format!("{USER}/mailFolders/inbox/messages/$count")))
            .respond_with(ResponseTemplate::new(200).set_body_string("1"))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{USER}/mailFolders/inbox/messages")))
            .and(query_param("$filter", "isRead eq false and isDraft eq false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": messages})))
            .mount(&self.server)
            .await;
    }

    async fn expect_move(&self, message_id: &str, label: Label, new_id: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path(format!("{USER}/messages/{message_id}/move")))
            .and(body_json(json!({"destinationId": folder_id(label)})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": new_id})))
            .expect(times)
            .mount(&self.server)
            .await;
    }

    async fn expect_read_state(&self, message_id: &str, is_read: bool, times: u64) {
        Mock::given(method("PATCH"))
            .and(path(format!("{USER}/messages/{message_id}")))
            .and(body_json(json!({"isRead": is_read})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": message_id})))
            .expect(times)
            .mount(&self.server)
            .await;
    }
}

fn folder_id(label: Label) -> String {
    format!("f-{}", label.as_str())
}

fn html_message(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "subject": "Invoice copy",
        "from": {"emailAddress": {"address": "billing@acme.test"}},
        "toRecipients": [{"emailAddress": {"address": "ar@example.com"}}],
        "body": {"contentType": "html", "content": "<html><body><p>Please send a copy of invoice&nbsp;42.</p></body></html>"},
        "bodyPreview": "Please send a copy",
        "hasAttachments": false,
        "conversationId": "conv-1",
        "internetMessageHeaders": [{"name": "X-Mailer", "value": "Outlook"}],
        "receivedDateTime": "2024-05-01T10:00:00Z"
    })
}

#[tokio::test]
async fn invoice_request_is_replied_moved_and_marked_read() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness.mount_inbox(json!([html_message("m-1")])).await;
    harness
        .expect_move("m-1", Label::InvoiceRequestNoInfo, "m-1-moved", 1)
        .await;
    harness.expect_read_state("m-1-moved", true, 1).await;

    harness.model.enqueue_label("invoice_request_no_info", 0.93);
    harness
        .model
        .enqueue_reply(ModelOutcome::Ok("Invoice 42 is attached.".into()));

    let report = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(report.metrics.processed, 1);
    assert_eq!(report.metrics.classified, 1);
    assert_eq!(report.metrics.moved, 1);
    assert_eq!(report.metrics.errored, 0);
    assert_eq!(report.metrics.skipped, 0);
    assert!(!report.stopped_early);

    let classify = harness.model.classify_requests();
    assert_eq!(classify.len(), 1);
    assert_eq!(classify[0].body, "Please send a copy of invoice 42.");
    assert!(!classify[0].had_threads);
    assert_eq!(harness.model.reply_calls(), 1);

    let record = harness
        .repo
        .get_by_message_id("m-1-moved")
        .await
        .expect("record tracked under new id");
    assert_eq!(record.original_message_id, "m-1");
    assert_eq!(record.label, Label::InvoiceRequestNoInfo);
    assert_eq!(record.content_source, ContentSource::FullHtmlConverted);
    assert_eq!(record.reply, "Invoice 42 is attached.");
    assert_eq!(record.response_sent, Some(false));
    assert!(record.save_as_draft);
    assert!(!record.needs_manual_review);
    assert!(record.synced_at.is_some());

    let batch = harness.repo.get_batch(&report.batch_id).await.expect("batch");
    assert_eq!(batch.status, BatchStatus::Success);
    assert_eq!(batch.processed, 1);
    assert_eq!(batch.draft_count, 1);
}

#[tokio::test]
async fn second_run_skips_already_processed_message() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness.mount_inbox(json!([html_message("m-1")])).await;
    // the move is issued once across both runs
    harness
        .expect_move("m-1", Label::NoReplyNoInfo, "m-1-moved", 1)
        .await;
    harness.expect_read_state("m-1-moved", true, 1).await;
    harness.model.enqueue_label("no_reply_no_info", 0.7);

    let first = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("first run");
    let second = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("second run");

    assert_eq!(first.metrics.processed, 1);
    assert_eq!(second.metrics.processed, 0);
    assert_eq!(second.metrics.skipped, 1);
    assert_eq!(harness.model.classify_calls(), 1);
    assert_ne!(first.batch_id, second.batch_id);

    let first_records = harness.repo.list_for_batch(&first.batch_id).await.expect("list");
    let second_records = harness.repo.list_for_batch(&second.batch_id).await.expect("list");
    assert_eq!(first_records.len(), 1);
    assert!(second_records.is_empty());
}

#[tokio::test]
async fn clean_text_is_counted_for_skipped_messages_too() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    let mut message = html_message("m-1");
    message["uniqueBody"] = json!({"contentType": "text", "content": "Please send invoice 42."});
    harness.mount_inbox(json!([message])).await;
    harness
        .expect_move("m-1", Label::NoReplyNoInfo, "m-1-moved", 1)
        .await;
    harness.expect_read_state("m-1-moved", true, 1).await;
    harness.model.enqueue_label("no_reply_no_info", 0.7);

    let first = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("first run");
    let second = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("second run");

    assert_eq!(first.metrics.clean_text_extracted, 1);
    assert_eq!(second.metrics.skipped, 1);
    assert_eq!(second.metrics.clean_text_extracted, 1);
    assert_eq!(second.metrics.classified, 0);
}

#[tokio::test]
async fn degraded_classifier_leaves_message_unread_as_uncategorised() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness.mount_inbox(json!([html_message("m-1")])).await;
    harness
        .expect_move("m-1", Label::Uncategorised, "m-1-unc", 1)
        .await;
    harness.expect_read_state("m-1-unc", false, 1).await;

    let report = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(report.metrics.processed, 1);
    assert_eq!(report.metrics.classified, 1);
    assert_eq!(harness.model.reply_calls(), 0);

    let record = harness.repo.get_by_message_id("m-1-unc").await.expect("record");
    assert_eq!(record.label, Label::Uncategorised);
    assert_eq!(record.confidence, 0.0);
    assert_eq!(record.method, "api_unavailable");
    assert!(record.needs_manual_review);
    assert_eq!(record.response_sent, None);
}

#[tokio::test]
async fn unknown_label_is_coerced() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness.mount_inbox(json!([html_message("m-1")])).await;
    harness
        .expect_move("m-1", Label::Uncategorised, "m-1-unc", 1)
        .await;
    harness.expect_read_state("m-1-unc", false, 1).await;
    harness.model.enqueue_label("promotional_spam", 0.99);

    let report = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(report.metrics.classified, 1);
    let record = harness.repo.get_by_message_id("m-1-unc").await.expect("record");
    assert_eq!(record.label, Label::Uncategorised);
}

#[tokio::test]
async fn failed_reply_degrades_label() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness.mount_inbox(json!([html_message("m-1")])).await;
    harness
        .expect_move("m-1", Label::Uncategorised, "m-1-unc", 1)
        .await;
    harness.expect_read_state("m-1-unc", false, 1).await;
    harness.model.enqueue_label("claims_paid_no_proof", 0.8);
    harness
        .model
        .enqueue_reply(ModelOutcome::degraded(String::new(), "timeout"));

    harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");

    let record = harness.repo.get_by_message_id("m-1-unc").await.expect("record");
    assert_eq!(record.label, Label::Uncategorised);
    assert!(record.reply.is_empty());
}

#[tokio::test]
async fn failed_move_leaves_message_in_place() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness.mount_inbox(json!([html_message("m-1")])).await;
    Mock::given(method("POST"))
        .and(path(format!("{USER}/messages/m-1/move")))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&harness.server)
        .await;
    harness.expect_read_state("m-1", true, 1).await;
    harness.model.enqueue_label("auto_reply_no_info", 0.6);

    let report = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(report.metrics.processed, 1);
    assert_eq!(report.metrics.moved, 0);
    assert_eq!(report.metrics.errored, 0);
    harness.repo.get_by_message_id("m-1").await.expect("id unchanged");
}

#[tokio::test]
async fn failed_read_state_update_still_counts_as_processed() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness.mount_inbox(json!([html_message("m-1")])).await;
    harness
        .expect_move("m-1", Label::NoReplyWithInfo, "m-1-moved", 1)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("{USER}/messages/m-1-moved")))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&harness.server)
        .await;
    harness.model.enqueue_label("no_reply_with_info", 0.9);

    let first = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("first run");
    let second = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect("second run");

    assert_eq!(first.metrics.processed, 1);
    assert_eq!(first.metrics.errored, 0);
    assert_eq!(first.metrics.moved, 1);
    assert_eq!(second.metrics.skipped, 1);
    harness
        .repo
        .get_by_message_id("m-1-moved")
        .await
        .expect("record tracked under new id");
}

/// Store that refuses to persist one message id.
struct RejectingStore {
    inner: RecordRepository,
    reject: &'static str,
}

#[async_trait]
impl RecordStore for RejectingStore {
    async fn create_batch(&self, batch_id: Option<&str>) -> Result<String, StoreError> {
        self.inner.create_batch(batch_id).await
    }

    async fn exists(&self, message_id: &str) -> Result<bool, StoreError> {
        self.inner.exists(message_id).await
    }

    async fn insert(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        if record.message_id == self.reject {
            return Err(StoreError::Duplicate(record.message_id.clone()));
        }
        self.inner.insert(record).await
    }

    async fn update_message_id(&self, old_id: &str, new_id: &str) -> Result<(), StoreError> {
        self.inner.update_message_id(old_id, new_id).await
    }

    async fn sync_batch(&self, batch_id: &str) -> Result<u64, StoreError> {
        self.inner.sync_batch(batch_id).await
    }

    async fn finalize_batch(
        &self,
        batch_id: &str,
        summary: &BatchSummary,
    ) -> Result<(), StoreError> {
        self.inner.finalize_batch(batch_id, summary).await
    }
}

#[tokio::test]
async fn per_message_failures_do_not_stop_the_batch() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness
        .mount_inbox(json!([html_message("m-1"), html_message("m-2")]))
        .await;
    harness
        .expect_move("m-1", Label::NoReplyWithInfo, "m-1-moved", 0)
        .await;
    harness
        .expect_move("m-2", Label::NoReplyWithInfo, "m-2-moved", 1)
        .await;
    harness.expect_read_state("m-2-moved", true, 1).await;
    harness.model.enqueue_label("no_reply_with_info", 0.9);
    harness.model.enqueue_label("no_reply_with_info", 0.9);

    let store = RejectingStore {
        inner: harness.repo.clone(),
        reject: "m-1",
    };
    let report = EmailProcessor::new(
        harness.graph.clone(),
        Arc::new(harness.model.clone()),
        Arc::new(store),
    )
    .run(&CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(report.metrics.errored, 1);
    assert_eq!(report.metrics.processed, 1);
    assert_eq!(report.metrics.moved, 1);

    let batch = harness.repo.get_batch(&report.batch_id).await.expect("batch");
    assert_eq!(batch.status, BatchStatus::Success);
    assert_eq!(batch.errored, 1);
}

#[tokio::test]
async fn cancelled_run_stops_before_next_message() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness
        .mount_inbox(json!([html_message("m-1"), html_message("m-2")]))
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{USER}/messages/m-1/move")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "x"})))
        .expect(0)
        .mount(&harness.server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = harness.processor().run(&cancel).await.expect("run returns");

    assert!(report.stopped_early);
    assert_eq!(report.metrics.processed, 0);
    assert_eq!(harness.model.classify_calls(), 0);

    let batch = harness.repo.get_batch(&report.batch_id).await.expect("batch");
    assert_eq!(batch.status, BatchStatus::Stopped);
}

#[tokio::test]
async fn sending_enabled_keeps_replies_out_of_drafts() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    harness.mount_folders().await;
    harness.mount_inbox(json!([html_message("m-1")])).await;
    harness
        .expect_move("m-1", Label::InvoiceRequestNoInfo, "m-1-moved", 1)
        .await;
    harness.expect_read_state("m-1-moved", true, 1).await;
    harness.model.enqueue_label("invoice_request_no_info", 0.93);
    harness.model.enqueue_reply(ModelOutcome::Ok("Reply".into()));

    harness
        .processor()
        .with_delivery(DeliveryConfig {
            mail_send_enabled: true,
            force_drafts: false,
        })
        .run(&CancellationToken::new())
        .await
        .expect("run succeeds");

    let record = harness.repo.get_by_message_id("m-1-moved").await.expect("record");
    assert!(!record.save_as_draft);
}

#[tokio::test]
async fn empty_folder_map_aborts_before_listing() {
    let harness = Harness::start().await;
    harness.mount_token().await;
    Mock::given(method("GET"))
        .and(path(format!("{USER}/mailFolders")))
        .and(query_param("$top", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "p-1", "displayName": "Email Classification"}]
        })))
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{USER}/mailFolders/p-1/childFolders")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{USER}/mailFolders")))
        .and(query_param("$select", "id,parentFolderId,displayName"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{USER}/mailFolders/p-1/childFolders")))
        .respond_with(ResponseTemplate::new(403))
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{USER}/mailFolders/inbox/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(0)
        .mount(&harness.server)
        .await;

    let err = harness
        .processor()
        .with_batch_id("batch-empty")
        .run(&CancellationToken::new())
        .await
        .expect_err("empty map aborts");
    assert!(matches!(err, PipelineError::EmptyFolderMap));

    let batch = harness.repo.get_batch("batch-empty").await.expect("batch");
    assert_eq!(batch.status, BatchStatus::Failed);
}

#[tokio::test]
async fn rejected_credentials_fail_the_run() {
    let harness = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/tenant/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string(r#"{"error":"invalid_client"}"#))
        .mount(&harness.server)
        .await;

    let err = harness
        .processor()
        .run(&CancellationToken::new())
        .await
        .expect_err("authentication failure");
    assert!(matches!(err, PipelineError::Authentication(_)));
    assert_eq!(harness.model.classify_calls(), 0);
}
