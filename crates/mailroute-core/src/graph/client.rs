use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use futures::StreamExt;

use crate::config::GraphConfig;
use crate::graph::token::{TokenError, TokenManager};
use crate::graph::types::{MESSAGE_SELECT, MailFolder, MovedMessage, Page, RemoteMessage};
use crate::retry::RetryPolicy;

const DEFAULT_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const ROOT_FOLDER_PAGE: &str = "1000";
const CHILD_FOLDER_PAGE: &str = "100";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mail api returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unauthorized after token refresh")]
    Unauthorized,
    #[error("unexpected response body: {0}")]
    UnexpectedBody(String),
}

impl GraphError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GraphError::Status { status, .. } => Some(*status),
            GraphError::Http(err) => err.status(),
            GraphError::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            _ => None,
        }
    }

    /// Timeouts, dropped connections, 408, 429 and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            GraphError::Http(err) => {
                if let Some(status) = err.status() {
                    is_transient_status(status)
                } else {
                    !err.is_decode() && !err.is_builder()
                }
            }
            GraphError::Status { status, .. } => is_transient_status(*status),
            GraphError::Token(_)
            | GraphError::Decode(_)
            | GraphError::Unauthorized
            | GraphError::UnexpectedBody(_) => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, GraphError::Token(_) | GraphError::Unauthorized)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Token-backed client for one mailbox on the Graph-style mail API.
pub struct GraphClient {
    http: Client,
    mailbox: String,
    api_base: String,
    timeout: Duration,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
}

impl GraphClient {
    pub fn new(http: Client, mailbox: impl Into<String>, tokens: Arc<TokenManager>) -> Self {
        Self {
            http,
            mailbox: mailbox.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            tokens,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(
        http: Client,
        config: &GraphConfig,
        tokens: Arc<TokenManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self::new(http, config.mailbox.clone(), tokens)
            .with_api_base(config.api_base.clone())
            .with_timeout(Duration::from_secs(config.timeout_secs))
            .with_retry(retry)
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    fn user_url(&self) -> String {
        format!("{}/users/{}", self.api_base, self.mailbox)
    }

    /// Best-effort size of the unread backlog. The count endpoint needs the
    /// eventual-consistency hint.
    pub async fn count_unread(&self) -> Result<u64, GraphError> {
        let url = format!("{}/mailFolders/inbox/messages/$count", self.user_url());
        let body = self
            .send_text(|| {
                self.http
                    .get(&url)
                    .header("ConsistencyLevel", "eventual")
                    .query(&[("$filter", "isRead eq false")])
            })
            .await?;
        body.trim()
            .parse::<u64>()
            .map_err(|_| GraphError::UnexpectedBody(format!("count: {body}")))
    }

    /// Newest-first unread, non-draft inbox messages, at most `max`.
    pub async fn list_unread(&self, max: usize) -> Vec<RemoteMessage> {
        match self.count_unread().await {
            Ok(total) => info!(total_unread = total, "unread messages in inbox"),
            Err(err) => debug!(error = %err, "unread count unavailable"),
        }

        let url = format!("{}/mailFolders/inbox/messages", self.user_url());
        let top = max.to_string();
        let params = [
            ("$orderby", "receivedDateTime desc"),
            ("$filter", "isRead eq false and isDraft eq false"),
            ("$select", MESSAGE_SELECT),
            ("$top", top.as_str()),
        ];

        let messages: Vec<RemoteMessage> = self.walk(&url, &params, Some(max)).collect().await;
        if messages.is_empty() {
            info!("no unread messages to process");
        } else {
            info!(count = messages.len(), "fetched unread messages");
        }
        messages
    }

    /// Moves a message and returns the id it carries in its new folder.
    pub async fn move_message(&self, message_id: &str, folder_id: &str) -> Result<String, GraphError> {
        let url = format!("{}/messages/{}/move", self.user_url(), message_id);
        let payload = json!({ "destinationId": folder_id });
        let moved: MovedMessage = self
            .send_json(|| self.http.post(&url).json(&payload))
            .await?;
        info!(
            message_id,
            folder_id,
            new_id = %moved.id,
            "moved message"
        );
        Ok(moved.id)
    }

    pub async fn set_read(&self, message_id: &str, is_read: bool) -> Result<(), GraphError> {
        let url = format!("{}/messages/{}", self.user_url(), message_id);
        let payload = json!({ "isRead": is_read });
        self.send_text(|| self.http.patch(&url).json(&payload))
            .await?;
        info!(message_id, is_read, "updated read state");
        Ok(())
    }

    pub async fn list_root_folders(&self) -> Result<Vec<MailFolder>, GraphError> {
        let url = format!("{}/mailFolders", self.user_url());
        let page: Page<MailFolder> = self
            .send_json(|| self.http.get(&url).query(&[("$top", ROOT_FOLDER_PAGE)]))
            .await?;
        Ok(page.value)
    }

    pub async fn create_root_folder(&self, display_name: &str) -> Result<MailFolder, GraphError> {
        let url = format!("{}/mailFolders", self.user_url());
        let payload = json!({ "displayName": display_name });
        self.send_json(|| self.http.post(&url).json(&payload)).await
    }

    pub async fn child_folders(&self, parent_id: &str) -> Vec<MailFolder> {
        let url = format!("{}/mailFolders/{}/childFolders", self.user_url(), parent_id);
        self.walk(&url, &[("$top", CHILD_FOLDER_PAGE)], None)
            .collect()
            .await
    }

    pub async fn create_child_folder(
        &self,
        parent_id: &str,
        display_name: &str,
    ) -> Result<MailFolder, GraphError> {
        let url = format!("{}/mailFolders/{}/childFolders", self.user_url(), parent_id);
        let payload = json!({ "displayName": display_name });
        self.send_json(|| self.http.post(&url).json(&payload)).await
    }

    /// First folder anywhere in the mailbox with exactly this display name.
    pub async fn find_folder_by_name(
        &self,
        display_name: &str,
    ) -> Result<Option<MailFolder>, GraphError> {
        let url = format!("{}/mailFolders", self.user_url());
        let filter = format!("displayName eq '{}'", display_name.replace('\'', "''"));
        let page: Page<MailFolder> = self
            .send_json(|| {
                self.http.get(&url).query(&[
                    ("$filter", filter.as_str()),
                    ("$select", "id,parentFolderId,displayName"),
                ])
            })
            .await?;
        Ok(page.value.into_iter().next())
    }

    pub async fn reparent_folder(&self, folder_id: &str, parent_id: &str) -> Result<(), GraphError> {
        let url = format!("{}/mailFolders/{}", self.user_url(), folder_id);
        let payload = json!({ "parentFolderId": parent_id });
        self.send_text(|| self.http.patch(&url).json(&payload))
            .await?;
        Ok(())
    }

    pub(crate) async fn send_json<T, B>(&self, build: B) -> Result<T, GraphError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        self.retry
            .run(|| self.fetch_json(&build), GraphError::is_transient)
            .await
    }

    async fn send_text<B>(&self, build: B) -> Result<String, GraphError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        self.retry
            .run(|| self.fetch_text(&build), GraphError::is_transient)
            .await
    }

    async fn fetch_json<T, B>(&self, build: &B) -> Result<T, GraphError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let body = self.fetch_text(build).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_text<B>(&self, build: &B) -> Result<String, GraphError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let response = self.perform_authenticated(build).await?;
        Ok(response.text().await?)
    }

    async fn perform_authenticated<B>(&self, build: &B) -> Result<reqwest::Response, GraphError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.tokens.get_token(false).await?;
        let mut response = build()
            .bearer_auth(&token)
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("access token rejected, forcing refresh");
            let token = self.tokens.get_token(true).await?;
            response = build()
                .bearer_auth(&token)
                .timeout(self.timeout)
                .send()
                .await?;
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(GraphError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::Status { status, body });
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::token::AppCredentials;
    use crate::retry::Sleeper;
    use async_trait::async_trait;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _duration: Duration) {}
    }

    async fn mount_token(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "expires_in": 3600,
            })))
            .mount(server)
            .await;
    }

    fn make_client(server: &MockServer) -> GraphClient {
        let tokens = TokenManager::new(
            reqwest::Client::new(),
            AppCredentials {
                tenant_id: "tenant".into(),
                client_id: "client".into(),
                client_secret: "secret".into(),
            },
            server.uri(),
        );
        GraphClient::new(reqwest::Client::new(), "ar@example.com", Arc::new(tokens))
            .with_api_base(format!("{}/v1.0", server.uri()))
            .with_retry(
                RetryPolicy::new(3, Duration::from_millis(1)).with_sleeper(Arc::new(NoSleep)),
            )
    }

    #[tokio::test]
    async fn move_returns_new_id() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("POST"))
            .and(path("/v1.0/users/ar@example.com/messages/m-1/move"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({"destinationId": "folder-9"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "m-1-moved"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let new_id = client.move_message("m-1", "folder-9").await.expect("move");
        assert_eq!(new_id, "m-1-moved");
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("PATCH"))
            .and(path("/v1.0/users/ar@example.com/messages/m-1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1.0/users/ar@example.com/messages/m-1"))
            .and(body_json(json!({"isRead": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        client.set_read("m-1", true).await.expect("third attempt succeeds");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("POST"))
            .and(path("/v1.0/users/ar@example.com/messages/gone/move"))
            .respond_with(ResponseTemplate::new(404).set_body_string("ErrorItemNotFound"))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let err = client
            .move_message("gone", "folder")
            .await
            .expect_err("404 surfaces");
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn rate_limits_exhaust_retries() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/v1.0/users/ar@example.com/mailFolders"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let err = client.list_root_folders().await.expect_err("429 surfaces");
        assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unauthorized_forces_one_token_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "stale",
                "expires_in": 3600,
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_token(&server, "fresh").await;

        Mock::given(method("PATCH"))
            .and(path("/v1.0/users/ar@example.com/messages/m-1"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1.0/users/ar@example.com/messages/m-1"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        client.set_read("m-1", false).await.expect("replayed with fresh token");
    }

    #[tokio::test]
    async fn persistent_unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/v1.0/users/ar@example.com/mailFolders"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let err = client.list_root_folders().await.expect_err("unauthorized");
        assert!(matches!(err, GraphError::Unauthorized));
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn count_sends_consistency_header() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/v1.0/users/ar@example.com/mailFolders/inbox/messages/$count"))
            .and(header("ConsistencyLevel", "eventual"))
            .and(query_param("$filter", "isRead eq false"))
            .respond_with(ResponseTemplate::new(200).set_body_string("17"))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        assert_eq!(client.count_unread().await.expect("count"), 17);
    }

    #[tokio::test]
    async fn non_numeric_count_is_not_a_status_error() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/v1.0/users/ar@example.com/mailFolders/inbox/messages/$count"))
            .respond_with(ResponseTemplate::new(200).set_body_string("lots"))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let err = client.count_unread().await.expect_err("bad count body");
        assert!(matches!(err, GraphError::UnexpectedBody(_)));
        assert_eq!(err.status(), None);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn list_unread_queries_filtered_inbox() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/v1.0/users/ar@example.com/mailFolders/inbox/messages/$count"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/users/ar@example.com/mailFolders/inbox/messages"))
            .and(query_param("$filter", "isRead eq false and isDraft eq false"))
            .and(query_param("$orderby", "receivedDateTime desc"))
            .and(query_param("$top", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"id": "m-1", "subject": "one"},
                    {"id": "m-2", "subject": "two"},
                    {"id": "m-3", "subject": "three"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let messages = client.list_unread(2).await;
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);
    }

    #[tokio::test]
    async fn folder_search_escapes_quotes() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/v1.0/users/ar@example.com/mailFolders"))
            .and(query_param("$filter", "displayName eq 'Bob''s Folder'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "f-7", "displayName": "Bob's Folder", "parentFolderId": "root"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let found = client
            .find_folder_by_name("Bob's Folder")
            .await
            .expect("search")
            .expect("folder found");
        assert_eq!(found.id, "f-7");
        assert_eq!(found.parent_folder_id.as_deref(), Some("root"));
    }

    #[test]
    fn transient_classification_follows_status() {
        let status = |code: u16| GraphError::Status {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };
        assert!(status(500).is_transient());
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(status(408).is_transient());
        assert!(!status(400).is_transient());
        assert!(!status(403).is_transient());
        assert!(!status(409).is_transient());
        assert!(status(409).is_conflict());
        assert!(!GraphError::Token(TokenError::MissingConfig("client_id")).is_transient());
    }
}
