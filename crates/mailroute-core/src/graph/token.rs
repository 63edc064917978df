use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::GraphConfig;

pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::seconds(60);
pub const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// A bearer token and the instant it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now.checked_add_signed(margin)
            .is_some_and(|deadline| self.expires_at > deadline)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl AppCredentials {
    pub fn from_config(config: &GraphConfig) -> Self {
        Self {
            tenant_id: config.tenant_id.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    fn validate(&self) -> Result<(), TokenError> {
        for (field, value) in [
            ("tenant_id", &self.tenant_id),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ] {
            if value.trim().is_empty() {
                return Err(TokenError::MissingConfig(field));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("missing identity configuration: {0}")]
    MissingConfig(&'static str),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("identity provider rejected credentials {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Holds the single application credential for the process and exchanges
/// client credentials for a new one when it is missing or about to expire.
///
/// Reads take a shared lock; refreshes are serialised so a forced refresh
/// cannot interleave with a caller still holding the stale token's slot.
pub struct TokenManager {
    http: reqwest::Client,
    credentials: AppCredentials,
    authority_base: String,
    scope: String,
    safety_margin: Duration,
    cached: RwLock<Option<Credential>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        credentials: AppCredentials,
        authority_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            credentials,
            authority_base: authority_base.into(),
            scope: GRAPH_DEFAULT_SCOPE.to_string(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    fn token_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_base.trim_end_matches('/'),
            self.credentials.tenant_id
        )
    }

    pub async fn get_token(&self, force_refresh: bool) -> Result<String, TokenError> {
        if !force_refresh {
            if let Some(token) = self.cached_if_fresh().await {
                debug!("using cached access token");
                return Ok(token);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if !force_refresh {
            if let Some(token) = self.cached_if_fresh().await {
                return Ok(token);
            }
        }

        let credential = self.exchange().await?;
        let token = credential.access_token.clone();
        *self.cached.write().await = Some(credential);
        Ok(token)
    }

    async fn cached_if_fresh(&self) -> Option<String> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|c| c.is_fresh(Utc::now(), self.safety_margin))
            .map(|c| c.access_token.clone())
    }

    async fn exchange(&self) -> Result<Credential, TokenError> {
        self.credentials.validate()?;
        let client_prefix: String = self.credentials.client_id.chars().take(8).collect();
        debug!(
            client_id = %format!("{client_prefix}***"),
            tenant_id = %self.credentials.tenant_id,
            "requesting application token"
        );

        let response = self
            .http
            .post(self.token_endpoint())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let requested_at = Utc::now();
        let body = response.text().await?;
        let payload: TokenResponse = serde_json::from_str(&body)?;
        let expires_in = payload.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        let expires_at = Some(expires_in)
            .filter(|secs| *secs > 0)
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| requested_at.checked_add_signed(lifetime))
            .ok_or(TokenError::InvalidExpires(expires_in))?;

        info!(expires_in, "acquired application access token");
        Ok(Credential {
            access_token: payload.access_token,
            expires_at,
        })
    }
}
