use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    pub graph: GraphConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub heuristics: HeuristicsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub export_traces: bool,
}

/// Mailbox access through the Graph-style mail API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub mailbox: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_authority_base")]
    pub authority_base: String,
    #[serde(default = "default_graph_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_parent_folder")]
    pub parent_folder: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelConfig {
    pub api_url: String,
    #[serde(default = "default_classify_timeout")]
    pub classify_timeout_secs: u64,
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeliveryConfig {
    #[serde(default)]
    pub mail_send_enabled: bool,
    #[serde(default = "default_true")]
    pub force_drafts: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mail_send_enabled: false,
            force_drafts: true,
        }
    }
}

impl DeliveryConfig {
    /// Sending is requested but every reply will still be parked as a draft.
    pub fn is_conflicting(&self) -> bool {
        self.mail_send_enabled && self.force_drafts
    }

    pub fn drafts_forced(&self) -> bool {
        !self.mail_send_enabled || self.force_drafts
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1500,
            multiplier: 2.0,
            max_jitter: 0.1,
        }
    }
}

/// Fixed heuristics kept tunable. Neither value has a documented derivation.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct HeuristicsConfig {
    pub thread_ratio: f64,
    pub token_safety_margin_secs: i64,
}

/// Upper bound for the token safety margin, one day.
pub const MAX_TOKEN_SAFETY_MARGIN_SECS: i64 = 86_400;

impl HeuristicsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.thread_ratio.is_finite() || self.thread_ratio <= 0.0 {
            return Err(ConfigError::InvalidHeuristic(format!(
                "thread_ratio must be a positive number, got {}",
                self.thread_ratio
            )));
        }
        if !(0..=MAX_TOKEN_SAFETY_MARGIN_SECS).contains(&self.token_safety_margin_secs) {
            return Err(ConfigError::InvalidHeuristic(format!(
                "token_safety_margin_secs must be between 0 and {MAX_TOKEN_SAFETY_MARGIN_SECS}, got {}",
                self.token_safety_margin_secs
            )));
        }
        Ok(())
    }

    pub fn token_safety_margin(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(
            self.token_safety_margin_secs
                .clamp(0, MAX_TOKEN_SAFETY_MARGIN_SECS),
        )
        .unwrap_or_default()
    }
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            thread_ratio: crate::normalize::DEFAULT_THREAD_RATIO,
            token_safety_margin_secs: 60,
        }
    }
}

fn default_api_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_authority_base() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_graph_timeout() -> u64 {
    60
}

fn default_batch_size() -> usize {
    125
}

fn default_parent_folder() -> String {
    "Email Classification".to_string()
}

fn default_classify_timeout() -> u64 {
    420
}

fn default_reply_timeout() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid BATCH_SIZE override: {0}")]
    InvalidBatchSize(std::num::ParseIntError),
    #[error("invalid heuristics: {0}")]
    InvalidHeuristic(String),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.heuristics.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(size) = env::var("BATCH_SIZE") {
            self.graph.batch_size = size.trim().parse().map_err(ConfigError::InvalidBatchSize)?;
        }

        if let Ok(flag) = env::var("MAIL_SEND_ENABLED") {
            self.delivery.mail_send_enabled = is_truthy(&flag);
        }

        if let Ok(flag) = env::var("FORCE_DRAFTS") {
            self.delivery.force_drafts = is_truthy(&flag);
        }

        if let Ok(url) = env::var("MODEL_API_URL") {
            self.model.api_url = url;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.graph.tenant_id)?;
        apply_env_marker(&mut self.graph.client_id)?;
        apply_env_marker(&mut self.graph.client_secret)?;
        apply_env_marker(&mut self.graph.mailbox)?;
        apply_env_marker(&mut self.graph.api_base)?;
        apply_env_marker(&mut self.graph.authority_base)?;
        apply_env_marker(&mut self.graph.parent_folder)?;
        apply_env_marker(&mut self.model.api_url)?;
        apply_env_marker_path(&mut self.paths.database)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let database_string = self.paths.database.to_string_lossy().to_string();
        let database = shellexpand::tilde(&database_string);
        self.paths.database = PathBuf::from(database.as_ref());
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
