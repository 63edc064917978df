pub mod config;
pub mod db;
pub mod folders;
pub mod graph;
pub mod migrations;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use db::Database;
pub use folders::{FolderError, FolderManager, FolderMap};
pub use graph::{AppCredentials, GraphClient, GraphError, RemoteMessage, TokenError, TokenManager};
pub use model::{Label, MockModelApi, ModelApi, ModelApiClient, ModelOutcome};
pub use normalize::{ContentNormalizer, ContentSource, NormalizedContent};
pub use pipeline::{DraftFlags, EmailProcessor, PipelineError, RunMetrics, RunReport};
pub use retry::RetryPolicy;
pub use store::{RecordRepository, RecordStore, StoreError};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
