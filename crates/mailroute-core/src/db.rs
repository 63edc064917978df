use std::{env, fmt, path::Path, sync::Arc, time::Duration};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const AUTH_TOKEN_VAR: &str = "LIBSQL_AUTH_TOKEN";

/// Where the record database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// A file on disk, created on first open.
    Local(String),
    /// A `libsql://` or `http(s)://` endpoint.
    Remote(String),
}

impl DatabaseLocation {
    pub fn parse(path: &Path) -> Self {
        let location = path.to_string_lossy().into_owned();
        let remote = ["libsql://", "http://", "https://"]
            .iter()
            .any(|scheme| location.starts_with(scheme));
        if remote {
            DatabaseLocation::Remote(location)
        } else {
            DatabaseLocation::Local(location)
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, DatabaseLocation::Remote(_))
    }
}

impl fmt::Display for DatabaseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseLocation::Local(path) => write!(f, "file {path}"),
            DatabaseLocation::Remote(url) => write!(f, "remote {url}"),
        }
    }
}

/// Shared handle to the processing-record database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
    location: DatabaseLocation,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to open {location}: {source}")]
    Open {
        location: DatabaseLocation,
        source: libsql::Error,
    },
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("missing required LIBSQL_AUTH_TOKEN for remote database")]
    MissingAuthToken,
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        Self::open(DatabaseLocation::parse(database_path)).await
    }

    pub async fn open(location: DatabaseLocation) -> Result<Self, DbError> {
        let built = match &location {
            DatabaseLocation::Remote(url) => {
                let auth_token = env::var(AUTH_TOKEN_VAR)
                    .ok()
                    .filter(|token| !token.is_empty())
                    .ok_or(DbError::MissingAuthToken)?;
                Builder::new_remote(url.clone(), auth_token).build().await
            }
            DatabaseLocation::Local(path) => Builder::new_local(path.clone()).build().await,
        };
        let inner = built.map_err(|source| DbError::Open {
            location: location.clone(),
            source,
        })?;
        debug!(%location, "opened record database");

        Ok(Self {
            inner: Arc::new(inner),
            location,
        })
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    /// A new connection. Local files get a busy timeout so a second writer
    /// waits instead of failing.
    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        if !self.location.is_remote() {
            conn.busy_timeout(BUSY_TIMEOUT).map_err(DbError::Statement)?;
        }
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}
