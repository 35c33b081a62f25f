//! SQLite driver built on `sqlx`.
//!
//! The database file is opened read-only and is never created; testing a
//! path that does not exist fails instead of leaving an empty file behind.

use super::DriverAdapter;
use crate::error::DbPanelError;
use crate::models::{ConnectionConfig, ServerInfo};
use crate::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Identity query run after opening the file.
pub const IDENTITY_QUERY: &str = "SELECT sqlite_version()";

/// SQLite connection tester.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    fn path(config: &ConnectionConfig) -> Result<&str> {
        config
            .database_name()
            .ok_or_else(|| DbPanelError::configuration("SQLite requires a database file path"))
    }
}

#[async_trait]
impl DriverAdapter for SqliteDriver {
    fn driver_name(&self) -> &'static str {
        "SQLite"
    }

    fn validate(&self, config: &ConnectionConfig) -> Result<()> {
        Self::path(config).map(|_| ())
    }

    async fn probe(&self, config: &ConnectionConfig, timeout: Duration) -> Result<ServerInfo> {
        let path = Self::path(config)?;
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false)
            .busy_timeout(timeout)
            .disable_statement_logging();

        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| DbPanelError::connection_failed("SQLite open failed", e))?;

        let version = sqlx::query_scalar::<_, String>(IDENTITY_QUERY)
            .fetch_one(&mut conn)
            .await;

        if let Err(e) = conn.close().await {
            debug!("Closing SQLite connection failed: {}", e);
        }

        let version =
            version.map_err(|e| DbPanelError::connection_failed("SQLite identity query failed", e))?;

        Ok(ServerInfo {
            version: Some(version),
            current_user: None,
            current_database: Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            server_name: Some("localhost".to_string()),
        })
    }
}
