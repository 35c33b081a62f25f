//! MySQL driver built on `sqlx`.
//!
//! # Security Features
//! - Credentials go into connect options, never into a logged URL
//! - Statement logging is disabled
//! - The single connection is closed on both success and failure

use super::{DriverAdapter, connection_string, require_endpoint, require_user};
use crate::error::{DbPanelError, redact_database_url};
use crate::models::{ConnectionConfig, DatabaseType, ServerInfo};
use crate::Result;
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Identity query run after connecting.
pub const IDENTITY_QUERY: &str = "SELECT VERSION(), CURRENT_USER(), DATABASE(), @@hostname";

/// MySQL connection tester.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDriver;

impl MySqlDriver {
    /// Builds connect options from discrete fields or a `mysql://` URL.
    ///
    /// # Errors
    /// Returns a configuration error if the URL cannot be parsed.
    pub fn connect_options(config: &ConnectionConfig) -> Result<MySqlConnectOptions> {
        let options = if let Some(url) = connection_string(config) {
            MySqlConnectOptions::from_str(url).map_err(|e| {
                DbPanelError::configuration(format!(
                    "Invalid MySQL connection string {}: {e}",
                    redact_database_url(url)
                ))
            })?
        } else {
            let mut options = MySqlConnectOptions::new()
                .host(config.endpoint().unwrap_or("localhost"))
                .port(config.port_or_default(DatabaseType::Mysql).unwrap_or(3306));
            if let Some(user) = config.user() {
                options = options.username(user);
            }
            if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
                options = options.password(password);
            }
            if let Some(database) = config.database_name() {
                options = options.database(database);
            }
            options
        };

        Ok(options.disable_statement_logging())
    }
}

#[async_trait]
impl DriverAdapter for MySqlDriver {
    fn driver_name(&self) -> &'static str {
        "MySQL"
    }

    fn validate(&self, config: &ConnectionConfig) -> Result<()> {
        if connection_string(config).is_some() {
            return Ok(());
        }
        require_endpoint(config, "MySQL")?;
        require_user(config, "MySQL")?;
        Ok(())
    }

    async fn probe(&self, config: &ConnectionConfig, _timeout: Duration) -> Result<ServerInfo> {
        let options = Self::connect_options(config)?;
        let mut conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| DbPanelError::connection_failed("MySQL connection failed", e))?;

        let row = sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>, Option<String>)>(
            IDENTITY_QUERY,
        )
        .fetch_one(&mut conn)
        .await;

        if let Err(e) = conn.close().await {
            debug!("Closing MySQL connection failed: {}", e);
        }

        let (version, current_user, current_database, server_name) =
            row.map_err(|e| DbPanelError::connection_failed("MySQL identity query failed", e))?;

        Ok(ServerInfo {
            version,
            current_user,
            current_database,
            server_name,
        })
    }
}
