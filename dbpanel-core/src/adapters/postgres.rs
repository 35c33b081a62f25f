//! PostgreSQL driver built on `sqlx`.

use super::{DriverAdapter, connection_string, require_endpoint, require_user};
use crate::error::{DbPanelError, redact_database_url};
use crate::models::{ConnectionConfig, DatabaseType, ServerInfo};
use crate::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Identity query run after connecting.
pub const IDENTITY_QUERY: &str =
    "SELECT version(), current_user, current_database(), inet_server_addr()::text";

/// PostgreSQL connection tester.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    /// Builds connect options from discrete fields or a `postgres://` URL.
    ///
    /// # Errors
    /// Returns a configuration error if the URL cannot be parsed.
    pub fn connect_options(config: &ConnectionConfig) -> Result<PgConnectOptions> {
        let options = if let Some(url) = connection_string(config) {
            PgConnectOptions::from_str(url).map_err(|e| {
                DbPanelError::configuration(format!(
                    "Invalid PostgreSQL connection string {}: {e}",
                    redact_database_url(url)
                ))
            })?
        } else {
            let mut options = PgConnectOptions::new()
                .host(config.endpoint().unwrap_or("localhost"))
                .port(config.port_or_default(DatabaseType::Postgresql).unwrap_or(5432))
                .application_name("dbpanel");
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
impl DriverAdapter for PostgresDriver {
    fn driver_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn validate(&self, config: &ConnectionConfig) -> Result<()> {
        if connection_string(config).is_some() {
            return Ok(());
        }
        require_endpoint(config, "PostgreSQL")?;
        require_user(config, "PostgreSQL")?;
        Ok(())
    }

    async fn probe(&self, config: &ConnectionConfig, _timeout: Duration) -> Result<ServerInfo> {
        let options = Self::connect_options(config)?;
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| DbPanelError::connection_failed("PostgreSQL connection failed", e))?;

        let row = sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>, Option<String>)>(
            IDENTITY_QUERY,
        )
        .fetch_one(&mut conn)
        .await;

        if let Err(e) = conn.close().await {
            debug!("Closing PostgreSQL connection failed: {}", e);
        }

        let (version, current_user, current_database, server_addr) = row
            .map_err(|e| DbPanelError::connection_failed("PostgreSQL identity query failed", e))?;

        Ok(ServerInfo {
            version,
            current_user,
            current_database,
            // NULL over a Unix socket
            server_name: server_addr.or_else(|| config.endpoint().map(str::to_string)),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_host_and_user() {
        let driver = PostgresDriver;
        let config = ConnectionConfig {
            host: Some("localhost".to_string()),
            ..Default::default()
        };
        assert!(driver.validate(&config).is_err());

        let config = ConnectionConfig {
            host: Some("localhost".to_string()),
            username: Some("postgres".to_string()),
            ..Default::default()
        };
        assert!(driver.validate(&config).is_ok());
    }

    #[test]
    fn test_connect_options_from_fields() {
        let config = ConnectionConfig {
            host: Some("db.internal".to_string()),
            port: Some(6543),
            username: Some("app".to_string()),
            database: Some("orders".to_string()),
            ..Default::default()
        };
        let options = PostgresDriver::connect_options(&config).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("orders"));
    }
}
