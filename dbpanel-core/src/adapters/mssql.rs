//! SQL Server driver built on `tiberius`.
//!
//! `server` accepts `host`, `host,port` or `host\INSTANCE`. Named instances
//! are resolved through the SQL Server Browser service. Windows integrated
//! authentication is available on Windows builds only.

use super::{DriverAdapter, require_endpoint, require_user};
use crate::error::DbPanelError;
use crate::models::{ConnectionConfig, DatabaseType, ServerInfo};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

/// Identity query run after connecting.
pub const IDENTITY_QUERY: &str = "SELECT @@VERSION, SUSER_SNAME(), DB_NAME(), @@SERVERNAME";

/// Parsed form of the `server` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub instance: Option<String>,
    pub port: Option<u16>,
}

impl ServerAddress {
    /// Splits `host`, `host,port` and `host\INSTANCE`.
    ///
    /// # Errors
    /// Returns a configuration error for a non-numeric port.
    pub fn parse(server: &str) -> Result<Self> {
        let server = server.trim();
        let (rest, port) = match server.split_once(',') {
            Some((rest, port)) => {
                let port = port.trim().parse::<u16>().map_err(|_| {
                    DbPanelError::configuration(format!("Invalid SQL Server port: {}", port.trim()))
                })?;
                (rest.trim(), Some(port))
            }
            None => (server, None),
        };

        let (host, instance) = match rest.split_once('\\') {
            Some((host, instance)) if !instance.trim().is_empty() => {
                (host.trim(), Some(instance.trim().to_string()))
            }
            Some((host, _)) => (host.trim(), None),
            None => (rest, None),
        };

        let host = match host {
            "." | "(local)" | "(localdb)" | "" => "localhost",
            other => other,
        };

        Ok(Self {
            host: host.to_string(),
            instance,
            port,
        })
    }

    /// Named instances without a known port are located through the
    /// SQL Server Browser; everything else is a direct TCP connect.
    pub fn uses_browser(&self) -> bool {
        self.instance.is_some() && self.port.is_none()
    }
}

/// SQL Server connection tester.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDriver;

impl SqlServerDriver {
    /// Builds the tiberius configuration for a record.
    ///
    /// # Errors
    /// Returns an error for a malformed server field, or when Windows
    /// authentication is requested on another platform.
    pub fn client_config(config: &ConnectionConfig) -> Result<(Config, ServerAddress)> {
        let mut address = ServerAddress::parse(require_endpoint(config, "SQL Server")?)?;
        address.port = address.port.or(config.port);

        let mut tiberius_config = Config::new();
        tiberius_config.host(&address.host);
        if let Some(port) = address.port {
            tiberius_config.port(port);
        } else if address.instance.is_none() {
            tiberius_config.port(DatabaseType::Mssql.default_port().unwrap_or(1433));
        }
        if let Some(instance) = &address.instance {
            tiberius_config.instance_name(instance);
        }
        if let Some(database) = config.database_name() {
            tiberius_config.database(database);
        }
        tiberius_config.application_name("dbpanel");

        match config.encrypt {
            Some(true) => tiberius_config.encryption(EncryptionLevel::Required),
            Some(false) => tiberius_config.encryption(EncryptionLevel::Off),
            None => {}
        }
        if config.trust_server_certificate.unwrap_or(false) {
            tiberius_config.trust_cert();
        }

        if config.windows_auth() {
            #[cfg(windows)]
            tiberius_config.authentication(AuthMethod::Integrated);
            #[cfg(not(windows))]
            return Err(DbPanelError::unsupported_platform("Windows authentication"));
        } else {
            tiberius_config.authentication(AuthMethod::sql_server(
                config.user().unwrap_or_default(),
                config.password.as_deref().unwrap_or_default(),
            ));
        }

        Ok((tiberius_config, address))
    }

    async fn connect(
        tiberius_config: Config,
        address: &ServerAddress,
    ) -> Result<Client<Compat<TcpStream>>> {
        let tcp = if address.uses_browser() {
            TcpStream::connect_named(&tiberius_config)
                .await
                .map_err(|e| DbPanelError::connection_failed("SQL Server Browser lookup failed", e))?
        } else {
            TcpStream::connect(tiberius_config.get_addr())
                .await
                .map_err(|e| DbPanelError::connection_failed("SQL Server connection failed", e))?
        };

        tcp.set_nodelay(true)
            .map_err(|e| DbPanelError::connection_failed("SQL Server connection failed", e))?;

        Client::connect(tiberius_config, tcp.compat_write())
            .await
            .map_err(|e| DbPanelError::connection_failed("SQL Server login failed", e))
    }

    async fn identity(client: &mut Client<Compat<TcpStream>>) -> Result<ServerInfo> {
        let row = client
            .simple_query(IDENTITY_QUERY)
            .await
            .map_err(|e| DbPanelError::connection_failed("SQL Server identity query failed", e))?
            .into_row()
            .await
            .map_err(|e| DbPanelError::connection_failed("SQL Server identity query failed", e))?
            .ok_or_else(|| {
                DbPanelError::connection_message(
                    "SQL Server identity query failed",
                    "no rows returned",
                )
            })?;

        Ok(ServerInfo {
            version: column(&row, 0).map(|v| v.lines().next().unwrap_or_default().trim().to_string()),
            current_user: column(&row, 1),
            current_database: column(&row, 2),
            server_name: column(&row, 3),
        })
    }
}

fn column(row: &Row, index: usize) -> Option<String> {
    row.try_get::<&str, usize>(index)
        .ok()
        .flatten()
        .map(str::to_string)
}

#[async_trait]
impl DriverAdapter for SqlServerDriver {
    fn driver_name(&self) -> &'static str {
        "SQL Server"
    }

    fn validate(&self, config: &ConnectionConfig) -> Result<()> {
        let server = require_endpoint(config, "SQL Server")?;
        ServerAddress::parse(server)?;
        if !config.windows_auth() {
            require_user(config, "SQL Server")?;
        }
        Ok(())
    }

    async fn probe(&self, config: &ConnectionConfig, _timeout: Duration) -> Result<ServerInfo> {
        let (tiberius_config, address) = Self::client_config(config)?;
        debug!(
            "Connecting to SQL Server host {} (instance: {:?})",
            address.host, address.instance
        );

        let mut client = Self::connect(tiberius_config, &address).await?;
        let info = Self::identity(&mut client).await;

        if let Err(e) = client.close().await {
            debug!("Closing SQL Server connection failed: {}", e);
        }

        info
    }
}
