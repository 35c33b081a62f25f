//! Driver adapters and the tester that dispatches to them.
//!
//! Each adapter opens one connection, runs an identity query and closes the
//! connection again. Failures never escape as errors: they become a failed
//! [`ConnectionStatus`] carrying the raw message and remediation hints.
//!
//! # Module Structure
//! - `mysql`, `postgres`, `sqlite`: `sqlx` drivers
//! - `mssql`: `tiberius` driver
//! - `mongodb`: official MongoDB driver
//! - `odbc`: PowerShell bridge to `System.Data.Odbc`
//! - `placeholder`: stand-in for kinds without a driver in this build

use crate::command::{PowerShell, SystemCommandRunner};
use crate::config::PanelConfig;
use crate::error::DbPanelError;
use crate::hints::{FailureKind, hints_for, hints_for_kind};
use crate::models::{ConnectionConfig, ConnectionStatus, DatabaseType, ServerInfo, SupportedType};
use crate::registry::RegistryScanner;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[cfg(feature = "mongodb")]
pub mod mongodb;
#[cfg(feature = "mssql")]
pub mod mssql;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod odbc;
pub mod placeholder;
#[cfg(feature = "postgresql")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use odbc::OdbcAdapter;
pub use placeholder::NotInstalledAdapter;

/// One database driver.
///
/// # Security
/// - Credentials are never logged
/// - Every connection opened by `probe` is closed before it returns
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    /// Name used in messages, e.g. "MySQL" or "ODBC".
    fn driver_name(&self) -> &'static str;

    /// Whether the driver is part of this build.
    fn driver_installed(&self) -> bool {
        true
    }

    /// Checks required fields without any I/O.
    ///
    /// # Errors
    /// Returns a configuration error naming the missing field.
    fn validate(&self, config: &ConnectionConfig) -> Result<()>;

    /// Connects, runs the identity query and disconnects.
    ///
    /// # Errors
    /// Returns an error if the connection or the query fails.
    async fn probe(&self, config: &ConnectionConfig, timeout: Duration) -> Result<ServerInfo>;

    /// Full test: validation, a bounded probe and failure classification.
    ///
    /// `db_type` is the kind of the record under test and selects the hint
    /// set; it differs from the adapter's own kind for ODBC.
    async fn test_connection(
        &self,
        db_type: DatabaseType,
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> ConnectionStatus {
        let started = Instant::now();
        let result = match self.validate(config) {
            Ok(()) => bounded(self.driver_name(), timeout, self.probe(config, timeout)).await,
            Err(e) => Err(e),
        };

        let status = match result {
            Ok(info) => {
                info!("{} connection test succeeded", self.driver_name());
                ConnectionStatus::succeeded(
                    format!("Connected to {} successfully", self.driver_name()),
                    info,
                )
            }
            Err(e) => {
                warn!("{} connection test failed: {}", self.driver_name(), e);
                failure_status(db_type, &e)
            }
        };
        status.with_duration(started.elapsed())
    }
}

/// Runs `probe` under `timeout`, mapping expiry to a timeout error.
pub(crate) async fn bounded<F>(driver: &str, timeout: Duration, probe: F) -> Result<ServerInfo>
where
    F: std::future::Future<Output = Result<ServerInfo>>,
{
    tokio::time::timeout(timeout, probe)
        .await
        .unwrap_or_else(|_| Err(DbPanelError::timeout(format!("{driver} connection"), timeout)))
}

/// Failed status for an error, with hints chosen by error class.
pub fn failure_status(db_type: DatabaseType, error: &DbPanelError) -> ConnectionStatus {
    let message = error.to_string();
    let hints = match error {
        DbPanelError::Configuration { .. } | DbPanelError::NotFound { .. } => Vec::new(),
        DbPanelError::UnsupportedPlatform { .. } => {
            vec!["Use SQL Server authentication with a username and password instead".to_string()]
        }
        DbPanelError::DriverNotInstalled { .. } => {
            hints_for_kind(db_type, FailureKind::DriverMissing)
        }
        DbPanelError::Timeout { .. } => hints_for_kind(db_type, FailureKind::Timeout),
        _ => hints_for(db_type, &message),
    };
    ConnectionStatus::failed(message, hints)
}

/// Adapter budget for one record; a per-connection override wins.
pub fn effective_timeout(config: &ConnectionConfig, default: Duration) -> Duration {
    config
        .connect_timeout_secs
        .filter(|secs| *secs > 0)
        .map_or(default, Duration::from_secs)
}

/// Network endpoint or a configuration error.
pub(crate) fn require_endpoint<'a>(config: &'a ConnectionConfig, kind: &str) -> Result<&'a str> {
    config
        .endpoint()
        .ok_or_else(|| DbPanelError::configuration(format!("{kind} requires a server or host")))
}

/// Username or a configuration error.
pub(crate) fn require_user<'a>(config: &'a ConnectionConfig, kind: &str) -> Result<&'a str> {
    config
        .user()
        .ok_or_else(|| DbPanelError::configuration(format!("{kind} requires a username")))
}

/// Non-blank connection string override.
pub(crate) fn connection_string(config: &ConnectionConfig) -> Option<&str> {
    config
        .connection_string
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Capability to test a connection record's settings.
///
/// The connection store only knows this trait, never concrete drivers.
#[async_trait]
pub trait ConnectionTester: Send + Sync {
    /// Tests `config` as a `db_type` connection. Never fails: problems are
    /// reported in the returned status.
    async fn test(&self, db_type: DatabaseType, config: &ConnectionConfig) -> ConnectionStatus;
}

/// The set of drivers available to this build, keyed by kind.
pub struct DriverRegistry {
    drivers: BTreeMap<DatabaseType, Arc<dyn DriverAdapter>>,
    odbc: Arc<dyn DriverAdapter>,
    default_timeout: Duration,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl DriverRegistry {
    /// Registry with every compiled-in driver and the given ODBC adapter.
    pub fn new(odbc: OdbcAdapter, default_timeout: Duration) -> Self {
        let mut drivers: BTreeMap<DatabaseType, Arc<dyn DriverAdapter>> = BTreeMap::new();

        #[cfg(feature = "mssql")]
        drivers.insert(DatabaseType::Mssql, Arc::new(mssql::SqlServerDriver));
        #[cfg(feature = "mysql")]
        drivers.insert(DatabaseType::Mysql, Arc::new(mysql::MySqlDriver));
        #[cfg(feature = "postgresql")]
        drivers.insert(DatabaseType::Postgresql, Arc::new(postgres::PostgresDriver));
        #[cfg(feature = "mongodb")]
        drivers.insert(DatabaseType::Mongodb, Arc::new(mongodb::MongoDriver));
        #[cfg(feature = "sqlite")]
        drivers.insert(DatabaseType::Sqlite, Arc::new(sqlite::SqliteDriver));

        debug!("Registered {} native drivers", drivers.len());

        Self {
            drivers,
            odbc: Arc::new(odbc),
            default_timeout,
        }
    }

    /// Registry for the running system: live registry, real PowerShell.
    pub fn from_config(config: &PanelConfig) -> Self {
        let scanner = RegistryScanner::system(config.registry_timeout);
        let powershell = PowerShell::new(Arc::new(SystemCommandRunner), config.command_timeout);
        Self::new(OdbcAdapter::new(powershell, scanner), config.connect_timeout)
    }

    /// Builder method replacing the adapter for one kind.
    pub fn with_driver(mut self, db_type: DatabaseType, adapter: Arc<dyn DriverAdapter>) -> Self {
        self.drivers.insert(db_type, adapter);
        self
    }

    /// Builder method replacing the ODBC adapter.
    pub fn with_odbc(mut self, adapter: Arc<dyn DriverAdapter>) -> Self {
        self.odbc = adapter;
        self
    }

    /// Adapter that handles a record; `useOdbc` routes to ODBC regardless
    /// of the kind.
    pub fn adapter_for(
        &self,
        db_type: DatabaseType,
        config: &ConnectionConfig,
    ) -> Arc<dyn DriverAdapter> {
        if config.use_odbc() {
            return Arc::clone(&self.odbc);
        }
        self.drivers.get(&db_type).map_or_else(
            || Arc::new(NotInstalledAdapter::new(db_type)) as Arc<dyn DriverAdapter>,
            Arc::clone,
        )
    }

    /// Capabilities of every kind in this build.
    pub fn supported_types(&self) -> Vec<SupportedType> {
        DatabaseType::ALL
            .into_iter()
            .map(|db_type| SupportedType {
                db_type,
                display_name: db_type.display_name().to_string(),
                default_port: db_type.default_port(),
                driver_installed: self
                    .drivers
                    .get(&db_type)
                    .is_some_and(|driver| driver.driver_installed()),
                supports_windows_auth: db_type.supports_windows_auth(),
                supports_odbc: db_type.supports_odbc(),
            })
            .collect()
    }
}

#[async_trait]
impl ConnectionTester for DriverRegistry {
    async fn test(&self, db_type: DatabaseType, config: &ConnectionConfig) -> ConnectionStatus {
        let adapter = self.adapter_for(db_type, config);
        let timeout = effective_timeout(config, self.default_timeout);
        debug!(
            "Testing {} connection through the {} adapter (timeout {:?})",
            db_type,
            adapter.driver_name(),
            timeout
        );
        adapter.test_connection(db_type, config, timeout).await
    }
}
