//! Windows registry scanning for connection settings, vendor instances and
//! ODBC data sources.
//!
//! All lookups go through a [`RegistryReader`], so the same scanning logic
//! runs against the live registry on Windows and an in-memory registry in
//! tests. Reads execute on the blocking pool under a timeout; a read that
//! fails, times out or finds nothing is treated as "no such key".

mod reader;

pub use reader::{MemoryRegistry, RegistryReader, UnavailableRegistry, system_registry};
#[cfg(windows)]
pub use reader::WindowsRegistry;

use crate::command::Architecture;
use crate::models::{ConnectionConfig, DatabaseType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Flattened values of one registry key.
pub type RegistryValues = BTreeMap<String, String>;

/// Registry root a path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegistryHive {
    #[serde(rename = "HKCU")]
    CurrentUser,
    #[serde(rename = "HKLM")]
    LocalMachine,
}

impl RegistryHive {
    /// Per-user settings shadow machine-wide ones.
    pub const SEARCH_ORDER: [Self; 2] = [Self::CurrentUser, Self::LocalMachine];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CurrentUser => "HKCU",
            Self::LocalMachine => "HKLM",
        }
    }
}

impl fmt::Display for RegistryHive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hive plus a subkey path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryPath {
    pub hive: RegistryHive,
    pub path: String,
}

impl RegistryPath {
    pub fn new(hive: RegistryHive, path: impl Into<String>) -> Self {
        Self {
            hive,
            path: path.into(),
        }
    }
}

impl fmt::Display for RegistryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}", self.hive, self.path)
    }
}

/// Result of looking up saved credentials for a vendor instance.
///
/// A miss is a normal outcome: `found` is false and `paths_tried` lists
/// every location that was checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialFetch {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConnectionConfig>,
    /// Values that did not map onto a connection field
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw: RegistryValues,
    pub paths_tried: Vec<String>,
    pub message: String,
}

/// Scope of an ODBC data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DsnScope {
    User,
    System,
}

/// An ODBC data source registered under `ODBC.INI`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OdbcDsn {
    pub name: String,
    pub driver: String,
    pub architecture: Architecture,
    pub scope: DsnScope,
}

const APP_KEY: &str = r"SOFTWARE\DBPanel\Connections";
const ODBC_INI_64: &str = r"SOFTWARE\ODBC\ODBC.INI";
const ODBC_INI_32: &str = r"SOFTWARE\WOW6432Node\ODBC\ODBC.INI";
const ODBC_DATA_SOURCES: &str = "ODBC Data Sources";

/// Instance name used when the caller does not name one.
pub const fn default_instance(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::Mssql => "MSSQLSERVER",
        _ => "default",
    }
}

/// Candidate registry locations for a vendor instance, most specific first.
///
/// Each subkey is tried under HKCU before HKLM. The application's own key
/// comes first and the generic ODBC keys last.
pub fn candidate_paths(db_type: DatabaseType, instance: Option<&str>) -> Vec<RegistryPath> {
    let instance = instance
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| default_instance(db_type));

    let mut subkeys = vec![format!(r"{APP_KEY}\{}\{instance}", db_type.as_str())];
    match db_type {
        DatabaseType::Mssql => {
            subkeys.push(format!(
                r"SOFTWARE\Microsoft\Microsoft SQL Server\{instance}\MSSQLServer"
            ));
            subkeys.push(r"SOFTWARE\Microsoft\MSSQLServer\Client\ConnectTo".to_string());
        }
        DatabaseType::Mysql => {
            subkeys.push(format!(r"SOFTWARE\MySQL AB\{instance}"));
            subkeys.push(format!(r"SOFTWARE\Oracle\MySQL\{instance}"));
        }
        DatabaseType::Postgresql => {
            subkeys.push(format!(r"SOFTWARE\PostgreSQL\Installations\{instance}"));
            subkeys.push(format!(r"SOFTWARE\PostgreSQL\Services\{instance}"));
        }
        DatabaseType::Mongodb => {
            subkeys.push(format!(r"SOFTWARE\MongoDB\Server\{instance}"));
        }
        DatabaseType::Oracle | DatabaseType::Sqlite => {}
    }
    subkeys.push(format!(r"{ODBC_INI_64}\{instance}"));
    subkeys.push(format!(r"{ODBC_INI_32}\{instance}"));

    subkeys
        .into_iter()
        .flat_map(|subkey| {
            RegistryHive::SEARCH_ORDER
                .into_iter()
                .map(move |hive| RegistryPath::new(hive, subkey.clone()))
        })
        .collect()
}

/// Maps flattened registry values onto connection fields.
///
/// Key names match case-insensitively. Returns the config and the values
/// that had no matching field. Passwords never end up in the leftover map.
pub fn config_from_values(
    db_type: DatabaseType,
    values: &RegistryValues,
) -> (ConnectionConfig, RegistryValues) {
    let mut config = ConnectionConfig::default();
    let mut raw = RegistryValues::new();

    for (key, value) in values {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.to_ascii_lowercase().as_str() {
            "server" | "servername" | "data source" | "host" | "hostname" => {
                if db_type == DatabaseType::Mssql {
                    config.server = Some(value.to_string());
                } else {
                    config.host = Some(value.to_string());
                }
            }
            "port" | "tcpport" => match value.parse::<u16>() {
                Ok(port) => config.port = Some(port),
                Err(_) => {
                    raw.insert(key.clone(), value.to_string());
                }
            },
            "database" | "initial catalog" | "dbname" => {
                config.database = Some(value.to_string());
            }
            "uid" | "user" | "username" | "user id" => {
                config.username = Some(value.to_string());
            }
            "pwd" | "password" => config.password = Some(value.to_string()),
            "trusted_connection" | "integrated security" => {
                config.windows_auth = Some(parse_flag(value));
            }
            "encrypt" => config.encrypt = Some(parse_flag(value)),
            "trustservercertificate" => {
                config.trust_server_certificate = Some(parse_flag(value));
            }
            "driver" => {
                config
                    .extra
                    .insert("driver".to_string(), serde_json::Value::String(value.to_string()));
            }
            _ => {
                raw.insert(key.clone(), value.to_string());
            }
        }
    }

    (config, raw)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "sspi" | "mandatory"
    )
}

/// Reads registry keys through a [`RegistryReader`] with a time budget.
#[derive(Clone)]
pub struct RegistryScanner {
    reader: Arc<dyn RegistryReader>,
    timeout: Duration,
}

impl fmt::Debug for RegistryScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryScanner")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RegistryScanner {
    pub fn new(reader: Arc<dyn RegistryReader>, timeout: Duration) -> Self {
        Self { reader, timeout }
    }

    /// Scanner over the registry of the running platform.
    pub fn system(timeout: Duration) -> Self {
        Self::new(system_registry(), timeout)
    }

    /// Flattens a key's values into a string map; `None` if unreadable.
    pub async fn read_registry_config(
        &self,
        hive: RegistryHive,
        path: &str,
    ) -> Option<RegistryValues> {
        let reader = Arc::clone(&self.reader);
        let owned = path.to_string();
        self.blocking(move || reader.read_values(hive, &owned), hive, path)
            .await
    }

    /// Names of a key's direct subkeys; empty if unreadable.
    pub async fn subkeys(&self, hive: RegistryHive, path: &str) -> Vec<String> {
        let reader = Arc::clone(&self.reader);
        let owned = path.to_string();
        self.blocking(move || reader.subkeys(hive, &owned), hive, path)
            .await
            .unwrap_or_default()
    }

    async fn blocking<T, F>(&self, read: F, hive: RegistryHive, path: &str) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Option<T> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(read)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("Registry read of {}\\{} panicked: {}", hive, path, e);
                None
            }
            Err(_) => {
                warn!(
                    "Registry read of {}\\{} timed out after {:?}",
                    hive, path, self.timeout
                );
                None
            }
        }
    }

    /// Candidate paths that can actually be read.
    ///
    /// A type with no matching keys yields an empty list.
    pub async fn discover_registry_paths(
        &self,
        db_type: DatabaseType,
        instance: Option<&str>,
    ) -> Vec<RegistryPath> {
        let mut found = Vec::new();
        for candidate in candidate_paths(db_type, instance) {
            if self
                .read_registry_config(candidate.hive, &candidate.path)
                .await
                .is_some()
            {
                found.push(candidate);
            }
        }
        debug!(
            "{} of the {} registry paths are readable",
            found.len(),
            db_type
        );
        found
    }

    /// First non-empty config among the candidate paths.
    ///
    /// Candidates are read once each, in order; the first key with any
    /// values wins.
    pub async fn fetch_credentials_from_registry(
        &self,
        db_type: DatabaseType,
        instance: Option<&str>,
    ) -> CredentialFetch {
        let mut paths_tried = Vec::new();

        for candidate in candidate_paths(db_type, instance) {
            paths_tried.push(candidate.to_string());
            let Some(values) = self
                .read_registry_config(candidate.hive, &candidate.path)
                .await
            else {
                continue;
            };
            if values.is_empty() {
                continue;
            }

            let (mut config, raw) = config_from_values(db_type, &values);
            if candidate.path.contains("ODBC.INI") {
                let dsn = candidate.path.rsplit('\\').next().unwrap_or_default();
                config.use_odbc = Some(true);
                config.odbc_connection_string = Some(format!("DSN={dsn}"));
            }

            info!("Found {} settings in {}", db_type, candidate);
            return CredentialFetch {
                found: true,
                source: Some(candidate.to_string()),
                config: Some(config),
                raw,
                message: format!("Loaded settings from {candidate}"),
                paths_tried,
            };
        }

        info!(
            "No {} settings in the registry ({} paths tried)",
            db_type,
            paths_tried.len()
        );
        CredentialFetch {
            found: false,
            source: None,
            config: None,
            raw: RegistryValues::new(),
            message: "No saved settings found in the registry; enter the connection details manually"
                .to_string(),
            paths_tried,
        }
    }

    /// Instance names registered by a vendor's installer.
    pub async fn list_instances(&self, db_type: DatabaseType) -> Vec<String> {
        let hive = RegistryHive::LocalMachine;
        let mut instances = match db_type {
            DatabaseType::Mssql => {
                let mut names = Vec::new();
                for path in [
                    r"SOFTWARE\Microsoft\Microsoft SQL Server\Instance Names\SQL",
                    r"SOFTWARE\WOW6432Node\Microsoft\Microsoft SQL Server\Instance Names\SQL",
                ] {
                    if let Some(values) = self.read_registry_config(hive, path).await {
                        names.extend(values.into_keys());
                    }
                }
                names
            }
            DatabaseType::Mysql => self.subkeys(hive, r"SOFTWARE\MySQL AB").await,
            DatabaseType::Postgresql => self.subkeys(hive, r"SOFTWARE\PostgreSQL\Services").await,
            DatabaseType::Mongodb => self.subkeys(hive, r"SOFTWARE\MongoDB\Server").await,
            DatabaseType::Oracle | DatabaseType::Sqlite => Vec::new(),
        };

        let mut seen = std::collections::HashSet::new();
        instances.retain(|name| seen.insert(name.to_ascii_lowercase()));
        instances
    }

    /// Values of one instance key, used to recover a port.
    pub async fn instance_values(
        &self,
        db_type: DatabaseType,
        instance: &str,
    ) -> Option<RegistryValues> {
        let path = match db_type {
            DatabaseType::Mysql => format!(r"SOFTWARE\MySQL AB\{instance}"),
            DatabaseType::Postgresql => format!(r"SOFTWARE\PostgreSQL\Services\{instance}"),
            DatabaseType::Mongodb => format!(r"SOFTWARE\MongoDB\Server\{instance}"),
            DatabaseType::Mssql | DatabaseType::Oracle | DatabaseType::Sqlite => return None,
        };
        self.read_registry_config(RegistryHive::LocalMachine, &path)
            .await
    }

    /// ODBC data sources in both hives and both registry views.
    pub async fn list_odbc_dsns(&self) -> Vec<OdbcDsn> {
        let native = Architecture::X64;
        let views = [(ODBC_INI_64, native), (ODBC_INI_32, Architecture::X86)];
        let mut dsns = Vec::new();

        for hive in RegistryHive::SEARCH_ORDER {
            let scope = match hive {
                RegistryHive::CurrentUser => DsnScope::User,
                RegistryHive::LocalMachine => DsnScope::System,
            };
            for (root, architecture) in views {
                let path = format!(r"{root}\{ODBC_DATA_SOURCES}");
                let Some(values) = self.read_registry_config(hive, &path).await else {
                    continue;
                };
                dsns.extend(values.into_iter().map(|(name, driver)| OdbcDsn {
                    name,
                    driver,
                    architecture,
                    scope,
                }));
            }
        }

        debug!("Found {} ODBC data sources", dsns.len());
        dsns
    }

    /// Host architecture an ODBC test for `dsn` must run in.
    ///
    /// Only a DSN registered exclusively in the 32-bit view needs the 32-bit
    /// host; unknown names default to the native host.
    pub async fn dsn_architecture(&self, dsn: &str) -> Architecture {
        let registered = self.list_odbc_dsns().await;
        required_architecture(&registered, dsn)
    }
}

/// Architecture a DSN requires given the registered data sources.
pub fn required_architecture(dsns: &[OdbcDsn], name: &str) -> Architecture {
    let mut in_32 = false;
    let mut in_64 = false;
    for dsn in dsns.iter().filter(|d| d.name.eq_ignore_ascii_case(name)) {
        match dsn.architecture {
            Architecture::X86 => in_32 = true,
            Architecture::X64 => in_64 = true,
        }
    }
    if in_32 && !in_64 {
        Architecture::X86
    } else {
        Architecture::X64
    }
}
