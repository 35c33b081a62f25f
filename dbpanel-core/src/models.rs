//! Connection records, statuses and discovery results.
//!
//! These are the JSON-shaped values that cross the IPC boundary. Field names
//! serialize in camelCase to match what the UI expects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Placeholder returned in place of a stored password on every display read.
pub const PASSWORD_MASK: &str = "********";

/// Database kinds a connection record can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Mssql,
    Mysql,
    Postgresql,
    Mongodb,
    Oracle,
    Sqlite,
}

impl DatabaseType {
    /// Every kind, in the order the UI lists them.
    pub const ALL: [Self; 6] = [
        Self::Mssql,
        Self::Mysql,
        Self::Postgresql,
        Self::Mongodb,
        Self::Oracle,
        Self::Sqlite,
    ];

    /// Kinds covered by local discovery.
    pub const DISCOVERABLE: [Self; 4] = [Self::Mssql, Self::Mysql, Self::Postgresql, Self::Mongodb];

    /// Identifier used in JSON and registry paths.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mssql => "mssql",
            Self::Mysql => "mysql",
            Self::Postgresql => "postgresql",
            Self::Mongodb => "mongodb",
            Self::Oracle => "oracle",
            Self::Sqlite => "sqlite",
        }
    }

    /// Human readable vendor name.
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Mssql => "SQL Server",
            Self::Mysql => "MySQL",
            Self::Postgresql => "PostgreSQL",
            Self::Mongodb => "MongoDB",
            Self::Oracle => "Oracle",
            Self::Sqlite => "SQLite",
        }
    }

    /// Default TCP port, `None` for file-based kinds.
    pub const fn default_port(self) -> Option<u16> {
        match self {
            Self::Mssql => Some(1433),
            Self::Mysql => Some(3306),
            Self::Postgresql => Some(5432),
            Self::Mongodb => Some(27017),
            Self::Oracle => Some(1521),
            Self::Sqlite => None,
        }
    }

    /// Whether the kind is reached over the network.
    pub const fn is_network(self) -> bool {
        !matches!(self, Self::Sqlite)
    }

    /// Whether integrated Windows authentication applies.
    pub const fn supports_windows_auth(self) -> bool {
        matches!(self, Self::Mssql)
    }

    /// Whether the kind may be reached through an ODBC DSN.
    pub const fn supports_odbc(self) -> bool {
        !matches!(self, Self::Mongodb)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for DatabaseType {
    type Err = crate::error::DbPanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" => Ok(Self::Mssql),
            "mysql" => Ok(Self::Mysql),
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            "mongodb" | "mongo" => Ok(Self::Mongodb),
            "oracle" => Ok(Self::Oracle),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(crate::error::DbPanelError::configuration(format!(
                "Unsupported database type: {other}"
            ))),
        }
    }
}

/// Type-specific connection settings.
///
/// Every field is optional; which ones matter depends on the record's
/// [`DatabaseType`]. Unknown keys survive a load/save cycle through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows_auth: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_server_certificate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_odbc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odbc_connection_string: Option<String>,
    /// Full driver URI; takes precedence over the discrete fields when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Per-connection override of the adapter timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ConnectionConfig {
    /// Network endpoint: `server` wins over `host`, blanks are ignored.
    pub fn endpoint(&self) -> Option<&str> {
        non_blank(self.server.as_deref()).or_else(|| non_blank(self.host.as_deref()))
    }

    /// Configured port or the kind's default.
    pub fn port_or_default(&self, db_type: DatabaseType) -> Option<u16> {
        self.port.or_else(|| db_type.default_port())
    }

    /// Non-blank database name or path.
    pub fn database_name(&self) -> Option<&str> {
        non_blank(self.database.as_deref())
    }

    /// Non-blank username.
    pub fn user(&self) -> Option<&str> {
        non_blank(self.username.as_deref())
    }

    /// Whether a non-empty password is stored.
    pub fn has_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    pub fn windows_auth(&self) -> bool {
        self.windows_auth.unwrap_or(false)
    }

    pub fn use_odbc(&self) -> bool {
        self.use_odbc.unwrap_or(false)
    }

    /// Copy with every stored secret replaced by [`PASSWORD_MASK`].
    ///
    /// Covers `password`, the `PWD`/`Password` attributes of
    /// `odbcConnectionString` and the password of a `connectionString` URL.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if copy.has_password() {
            copy.password = Some(PASSWORD_MASK.to_string());
        }
        copy.odbc_connection_string = copy.odbc_connection_string.as_deref().map(mask_secrets);
        copy.connection_string = copy.connection_string.as_deref().map(mask_secrets);
        copy
    }

    /// Applies a partial config on top of this one.
    ///
    /// Present fields in `patch` win. A password equal to [`PASSWORD_MASK`]
    /// is an echo of a masked record and leaves the stored password alone;
    /// the same holds for a masked secret inside either connection string.
    pub fn merge(&mut self, patch: Self) {
        macro_rules! take {
            ($target:ident, $source:ident; $($field:ident),*) => {
                $(if $source.$field.is_some() { $target.$field = $source.$field; })*
            };
        }

        let target = self;
        take!(
            target, patch;
            server,
            host,
            port,
            database,
            username,
            windows_auth,
            encrypt,
            trust_server_certificate,
            use_odbc,
            connect_timeout_secs
        );

        if let Some(odbc) = patch.odbc_connection_string {
            let restored = unmask_secrets(&odbc, target.odbc_connection_string.as_deref());
            target.odbc_connection_string = Some(restored);
        }
        if let Some(uri) = patch.connection_string {
            let restored = unmask_secrets(&uri, target.connection_string.as_deref());
            target.connection_string = Some(restored);
        }

        if let Some(password) = patch.password
            && password != PASSWORD_MASK
        {
            target.password = Some(password);
        }

        target.extra.extend(patch.extra);
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

const SECRET_KEYS: [&str; 2] = ["pwd", "password"];

/// Splits `key=value;...` attributes, keeping `{...}` values intact.
pub(crate) fn split_attributes(conn_str: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_braces = false;
    let mut chars = conn_str.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '{' if !in_braces => in_braces = true,
            '}' if in_braces => {
                if chars.peek().is_some_and(|(_, next)| *next == '}') {
                    chars.next();
                } else {
                    in_braces = false;
                }
            }
            ';' if !in_braces => {
                parts.push(conn_str.get(start..i).unwrap_or_default());
                start = i.saturating_add(1);
            }
            _ => {}
        }
    }
    parts.push(conn_str.get(start..).unwrap_or_default());
    parts
}

fn secret_attribute(part: &str) -> Option<(&str, &str)> {
    let (key, value) = part.split_once('=')?;
    SECRET_KEYS
        .iter()
        .any(|k| key.trim().eq_ignore_ascii_case(k))
        .then_some((key, value))
}

fn url_with_password(conn_str: &str) -> Option<url::Url> {
    if !conn_str.contains("://") {
        return None;
    }
    url::Url::parse(conn_str)
        .ok()
        .filter(|url| url.password().is_some())
}

/// Replaces the password of a URL or of `PWD=`/`Password=` attributes.
pub fn mask_secrets(conn_str: &str) -> String {
    if let Some(mut url) = url_with_password(conn_str) {
        return match url.set_password(Some(PASSWORD_MASK)) {
            Ok(()) => url.to_string(),
            Err(()) => "<redacted>".to_string(),
        };
    }

    split_attributes(conn_str)
        .into_iter()
        .map(|part| match secret_attribute(part) {
            Some((key, value)) if !value.trim().is_empty() => format!("{key}={PASSWORD_MASK}"),
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Puts the stored secrets back where `incoming` carries [`PASSWORD_MASK`].
fn unmask_secrets(incoming: &str, stored: Option<&str>) -> String {
    let Some(stored) = stored else {
        return incoming.to_string();
    };
    if incoming == mask_secrets(stored) {
        return stored.to_string();
    }

    if incoming.contains("://") {
        if let Ok(mut url) = url::Url::parse(incoming)
            && url.password() == Some(PASSWORD_MASK)
            && let Some(original) = url_with_password(stored)
            && url.set_password(original.password()).is_ok()
        {
            return url.to_string();
        }
        return incoming.to_string();
    }

    let stored_secret = split_attributes(stored)
        .into_iter()
        .find_map(secret_attribute)
        .map(|(_, value)| value);
    split_attributes(incoming)
        .into_iter()
        .map(|part| match (secret_attribute(part), stored_secret) {
            (Some((key, value)), Some(secret)) if value.trim() == PASSWORD_MASK => {
                format!("{key}={secret}")
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Persisted connection record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    #[serde(default)]
    pub config: ConnectionConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_tested: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// Copy safe to hand to the presentation layer.
    pub fn sanitized(&self) -> Self {
        Self {
            config: self.config.masked(),
            ..self.clone()
        }
    }
}

/// Payload for creating a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnection {
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    #[serde(default)]
    pub config: ConnectionConfig,
}

/// Partial update for an existing connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub db_type: Option<DatabaseType>,
    #[serde(default)]
    pub config: Option<ConnectionConfig>,
}

/// Identity reported by a successful test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Outcome of the most recent test of a connection.
///
/// `success` is `None` until the connection has been tested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub success: Option<bool>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ConnectionStatus {
    /// Sentinel for a connection that was never tested.
    pub fn not_tested() -> Self {
        Self {
            success: None,
            message: "Not tested".to_string(),
            server_info: None,
            error: None,
            hint: None,
            tested_at: None,
            duration_ms: None,
        }
    }

    pub fn succeeded(message: impl Into<String>, server_info: ServerInfo) -> Self {
        Self {
            success: Some(true),
            message: message.into(),
            server_info: Some(server_info),
            error: None,
            hint: None,
            tested_at: Some(Utc::now()),
            duration_ms: None,
        }
    }

    /// Failure with the raw error kept in `error`; an empty hint list is dropped.
    pub fn failed(error: impl Into<String>, hints: Vec<String>) -> Self {
        let error = error.into();
        Self {
            success: Some(false),
            message: format!("Connection failed: {error}"),
            server_info: None,
            error: Some(error),
            hint: if hints.is_empty() { None } else { Some(hints) },
            tested_at: Some(Utc::now()),
            duration_ms: None,
        }
    }

    /// Failure for an id the store does not know.
    pub fn connection_not_found() -> Self {
        Self {
            message: "Connection not found".to_string(),
            ..Self::failed("Connection not found", Vec::new())
        }
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn is_success(&self) -> bool {
        self.success == Some(true)
    }

    pub fn is_tested(&self) -> bool {
        self.success.is_some()
    }
}

/// Where a discovered instance was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Registry,
    Service,
    Network,
}

/// A locally installed database server found by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredInstance {
    pub name: String,
    pub server_name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub source: DiscoverySource,
}

/// Capabilities of one database kind in this build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedType {
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
    pub driver_installed: bool,
    pub supports_windows_auth: bool,
    pub supports_odbc: bool,
}
