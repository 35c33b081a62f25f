//! Remediation hints for failed connection tests.
//!
//! Driver errors are classified by matching their text against a fixed set
//! of patterns; each class maps to an ordered list of suggestions. The raw
//! error is reported separately, so hints never repeat it or any credential.

use crate::models::DatabaseType;
use regex::Regex;
use std::sync::OnceLock;

/// Recognized failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AccessDenied,
    AuthPlugin,
    Timeout,
    ConnectionRefused,
    HostNotFound,
    UnknownDatabase,
    DsnNotFound,
    ArchitectureMismatch,
    DriverMissing,
    Tls,
    Unknown,
}

/// Pre-compiled classification patterns, checked in order.
struct FailurePatterns {
    rules: Vec<(FailureKind, Regex)>,
}

impl FailurePatterns {
    fn instance() -> &'static Self {
        static PATTERNS: OnceLock<FailurePatterns> = OnceLock::new();
        PATTERNS.get_or_init(Self::compile)
    }

    fn compile() -> Self {
        // More specific classes come first: an auth plugin error also says
        // "authentication", an architecture mismatch also says "data source".
        let sources = [
            (
                FailureKind::AuthPlugin,
                r"(?i)(caching_sha2_password|authentication plugin|auth_gssapi|does not support authentication protocol)",
            ),
            (
                FailureKind::ArchitectureMismatch,
                r"(?i)(architecture mismatch|\bIM014\b)",
            ),
            (
                FailureKind::DsnNotFound,
                r"(?i)(data source name not found|\bIM002\b)",
            ),
            (
                FailureKind::DriverMissing,
                r"(?i)(driver is not installed|driver could not be loaded|\bIM003\b|no such driver)",
            ),
            (
                FailureKind::AccessDenied,
                r"(?i)(access denied|login failed|password authentication failed|authentication failed|not authorized|bad auth|\b18456\b|\b28000\b|\b28P01\b)",
            ),
            (
                FailureKind::UnknownDatabase,
                r"(?i)(unknown database|database .* does not exist|cannot open database|unable to open database file|\b3D000\b)",
            ),
            (
                FailureKind::Tls,
                r"(?i)(certificate|\bssl\b|\btls\b|handshake)",
            ),
            (
                FailureKind::Timeout,
                r"(?i)(timed? ?out|timeout|etimedout)",
            ),
            (
                FailureKind::ConnectionRefused,
                r"(?i)(refused|econnrefused|\b10061\b)",
            ),
            (
                FailureKind::HostNotFound,
                r"(?i)(getaddrinfo|enotfound|no such host|name or service not known|could not resolve|failed to lookup address|host not found|unknown host)",
            ),
        ];

        let rules = sources
            .into_iter()
            .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
            .collect();

        Self { rules }
    }
}

/// Classifies a driver error message.
pub fn classify(error: &str) -> FailureKind {
    FailurePatterns::instance()
        .rules
        .iter()
        .find(|(_, pattern)| pattern.is_match(error))
        .map_or(FailureKind::Unknown, |(kind, _)| *kind)
}

/// Ordered remediation hints for a failed test of `db_type`.
///
/// Unrecognized errors get the generic "verify configuration" set, so the
/// result is never empty.
pub fn hints_for(db_type: DatabaseType, error: &str) -> Vec<String> {
    hints_for_kind(db_type, classify(error))
}

/// Hints for an already classified failure.
pub fn hints_for_kind(db_type: DatabaseType, kind: FailureKind) -> Vec<String> {
    let port = db_type
        .default_port()
        .map_or_else(|| "the configured port".to_string(), |p| format!("port {p}"));

    let hints: Vec<String> = match (kind, db_type) {
        (FailureKind::AccessDenied, DatabaseType::Mysql) => vec![
            "Re-enter the password; MySQL rejected the credentials".into(),
            "Check that the account may connect from this host ('user'@'localhost' and 'user'@'%' are different accounts)".into(),
            "If the account uses caching_sha2_password, switch it to mysql_native_password or enable TLS".into(),
        ],
        (FailureKind::AccessDenied, DatabaseType::Mssql) => vec![
            "Re-enter the password or switch to Windows authentication".into(),
            "Enable SQL Server and Windows Authentication mode if SQL logins are used".into(),
            "Check that the login has access to the default database".into(),
        ],
        (FailureKind::AccessDenied, DatabaseType::Postgresql) => vec![
            "Re-enter the password".into(),
            "Check pg_hba.conf allows this user and address with md5 or scram-sha-256".into(),
        ],
        (FailureKind::AccessDenied, DatabaseType::Mongodb) => vec![
            "Re-enter the username and password".into(),
            "Set authSource in the connection string if the user is not defined in 'admin'".into(),
        ],
        (FailureKind::AccessDenied, _) => vec![
            "Re-enter the username and password".into(),
            "Check that the account is allowed to log in".into(),
        ],
        (FailureKind::AuthPlugin, _) => vec![
            "The server requires an authentication plugin the client cannot use".into(),
            "Run ALTER USER ... IDENTIFIED WITH mysql_native_password BY '...' or enable TLS for caching_sha2_password".into(),
        ],
        (FailureKind::Timeout, DatabaseType::Mssql) => vec![
            "Check that the SQL Server service is running".into(),
            "Enable TCP/IP in SQL Server Configuration Manager".into(),
            "Start the SQL Server Browser service when connecting to a named instance".into(),
            format!("Allow {port} through the Windows firewall"),
        ],
        (FailureKind::Timeout, _) => vec![
            "Check that the database service is running and reachable".into(),
            format!("Allow {port} through the firewall"),
        ],
        (FailureKind::ConnectionRefused, _) => vec![
            format!("Nothing is listening on {port}; start the {db_type} service"),
            "Check the port number in the connection settings".into(),
        ],
        (FailureKind::HostNotFound, _) => vec![
            "Check the spelling of the server name".into(),
            "Try localhost or the server's IP address".into(),
        ],
        (FailureKind::UnknownDatabase, DatabaseType::Sqlite) => vec![
            "Check that the database file exists and the path is correct".into(),
        ],
        (FailureKind::UnknownDatabase, _) => vec![
            "Check the database name; it does not exist on this server".into(),
            "Leave the database empty to connect to the default one".into(),
        ],
        (FailureKind::DsnNotFound, _) => vec![
            "Configure a System DSN in the ODBC Data Source Administrator".into(),
            "32-bit drivers are managed with %SystemRoot%\\SysWOW64\\odbcad32.exe".into(),
            "Check the DSN name in the connection string".into(),
        ],
        (FailureKind::ArchitectureMismatch, _) => vec![
            "The DSN's driver and the testing process have different bit-widths".into(),
            "Install the 64-bit version of the driver or recreate the DSN with a matching driver".into(),
        ],
        (FailureKind::DriverMissing, DatabaseType::Oracle) => vec![
            "Install the Oracle ODBC driver and connect through ODBC instead".into(),
        ],
        (FailureKind::DriverMissing, _) => vec![
            format!("Install the {db_type} driver or enable it in this build"),
            "Alternatively connect through an ODBC DSN".into(),
        ],
        (FailureKind::Tls, DatabaseType::Mssql) => vec![
            "Enable Trust Server Certificate for self-signed certificates".into(),
            "Turn off Encrypt if the server does not support TLS".into(),
        ],
        (FailureKind::Tls, _) => vec![
            "Check the server's TLS certificate or disable TLS for local servers".into(),
        ],
        (FailureKind::Unknown, _) => vec![
            "Verify the server address, port, database and credentials".into(),
            format!("Check that the {db_type} service is running"),
        ],
    };

    hints
}
