//! ODBC access through a PowerShell bridge.
//!
//! ODBC drivers are bound to a bit-width, and a 64-bit process asking for a
//! 32-bit-only DSN gets a misleading "data source name not found". The
//! adapter therefore looks the DSN up in both registry views and runs the
//! test in the PowerShell host of the matching architecture, using
//! `System.Data.Odbc`. The script reports back through marker lines:
//!
//! ```text
//! INFO: ServerVersion=16.00.1000
//! SUCCESS: Connected through ODBC
//! ERROR: [Microsoft][ODBC Driver Manager] Data source name not found ...
//! HINT: Configure a System DSN in the ODBC Data Source Administrator
//! ```
//!
//! The exit code of the host is not trusted; only the markers count.

use super::{DriverAdapter, failure_status};
use crate::command::{Architecture, CommandOutput, PowerShell, escape_ps};
use crate::error::DbPanelError;
use crate::hints::hints_for;
use crate::models::{ConnectionConfig, ConnectionStatus, DatabaseType, ServerInfo, split_attributes};
use crate::registry::RegistryScanner;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Parsed marker lines of one bridge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub success: Option<String>,
    pub errors: Vec<String>,
    pub info: BTreeMap<String, String>,
    pub hints: Vec<String>,
}

impl BridgeOutcome {
    /// A run succeeded when it printed `SUCCESS:` and no `ERROR:`.
    pub fn is_success(&self) -> bool {
        self.success.is_some() && self.errors.is_empty()
    }

    pub fn error_message(&self) -> String {
        self.errors.join("; ")
    }

    pub fn server_info(&self) -> ServerInfo {
        let field = |key: &str| self.info.get(key).filter(|v| !v.is_empty()).cloned();
        ServerInfo {
            version: field("ServerVersion"),
            current_user: field("User"),
            current_database: field("Database"),
            server_name: field("DataSource"),
        }
    }
}

/// Parses bridge stdout into an outcome.
///
/// # Errors
/// Returns a command error, including stderr, when the output carries
/// neither a `SUCCESS:` nor an `ERROR:` marker.
pub fn parse_bridge_output(output: &CommandOutput) -> Result<BridgeOutcome> {
    let mut outcome = BridgeOutcome::default();

    for line in output.stdout.lines().map(str::trim) {
        if let Some(message) = line.strip_prefix("SUCCESS:") {
            outcome.success = Some(message.trim().to_string());
        } else if let Some(message) = line.strip_prefix("ERROR:") {
            outcome.errors.push(message.trim().to_string());
        } else if let Some(hint) = line.strip_prefix("HINT:") {
            outcome.hints.push(hint.trim().to_string());
        } else if let Some(pair) = line.strip_prefix("INFO:")
            && let Some((key, value)) = pair.split_once('=')
        {
            outcome
                .info
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    if outcome.success.is_none() && outcome.errors.is_empty() {
        let stderr = output.stderr.trim();
        return Err(DbPanelError::command(if stderr.is_empty() {
            format!(
                "ODBC bridge produced no result (exit code {:?})",
                output.exit_code
            )
        } else {
            format!(
                "ODBC bridge produced no result: {}",
                stderr.chars().take(500).collect::<String>()
            )
        }));
    }

    Ok(outcome)
}

/// Builds the ODBC connection string for a record.
///
/// An explicit `odbcConnectionString` wins; otherwise `database` names a
/// DSN. Credentials from the record are appended when the string does not
/// carry its own, braced when they contain attribute delimiters.
///
/// # Errors
/// Returns a configuration error when neither is set.
pub fn build_connection_string(config: &ConnectionConfig) -> Result<Zeroizing<String>> {
    let base = config
        .odbc_connection_string
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            config
                .database_name()
                .map(|dsn| format!("DSN={}", quote_attribute(dsn).as_str()))
        })
        .ok_or_else(|| {
            DbPanelError::configuration("ODBC requires a DSN or an ODBC connection string")
        })?;

    let mut conn_str = Zeroizing::new(base.trim_end_matches(';').to_string());
    let has_key = |conn_str: &str, wanted: &str| {
        split_attributes(conn_str).into_iter().any(|part| {
            part.split_once('=')
                .is_some_and(|(key, _)| key.trim().eq_ignore_ascii_case(wanted))
        })
    };

    if config.windows_auth() {
        if !has_key(conn_str.as_str(), "Trusted_Connection") {
            conn_str.push_str(";Trusted_Connection=Yes");
        }
    } else {
        if let Some(user) = config.user()
            && !has_key(conn_str.as_str(), "UID")
        {
            conn_str.push_str(";UID=");
            conn_str.push_str(&quote_attribute(user));
        }
        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty())
            && !has_key(conn_str.as_str(), "PWD")
            && !has_key(conn_str.as_str(), "Password")
        {
            conn_str.push_str(";PWD=");
            conn_str.push_str(&quote_attribute(password));
        }
    }

    Ok(conn_str)
}

/// Attribute value safe to append to a connection string.
///
/// Values holding `;`, braces or edge whitespace are wrapped in `{...}`
/// with `}` doubled; anything else is returned as is.
pub fn quote_attribute(value: &str) -> Zeroizing<String> {
    let needs_braces = value.contains([';', '{', '}'])
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    Zeroizing::new(if needs_braces {
        format!("{{{}}}", value.replace('}', "}}"))
    } else {
        value.to_string()
    })
}

/// DSN named by a connection string, if any.
pub fn dsn_name(conn_str: &str) -> Option<String> {
    split_attributes(conn_str).into_iter().find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("dsn") {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('{')
            .and_then(|v| v.strip_suffix('}'))
            .map_or_else(|| value.to_string(), |v| v.replace("}}", "}"));
        (!value.is_empty()).then_some(value)
    })
}

/// PowerShell script that opens the connection and prints markers.
pub fn bridge_script(conn_str: &str, timeout: Duration) -> Zeroizing<String> {
    let seconds = timeout.as_secs().saturating_sub(1).max(1);
    Zeroizing::new(format!(
        r#"$ErrorActionPreference = 'Stop'
$conn = New-Object System.Data.Odbc.OdbcConnection
try {{
    $conn.ConnectionString = '{conn}'
    $conn.ConnectionTimeout = {seconds}
    $conn.Open()
    Write-Output ('INFO: ServerVersion=' + $conn.ServerVersion)
    Write-Output ('INFO: DataSource=' + $conn.DataSource)
    Write-Output ('INFO: Database=' + $conn.Database)
    Write-Output ('INFO: Driver=' + $conn.Driver)
    Write-Output ('INFO: Architecture=' + $(if ([Environment]::Is64BitProcess) {{ 'x64' }} else {{ 'x86' }}))
    Write-Output 'SUCCESS: Connected through ODBC'
}} catch {{
    $message = ($_.Exception.Message -replace "`r?`n", ' ')
    Write-Output ('ERROR: ' + $message)
    if ($message -match 'IM014|architecture mismatch') {{
        Write-Output 'HINT: The DSN driver and the PowerShell host have different bit-widths'
        Write-Output 'HINT: Recreate the DSN with a driver matching the host architecture'
    }} elseif ($message -match 'IM002|Data source name not found') {{
        Write-Output 'HINT: Configure a System DSN in the ODBC Data Source Administrator'
        Write-Output 'HINT: 32-bit drivers are managed with %SystemRoot%\SysWOW64\odbcad32.exe'
    }}
}} finally {{
    $conn.Close()
    $conn.Dispose()
}}
"#,
        conn = escape_ps(conn_str),
    ))
}

/// ODBC tester that shells out to PowerShell.
#[derive(Debug, Clone)]
pub struct OdbcAdapter {
    powershell: PowerShell,
    scanner: RegistryScanner,
}

impl OdbcAdapter {
    pub fn new(powershell: PowerShell, scanner: RegistryScanner) -> Self {
        Self {
            powershell,
            scanner,
        }
    }

    /// Host architecture the test must run in.
    pub async fn target_architecture(&self, conn_str: &str) -> Architecture {
        match dsn_name(conn_str) {
            Some(dsn) => self.scanner.dsn_architecture(&dsn).await,
            None => Architecture::current(),
        }
    }

    /// Runs the bridge and parses its markers.
    ///
    /// # Errors
    /// Returns an error if the configuration is incomplete, the host cannot
    /// be started or times out, or the output has no markers.
    pub async fn run_bridge(
        &self,
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<(Architecture, BridgeOutcome)> {
        let started = Instant::now();
        let conn_str = build_connection_string(config)?;
        let arch = self.target_architecture(&conn_str).await;
        debug!("Running ODBC bridge in the {} PowerShell host", arch);

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(DbPanelError::timeout("ODBC connection", timeout));
        }
        let script = bridge_script(&conn_str, remaining);
        let output = self.powershell.run_in(arch, &script, remaining).await?;
        let outcome = parse_bridge_output(&output)?;
        Ok((arch, outcome))
    }
}

#[async_trait]
impl DriverAdapter for OdbcAdapter {
    fn driver_name(&self) -> &'static str {
        "ODBC"
    }

    fn validate(&self, config: &ConnectionConfig) -> Result<()> {
        build_connection_string(config).map(|_| ())
    }

    async fn probe(&self, config: &ConnectionConfig, timeout: Duration) -> Result<ServerInfo> {
        let (_, outcome) = self.run_bridge(config, timeout).await?;
        if outcome.is_success() {
            Ok(outcome.server_info())
        } else {
            Err(DbPanelError::connection_message(
                "ODBC connection failed",
                outcome.error_message(),
            ))
        }
    }

    /// Bridge hints take precedence over the generic policy.
    async fn test_connection(
        &self,
        db_type: DatabaseType,
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> ConnectionStatus {
        let started = Instant::now();
        let run = tokio::time::timeout(timeout, self.run_bridge(config, timeout))
            .await
            .unwrap_or_else(|_| Err(DbPanelError::timeout("ODBC connection", timeout)));
        let status = match run {
            Ok((arch, outcome)) if outcome.is_success() => {
                info!("ODBC connection test succeeded ({})", arch);
                ConnectionStatus::succeeded(
                    format!("Connected through ODBC ({arch})"),
                    outcome.server_info(),
                )
            }
            Ok((arch, outcome)) => {
                let error = outcome.error_message();
                warn!("ODBC connection test failed ({}): {}", arch, error);
                let hints = if outcome.hints.is_empty() {
                    hints_for(db_type, &error)
                } else {
                    outcome.hints
                };
                ConnectionStatus::failed(error, hints)
            }
            Err(e) => {
                warn!("ODBC connection test failed: {}", e);
                failure_status(db_type, &e)
            }
        };
        status.with_duration(started.elapsed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn output(stdout: &str, exit_code: i32) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(exit_code),
        }
    }

    #[test]
    fn test_parse_success_ignores_exit_code() {
        let parsed = parse_bridge_output(&output(
            "INFO: ServerVersion=08.00.0035\nINFO: DataSource=LEGACY\nSUCCESS: Connected through ODBC\n",
            1,
        ))
        .unwrap();
        assert!(parsed.is_success());
        let info = parsed.server_info();
        assert_eq!(info.version.as_deref(), Some("08.00.0035"));
        assert_eq!(info.server_name.as_deref(), Some("LEGACY"));
    }

    #[test]
    fn test_parse_error_with_zero_exit() {
        let parsed = parse_bridge_output(&output(
            "ERROR: Data source name not found\nHINT: Configure a System DSN\n",
            0,
        ))
        .unwrap();
        assert!(!parsed.is_success());
        assert_eq!(parsed.error_message(), "Data source name not found");
        assert_eq!(parsed.hints, vec!["Configure a System DSN"]);
    }

    #[test]
    fn test_parse_without_markers_reports_stderr() {
        let out = CommandOutput {
            stdout: "garbage".to_string(),
            stderr: "powershell.exe: not found".to_string(),
            exit_code: None,
        };
        let err = parse_bridge_output(&out).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_build_connection_string() {
        let config = ConnectionConfig {
            database: Some("Reporting".to_string()),
            username: Some("svc".to_string()),
            password: Some("p;w".to_string()),
            ..Default::default()
        };
        let conn = build_connection_string(&config).unwrap();
        assert_eq!(conn.as_str(), "DSN=Reporting;UID=svc;PWD={p;w}");

        let explicit = ConnectionConfig {
            odbc_connection_string: Some("Driver={SQL Server};Server=.;UID=a;PWD=b;".to_string()),
            username: Some("ignored".to_string()),
            ..Default::default()
        };
        let conn = build_connection_string(&explicit).unwrap();
        assert_eq!(conn.as_str(), "Driver={SQL Server};Server=.;UID=a;PWD=b");

        assert!(build_connection_string(&ConnectionConfig::default()).is_err());
    }

    #[test]
    fn test_build_connection_string_cannot_inject_attributes() {
        let config = ConnectionConfig {
            database: Some("Reporting".to_string()),
            username: Some("svc".to_string()),
            password: Some("x;Trusted_Connection=Yes".to_string()),
            ..Default::default()
        };
        let conn = build_connection_string(&config).unwrap();
        assert_eq!(
            conn.as_str(),
            "DSN=Reporting;UID=svc;PWD={x;Trusted_Connection=Yes}"
        );
        assert_eq!(split_attributes(&conn).len(), 3);

        let braces = ConnectionConfig {
            database: Some("Reporting".to_string()),
            password: Some(" a}b ".to_string()),
            username: Some("svc".to_string()),
            ..Default::default()
        };
        let conn = build_connection_string(&braces).unwrap();
        assert!(conn.ends_with(";PWD={ a}}b }"));
    }

    #[test]
    fn test_existing_credentials_are_not_duplicated() {
        let config = ConnectionConfig {
            odbc_connection_string: Some("DSN=X;Password=secret".to_string()),
            password: Some("other".to_string()),
            ..Default::default()
        };
        let conn = build_connection_string(&config).unwrap();
        assert_eq!(conn.as_str(), "DSN=X;Password=secret");
    }

    #[test]
    fn test_quote_attribute() {
        assert_eq!(quote_attribute("plain").as_str(), "plain");
        assert_eq!(quote_attribute("a;b").as_str(), "{a;b}");
        assert_eq!(quote_attribute("{x}").as_str(), "{{x}}}");
    }

    #[test]
    fn test_dsn_name() {
        assert_eq!(dsn_name("dsn = Legacy ;UID=x").as_deref(), Some("Legacy"));
        assert_eq!(dsn_name("Driver={SQL Server};Server=."), None);
        assert_eq!(dsn_name("DSN={Sales; EU};UID=x").as_deref(), Some("Sales; EU"));
    }

    #[test]
    fn test_bridge_script_escapes_quotes() {
        let script = bridge_script("DSN=X;PWD=it's", Duration::from_secs(15));
        assert!(script.contains("PWD=it''s"));
        assert!(script.contains("ConnectionTimeout = 14"));
    }
}
