//! ODBC bridge routing and marker handling with a scripted PowerShell host.

#![allow(clippy::unwrap_used)]

mod common;

use common::{ScriptedRunner, powershell, stdout};
use dbpanel_core::adapters::{DriverAdapter, DriverRegistry, OdbcAdapter};
use async_trait::async_trait;
use dbpanel_core::command::{Architecture, CommandOutput, CommandRunner, PowerShell};
use dbpanel_core::models::{ConnectionConfig, DatabaseType};
use dbpanel_core::registry::{MemoryRegistry, RegistryHive, RegistryReader, RegistryValues};
use dbpanel_core::{DbPanelError, RegistryScanner};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn registry() -> MemoryRegistry {
    MemoryRegistry::new()
        .with_key(
            RegistryHive::LocalMachine,
            r"SOFTWARE\WOW6432Node\ODBC\ODBC.INI\ODBC Data Sources",
            [("Legacy", "SQL Server"), ("Warehouse", "ODBC Driver 18 for SQL Server")],
        )
        .with_key(
            RegistryHive::LocalMachine,
            r"SOFTWARE\ODBC\ODBC.INI\ODBC Data Sources",
            [("Warehouse", "ODBC Driver 18 for SQL Server")],
        )
}

fn adapter(respond: impl Fn(&str) -> CommandOutput + Send + Sync + 'static) -> (OdbcAdapter, Arc<ScriptedRunner>) {
    let runner = ScriptedRunner::new(respond);
    let scanner = RegistryScanner::new(Arc::new(registry()), Duration::from_secs(1));
    (OdbcAdapter::new(powershell(runner.clone()), scanner), runner)
}

fn dsn_config(dsn: &str) -> ConnectionConfig {
    ConnectionConfig {
        database: Some(dsn.to_string()),
        username: Some("legacy_user".to_string()),
        password: Some("legacy_pw".to_string()),
        use_odbc: Some(true),
        ..ConnectionConfig::default()
    }
}

#[tokio::test]
async fn test_32bit_only_dsn_runs_in_32bit_host() {
    let (adapter, runner) = adapter(|_| stdout("", 0));

    assert_eq!(adapter.target_architecture("DSN=Legacy").await, Architecture::X86);
    assert_eq!(adapter.target_architecture("dsn=legacy;UID=x").await, Architecture::X86);
    // Registered in both views: the native host can open it.
    assert_eq!(adapter.target_architecture("DSN=Warehouse").await, Architecture::X64);
    assert_eq!(adapter.target_architecture("DSN=Unknown").await, Architecture::X64);
    assert!(runner.invocations().is_empty());
}

#[tokio::test]
async fn test_success_marker_wins_over_exit_code() {
    let (adapter, runner) = adapter(|_| {
        stdout(
            "INFO: ServerVersion=08.00.0035\nINFO: DataSource=LEGACY01\nINFO: Database=sales\nSUCCESS: Connected through ODBC\n",
            1,
        )
    });

    let status = adapter
        .test_connection(DatabaseType::Mssql, &dsn_config("Legacy"), Duration::from_secs(5))
        .await;

    assert!(status.is_success(), "{status:?}");
    assert!(status.message.contains("32-bit"));
    let info = status.server_info.unwrap();
    assert_eq!(info.version.as_deref(), Some("08.00.0035"));
    assert_eq!(info.server_name.as_deref(), Some("LEGACY01"));
    assert_eq!(info.current_database.as_deref(), Some("sales"));
    assert!(status.duration_ms.is_some());

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].script.contains("DSN=Legacy;UID=legacy_user;PWD=legacy_pw"));
    if cfg!(all(windows, target_pointer_width = "64")) {
        assert!(invocations[0].program.contains("SysWOW64"));
    }
}

#[tokio::test]
async fn test_error_marker_with_zero_exit_uses_bridge_hints() {
    let (adapter, _) = adapter(|_| {
        stdout(
            "ERROR: [Microsoft][ODBC Driver Manager] Data source name not found (IM002)\nHINT: Configure a System DSN\n",
            0,
        )
    });

    let status = adapter
        .test_connection(DatabaseType::Mssql, &dsn_config("Missing"), Duration::from_secs(5))
        .await;

    assert_eq!(status.success, Some(false));
    assert!(status.error.as_deref().unwrap().contains("Data source name not found"));
    assert_eq!(status.hint, Some(vec!["Configure a System DSN".to_string()]));
}

#[tokio::test]
async fn test_error_without_bridge_hints_gets_classified_hints() {
    let (adapter, _) = adapter(|_| {
        stdout("ERROR: Login failed for user 'legacy_user'.\n", 0)
    });

    let status = adapter
        .test_connection(DatabaseType::Mssql, &dsn_config("Warehouse"), Duration::from_secs(5))
        .await;

    assert_eq!(status.success, Some(false));
    assert!(!status.hint.unwrap().is_empty());
}

#[tokio::test]
async fn test_no_markers_is_a_failure() {
    let (adapter, _) = adapter(|_| CommandOutput {
        stdout: "garbage".to_string(),
        stderr: "powershell crashed".to_string(),
        exit_code: Some(0),
    });

    let status = adapter
        .test_connection(DatabaseType::Mysql, &dsn_config("Warehouse"), Duration::from_secs(5))
        .await;

    assert_eq!(status.success, Some(false));
    assert!(status.error.unwrap().contains("powershell crashed"));
}

#[tokio::test]
async fn test_missing_dsn_never_runs_powershell() {
    let (adapter, runner) = adapter(|_| stdout("SUCCESS: ok", 0));

    let config = ConnectionConfig {
        use_odbc: Some(true),
        ..ConnectionConfig::default()
    };
    let status = adapter
        .test_connection(DatabaseType::Mssql, &config, Duration::from_secs(5))
        .await;

    assert_eq!(status.success, Some(false));
    assert!(runner.invocations().is_empty());
}

#[tokio::test]
async fn test_registry_routes_use_odbc_to_bridge() {
    let (odbc, runner) = adapter(|_| stdout("SUCCESS: Connected through ODBC", 0));
    let drivers = DriverRegistry::new(odbc, Duration::from_secs(5));

    // Even a kind with no native driver goes through the bridge.
    let adapter = drivers.adapter_for(DatabaseType::Oracle, &dsn_config("Warehouse"));
    assert_eq!(adapter.driver_name(), "ODBC");

    let status = adapter
        .test_connection(DatabaseType::Oracle, &dsn_config("Warehouse"), Duration::from_secs(5))
        .await;
    assert!(status.is_success());
    assert_eq!(runner.invocations().len(), 1);
}

/// Registry whose every read blocks for a while before finding nothing.
struct SlowRegistry(Duration);

impl RegistryReader for SlowRegistry {
    fn read_values(&self, _hive: RegistryHive, _path: &str) -> Option<RegistryValues> {
        std::thread::sleep(self.0);
        None
    }

    fn subkeys(&self, _hive: RegistryHive, _path: &str) -> Option<Vec<String>> {
        std::thread::sleep(self.0);
        None
    }
}

/// Host that never answers before its timeout.
struct HungHost;

#[async_trait]
impl CommandRunner for HungHost {
    async fn run(
        &self,
        program: &str,
        _args: &[String],
        timeout: Duration,
    ) -> dbpanel_core::Result<CommandOutput> {
        tokio::time::sleep(timeout).await;
        Err(DbPanelError::timeout(program, timeout))
    }
}

#[tokio::test]
async fn test_dsn_lookup_and_bridge_share_one_budget() {
    let scanner = RegistryScanner::new(
        Arc::new(SlowRegistry(Duration::from_millis(400))),
        Duration::from_secs(1),
    );
    let adapter = OdbcAdapter::new(
        PowerShell::new(Arc::new(HungHost), Duration::from_secs(5)),
        scanner,
    );

    let started = Instant::now();
    let status = adapter
        .test_connection(DatabaseType::Mssql, &dsn_config("Legacy"), Duration::from_secs(1))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(status.success, Some(false));
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    let error = status.error.unwrap();
    assert!(error.contains("ODBC connection timed out"), "{error}");
    assert!(!status.hint.unwrap().is_empty());
}
