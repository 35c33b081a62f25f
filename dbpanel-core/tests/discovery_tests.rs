//! Discovery pipeline over an in-memory registry and scripted `Get-Service`.

#![allow(clippy::unwrap_used)]

mod common;

use common::{ScriptedRunner, powershell, stdout};
use dbpanel_core::command::CommandOutput;
use dbpanel_core::models::{DatabaseType, DiscoverySource};
use dbpanel_core::registry::{MemoryRegistry, RegistryHive};
use dbpanel_core::{Discovery, RegistryScanner};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> MemoryRegistry {
    MemoryRegistry::new()
        .with_key(
            RegistryHive::LocalMachine,
            r"SOFTWARE\Microsoft\Microsoft SQL Server\Instance Names\SQL",
            [
                ("MSSQLSERVER", "MSSQL16.MSSQLSERVER"),
                ("SQLEXPRESS", "MSSQL16.SQLEXPRESS"),
            ],
        )
        .with_key(
            RegistryHive::LocalMachine,
            r"SOFTWARE\PostgreSQL\Services\postgresql-x64-16",
            [("Port", "5433"), ("Display Name", "PostgreSQL 16")],
        )
}

fn services(script: &str) -> CommandOutput {
    if script.contains("MSSQLSERVER") {
        stdout(
            r#"[{"Name":"MSSQLSERVER","DisplayName":"SQL Server (MSSQLSERVER)","Status":"Running"},
                {"Name":"MSSQL$DEV","DisplayName":"SQL Server (DEV)","Status":"Stopped"}]"#,
            0,
        )
    } else if script.contains("^MySQL") {
        // A single service comes back as a bare object.
        stdout(
            r#"{"Name":"MySQL80","DisplayName":"MySQL80","Status":"Running"}"#,
            0,
        )
    } else if script.contains("^MongoDB") {
        CommandOutput {
            stdout: String::new(),
            stderr: "Get-Service : access denied".to_string(),
            exit_code: Some(1),
        }
    } else {
        stdout("", 0)
    }
}

fn discovery() -> (Discovery, Arc<ScriptedRunner>) {
    let runner = ScriptedRunner::new(services);
    let scanner = RegistryScanner::new(Arc::new(registry()), Duration::from_secs(1));
    let discovery = Discovery::new(scanner, powershell(runner.clone()), Duration::from_millis(50))
        .with_service_scan(true)
        .with_network_probe(false);
    (discovery, runner)
}

#[tokio::test]
async fn test_discover_mssql_merges_registry_and_services() {
    let (discovery, _) = discovery();

    let instances = discovery.discover(DatabaseType::Mssql).await.unwrap();
    let servers: Vec<&str> = instances.iter().map(|i| i.server_name.as_str()).collect();

    // The MSSQLSERVER service duplicates the registry default instance.
    assert_eq!(servers, vec!["localhost", r"localhost\SQLEXPRESS", r"localhost\DEV"]);
    assert_eq!(instances[0].port, Some(1433));
    assert_eq!(instances[0].source, DiscoverySource::Registry);
    assert_eq!(instances[1].port, None);
    assert_eq!(instances[2].source, DiscoverySource::Service);
    assert_eq!(instances[2].display_name, "SQL Server (DEV)");
}

#[tokio::test]
async fn test_discover_postgres_reads_port_from_registry() {
    let (discovery, _) = discovery();

    let instances = discovery.discover(DatabaseType::Postgresql).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].name, "postgresql-x64-16");
    assert_eq!(instances[0].server_name, "localhost");
    assert_eq!(instances[0].port, Some(5433));
}

#[tokio::test]
async fn test_discover_all_keeps_vendor_order_and_errors() {
    let (discovery, runner) = discovery();

    let report = discovery.discover_all_databases().await;

    let kinds: Vec<DatabaseType> = report.instances.iter().map(|i| i.db_type).collect();
    assert_eq!(
        kinds,
        vec![
            DatabaseType::Mssql,
            DatabaseType::Mssql,
            DatabaseType::Mssql,
            DatabaseType::Mysql,
            DatabaseType::Postgresql,
        ]
    );
    let mysql = report
        .instances
        .iter()
        .find(|i| i.db_type == DatabaseType::Mysql)
        .unwrap();
    assert_eq!(mysql.name, "MySQL80");
    assert_eq!(mysql.port, Some(3306));

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].db_type, DatabaseType::Mongodb);
    assert!(report.errors[0].error.contains("access denied"));

    // One Get-Service call per discoverable vendor.
    assert_eq!(runner.invocations().len(), 4);
}

#[tokio::test]
async fn test_discover_without_service_scan_runs_no_commands() {
    let runner = ScriptedRunner::new(services);
    let scanner = RegistryScanner::new(Arc::new(registry()), Duration::from_secs(1));
    let discovery = Discovery::new(scanner, powershell(runner.clone()), Duration::from_millis(50))
        .with_service_scan(false)
        .with_network_probe(false);

    let report = discovery.discover_all_databases().await;
    assert_eq!(report.instances.len(), 3);
    assert!(report.errors.is_empty());
    assert!(runner.invocations().is_empty());
}

#[tokio::test]
async fn test_discover_oracle_is_unsupported() {
    let (discovery, _) = discovery();
    assert!(discovery.discover(DatabaseType::Oracle).await.is_err());
}

#[tokio::test]
async fn test_empty_registry_finds_nothing() {
    let runner = ScriptedRunner::new(|_| stdout("", 0));
    let scanner = RegistryScanner::new(Arc::new(MemoryRegistry::new()), Duration::from_secs(1));
    let discovery = Discovery::new(scanner, powershell(runner), Duration::from_millis(50))
        .with_network_probe(false);

    let report = discovery.discover_all_databases().await;
    assert!(report.instances.is_empty());
    assert!(discovery.list_odbc_dsns().await.is_empty());
    assert!(
        discovery
            .discover_registry_paths(DatabaseType::Mssql, None)
            .await
            .is_empty()
    );
}
