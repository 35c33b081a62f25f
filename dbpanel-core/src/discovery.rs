//! Discovery of locally installed database servers.
//!
//! Each vendor is discovered from three sources, in this order of
//! precedence: installer keys in the registry, Windows services, and a TCP
//! probe of the vendor's default port on the loopback address. Results are
//! de-duplicated by `(type, serverName)`, keeping the first source that
//! reported an instance. A failing source is logged and reported but never
//! hides what the other sources found.

use crate::command::PowerShell;
use crate::config::PanelConfig;
use crate::error::DbPanelError;
use crate::models::{DatabaseType, DiscoveredInstance, DiscoverySource};
use crate::registry::{CredentialFetch, OdbcDsn, RegistryPath, RegistryScanner};
use crate::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Windows service as reported by `Get-Service | ConvertTo-Json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A vendor whose discovery failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryFailure {
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    pub error: String,
}

/// Merged result of discovering every vendor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub instances: Vec<DiscoveredInstance>,
    pub errors: Vec<DiscoveryFailure>,
}

/// Instances and source failures for one vendor.
#[derive(Debug, Default)]
struct VendorDiscovery {
    instances: Vec<DiscoveredInstance>,
    errors: Vec<String>,
}

/// `Get-Service` name filter per vendor.
fn service_pattern(db_type: DatabaseType) -> Option<&'static str> {
    match db_type {
        DatabaseType::Mssql => Some(r"^(MSSQLSERVER|MSSQL\$.+)$"),
        DatabaseType::Mysql => Some("^MySQL"),
        DatabaseType::Postgresql => Some("^postgresql"),
        DatabaseType::Mongodb => Some("^MongoDB"),
        DatabaseType::Oracle | DatabaseType::Sqlite => None,
    }
}

/// Maps a Windows service to an instance.
///
/// `MSSQLSERVER` is the default SQL Server instance on `localhost`;
/// `MSSQL$NAME` is the named instance `localhost\NAME`.
pub fn instance_from_service(db_type: DatabaseType, service: &ServiceEntry) -> DiscoveredInstance {
    let display_name = service
        .display_name
        .clone()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| service.name.clone());

    let (server_name, port) = match db_type {
        DatabaseType::Mssql => match service.name.split_once('$') {
            Some((_, instance)) if !instance.is_empty() => (format!(r"localhost\{instance}"), None),
            _ => ("localhost".to_string(), db_type.default_port()),
        },
        _ => ("localhost".to_string(), db_type.default_port()),
    };

    DiscoveredInstance {
        name: service.name.clone(),
        server_name,
        display_name,
        db_type,
        port,
        source: DiscoverySource::Service,
    }
}

/// Maps a registry instance name to an instance.
pub fn instance_from_registry(
    db_type: DatabaseType,
    instance: &str,
    port: Option<u16>,
) -> DiscoveredInstance {
    let server_name = match db_type {
        DatabaseType::Mssql if !instance.eq_ignore_ascii_case("MSSQLSERVER") => {
            format!(r"localhost\{instance}")
        }
        _ => "localhost".to_string(),
    };
    let port = match db_type {
        DatabaseType::Mssql if server_name.contains('\\') => port,
        _ => port.or_else(|| db_type.default_port()),
    };

    DiscoveredInstance {
        name: instance.to_string(),
        server_name,
        display_name: format!("{} ({instance})", db_type.display_name()),
        db_type,
        port,
        source: DiscoverySource::Registry,
    }
}

/// Drops later duplicates of `(type, serverName)`, case-insensitively.
pub fn dedupe_instances(instances: Vec<DiscoveredInstance>) -> Vec<DiscoveredInstance> {
    let mut seen = HashSet::new();
    instances
        .into_iter()
        .filter(|i| seen.insert((i.db_type, i.server_name.to_ascii_lowercase())))
        .collect()
}

/// Discovery and credential lookup pipeline.
#[derive(Debug, Clone)]
pub struct Discovery {
    scanner: RegistryScanner,
    powershell: PowerShell,
    probe_host: String,
    probe_timeout: Duration,
    scan_services: bool,
    probe_network: bool,
}

impl Discovery {
    /// Pipeline with service scanning enabled on Windows only.
    pub fn new(scanner: RegistryScanner, powershell: PowerShell, probe_timeout: Duration) -> Self {
        Self {
            scanner,
            powershell,
            probe_host: "127.0.0.1".to_string(),
            probe_timeout,
            scan_services: cfg!(windows),
            probe_network: true,
        }
    }

    /// Pipeline for the running system.
    pub fn from_config(config: &PanelConfig) -> Self {
        Self::new(
            RegistryScanner::system(config.registry_timeout),
            PowerShell::new(
                Arc::new(crate::command::SystemCommandRunner),
                config.command_timeout,
            ),
            config.probe_timeout,
        )
    }

    /// Builder method toggling the Windows service scan.
    pub fn with_service_scan(mut self, enabled: bool) -> Self {
        self.scan_services = enabled;
        self
    }

    /// Builder method toggling the TCP port probe.
    pub fn with_network_probe(mut self, enabled: bool) -> Self {
        self.probe_network = enabled;
        self
    }

    pub fn scanner(&self) -> &RegistryScanner {
        &self.scanner
    }

    /// Instances of one vendor.
    ///
    /// # Errors
    /// Returns a configuration error for kinds discovery does not cover.
    pub async fn discover(&self, db_type: DatabaseType) -> Result<Vec<DiscoveredInstance>> {
        Ok(self.discover_vendor(db_type).await?.instances)
    }

    /// Instances of every discoverable vendor, found concurrently.
    ///
    /// Instances are grouped in vendor order (SQL Server, MySQL,
    /// PostgreSQL, MongoDB) regardless of which finished first.
    pub async fn discover_all_databases(&self) -> DiscoveryReport {
        let results = join_all(
            DatabaseType::DISCOVERABLE
                .into_iter()
                .map(|db_type| self.discover_vendor(db_type)),
        )
        .await;

        let mut report = DiscoveryReport::default();
        for (db_type, result) in DatabaseType::DISCOVERABLE.into_iter().zip(results) {
            match result {
                Ok(found) => {
                    report.instances.extend(found.instances);
                    report
                        .errors
                        .extend(found.errors.into_iter().map(|error| DiscoveryFailure {
                            db_type,
                            error,
                        }));
                }
                Err(e) => report.errors.push(DiscoveryFailure {
                    db_type,
                    error: e.to_string(),
                }),
            }
        }

        info!(
            "Discovery found {} instance(s) with {} error(s)",
            report.instances.len(),
            report.errors.len()
        );
        report
    }

    async fn discover_vendor(&self, db_type: DatabaseType) -> Result<VendorDiscovery> {
        if !DatabaseType::DISCOVERABLE.contains(&db_type) {
            return Err(DbPanelError::configuration(format!(
                "Discovery is not supported for {db_type}"
            )));
        }

        let (registry, services) =
            tokio::join!(self.registry_instances(db_type), self.service_instances(db_type));

        let mut found = VendorDiscovery::default();
        found.instances.extend(registry);
        match services {
            Ok(services) => found.instances.extend(services),
            Err(e) => {
                warn!("{} service scan failed: {}", db_type, e);
                found.errors.push(format!("Service scan failed: {e}"));
            }
        }

        if self.probe_network
            && let Some(port) = db_type.default_port()
            && self.probe_port(port).await
        {
            found.instances.push(DiscoveredInstance {
                name: format!("{}:{port}", self.probe_host),
                server_name: "localhost".to_string(),
                display_name: format!("{} on port {port}", db_type.display_name()),
                db_type,
                port: Some(port),
                source: DiscoverySource::Network,
            });
        }

        found.instances = dedupe_instances(found.instances);
        debug!("{}: {} instance(s)", db_type, found.instances.len());
        Ok(found)
    }

    async fn registry_instances(&self, db_type: DatabaseType) -> Vec<DiscoveredInstance> {
        let mut instances = Vec::new();
        for name in self.scanner.list_instances(db_type).await {
            let port = self
                .scanner
                .instance_values(db_type, &name)
                .await
                .and_then(|values| {
                    values
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case("port"))
                        .and_then(|(_, v)| v.trim().parse::<u16>().ok())
                });
            instances.push(instance_from_registry(db_type, &name, port));
        }
        instances
    }

    async fn service_instances(&self, db_type: DatabaseType) -> Result<Vec<DiscoveredInstance>> {
        if !self.scan_services {
            return Ok(Vec::new());
        }
        let Some(pattern) = service_pattern(db_type) else {
            return Ok(Vec::new());
        };

        let script = format!(
            "Get-Service -ErrorAction SilentlyContinue | Where-Object {{ $_.Name -match '{pattern}' }} | \
             Select-Object Name, DisplayName, @{{Name='Status';Expression={{$_.Status.ToString()}}}} | \
             ConvertTo-Json -Compress"
        );
        let services: Vec<ServiceEntry> = self.powershell.run_json_array(&script).await?;

        Ok(services
            .iter()
            .map(|service| instance_from_service(db_type, service))
            .collect())
    }

    /// Whether something accepts TCP connections on `port` of the probe host.
    pub async fn probe_port(&self, port: u16) -> bool {
        let address = (self.probe_host.as_str(), port);
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }

    /// Readable registry locations for a vendor instance.
    pub async fn discover_registry_paths(
        &self,
        db_type: DatabaseType,
        instance: Option<&str>,
    ) -> Vec<RegistryPath> {
        self.scanner.discover_registry_paths(db_type, instance).await
    }

    /// Saved settings for a vendor instance, for pre-filling a new record.
    pub async fn fetch_credentials(
        &self,
        db_type: DatabaseType,
        instance: Option<&str>,
    ) -> CredentialFetch {
        self.scanner
            .fetch_credentials_from_registry(db_type, instance)
            .await
    }

    /// ODBC data sources registered on this machine.
    pub async fn list_odbc_dsns(&self) -> Vec<OdbcDsn> {
        self.scanner.list_odbc_dsns().await
    }
}
