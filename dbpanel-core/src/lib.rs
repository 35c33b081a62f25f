//! Core of dbpanel: saved database connections, driver tests and local
//! discovery for a Windows workstation.
//!
//! The crate is consumed through [`ipc::IpcHandler`], a dispatcher of named
//! JSON calls, or through its parts directly.
//!
//! # Security Guarantees
//! - Passwords are masked on every read that leaves the connection store
//! - Credentials, connection strings and scripts are never logged
//! - Driver errors are redacted before they reach a message
//!
//! # Architecture
//! - `command`: bounded external commands and PowerShell
//! - `registry`: registry reads behind a swappable reader
//! - `adapters`: one driver per database kind plus an ODBC bridge
//! - `hints`: remediation hints for failed tests
//! - `store`: file-backed connection records and in-memory statuses
//! - `discovery`: registry, service and port based instance discovery
//! - `ipc`: the named-call facade

pub mod adapters;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hints;
pub mod ipc;
pub mod logging;
pub mod models;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use adapters::{ConnectionTester, DriverAdapter, DriverRegistry};
pub use config::PanelConfig;
pub use discovery::{Discovery, DiscoveryReport};
pub use error::{DbPanelError, Result};
pub use ipc::{IpcHandler, IpcRequest};
pub use models::{
    ConnectionConfig, ConnectionPatch, ConnectionRecord, ConnectionStatus, DatabaseType,
    DiscoveredInstance, DiscoverySource, NewConnection, PASSWORD_MASK, ServerInfo, SupportedType,
};
pub use registry::{CredentialFetch, RegistryScanner};
pub use store::{ConnectionStore, TestAllEntry};
