//! Runtime configuration for the connection pipeline.
//!
//! Defaults suit a single desktop user; environment variables override them
//! and the CLI layers its own flags on top.

use crate::{Result, error::DbPanelError};
use std::path::PathBuf;
use std::time::Duration;

/// File holding the saved connection records.
pub const STORE_FILE_NAME: &str = "db-connections.json";

/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "DBPANEL_DATA_DIR";
/// Environment variable overriding the driver connect timeout (seconds).
pub const ENV_CONNECT_TIMEOUT: &str = "DBPANEL_CONNECT_TIMEOUT_SECS";
/// Environment variable overriding the external command timeout (seconds).
pub const ENV_COMMAND_TIMEOUT: &str = "DBPANEL_COMMAND_TIMEOUT_SECS";

/// Timeouts and paths used by the store, adapters and discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelConfig {
    /// Per-user application data directory
    pub data_dir: PathBuf,
    /// Driver connect + identity query budget
    pub connect_timeout: Duration,
    /// Budget for one shell or PowerShell invocation
    pub command_timeout: Duration,
    /// Budget for one registry read
    pub registry_timeout: Duration,
    /// Budget for one TCP port probe during discovery
    pub probe_timeout: Duration,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(10),
            registry_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

impl PanelConfig {
    /// Builds a config from defaults plus environment overrides.
    ///
    /// # Errors
    /// Returns an error if an override is not a positive integer.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_DATA_DIR)
            && !dir.trim().is_empty()
        {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(secs) = read_secs(ENV_CONNECT_TIMEOUT)? {
            config.connect_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = read_secs(ENV_COMMAND_TIMEOUT)? {
            config.command_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Builder method to set the data directory.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Builder method to set the driver timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Path of the JSON file backing the connection store.
    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE_NAME)
    }

    /// Validates timeouts and paths.
    ///
    /// # Errors
    /// Returns error if a timeout is zero, exceeds five minutes, or the
    /// data directory is empty.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(DbPanelError::configuration("data directory cannot be empty"));
        }

        for (name, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("command_timeout", self.command_timeout),
            ("registry_timeout", self.registry_timeout),
            ("probe_timeout", self.probe_timeout),
        ] {
            if timeout.is_zero() {
                return Err(DbPanelError::configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
            if timeout > Duration::from_secs(300) {
                return Err(DbPanelError::configuration(format!(
                    "{name} should not exceed 300 seconds"
                )));
            }
        }

        Ok(())
    }
}

fn read_secs(var: &str) -> Result<Option<u64>> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Some)
            .ok_or_else(|| {
                DbPanelError::configuration(format!("{var} must be a positive number of seconds"))
            }),
        Err(_) => Ok(None),
    }
}

/// `%APPDATA%\dbpanel\data` on Windows, the XDG/macOS equivalents elsewhere.
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "dbpanel").map_or_else(
        || std::env::temp_dir().join("dbpanel"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
