//! Stand-in adapter for database kinds without a driver in this build.
//!
//! Oracle always lands here; the other kinds do when their cargo feature is
//! disabled. Every test reports "driver not installed" without any I/O.

use super::DriverAdapter;
use crate::error::DbPanelError;
use crate::models::{ConnectionConfig, DatabaseType, ServerInfo};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Adapter whose driver is absent.
#[derive(Debug, Clone, Copy)]
pub struct NotInstalledAdapter {
    db_type: DatabaseType,
}

impl NotInstalledAdapter {
    pub const fn new(db_type: DatabaseType) -> Self {
        Self { db_type }
    }
}

#[async_trait]
impl DriverAdapter for NotInstalledAdapter {
    fn driver_name(&self) -> &'static str {
        self.db_type.display_name()
    }

    fn driver_installed(&self) -> bool {
        false
    }

    fn validate(&self, _config: &ConnectionConfig) -> Result<()> {
        Ok(())
    }

    async fn probe(&self, _config: &ConnectionConfig, _timeout: Duration) -> Result<ServerInfo> {
        Err(DbPanelError::driver_not_installed(self.db_type.display_name()))
    }
}
