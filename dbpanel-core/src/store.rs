//! Saved connection records and their latest test results.
//!
//! Records live in memory and are written through to a pretty-printed JSON
//! file after every mutation. Statuses are process-local and never
//! persisted. Passwords are stored in clear in the file and masked on every
//! read that leaves the store.
//!
//! # Concurrency
//! Records and statuses sit behind separate `RwLock`s. A test copies what
//! it needs and releases the locks before the driver runs, so a slow test
//! never blocks listing or editing.

use crate::adapters::ConnectionTester;
use crate::error::DbPanelError;
use crate::models::{
    ConnectionPatch, ConnectionRecord, ConnectionStatus, DatabaseType, NewConnection,
};
use crate::Result;
use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_SUFFIX_LEN: usize = 9;

/// Result of testing one record as part of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAllEntry {
    pub id: String,
    pub name: String,
    pub status: ConnectionStatus,
}

/// File-backed store of connection records.
pub struct ConnectionStore {
    path: PathBuf,
    records: RwLock<Vec<ConnectionRecord>>,
    statuses: RwLock<HashMap<String, ConnectionStatus>>,
    tester: Arc<dyn ConnectionTester>,
}

impl std::fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConnectionStore {
    /// Opens the store backed by `path`.
    ///
    /// A missing file is an empty store; the file is created on the first
    /// mutation.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>, tester: Arc<dyn ConnectionTester>) -> Result<Self> {
        let path = path.into();
        let records = load_records(&path).await?;
        info!("Loaded {} saved connection(s)", records.len());

        Ok(Self {
            path,
            records: RwLock::new(records),
            statuses: RwLock::new(HashMap::new()),
            tester,
        })
    }

    /// Path of the backing JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, passwords masked, in insertion order.
    pub async fn list(&self) -> Vec<ConnectionRecord> {
        self.records
            .read()
            .await
            .iter()
            .map(ConnectionRecord::sanitized)
            .collect()
    }

    /// One record, password masked.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn get(&self, id: &str) -> Result<ConnectionRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .map(ConnectionRecord::sanitized)
            .ok_or_else(|| DbPanelError::not_found(id))
    }

    /// Creates a record with a fresh id and persists it.
    ///
    /// # Errors
    /// Returns a configuration error for an empty name, or an I/O error if
    /// the file cannot be written (the record is then not kept).
    pub async fn add(&self, new: NewConnection) -> Result<ConnectionRecord> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(DbPanelError::configuration("Connection name cannot be empty"));
        }

        let mut records = self.records.write().await;
        let mut id = generate_id();
        while records.iter().any(|r| r.id == id) {
            id = generate_id();
        }

        let record = ConnectionRecord {
            id,
            name: name.to_string(),
            db_type: new.db_type,
            config: new.config,
            created_at: Utc::now(),
            last_tested: None,
        };

        let mut updated = records.clone();
        updated.push(record.clone());
        save_records(&self.path, &updated).await?;
        *records = updated;

        info!("Added {} connection {}", record.db_type, record.id);
        Ok(record.sanitized())
    }

    /// Deletes a record and forgets its status.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id, or an I/O error if the file
    /// cannot be written.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if !records.iter().any(|r| r.id == id) {
            return Err(DbPanelError::not_found(id));
        }

        let updated: Vec<ConnectionRecord> =
            records.iter().filter(|r| r.id != id).cloned().collect();
        save_records(&self.path, &updated).await?;
        *records = updated;
        drop(records);

        self.statuses.write().await.remove(id);
        info!("Removed connection {}", id);
        Ok(())
    }

    /// Applies a partial update; `id` and `createdAt` never change.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id, a configuration error for an
    /// empty name, or an I/O error if the file cannot be written.
    pub async fn update(&self, id: &str, patch: ConnectionPatch) -> Result<ConnectionRecord> {
        let mut records = self.records.write().await;
        let mut updated = records.clone();
        let record = updated
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DbPanelError::not_found(id))?;

        if let Some(name) = patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(DbPanelError::configuration("Connection name cannot be empty"));
            }
            record.name = name.to_string();
        }
        if let Some(db_type) = patch.db_type {
            record.db_type = db_type;
        }
        if let Some(config) = patch.config {
            record.config.merge(config);
        }
        let result = record.sanitized();

        save_records(&self.path, &updated).await?;
        *records = updated;

        debug!("Updated connection {}", id);
        Ok(result)
    }

    /// Tests one record and records the outcome.
    ///
    /// Never fails: an unknown id yields a "Connection not found" status.
    pub async fn test(&self, id: &str) -> ConnectionStatus {
        let Some((db_type, config)) = self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .map(|r| (r.db_type, r.config.clone()))
        else {
            return ConnectionStatus::connection_not_found();
        };

        let status = self.tester.test(db_type, &config).await;
        self.record_results(vec![(id.to_string(), status.clone())])
            .await;
        status
    }

    /// Tests every record concurrently; results follow store order.
    pub async fn test_all(&self) -> Vec<TestAllEntry> {
        let snapshot: Vec<(String, String, DatabaseType, crate::models::ConnectionConfig)> = self
            .records
            .read()
            .await
            .iter()
            .map(|r| (r.id.clone(), r.name.clone(), r.db_type, r.config.clone()))
            .collect();

        if snapshot.is_empty() {
            return Vec::new();
        }

        let statuses = join_all(
            snapshot
                .iter()
                .map(|(_, _, db_type, config)| self.tester.test(*db_type, config)),
        )
        .await;

        let entries: Vec<TestAllEntry> = snapshot
            .into_iter()
            .zip(statuses)
            .map(|((id, name, _, _), status)| TestAllEntry { id, name, status })
            .collect();

        self.record_results(
            entries
                .iter()
                .map(|e| (e.id.clone(), e.status.clone()))
                .collect(),
        )
        .await;

        let passed = entries.iter().filter(|e| e.status.is_success()).count();
        info!("Tested {} connection(s), {} succeeded", entries.len(), passed);
        entries
    }

    /// Latest status of a record, or the "not tested" sentinel.
    pub async fn get_status(&self, id: &str) -> ConnectionStatus {
        self.statuses
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_else(ConnectionStatus::not_tested)
    }

    /// Every status recorded in this process.
    pub async fn get_statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.statuses
            .read()
            .await
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect()
    }

    /// Stores statuses and `lastTested` for records that still exist.
    async fn record_results(&self, results: Vec<(String, ConnectionStatus)>) {
        let mut records = self.records.write().await;
        let mut statuses = self.statuses.write().await;
        let mut touched = false;

        for (id, status) in results {
            let Some(record) = records.iter_mut().find(|r| r.id == id) else {
                debug!("Connection {} was removed during its test", id);
                continue;
            };
            record.last_tested = Some(status.tested_at.unwrap_or_else(Utc::now));
            statuses.insert(id, status);
            touched = true;
        }
        drop(statuses);

        if touched && let Err(e) = save_records(&self.path, &records).await {
            warn!("Failed to persist test timestamps: {}", e);
        }
    }
}

/// `conn_<unix millis>_<9 lowercase alphanumerics>`
fn generate_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .filter_map(|_| {
            ID_ALPHABET
                .get(rng.random_range(0..ID_ALPHABET.len()))
                .copied()
                .map(char::from)
        })
        .collect();
    format!("conn_{}_{}", Utc::now().timestamp_millis(), suffix)
}

async fn load_records(path: &Path) -> Result<Vec<ConnectionRecord>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            DbPanelError::serialization(format!("parsing {}", path.display()), e)
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No connection file at {}", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(DbPanelError::io(format!("reading {}", path.display()), e)),
    }
}

/// Writes through a temporary file and renames it over the target.
async fn save_records(path: &Path, records: &[ConnectionRecord]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DbPanelError::io(format!("creating {}", parent.display()), e))?;
    }

    let json = serde_json::to_vec_pretty(records)
        .map_err(|e| DbPanelError::serialization("encoding connection records", e))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|e| DbPanelError::io(format!("writing {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| DbPanelError::io(format!("replacing {}", path.display()), e))?;

    debug!("Saved {} connection(s) to {}", records.len(), path.display());
    Ok(())
}
