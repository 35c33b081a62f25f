//! Named JSON calls over the store, drivers and discovery.
//!
//! Every call takes a JSON payload and answers with a JSON object carrying
//! `success`. Failures are answered, not raised: `{success: false, error,
//! hint?}`. The `serve` transport wraps calls in line-delimited envelopes
//! `{id?, channel, payload?}`.

use crate::adapters::DriverRegistry;
use crate::config::PanelConfig;
use crate::discovery::Discovery;
use crate::error::DbPanelError;
use crate::models::{ConnectionPatch, DatabaseType, NewConnection};
use crate::store::ConnectionStore;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

/// Channel names understood by [`IpcHandler`].
pub mod channels {
    pub const GET_ALL: &str = "db-connections:get-all";
    pub const GET: &str = "db-connections:get";
    pub const ADD: &str = "db-connections:add";
    pub const REMOVE: &str = "db-connections:remove";
    pub const UPDATE: &str = "db-connections:update";
    pub const TEST: &str = "db-connections:test";
    pub const TEST_ALL: &str = "db-connections:test-all";
    pub const GET_STATUS: &str = "db-connections:get-status";
    pub const GET_STATUSES: &str = "db-connections:get-statuses";
    pub const GET_SUPPORTED_TYPES: &str = "db-connections:get-supported-types";
    pub const DISCOVER_ALL: &str = "db-connections:discover-all";
    pub const DISCOVER: &str = "db-connections:discover";
    pub const FETCH_CREDENTIALS: &str = "db-connections:fetch-credentials";
    pub const REGISTRY_PATHS: &str = "db-connections:registry-paths";
    pub const LIST_ODBC_DSNS: &str = "db-connections:list-odbc-dsns";

    /// Every channel, in documentation order.
    pub const ALL: [&str; 15] = [
        GET_ALL,
        GET,
        ADD,
        REMOVE,
        UPDATE,
        TEST,
        TEST_ALL,
        GET_STATUS,
        GET_STATUSES,
        GET_SUPPORTED_TYPES,
        DISCOVER_ALL,
        DISCOVER,
        FETCH_CREDENTIALS,
        REGISTRY_PATHS,
        LIST_ODBC_DSNS,
    ];
}

/// One request line of the `serve` transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub channel: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    id: String,
    #[serde(default)]
    updates: ConnectionPatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancePayload {
    #[serde(rename = "type")]
    db_type: DatabaseType,
    #[serde(default)]
    instance_name: Option<String>,
}

/// Dispatches named calls.
#[derive(Debug, Clone)]
pub struct IpcHandler {
    store: Arc<ConnectionStore>,
    drivers: Arc<DriverRegistry>,
    discovery: Arc<Discovery>,
}

impl IpcHandler {
    pub fn new(
        store: Arc<ConnectionStore>,
        drivers: Arc<DriverRegistry>,
        discovery: Arc<Discovery>,
    ) -> Self {
        Self {
            store,
            drivers,
            discovery,
        }
    }

    /// Wires the store, drivers and discovery for the running system.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the connection
    /// file exists but cannot be loaded.
    pub async fn from_config(config: &PanelConfig) -> Result<Self> {
        config.validate()?;
        let drivers = Arc::new(DriverRegistry::from_config(config));
        let store = ConnectionStore::open(config.store_file(), drivers.clone()).await?;
        Ok(Self::new(
            Arc::new(store),
            drivers,
            Arc::new(Discovery::from_config(config)),
        ))
    }

    pub fn store(&self) -> &ConnectionStore {
        &self.store
    }

    /// Handles one call; never fails.
    pub async fn handle(&self, channel: &str, payload: Value) -> Value {
        debug!("IPC call {}", channel);
        match self.dispatch(channel, payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!("IPC call {} failed: {}", channel, e);
                error_response(&e)
            }
        }
    }

    /// Handles one `serve` line, echoing the request id.
    pub async fn handle_line(&self, line: &str) -> Value {
        let request: IpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return json!({
                    "success": false,
                    "error": format!("Malformed request: {e}"),
                });
            }
        };

        let mut response = self
            .handle(&request.channel, request.payload.unwrap_or(Value::Null))
            .await;
        if let (Some(id), Value::Object(map)) = (request.id, &mut response) {
            map.insert("id".to_string(), id);
        }
        response
    }

    async fn dispatch(&self, channel: &str, payload: Value) -> Result<Value> {
        match channel {
            channels::GET_ALL => Ok(json!({
                "success": true,
                "connections": self.store.list().await,
            })),
            channels::GET => {
                let IdPayload { id } = parse(payload)?;
                let connection = self.store.get(&id).await?;
                Ok(json!({ "success": true, "connection": connection }))
            }
            channels::ADD => {
                let new: NewConnection = parse(payload)?;
                let connection = self.store.add(new).await?;
                Ok(json!({ "success": true, "connection": connection }))
            }
            channels::REMOVE => {
                let IdPayload { id } = parse(payload)?;
                self.store.remove(&id).await?;
                Ok(json!({ "success": true }))
            }
            channels::UPDATE => {
                let UpdatePayload { id, updates } = parse(payload)?;
                let connection = self.store.update(&id, updates).await?;
                Ok(json!({ "success": true, "connection": connection }))
            }
            channels::TEST => {
                let IdPayload { id } = parse(payload)?;
                let status = self.store.test(&id).await;
                let mut body = to_object(&status)?;
                body.insert("success".to_string(), Value::Bool(status.is_success()));
                Ok(Value::Object(body))
            }
            channels::TEST_ALL => Ok(json!({
                "success": true,
                "results": self.store.test_all().await,
            })),
            channels::GET_STATUS => {
                let IdPayload { id } = parse(payload)?;
                Ok(json!({ "success": true, "status": self.store.get_status(&id).await }))
            }
            channels::GET_STATUSES => Ok(json!({
                "success": true,
                "statuses": self.store.get_statuses().await,
            })),
            channels::GET_SUPPORTED_TYPES => Ok(json!({
                "success": true,
                "types": self.drivers.supported_types(),
            })),
            channels::DISCOVER_ALL => {
                let report = self.discovery.discover_all_databases().await;
                Ok(json!({
                    "success": true,
                    "instances": report.instances,
                    "errors": report.errors,
                }))
            }
            channels::DISCOVER => {
                #[derive(Deserialize)]
                struct DiscoverPayload {
                    #[serde(rename = "type")]
                    db_type: DatabaseType,
                }
                let DiscoverPayload { db_type } = parse(payload)?;
                let instances = self.discovery.discover(db_type).await?;
                Ok(json!({ "success": true, "instances": instances }))
            }
            channels::FETCH_CREDENTIALS => {
                let request: InstancePayload = parse(payload)?;
                let fetch = self
                    .discovery
                    .fetch_credentials(request.db_type, request.instance_name.as_deref())
                    .await;
                let mut body = to_object(&fetch)?;
                body.insert("success".to_string(), Value::Bool(true));
                Ok(Value::Object(body))
            }
            channels::REGISTRY_PATHS => {
                let request: InstancePayload = parse(payload)?;
                let paths = self
                    .discovery
                    .discover_registry_paths(request.db_type, request.instance_name.as_deref())
                    .await;
                Ok(json!({ "success": true, "paths": paths }))
            }
            channels::LIST_ODBC_DSNS => Ok(json!({
                "success": true,
                "dsns": self.discovery.list_odbc_dsns().await,
            })),
            other => Err(DbPanelError::configuration(format!("Unknown channel: {other}"))),
        }
    }
}

/// `{success: false, error, hint?}` for an error.
pub fn error_response(error: &DbPanelError) -> Value {
    let mut body = Map::new();
    body.insert("success".to_string(), Value::Bool(false));
    body.insert("error".to_string(), Value::String(error.to_string()));
    if let DbPanelError::DriverNotInstalled { .. } = error {
        body.insert(
            "hint".to_string(),
            json!(["Connect through ODBC or use a build with this driver enabled"]),
        );
    }
    Value::Object(body)
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| DbPanelError::configuration(format!("Invalid payload: {e}")))
}

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)
        .map_err(|e| DbPanelError::serialization("Encoding response", e))?
    {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}
