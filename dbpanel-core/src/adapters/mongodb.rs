//! MongoDB driver built on the official `mongodb` crate.
//!
//! Anonymous access is allowed: without a username no credential is sent.
//! The identity comes from `buildInfo` and `connectionStatus`.

use super::{DriverAdapter, connection_string, require_endpoint};
use crate::error::{DbPanelError, redact_database_url};
use crate::models::{ConnectionConfig, DatabaseType, ServerInfo};
use crate::Result;
use async_trait::async_trait;
use mongodb::bson::{Document, doc};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::Client;
use std::time::Duration;
use tracing::debug;

/// MongoDB connection tester.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDriver;

impl MongoDriver {
    /// Builds client options from a `mongodb://` URI or discrete fields.
    ///
    /// # Errors
    /// Returns a configuration error if the URI or address is malformed.
    pub async fn client_options(
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<ClientOptions> {
        let mut options = if let Some(uri) = connection_string(config) {
            ClientOptions::parse(uri).await.map_err(|e| {
                DbPanelError::configuration(format!(
                    "Invalid MongoDB connection string {}: {e}",
                    redact_database_url(uri)
                ))
            })?
        } else {
            let host = require_endpoint(config, "MongoDB")?;
            let port = config.port_or_default(DatabaseType::Mongodb).unwrap_or(27017);
            let address = ServerAddress::parse(format!("{host}:{port}")).map_err(|e| {
                DbPanelError::configuration(format!("Invalid MongoDB address: {e}"))
            })?;

            let mut options = ClientOptions::default();
            options.hosts = vec![address];
            if let Some(user) = config.user() {
                let mut credential = Credential::default();
                credential.username = Some(user.to_string());
                credential.password = config.password.clone().filter(|p| !p.is_empty());
                credential.source = config.database_name().map(str::to_string);
                options.credential = Some(credential);
            }
            options
        };

        options.app_name = Some("dbpanel".to_string());
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        Ok(options)
    }

    fn authenticated_user(status: &Document) -> Option<String> {
        status
            .get_document("authInfo")
            .ok()?
            .get_array("authenticatedUsers")
            .ok()?
            .iter()
            .find_map(|user| user.as_document())
            .and_then(|user| user.get_str("user").ok())
            .map(str::to_string)
    }
}

#[async_trait]
impl DriverAdapter for MongoDriver {
    fn driver_name(&self) -> &'static str {
        "MongoDB"
    }

    fn validate(&self, config: &ConnectionConfig) -> Result<()> {
        if connection_string(config).is_some() {
            return Ok(());
        }
        require_endpoint(config, "MongoDB").map(|_| ())
    }

    async fn probe(&self, config: &ConnectionConfig, timeout: Duration) -> Result<ServerInfo> {
        let options = Self::client_options(config, timeout).await?;
        let default_db = options
            .default_database
            .clone()
            .or_else(|| config.database_name().map(str::to_string));
        let server_name = options.hosts.first().map(ToString::to_string);

        let client = Client::with_options(options)
            .map_err(|e| DbPanelError::connection_failed("MongoDB client creation failed", e))?;

        let admin = client.database("admin");
        let result = async {
            let build_info = admin
                .run_command(doc! { "buildInfo": 1 })
                .await
                .map_err(|e| DbPanelError::connection_failed("MongoDB connection failed", e))?;
            let status = admin
                .run_command(doc! { "connectionStatus": 1 })
                .await
                .map_err(|e| DbPanelError::connection_failed("MongoDB connectionStatus failed", e))?;
            Ok::<_, DbPanelError>((build_info, status))
        }
        .await;

        client.shutdown().await;
        debug!("MongoDB client shut down");

        let (build_info, status) = result?;
        Ok(ServerInfo {
            version: build_info.get_str("version").ok().map(str::to_string),
            current_user: Self::authenticated_user(&status),
            current_database: default_db,
            server_name,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_allows_anonymous() {
        let config = ConnectionConfig {
            host: Some("localhost".to_string()),
            ..Default::default()
        };
        assert!(MongoDriver.validate(&config).is_ok());
        assert!(MongoDriver.validate(&ConnectionConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_client_options_from_fields() {
        let config = ConnectionConfig {
            host: Some("mongo.local".to_string()),
            username: Some("admin".to_string()),
            password: Some("pw".to_string()),
            database: Some("admin".to_string()),
            ..Default::default()
        };
        let options = MongoDriver::client_options(&config, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(options.hosts[0].to_string(), "mongo.local:27017");
        assert_eq!(options.server_selection_timeout, Some(Duration::from_secs(3)));
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("admin"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
    }

    #[test]
    fn test_authenticated_user_from_status() {
        let status = doc! {
            "authInfo": {
                "authenticatedUsers": [ { "user": "reporter", "db": "admin" } ],
                "authenticatedUserRoles": []
            },
            "ok": 1
        };
        assert_eq!(
            MongoDriver::authenticated_user(&status).as_deref(),
            Some("reporter")
        );
    }
}
