//! Argument parsing and the mapping from subcommands to IPC calls.

use clap::{Args, Parser, Subcommand};
use dbpanel_core::ipc::channels;
use dbpanel_core::models::{ConnectionConfig, DatabaseType};
use dbpanel_core::{IpcHandler, PanelConfig};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "dbpanel")]
#[command(about = "Saved database connections, connection tests and local discovery")]
#[command(version)]
#[command(long_about = "
dbpanel - database connection manager for Windows workstations

Keeps a list of saved connections, tests them with native drivers or
through ODBC, and finds database servers installed on this machine.

SECURITY NOTES:
- Passwords are masked in every listing
- Passwords are stored unencrypted in the data directory
- Credentials and connection strings are never logged

EXAMPLES:
  dbpanel add --name Reporting --type postgresql --host db01 --username app --ask-password
  dbpanel test conn_1718000000000_k3j9x0a2b
  dbpanel discover
  dbpanel serve
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all logs except errors")]
    pub quiet: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Directory holding db-connections.json
    #[arg(long, global = true, env = "DBPANEL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Driver connect timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub connect_timeout: Option<u64>,
}

impl GlobalArgs {
    /// Environment config with the command-line overrides applied.
    ///
    /// # Errors
    /// Returns an error if an override is out of range.
    pub fn panel_config(&self) -> dbpanel_core::Result<PanelConfig> {
        let mut config = PanelConfig::from_env()?;
        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(dir);
        }
        if let Some(secs) = self.connect_timeout {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List saved connections
    List,
    /// Show one saved connection
    Get { id: String },
    /// Save a new connection
    Add(AddArgs),
    /// Delete a saved connection
    Remove { id: String },
    /// Change a saved connection
    Update(UpdateArgs),
    /// Test a saved connection
    Test { id: String },
    /// Test every saved connection
    TestAll,
    /// Show the latest test result of one or all connections
    Status { id: Option<String> },
    /// List database kinds and whether their driver is built in
    Types,
    /// Find local database servers
    Discover {
        /// Limit discovery to one kind
        #[arg(long = "type", value_parser = parse_type)]
        db_type: Option<DatabaseType>,
    },
    /// Read saved settings for an instance from the registry
    FetchCredentials(InstanceArgs),
    /// List readable registry locations for an instance
    RegistryPaths(InstanceArgs),
    /// List registered ODBC data sources
    OdbcDsns,
    /// Answer line-delimited JSON requests on stdin
    Serve,
}

#[derive(Debug, Clone, Args)]
pub struct AddArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long = "type", value_parser = parse_type)]
    pub db_type: DatabaseType,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
pub struct UpdateArgs {
    pub id: String,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long = "type", value_parser = parse_type)]
    pub db_type: Option<DatabaseType>,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
pub struct InstanceArgs {
    #[arg(long = "type", value_parser = parse_type)]
    pub db_type: DatabaseType,

    /// Instance name; the vendor default when omitted
    #[arg(long)]
    pub instance: Option<String>,
}

/// Connection fields shared by `add` and `update`.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// SQL Server name, `host`, `host,port` or `host\INSTANCE`
    #[arg(long)]
    pub server: Option<String>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Database name, SQLite file path or ODBC DSN
    #[arg(long)]
    pub database: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long, env = "DBPANEL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Prompt for the password without echo
    #[arg(long)]
    pub ask_password: bool,
    #[arg(long)]
    pub windows_auth: bool,
    #[arg(long)]
    pub encrypt: bool,
    #[arg(long)]
    pub trust_server_certificate: bool,
    /// Test through ODBC instead of the native driver
    #[arg(long)]
    pub odbc: bool,
    #[arg(long)]
    pub odbc_connection_string: Option<String>,
    /// Full driver URI, used instead of the discrete fields
    #[arg(long)]
    pub connection_string: Option<String>,
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl ConfigArgs {
    /// Fields that were given; flags that are off stay unset.
    pub fn to_config(&self) -> ConnectionConfig {
        let flag = |on: bool| on.then_some(true);
        ConnectionConfig {
            server: self.server.clone(),
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            windows_auth: flag(self.windows_auth),
            encrypt: flag(self.encrypt),
            trust_server_certificate: flag(self.trust_server_certificate),
            use_odbc: flag(self.odbc),
            odbc_connection_string: self.odbc_connection_string.clone(),
            connection_string: self.connection_string.clone(),
            connect_timeout_secs: self.timeout,
            ..ConnectionConfig::default()
        }
    }

    /// Replaces `--ask-password` with the value typed at the prompt.
    ///
    /// # Errors
    /// Returns an error if the terminal cannot be read.
    pub fn prompt_password(&mut self) -> std::io::Result<()> {
        if self.ask_password {
            let password = rpassword::prompt_password("Password: ")?;
            self.password = Some(password);
            self.ask_password = false;
        }
        Ok(())
    }
}

impl Command {
    /// Prompts for any password the command asked for.
    ///
    /// # Errors
    /// Returns an error if the terminal cannot be read.
    pub fn resolve_prompts(&mut self) -> std::io::Result<()> {
        match self {
            Self::Add(args) => args.config.prompt_password(),
            Self::Update(args) => args.config.prompt_password(),
            _ => Ok(()),
        }
    }

    /// IPC channel and payload for this command; `None` for `serve`.
    pub fn request(&self) -> Option<(&'static str, Value)> {
        let request = match self {
            Self::List => (channels::GET_ALL, Value::Null),
            Self::Get { id } => (channels::GET, json!({ "id": id })),
            Self::Add(args) => (
                channels::ADD,
                json!({
                    "name": args.name,
                    "type": args.db_type,
                    "config": args.config.to_config(),
                }),
            ),
            Self::Remove { id } => (channels::REMOVE, json!({ "id": id })),
            Self::Update(args) => {
                let mut updates = json!({ "config": args.config.to_config() });
                if let Some(name) = &args.name {
                    updates["name"] = json!(name);
                }
                if let Some(db_type) = args.db_type {
                    updates["type"] = json!(db_type);
                }
                (channels::UPDATE, json!({ "id": args.id, "updates": updates }))
            }
            Self::Test { id } => (channels::TEST, json!({ "id": id })),
            Self::TestAll => (channels::TEST_ALL, Value::Null),
            Self::Status { id: Some(id) } => (channels::GET_STATUS, json!({ "id": id })),
            Self::Status { id: None } => (channels::GET_STATUSES, Value::Null),
            Self::Types => (channels::GET_SUPPORTED_TYPES, Value::Null),
            Self::Discover { db_type: Some(db_type) } => {
                (channels::DISCOVER, json!({ "type": db_type }))
            }
            Self::Discover { db_type: None } => (channels::DISCOVER_ALL, Value::Null),
            Self::FetchCredentials(args) => (channels::FETCH_CREDENTIALS, instance_payload(args)),
            Self::RegistryPaths(args) => (channels::REGISTRY_PATHS, instance_payload(args)),
            Self::OdbcDsns => (channels::LIST_ODBC_DSNS, Value::Null),
            Self::Serve => return None,
        };
        Some(request)
    }

    /// Runs the command's call; `None` for `serve`.
    pub async fn execute(&self, handler: &IpcHandler) -> Option<Value> {
        let (channel, payload) = self.request()?;
        Some(handler.handle(channel, payload).await)
    }
}

fn instance_payload(args: &InstanceArgs) -> Value {
    let mut payload = json!({ "type": args.db_type });
    if let Some(instance) = &args.instance {
        payload["instanceName"] = json!(instance);
    }
    payload
}

fn parse_type(value: &str) -> Result<DatabaseType, String> {
    value.parse().map_err(|e: dbpanel_core::DbPanelError| e.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_type_aliases() {
        assert_eq!(parse_type("postgres").unwrap(), DatabaseType::Postgresql);
        assert_eq!(parse_type("SQLServer").unwrap(), DatabaseType::Mssql);
        assert!(parse_type("db2").is_err());
    }

    #[test]
    fn test_unset_flags_stay_unset() {
        let config = ConfigArgs {
            host: Some("db01".to_string()),
            ..ConfigArgs::default()
        }
        .to_config();
        assert_eq!(config.host.as_deref(), Some("db01"));
        assert!(config.windows_auth.is_none());
        assert!(config.use_odbc.is_none());
    }

    #[test]
    fn test_serve_has_no_request() {
        assert!(Command::Serve.request().is_none());
    }
}
