//! dbpanel command-line entry point.
//!
//! Logs go to stderr; stdout carries only command results or, under
//! `serve`, protocol lines.

use anyhow::Context;
use clap::Parser;
use dbpanel::{Cli, Command, serve};
use dbpanel_core::IpcHandler;
use dbpanel_core::logging::init_logging;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::{debug, error};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let mut cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_json)?;

    let config = cli.global.panel_config()?;
    debug!("Using data directory {}", config.data_dir.display());

    let handler = IpcHandler::from_config(&config)
        .await
        .context("Failed to open the connection store")?;

    if matches!(cli.command, Command::Serve) {
        serve(&handler, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
        return Ok(ExitCode::SUCCESS);
    }

    cli.command
        .resolve_prompts()
        .context("Failed to read password")?;

    let Some(response) = cli.command.execute(&handler).await else {
        return Ok(ExitCode::SUCCESS);
    };
    println!("{}", serde_json::to_string_pretty(&response)?);

    if response["success"] == false {
        if let Some(message) = response["error"].as_str() {
            error!("{}", message);
        }
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
