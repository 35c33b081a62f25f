//! Command-line host for the dbpanel connection core.
//!
//! Every IPC channel is reachable as a subcommand, and `serve` speaks the
//! line-delimited protocol on stdin/stdout for a UI process.

pub mod cli;
pub mod serve;

pub use cli::{Cli, Command};
pub use serve::serve;
