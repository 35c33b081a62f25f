//! Bounded execution of external commands and PowerShell scripts.
//!
//! Every invocation carries a timeout; expiry kills the child and surfaces
//! as [`DbPanelError::Timeout`]. Callers get captured stdout/stderr and the
//! exit code, and decide for themselves what counts as success.

use crate::{Result, error::DbPanelError};
use async_trait::async_trait;
use base64::Engine;
use serde::de::DeserializeOwned;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Parses stdout as JSON that may be a bare object or an array.
    ///
    /// `ConvertTo-Json` emits a single object for one item, an array for
    /// many and nothing at all for none.
    pub fn parse_json_array<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let trimmed = self.stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }
        if trimmed.starts_with('[') {
            serde_json::from_str(trimmed)
                .map_err(|e| DbPanelError::serialization("PowerShell JSON array output", e))
        } else {
            serde_json::from_str(trimmed)
                .map(|item| vec![item])
                .map_err(|e| DbPanelError::serialization("PowerShell JSON object output", e))
        }
    }
}

/// Capability to run an external program with a time budget.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, capturing output.
    ///
    /// # Errors
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    /// A non-zero exit code is not an error.
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        debug!("Spawning {} with {} argument(s)", program, args.len());

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DbPanelError::command(format!("failed to spawn {program}: {e}")))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| DbPanelError::timeout(program, timeout))?
            .map_err(|e| DbPanelError::command(format!("{program} did not complete: {e}")))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        trace!("{} stdout: {} bytes", program, result.stdout.len());
        if !result.stderr.trim().is_empty() {
            warn!("{} wrote {} bytes to stderr", program, result.stderr.len());
        }

        Ok(result)
    }
}

/// Bit-width of the PowerShell host a script runs in.
///
/// ODBC drivers are architecture-bound, so a 32-bit DSN must be opened from
/// a 32-bit process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86,
    X64,
}

impl Architecture {
    /// Architecture of the current process.
    pub const fn current() -> Self {
        if cfg!(target_pointer_width = "32") {
            Self::X86
        } else {
            Self::X64
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X86 => f.write_str("32-bit"),
            Self::X64 => f.write_str("64-bit"),
        }
    }
}

/// Path of the Windows PowerShell host for `arch`.
///
/// A 32-bit process reaches the 64-bit host through `Sysnative`; a 64-bit
/// process reaches the 32-bit host through `SysWOW64`.
pub fn powershell_path(arch: Architecture) -> String {
    if !cfg!(windows) {
        return "pwsh".to_string();
    }

    let root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".to_string());
    let system_dir = match (Architecture::current(), arch) {
        (Architecture::X64, Architecture::X86) => "SysWOW64",
        (Architecture::X86, Architecture::X64) => "Sysnative",
        _ => "System32",
    };
    format!(r"{root}\{system_dir}\WindowsPowerShell\v1.0\powershell.exe")
}

/// Encodes a script for `-EncodedCommand` (base64 of UTF-16LE).
pub fn encode_powershell(script: &str) -> String {
    let utf16: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(utf16)
}

/// Escapes a value for a single-quoted PowerShell string literal.
pub fn escape_ps(value: &str) -> String {
    value.replace('\'', "''")
}

/// Runs PowerShell scripts through a [`CommandRunner`].
#[derive(Clone)]
pub struct PowerShell {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl std::fmt::Debug for PowerShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerShell")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PowerShell {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `script` in the host of the current architecture.
    pub async fn run(&self, script: &str) -> Result<CommandOutput> {
        self.run_in(Architecture::current(), script, self.timeout).await
    }

    /// Runs `script` in the host for `arch` with an explicit budget.
    ///
    /// The script travels as `-EncodedCommand`, so quoting inside it cannot
    /// break the command line, and it is never logged.
    pub async fn run_in(
        &self,
        arch: Architecture,
        script: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let program = powershell_path(arch);
        let args = vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-EncodedCommand".to_string(),
            encode_powershell(script),
        ];
        debug!("Running {} PowerShell script ({} chars)", arch, script.len());
        self.runner.run(&program, &args, timeout).await
    }

    /// Runs `script` and parses its `ConvertTo-Json` output.
    ///
    /// # Errors
    /// Fails when the host exits non-zero or the output is not JSON.
    pub async fn run_json_array<T: DeserializeOwned>(&self, script: &str) -> Result<Vec<T>> {
        let output = self.run(script).await?;
        if !output.success() {
            let detail = output.stderr.trim();
            return Err(DbPanelError::command(if detail.is_empty() {
                format!("PowerShell exited with code {:?}", output.exit_code)
            } else {
                detail.chars().take(500).collect()
            }));
        }
        output.parse_json_array()
    }
}
