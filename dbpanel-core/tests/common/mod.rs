//! Fakes shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use base64::Engine;
use dbpanel_core::adapters::ConnectionTester;
use dbpanel_core::command::{CommandOutput, CommandRunner, PowerShell};
use dbpanel_core::models::{ConnectionConfig, ConnectionStatus, DatabaseType, ServerInfo};
use dbpanel_core::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tester that succeeds for host `good` and fails with an access-denied
/// error for anything else.
#[derive(Debug, Default)]
pub struct FakeTester {
    calls: AtomicUsize,
}

impl FakeTester {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionTester for FakeTester {
    async fn test(&self, db_type: DatabaseType, config: &ConnectionConfig) -> ConnectionStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if config.endpoint() == Some("good") {
            ConnectionStatus::succeeded(
                format!("Connected to {db_type} successfully"),
                ServerInfo {
                    version: Some("1.0".to_string()),
                    ..ServerInfo::default()
                },
            )
        } else {
            ConnectionStatus::failed(
                "Access denied for user",
                vec!["Check the username and password".to_string()],
            )
        }
    }
}

/// One recorded invocation of [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub script: String,
}

type Responder = dyn Fn(&str) -> CommandOutput + Send + Sync;

/// Runner that answers from a closure over the decoded script.
pub struct ScriptedRunner {
    respond: Box<Responder>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new(respond: impl Fn(&str) -> CommandOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String], _timeout: Duration) -> Result<CommandOutput> {
        let script = args.last().map(|a| decode_script(a)).unwrap_or_default();
        let output = (self.respond)(&script);
        self.invocations.lock().unwrap().push(Invocation {
            program: program.to_string(),
            script,
        });
        Ok(output)
    }
}

/// Reverses `-EncodedCommand` encoding.
pub fn decode_script(encoded: &str) -> String {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap();
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).unwrap()
}

pub fn stdout(text: &str, exit_code: i32) -> CommandOutput {
    CommandOutput {
        stdout: text.to_string(),
        stderr: String::new(),
        exit_code: Some(exit_code),
    }
}

pub fn powershell(runner: Arc<ScriptedRunner>) -> PowerShell {
    PowerShell::new(runner, Duration::from_secs(5))
}
