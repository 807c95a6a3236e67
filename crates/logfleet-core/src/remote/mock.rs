// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock remote executor for testing.
//!
//! Simulates remote command execution without reaching any machine. Tests
//! script responses by command substring and inspect the recorded command
//! log afterwards.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RemoteError, RemoteExecutor, Result};
use crate::persistence::MachineRecord;

/// Scripted reaction to a matching command.
#[derive(Debug, Clone)]
enum MockResponse {
    /// Return this stdout.
    Output(String),
    /// Fail as a command that ran and exited non-zero.
    Fail(String),
    /// Fail as an unreachable host.
    Unreachable,
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    response: MockResponse,
}

#[derive(Default)]
struct MockInner {
    rules: Vec<Rule>,
    commands: Vec<(i64, String)>,
    uploads: Vec<(i64, String, String)>,
    all_unreachable: bool,
    fail_uploads: bool,
}

/// Mock remote executor for testing.
///
/// Commands are matched against scripted rules by substring, first match
/// wins; unmatched commands succeed with empty output. Every command and
/// upload is recorded for later inspection.
#[derive(Default)]
pub struct MockRemoteExecutor {
    inner: Mutex<MockInner>,
}

impl MockRemoteExecutor {
    /// Create a mock where every command succeeds with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock where every machine is unreachable.
    pub fn unreachable() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                all_unreachable: true,
                ..Default::default()
            }),
        }
    }

    /// Script an stdout response for commands containing `pattern`.
    pub async fn respond(&self, pattern: &str, output: &str) {
        let mut inner = self.inner.lock().await;
        inner.rules.push(Rule {
            pattern: pattern.to_string(),
            response: MockResponse::Output(output.to_string()),
        });
    }

    /// Script a non-zero-exit failure for commands containing `pattern`.
    pub async fn fail_matching(&self, pattern: &str, stderr: &str) {
        let mut inner = self.inner.lock().await;
        inner.rules.push(Rule {
            pattern: pattern.to_string(),
            response: MockResponse::Fail(stderr.to_string()),
        });
    }

    /// Script an unreachable-host failure for commands containing `pattern`.
    pub async fn unreachable_matching(&self, pattern: &str) {
        let mut inner = self.inner.lock().await;
        inner.rules.push(Rule {
            pattern: pattern.to_string(),
            response: MockResponse::Unreachable,
        });
    }

    /// Make every upload fail.
    pub async fn fail_uploads(&self) {
        let mut inner = self.inner.lock().await;
        inner.fail_uploads = true;
    }

    /// All commands executed so far, as (machine id, command) pairs.
    pub async fn commands(&self) -> Vec<(i64, String)> {
        self.inner.lock().await.commands.clone()
    }

    /// All uploads executed so far, as (machine id, local, remote) triples.
    pub async fn uploads(&self) -> Vec<(i64, String, String)> {
        self.inner.lock().await.uploads.clone()
    }

    /// Count of executed commands containing `pattern`.
    pub async fn command_count(&self, pattern: &str) -> usize {
        self.inner
            .lock()
            .await
            .commands
            .iter()
            .filter(|(_, c)| c.contains(pattern))
            .count()
    }
}

#[async_trait]
impl RemoteExecutor for MockRemoteExecutor {
    async fn execute_command(&self, machine: &MachineRecord, command: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        inner.commands.push((machine.id, command.to_string()));

        if inner.all_unreachable {
            return Err(RemoteError::Unreachable(format!(
                "no route to {}",
                machine.host
            )));
        }

        for rule in &inner.rules {
            if command.contains(&rule.pattern) {
                return match &rule.response {
                    MockResponse::Output(output) => Ok(output.clone()),
                    MockResponse::Fail(stderr) => Err(RemoteError::CommandFailed {
                        exit_code: 1,
                        stderr: stderr.clone(),
                    }),
                    MockResponse::Unreachable => Err(RemoteError::Unreachable(format!(
                        "no route to {}",
                        machine.host
                    ))),
                };
            }
        }

        Ok(String::new())
    }

    async fn upload_file(
        &self,
        machine: &MachineRecord,
        local_path: &str,
        remote_path: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .uploads
            .push((machine.id, local_path.to_string(), remote_path.to_string()));

        if inner.all_unreachable {
            return Err(RemoteError::Unreachable(format!(
                "no route to {}",
                machine.host
            )));
        }
        if inner.fail_uploads {
            return Err(RemoteError::UploadFailed("mock upload failure".to_string()));
        }
        Ok(())
    }
}
