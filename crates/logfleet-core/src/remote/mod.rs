// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote executor trait definitions.
//!
//! Defines the abstract interface for reaching a machine. The concrete
//! transport (SSH, an agent channel, ...) is supplied by the embedding
//! application; logfleet-core never binds a transport library itself.

pub mod mock;

pub use self::mock::MockRemoteExecutor;

use async_trait::async_trait;
use thiserror::Error;

use crate::persistence::MachineRecord;

/// Errors from remote operations.
///
/// The distinction between [`RemoteError::CommandFailed`] and
/// [`RemoteError::Unreachable`] matters: both fail the owning step, but the
/// reconciler treats an unreachable host as "process still alive" to avoid
/// false-positive resets during transient network trouble.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// The command ran on the machine and exited non-zero.
    #[error("Command exited with code {exit_code}: {stderr}")]
    CommandFailed {
        /// Exit code from the remote shell.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The machine could not be reached at all.
    #[error("Machine unreachable: {0}")]
    Unreachable(String),

    /// The command or transfer did not finish in time.
    #[error("Remote operation timed out")]
    Timeout,

    /// File transfer failed.
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// Local I/O failed while preparing the operation.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Whether this error means the machine itself could not be reached
    /// (as opposed to a command that ran and failed).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout)
    }
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Trait for executing work on remote machines.
///
/// Executors are PURE transports - they do NOT access the repository.
/// Recording outcomes is handled by the caller (the step executors and the
/// reconciler).
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on the machine and return its stdout.
    ///
    /// A non-zero exit maps to [`RemoteError::CommandFailed`]; a host that
    /// cannot be reached maps to [`RemoteError::Unreachable`]. Implementations
    /// may enforce their own per-command timeout and report it as
    /// [`RemoteError::Timeout`].
    async fn execute_command(&self, machine: &MachineRecord, command: &str) -> Result<String>;

    /// Copy a local file to a path on the machine.
    async fn upload_file(
        &self,
        machine: &MachineRecord,
        local_path: &str,
        remote_path: &str,
    ) -> Result<()>;
}
