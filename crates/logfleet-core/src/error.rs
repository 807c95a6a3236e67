// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for logfleet-core.
//!
//! Provides a unified error type with stable error codes for API surfaces.
//! Remote command failures are deliberately NOT represented here: they are
//! converted to failed step outcomes at the step boundary and recorded on the
//! step row instead of propagating as errors.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors surfaced to operators and embedders.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Process was not found in the repository.
    ProcessNotFound {
        /// The process ID that was not found.
        process_id: i64,
    },

    /// Instance was not found in the repository.
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: i64,
    },

    /// Machine was not found in the repository.
    MachineNotFound {
        /// The machine ID that was not found.
        machine_id: i64,
    },

    /// Task was not found in the repository.
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// The instance's current state does not permit the requested operation.
    InvalidStateTransition {
        /// The instance ID.
        instance_id: i64,
        /// The instance's current state.
        state: String,
        /// The operation that was denied.
        operation: String,
    },

    /// A (machine, deploy path) pair is already occupied by another instance.
    PathConflict {
        /// The target machine ID.
        machine_id: i64,
        /// The conflicting deploy path.
        deploy_path: String,
        /// The instance already occupying the pair.
        occupied_by_instance: i64,
        /// The process owning the occupying instance.
        occupied_by_process: i64,
    },

    /// Scale-in would leave the process with zero instances.
    MinimumInstances {
        /// The process ID.
        process_id: i64,
        /// Instances the process currently has.
        current: usize,
        /// Instances the request wants to remove.
        removing: usize,
    },

    /// Input validation failed.
    ValidationError {
        /// The validation error message.
        message: String,
    },

    /// Repository operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProcessNotFound { .. } => "PROCESS_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::MachineNotFound { .. } => "MACHINE_NOT_FOUND",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::PathConflict { .. } => "PATH_CONFLICT",
            Self::MinimumInstances { .. } => "MINIMUM_INSTANCES",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Build a validation error from anything printable.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessNotFound { process_id } => {
                write!(f, "Process {} not found", process_id)
            }
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance {} not found", instance_id)
            }
            Self::MachineNotFound { machine_id } => {
                write!(f, "Machine {} not found", machine_id)
            }
            Self::TaskNotFound { task_id } => {
                write!(f, "Task '{}' not found", task_id)
            }
            Self::InvalidStateTransition {
                instance_id,
                state,
                operation,
            } => {
                write!(
                    f,
                    "Instance {} in state '{}' does not allow operation '{}'",
                    instance_id, state, operation
                )
            }
            Self::PathConflict {
                machine_id,
                deploy_path,
                occupied_by_instance,
                occupied_by_process,
            } => {
                write!(
                    f,
                    "Deploy path '{}' on machine {} is already occupied by instance {} of process {}",
                    deploy_path, machine_id, occupied_by_instance, occupied_by_process
                )
            }
            Self::MinimumInstances {
                process_id,
                current,
                removing,
            } => {
                write!(
                    f,
                    "Process {} must keep at least one instance: has {}, cannot remove {}",
                    process_id, current, removing
                )
            }
            Self::ValidationError { message } => {
                write!(f, "Validation error: {}", message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CoreError::ProcessNotFound { process_id: 1 }.error_code(),
            "PROCESS_NOT_FOUND"
        );
        assert_eq!(
            CoreError::PathConflict {
                machine_id: 1,
                deploy_path: "/opt/ls/1".to_string(),
                occupied_by_instance: 7,
                occupied_by_process: 3,
            }
            .error_code(),
            "PATH_CONFLICT"
        );
        assert_eq!(
            CoreError::validation("bad request").error_code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn test_display() {
        let err = CoreError::InvalidStateTransition {
            instance_id: 42,
            state: "running".to_string(),
            operation: "initialize".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Instance 42 in state 'running' does not allow operation 'initialize'"
        );

        let err = CoreError::MinimumInstances {
            process_id: 5,
            current: 1,
            removing: 1,
        };
        assert_eq!(
            err.to_string(),
            "Process 5 must keep at least one instance: has 1, cannot remove 1"
        );
    }
}
