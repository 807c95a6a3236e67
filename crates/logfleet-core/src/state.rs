// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle state machine.
//!
//! One [`StateHandler`] entry owns one state's rules: which operations are
//! legal there and what the next state is once an operation resolves. The
//! handlers live in a fixed dispatch table built from a table literal - no
//! registry, no dynamic dispatch.
//!
//! The driver ([`StateMachine::run_operation`]) persists a transient
//! "in-progress" state before any remote work and the final state after the
//! outcome is known. A crash between the two writes leaves the instance in
//! the transient state; the reconciler deliberately does not touch transient
//! states, so recovery from such a crash is an operator decision informed by
//! task status.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::persistence::{InstanceRecord, MachineRecord, Persistence, ProcessRecord};
use crate::remote::RemoteExecutor;
use crate::steps::{
    INITIALIZE_SEQUENCE, START_SEQUENCE, STOP_SEQUENCE, StepKind, StepTimings,
};
use crate::task::TaskRunner;

/// Lifecycle states of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Initial state; also the state after a clean stop or a (possibly
    /// failed) initialize. Ready to be initialized or started.
    NotStarted,
    /// Initialize steps in flight.
    Initializing,
    /// The last start attempt failed. Re-initialize to retry.
    StartFailed,
    /// Start steps in flight.
    Starting,
    /// The shipper process is believed to be running.
    Running,
    /// Stop steps in flight.
    Stopping,
    /// The last stop attempt failed; the process may still be alive.
    /// Stop can be retried from here.
    StopFailed,
}

impl InstanceState {
    /// Storage string for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Initializing => "initializing",
            Self::StartFailed => "start_failed",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::StopFailed => "stop_failed",
        }
    }

    /// Parse a storage string back into a state.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "initializing" => Some(Self::Initializing),
            "start_failed" => Some(Self::StartFailed),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stop_failed" => Some(Self::StopFailed),
            _ => None,
        }
    }
}

/// Operations the orchestrator can run against instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Prepare the deploy directory: package, config, system config.
    Initialize,
    /// Spawn and verify the shipper process.
    Start,
    /// Stop the shipper process.
    Stop,
    /// Emergency stop: runs the stop steps but forces the final state to
    /// NOT_STARTED regardless of outcome.
    ForceStop,
    /// Stop followed by start, as one task.
    Restart,
    /// Scale-out: initialize + start newly created instances.
    ScaleOut,
    /// Scale-in: stop (forced) + delete directory for removed instances.
    ScaleIn,
}

/// Restart runs the stop sequence and then the start sequence.
pub const RESTART_SEQUENCE: &[StepKind] = &[
    StepKind::StopProcess,
    StepKind::StartProcess,
    StepKind::VerifyProcess,
];

/// Scale-out runs the full initialize sequence and then the start sequence.
pub const SCALE_OUT_SEQUENCE: &[StepKind] = &[
    StepKind::CreateRemoteDir,
    StepKind::UploadPackage,
    StepKind::ExtractPackage,
    StepKind::WriteConfig,
    StepKind::ApplySystemConfig,
    StepKind::StartProcess,
    StepKind::VerifyProcess,
];

/// Scale-in stops the instance (when forced) and deletes its directory.
pub const SCALE_IN_SEQUENCE: &[StepKind] =
    &[StepKind::StopProcess, StepKind::DeleteDirectory];

impl OperationType {
    /// Storage string for this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ForceStop => "force_stop",
            Self::Restart => "restart",
            Self::ScaleOut => "scale_out",
            Self::ScaleIn => "scale_in",
        }
    }

    /// The fixed step sequence this operation executes.
    pub fn step_sequence(&self) -> &'static [StepKind] {
        match self {
            Self::Initialize => INITIALIZE_SEQUENCE,
            Self::Start => START_SEQUENCE,
            Self::Stop | Self::ForceStop => STOP_SEQUENCE,
            Self::Restart => RESTART_SEQUENCE,
            Self::ScaleOut => SCALE_OUT_SEQUENCE,
            Self::ScaleIn => SCALE_IN_SEQUENCE,
        }
    }
}

/// Per-state behavior: capability predicates plus the next-state function.
pub struct StateHandler {
    /// The state this handler owns.
    pub state: InstanceState,
    /// Whether initialize may run from this state.
    pub can_initialize: bool,
    /// Whether start may run from this state.
    pub can_start: bool,
    /// Whether stop may run from this state.
    pub can_stop: bool,
    /// Next state once an operation launched from this state resolves.
    pub next_state: fn(OperationType, bool) -> InstanceState,
}

static NOT_STARTED: StateHandler = StateHandler {
    state: InstanceState::NotStarted,
    can_initialize: true,
    can_start: true,
    can_stop: false,
    next_state: |op, success| match op {
        // Initialize lands back in NOT_STARTED either way: on success the
        // instance is ready to start, on failure the operator re-runs it.
        OperationType::Initialize => InstanceState::NotStarted,
        OperationType::Start => {
            if success {
                InstanceState::Running
            } else {
                InstanceState::StartFailed
            }
        }
        _ => InstanceState::NotStarted,
    },
};

static INITIALIZING: StateHandler = StateHandler {
    state: InstanceState::Initializing,
    can_initialize: false,
    can_start: false,
    // Stopping an INITIALIZING instance is the supported cancellation.
    can_stop: true,
    next_state: |op, _success| match op {
        OperationType::Stop => InstanceState::NotStarted,
        _ => InstanceState::Initializing,
    },
};

static START_FAILED: StateHandler = StateHandler {
    state: InstanceState::StartFailed,
    can_initialize: true,
    can_start: false,
    can_stop: false,
    next_state: |op, _success| match op {
        OperationType::Initialize => InstanceState::NotStarted,
        _ => InstanceState::StartFailed,
    },
};

static STARTING: StateHandler = StateHandler {
    state: InstanceState::Starting,
    can_initialize: false,
    can_start: false,
    can_stop: false,
    next_state: |_op, _success| InstanceState::Starting,
};

static RUNNING: StateHandler = StateHandler {
    state: InstanceState::Running,
    can_initialize: false,
    can_start: false,
    can_stop: true,
    next_state: |op, success| match op {
        OperationType::Stop => {
            if success {
                InstanceState::NotStarted
            } else {
                InstanceState::StopFailed
            }
        }
        _ => InstanceState::Running,
    },
};

static STOPPING: StateHandler = StateHandler {
    state: InstanceState::Stopping,
    can_initialize: false,
    can_start: false,
    can_stop: false,
    next_state: |_op, _success| InstanceState::Stopping,
};

static STOP_FAILED: StateHandler = StateHandler {
    state: InstanceState::StopFailed,
    can_initialize: false,
    can_start: false,
    can_stop: true,
    next_state: |op, success| match op {
        OperationType::Stop => {
            if success {
                InstanceState::NotStarted
            } else {
                InstanceState::StopFailed
            }
        }
        _ => InstanceState::StopFailed,
    },
};

/// Get the handler owning a state.
pub fn handler(state: InstanceState) -> &'static StateHandler {
    match state {
        InstanceState::NotStarted => &NOT_STARTED,
        InstanceState::Initializing => &INITIALIZING,
        InstanceState::StartFailed => &START_FAILED,
        InstanceState::Starting => &STARTING,
        InstanceState::Running => &RUNNING,
        InstanceState::Stopping => &STOPPING,
        InstanceState::StopFailed => &STOP_FAILED,
    }
}

/// The transient "in-progress" state persisted while an operation runs.
pub fn transient_state(op: OperationType) -> InstanceState {
    match op {
        OperationType::Initialize => InstanceState::Initializing,
        OperationType::Start => InstanceState::Starting,
        OperationType::Stop | OperationType::ForceStop => InstanceState::Stopping,
        // Composite operations begin with their first half.
        OperationType::Restart | OperationType::ScaleIn => InstanceState::Stopping,
        OperationType::ScaleOut => InstanceState::Initializing,
    }
}

/// Compute the state an instance lands in once `op`, launched from `from`,
/// resolves with `success`.
///
/// Force-stop overrides the per-state tables: the contract is NOT_STARTED
/// regardless of what the stop commands did.
pub fn next_state(from: InstanceState, op: OperationType, success: bool) -> InstanceState {
    if matches!(op, OperationType::ForceStop) {
        return InstanceState::NotStarted;
    }
    (handler(from).next_state)(op, success)
}

/// Validate that `op` is legal from the instance's current state.
///
/// Fails fast with a validation error - no remote work is attempted for a
/// denied operation.
pub fn ensure_allowed(op: OperationType, instance: &InstanceRecord) -> Result<(), CoreError> {
    let state = InstanceState::parse(&instance.state).ok_or_else(|| {
        CoreError::validation(format!(
            "instance {} has unknown state '{}'",
            instance.id, instance.state
        ))
    })?;
    let handler = handler(state);
    let allowed = match op {
        OperationType::Initialize => handler.can_initialize,
        OperationType::Start => handler.can_start,
        OperationType::Stop | OperationType::Restart => handler.can_stop,
        // Force-stop is the emergency hatch; it skips the capability check.
        OperationType::ForceStop => true,
        // Scaling operations do their own validation in the controller.
        OperationType::ScaleOut | OperationType::ScaleIn => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(CoreError::InvalidStateTransition {
            instance_id: instance.id,
            state: instance.state.clone(),
            operation: op.as_str().to_string(),
        })
    }
}

/// Drives operations through the handler table, persisting instance state
/// around the task runner's step sweep.
pub struct StateMachine {
    persistence: Arc<dyn Persistence>,
    remote: Arc<dyn RemoteExecutor>,
    runner: Arc<TaskRunner>,
    config: Config,
    timings: StepTimings,
}

impl StateMachine {
    /// Create a state machine over the given collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        remote: Arc<dyn RemoteExecutor>,
        runner: Arc<TaskRunner>,
        config: Config,
        timings: StepTimings,
    ) -> Self {
        Self {
            persistence,
            remote,
            runner,
            config,
            timings,
        }
    }

    /// Persist a state, clearing the recorded PID when the state implies the
    /// process is gone.
    async fn set_state(&self, instance_id: i64, state: InstanceState) -> Result<(), CoreError> {
        self.persistence
            .update_instance_state(instance_id, state.as_str())
            .await?;
        if state == InstanceState::NotStarted {
            self.persistence.update_instance_pid(instance_id, None).await?;
        }
        Ok(())
    }

    /// Execute `op`'s step sequence for `targets` under `task_id`, managing
    /// per-instance state transitions.
    ///
    /// Every target is moved to the operation's transient state before any
    /// remote work, then to its final state (per its original handler) once
    /// its outcome is known. Returns the per-instance success map.
    pub async fn run_operation(
        &self,
        task_id: &str,
        op: OperationType,
        process: &ProcessRecord,
        targets: &[(InstanceRecord, MachineRecord)],
    ) -> Result<HashMap<i64, bool>, CoreError> {
        self.run_steps_with_transitions(task_id, op, op.step_sequence(), process, targets)
            .await
    }

    /// Like [`run_operation`](Self::run_operation) but executes only the
    /// given subset of the operation's steps. Composite operations (restart,
    /// scale-out) use this to run their halves against one shared task.
    pub async fn run_steps_with_transitions(
        &self,
        task_id: &str,
        op: OperationType,
        kinds: &[StepKind],
        process: &ProcessRecord,
        targets: &[(InstanceRecord, MachineRecord)],
    ) -> Result<HashMap<i64, bool>, CoreError> {
        let mut original_states: HashMap<i64, InstanceState> = HashMap::new();
        for (instance, _) in targets {
            let state = InstanceState::parse(&instance.state)
                .unwrap_or(InstanceState::NotStarted);
            original_states.insert(instance.id, state);
            self.set_state(instance.id, transient_state(op)).await?;
            info!(
                instance_id = instance.id,
                operation = op.as_str(),
                from = state.as_str(),
                transient = transient_state(op).as_str(),
                "operation started"
            );
        }

        let outcomes = self
            .runner
            .run_sequence(
                task_id,
                kinds,
                process,
                targets,
                self.remote.as_ref(),
                &self.config,
                &self.timings,
            )
            .await?;

        for (instance, _) in targets {
            let success = outcomes.get(&instance.id).copied().unwrap_or(false);
            let from = original_states[&instance.id];
            let final_state = next_state(from, op, success);
            self.set_state(instance.id, final_state).await?;
            if success {
                info!(
                    instance_id = instance.id,
                    operation = op.as_str(),
                    state = final_state.as_str(),
                    "operation completed"
                );
            } else {
                warn!(
                    instance_id = instance.id,
                    operation = op.as_str(),
                    state = final_state.as_str(),
                    "operation failed"
                );
            }
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn instance_in(state: InstanceState) -> InstanceRecord {
        InstanceRecord {
            id: 1,
            process_id: 1,
            machine_id: 1,
            deploy_path: "/opt/ls/1".to_string(),
            state: state.as_str().to_string(),
            pid: None,
            state_changed_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            InstanceState::NotStarted,
            InstanceState::Initializing,
            InstanceState::StartFailed,
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::StopFailed,
        ] {
            assert_eq!(InstanceState::parse(state.as_str()), Some(state));
        }
        assert_eq!(InstanceState::parse("bogus"), None);
    }

    #[test]
    fn test_capability_matrix() {
        // initialize: NOT_STARTED and START_FAILED only
        assert!(ensure_allowed(OperationType::Initialize, &instance_in(InstanceState::NotStarted)).is_ok());
        assert!(ensure_allowed(OperationType::Initialize, &instance_in(InstanceState::StartFailed)).is_ok());
        assert!(ensure_allowed(OperationType::Initialize, &instance_in(InstanceState::Running)).is_err());

        // start: NOT_STARTED only
        assert!(ensure_allowed(OperationType::Start, &instance_in(InstanceState::NotStarted)).is_ok());
        assert!(ensure_allowed(OperationType::Start, &instance_in(InstanceState::StartFailed)).is_err());
        assert!(ensure_allowed(OperationType::Start, &instance_in(InstanceState::Running)).is_err());

        // stop: RUNNING, STOP_FAILED, and INITIALIZING (cancel)
        assert!(ensure_allowed(OperationType::Stop, &instance_in(InstanceState::Running)).is_ok());
        assert!(ensure_allowed(OperationType::Stop, &instance_in(InstanceState::StopFailed)).is_ok());
        assert!(ensure_allowed(OperationType::Stop, &instance_in(InstanceState::Initializing)).is_ok());
        assert!(ensure_allowed(OperationType::Stop, &instance_in(InstanceState::NotStarted)).is_err());
        assert!(ensure_allowed(OperationType::Stop, &instance_in(InstanceState::Starting)).is_err());
    }

    #[test]
    fn test_transition_table() {
        use InstanceState::*;
        use OperationType::*;

        // initialize lands in NOT_STARTED whether it worked or not
        assert_eq!(next_state(NotStarted, Initialize, true), NotStarted);
        assert_eq!(next_state(NotStarted, Initialize, false), NotStarted);
        assert_eq!(next_state(StartFailed, Initialize, true), NotStarted);
        assert_eq!(next_state(StartFailed, Initialize, false), NotStarted);

        assert_eq!(next_state(NotStarted, Start, true), Running);
        assert_eq!(next_state(NotStarted, Start, false), StartFailed);

        assert_eq!(next_state(Running, Stop, true), NotStarted);
        assert_eq!(next_state(Running, Stop, false), StopFailed);
        assert_eq!(next_state(StopFailed, Stop, true), NotStarted);
        assert_eq!(next_state(StopFailed, Stop, false), StopFailed);

        // cancelling an initialize lands in NOT_STARTED either way
        assert_eq!(next_state(Initializing, Stop, true), NotStarted);
        assert_eq!(next_state(Initializing, Stop, false), NotStarted);

        // force-stop is unconditional
        assert_eq!(next_state(Running, ForceStop, false), NotStarted);
        assert_eq!(next_state(StopFailed, ForceStop, false), NotStarted);
    }

    #[test]
    fn test_transient_states() {
        assert_eq!(
            transient_state(OperationType::Initialize),
            InstanceState::Initializing
        );
        assert_eq!(transient_state(OperationType::Start), InstanceState::Starting);
        assert_eq!(transient_state(OperationType::Stop), InstanceState::Stopping);
        assert_eq!(
            transient_state(OperationType::ForceStop),
            InstanceState::Stopping
        );
    }

    #[test]
    fn test_force_stop_always_allowed() {
        for state in [
            InstanceState::NotStarted,
            InstanceState::Initializing,
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::StopFailed,
            InstanceState::StartFailed,
        ] {
            assert!(ensure_allowed(OperationType::ForceStop, &instance_in(state)).is_ok());
        }
    }
}
