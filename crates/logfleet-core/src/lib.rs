// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Logfleet Core - Fleet Orchestration Engine
//!
//! This crate is the orchestration engine for a fleet of log-shipping agent
//! processes ("instances") deployed across a pool of remote machines. An
//! operator defines a logical **process** (pipeline configuration + JVM
//! options) and binds it to one or more **instances**, each instance being
//! one deployment of that process onto one machine at one filesystem path.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Embedding Application                        │
//! │              (HTTP API, CLI, scheduler, ...)                     │
//! └──────────────────────────────────────────────────────────────────┘
//!                │ initialize/start/stop/scale -> task id
//!                ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     OrchestratorRuntime                          │
//! │  ┌──────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │ StateMachine │  │ TaskRunner  │  │   ScaleController       │  │
//! │  │ (per-state   │  │ (bounded    │  │ (path conflicts,        │  │
//! │  │  handlers)   │  │  pool,      │  │  minimum-one, force)    │  │
//! │  │              │  │  fan-out)   │  │                         │  │
//! │  └──────────────┘  └─────────────┘  └─────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │ Reconciler (periodic liveness sweep, self-healing)         │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌──────────────────┐                 ┌────────────────────────────┐
//! │   Persistence    │                 │      RemoteExecutor        │
//! │ (Postgres or     │                 │ (transport supplied by the │
//! │  in-memory)      │                 │  embedding application)    │
//! └──────────────────┘                 └────────────────────────────┘
//! ```
//!
//! # Instance State Machine
//!
//! ```text
//!             initialize                       start
//! ┌─────────────┐ ───► ┌──────────────┐ ───► ┌──────────┐ ───► ┌─────────┐
//! │ NOT_STARTED │      │ INITIALIZING │      │ STARTING │      │ RUNNING │
//! └─────────────┘ ◄─── └──────────────┘      └──────────┘      └─────────┘
//!     ▲   ▲  done (ok or not)                     │                 │
//!     │   │                                   start failed       stop│
//!     │   │                                       ▼                 ▼
//!     │   │    initialize (retry)          ┌──────────────┐   ┌──────────┐
//!     │   └─────────────────────────────── │ START_FAILED │   │ STOPPING │
//!     │                                    └──────────────┘   └──────────┘
//!     │ stop ok                                                │        │
//!     └───────────────────────────────────────────────────◄────┘   stop │
//!     ▲                                                         failed  ▼
//!     │                  stop (retry) ok                   ┌─────────────┐
//!     └─────────────────────────────────────────────────── │ STOP_FAILED │
//!                                                          └─────────────┘
//! ```
//!
//! | State | Description |
//! |-------|-------------|
//! | `NOT_STARTED` | Initial; also after a clean stop or an initialize |
//! | `INITIALIZING` | Initialize steps in flight (stop = cancel) |
//! | `START_FAILED` | Start failed; re-initialize to retry |
//! | `STARTING` | Start steps in flight |
//! | `RUNNING` | Shipper process believed alive (reconciled) |
//! | `STOPPING` | Stop steps in flight |
//! | `STOP_FAILED` | Stop failed, process may be alive (reconciled) |
//!
//! # Tasks and Steps
//!
//! Every operation is recorded as a **task** with one **step** row per
//! (instance × step kind), written PENDING up front. Steps run in step
//! order; within a step the instances fan out concurrently and join before
//! the next step. An instance that fails a step is short-circuited (its
//! remaining steps are SKIPPED); the task is COMPLETED only if every
//! instance completed every step. Operations return their task id
//! immediately and callers poll [`Orchestrator::task_detail`].
//!
//! # Liveness Reconciliation
//!
//! A periodic sweep probes the recorded PID of RUNNING/STOP_FAILED
//! instances (`ps -p <pid>`) and resets confirmed-dead instances to
//! NOT_STARTED, clearing the PID. Unreachable hosts are conservatively
//! treated as "still alive". See [`reconciler`].
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables ([`Config::from_env`]):
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LOGFLEET_DEPLOY_BASE_DIR` | `/opt/logfleet` | Default deploy path root |
//! | `LOGFLEET_PACKAGE_PATH` | `/opt/logfleet/packages/shipper.tar.gz` | Shipper package tarball |
//! | `LOGFLEET_MAX_CONCURRENT_TASKS` | `8` | Task worker pool size |
//! | `LOGFLEET_RECONCILER_INTERVAL_MS` | `600000` | Reconciler sweep interval |
//! | `LOGFLEET_RECONCILER_GRACE_MS` | `300000` | Reconciler grace window |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`orchestrator`]: Operator surface (lifecycle, scaling, task status)
//! - [`paths`]: Deploy path construction
//! - [`persistence`]: Repository trait, Postgres and in-memory backends
//! - [`reconciler`]: Periodic liveness sweep
//! - [`remote`]: Remote executor trait and test mock
//! - [`runtime`]: Embeddable runtime with graceful shutdown
//! - [`scale`]: Scale-out / scale-in controller
//! - [`state`]: Instance state machine
//! - [`steps`]: Step executors (the units of remote work)
//! - [`task`]: Task/step execution framework

#![deny(missing_docs)]

/// Configuration from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Database migrations, embedded.
pub mod migrations;

/// Operator surface: lifecycle operations, scaling, task status.
pub mod orchestrator;

/// Deploy path construction helpers.
pub mod paths;

/// Repository trait and backends (Postgres, in-memory).
pub mod persistence;

/// Periodic liveness sweep and self-healing.
pub mod reconciler;

/// Remote executor trait and test mock.
pub mod remote;

/// Embeddable runtime wiring the engine into a tokio application.
pub mod runtime;

/// Scaling controller.
pub mod scale;

/// Instance lifecycle state machine.
pub mod state;

/// Step executors.
pub mod steps;

/// Task/step execution framework.
pub mod task;

pub use config::Config;
pub use error::{CoreError, Result};
pub use orchestrator::{CreateProcessRequest, Orchestrator, ProcessCreated};
pub use runtime::OrchestratorRuntime;
pub use scale::ScaleRequest;
pub use state::{InstanceState, OperationType};
pub use task::TaskDetail;
