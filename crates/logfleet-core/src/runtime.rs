// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for logfleet-core.
//!
//! This module provides [`OrchestratorRuntime`] which wires the engine into
//! an existing tokio application: the operator surface plus the background
//! liveness reconciler, with graceful shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use logfleet_core::config::Config;
//! use logfleet_core::persistence::PostgresPersistence;
//! use logfleet_core::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(PostgresPersistence::connect(&database_url).await?);
//!     let remote = Arc::new(MySshExecutor::new());
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .persistence(persistence)
//!         .remote(remote)
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await;
//!
//!     let task_id = runtime.orchestrator().start(process_id, None).await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::remote::RemoteExecutor;
use crate::steps::StepTimings;

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    remote: Option<Arc<dyn RemoteExecutor>>,
    config: Config,
    timings: StepTimings,
}

impl std::fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("remote", &self.remote.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            remote: None,
            config: Config::default(),
            timings: StepTimings::default(),
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the remote executor (required).
    pub fn remote(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Override the configuration. Defaults to [`Config::default`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Override step poll/settle budgets. Tests use [`StepTimings::fast`].
    pub fn step_timings(mut self, timings: StepTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let remote = self
            .remote
            .ok_or_else(|| anyhow::anyhow!("remote executor is required"))?;

        Ok(OrchestratorRuntimeConfig {
            persistence,
            remote,
            config: self.config,
            timings: self.timings,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    remote: Arc<dyn RemoteExecutor>,
    config: Config,
    timings: StepTimings,
}

impl std::fmt::Debug for OrchestratorRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeConfig")
            .field("persistence", &"...")
            .field("remote", &"...")
            .field("config", &self.config)
            .finish()
    }
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime, spawning the reconciler loop.
    pub async fn start(self) -> OrchestratorRuntime {
        let orchestrator = Arc::new(Orchestrator::new(
            self.persistence.clone(),
            self.remote.clone(),
            self.config.clone(),
            self.timings,
        ));

        let reconciler = Reconciler::new(
            self.persistence,
            self.remote,
            ReconcilerConfig {
                poll_interval: self.config.reconciler_interval,
                grace_window: self.config.reconciler_grace_window,
            },
        );
        let shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

        info!("orchestrator runtime started");

        OrchestratorRuntime {
            orchestrator,
            reconciler_handle,
            shutdown,
        }
    }
}

/// A running logfleet engine that can be embedded in an application.
///
/// The runtime manages:
/// - the operator surface ([`Orchestrator`])
/// - the background liveness reconciler
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    orchestrator: Arc<Orchestrator>,
    reconciler_handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// The operator surface: lifecycle operations, scaling, task status.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Check if the reconciler loop is still running.
    pub fn is_running(&self) -> bool {
        !self.reconciler_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the reconciler loop to stop and waits for it to exit. Task
    /// bodies already submitted keep running to their terminal status.
    pub async fn shutdown(self) -> Result<()> {
        info!("orchestrator runtime shutting down...");
        self.shutdown.notify_one();

        match self.reconciler_handle.await {
            Ok(()) => {
                info!("orchestrator runtime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("reconciler task panicked: {}", e);
                Err(anyhow::anyhow!("reconciler task panicked: {}", e))
            }
        }
    }
}
