// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for the integration suites.

// Not every suite uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use logfleet_core::config::Config;
use logfleet_core::orchestrator::Orchestrator;
use logfleet_core::persistence::{
    MemoryPersistence, NewInstance, NewMachine, NewProcess, Persistence, TaskRecord, TaskStatus,
};
use logfleet_core::remote::MockRemoteExecutor;
use logfleet_core::steps::StepTimings;

/// An engine wired over in-memory persistence and a scripted remote.
pub struct Harness {
    pub store: Arc<MemoryPersistence>,
    pub remote: Arc<MockRemoteExecutor>,
    pub orchestrator: Orchestrator,
}

#[allow(dead_code)]
pub fn harness() -> Harness {
    harness_with_remote(MockRemoteExecutor::new())
}

/// Route engine logs to the test output when `RUST_LOG` is set. Safe to call
/// from every suite; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn harness_with_remote(remote: MockRemoteExecutor) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryPersistence::new());
    let remote = Arc::new(remote);
    let orchestrator = Orchestrator::new(
        store.clone(),
        remote.clone(),
        Config::default(),
        StepTimings::fast(),
    );
    Harness {
        store,
        remote,
        orchestrator,
    }
}

pub async fn add_machine(store: &MemoryPersistence, name: &str) -> i64 {
    store
        .insert_machine(&NewMachine {
            name: name.to_string(),
            host: format!("{}.fleet.internal", name),
            port: 22,
            username: "deploy".to_string(),
        })
        .await
        .unwrap()
}

pub async fn add_process(store: &MemoryPersistence, name: &str) -> i64 {
    store
        .insert_process(&NewProcess {
            name: name.to_string(),
            module: "nginx".to_string(),
            pipeline_config: "input {}\noutput {}".to_string(),
            jvm_options: None,
            deploy_base_dir: "/opt/logfleet".to_string(),
        })
        .await
        .unwrap()
}

pub async fn add_instance(
    store: &MemoryPersistence,
    process_id: i64,
    machine_id: i64,
    deploy_path: &str,
    state: &str,
) -> i64 {
    store
        .insert_instance(&NewInstance {
            process_id,
            machine_id,
            deploy_path: deploy_path.to_string(),
            state: state.to_string(),
        })
        .await
        .unwrap()
}

/// Poll a task until it reaches a terminal status, panicking after ~5s.
pub async fn wait_for_task(store: &MemoryPersistence, task_id: &str) -> TaskRecord {
    for _ in 0..500 {
        let task = store.get_task(task_id).await.unwrap().unwrap();
        if TaskStatus::parse(&task.status).is_some_and(|s| s.is_terminal()) {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached a terminal status", task_id);
}
