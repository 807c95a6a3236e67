// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator surface: process creation, restart, and pre-flight validation.

mod common;

use common::*;
use logfleet_core::error::CoreError;
use logfleet_core::orchestrator::CreateProcessRequest;
use logfleet_core::persistence::Persistence;
use logfleet_core::remote::MockRemoteExecutor;

fn create_request(name: &str, machine_ids: Vec<i64>) -> CreateProcessRequest {
    CreateProcessRequest {
        name: name.to_string(),
        module: "nginx".to_string(),
        pipeline_config: "input {}\noutput {}".to_string(),
        jvm_options: Some("-Xms512m -Xmx512m".to_string()),
        machine_ids,
        custom_deploy_path: None,
        deploy_base_dir: None,
    }
}

#[tokio::test]
async fn create_process_creates_instances_and_initializes_them() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let m2 = add_machine(&h.store, "m2").await;

    h.remote.respond("echo \"exists\"", "exists").await;

    let created = h
        .orchestrator
        .create_process(&create_request("nginx-access", vec![m1, m2]))
        .await
        .unwrap();
    assert_eq!(created.instance_ids.len(), 2);

    let task = wait_for_task(&h.store, &created.task_id).await;
    assert_eq!(task.status, "completed");

    let instances = h.store.list_instances_by_process(created.process_id).await.unwrap();
    assert_eq!(instances.len(), 2);
    for instance in &instances {
        assert_eq!(instance.state, "not_started");
        // Default path: {deploy_base_dir}/shipper-{process_id}
        assert_eq!(
            instance.deploy_path,
            format!("/opt/logfleet/shipper-{}", created.process_id)
        );
    }

    // JVM options were written during the system-config step.
    assert!(h.remote.command_count("jvm.options").await >= 2);
}

#[tokio::test]
async fn duplicate_process_name_is_rejected() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    add_process(&h.store, "nginx-access").await;

    let err = h
        .orchestrator
        .create_process(&create_request("nginx-access", vec![m1]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationError { .. }));
}

#[tokio::test]
async fn create_process_requires_machines() {
    let h = harness();
    let err = h
        .orchestrator
        .create_process(&create_request("nginx-access", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationError { .. }));
}

#[tokio::test]
async fn restart_stops_then_starts_in_one_task() {
    let h = harness();
    let machine_id = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let instance_id = add_instance(&h.store, process_id, machine_id, "/opt/ls/1", "running").await;
    h.store.update_instance_pid(instance_id, Some("4711")).await.unwrap();

    h.remote.respond("if ps -p 4711", "stopped").await;
    h.remote.respond(".pid 2>/dev/null", "5555\n").await;
    h.remote.respond("ps -p 5555 -o pid=", "5555").await;

    let task_id = h.orchestrator.restart_instance(instance_id).await.unwrap();
    let task = wait_for_task(&h.store, &task_id).await;

    assert_eq!(task.status, "completed");
    assert_eq!(task.instance_id, Some(instance_id));

    let instance = h.store.get_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.state, "running");
    assert_eq!(instance.pid.as_deref(), Some("5555"));

    let detail = h.orchestrator.task_detail(&task_id).await.unwrap().unwrap();
    assert_eq!(detail.total_steps, 3); // stop, start, verify
    assert_eq!(detail.counts.completed, 3);
}

#[tokio::test]
async fn restart_skips_the_start_half_when_the_stop_fails() {
    let h = harness();
    let machine_id = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let instance_id = add_instance(&h.store, process_id, machine_id, "/opt/ls/1", "running").await;
    h.store.update_instance_pid(instance_id, Some("4711")).await.unwrap();

    h.remote.respond("if ps -p 4711", "running").await;

    let task_id = h.orchestrator.restart_instance(instance_id).await.unwrap();
    let task = wait_for_task(&h.store, &task_id).await;
    assert_eq!(task.status, "failed");

    let detail = h.orchestrator.task_detail(&task_id).await.unwrap().unwrap();
    assert_eq!(detail.counts.failed, 1); // stop
    assert_eq!(detail.counts.skipped, 2); // start + verify never ran

    let instance = h.store.get_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.state, "stop_failed");
}

#[tokio::test]
async fn restart_requires_a_stoppable_state() {
    let h = harness();
    let machine_id = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let instance_id =
        add_instance(&h.store, process_id, machine_id, "/opt/ls/1", "not_started").await;

    let err = h.orchestrator.restart_instance(instance_id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn restart_rejects_an_unreachable_machine_before_creating_a_task() {
    let h = harness_with_remote(MockRemoteExecutor::unreachable());
    let machine_id = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let instance_id = add_instance(&h.store, process_id, machine_id, "/opt/ls/1", "running").await;

    let err = h.orchestrator.restart_instance(instance_id).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError { .. }));
    assert!(h.store.list_tasks_by_process(process_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn task_history_is_queryable_per_process_and_instance() {
    let h = harness();
    let machine_id = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let instance_id =
        add_instance(&h.store, process_id, machine_id, "/opt/ls/1", "not_started").await;

    h.remote.respond("echo \"exists\"", "exists").await;

    let first = h.orchestrator.initialize(process_id, None).await.unwrap();
    wait_for_task(&h.store, &first).await;
    let second = h.orchestrator.initialize(process_id, None).await.unwrap();
    wait_for_task(&h.store, &second).await;

    let by_process = h.orchestrator.process_task_ids(process_id).await.unwrap();
    assert_eq!(by_process.len(), 2);

    let by_instance = h.orchestrator.instance_task_ids(instance_id).await.unwrap();
    assert!(by_instance.contains(&first));
    assert!(by_instance.contains(&second));
}
