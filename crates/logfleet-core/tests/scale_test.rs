// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scaling protocol: path conflicts, the minimum-one invariant, force
//! semantics, and history retention for removed instances.

mod common;

use common::*;
use logfleet_core::error::CoreError;
use logfleet_core::persistence::Persistence;
use logfleet_core::scale::ScaleRequest;

#[tokio::test]
async fn scale_out_with_custom_path_deploys_and_starts_the_new_instance() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let m2 = add_machine(&h.store, "m2").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let existing = add_instance(&h.store, process_id, m1, "/opt/ls/1", "running").await;
    h.store.update_instance_pid(existing, Some("9999")).await.unwrap();

    h.remote.respond("echo \"exists\"", "exists").await;
    h.remote.respond(".pid 2>/dev/null", "4242\n").await;
    h.remote.respond("ps -p 4242 -o pid=", "4242").await;

    let request = ScaleRequest {
        add_machine_ids: vec![m2],
        custom_deploy_path: Some("/custom/path".to_string()),
        ..Default::default()
    };
    let task_id = h.orchestrator.scale(process_id, &request).await.unwrap();
    let task = wait_for_task(&h.store, &task_id).await;
    assert_eq!(task.status, "completed");

    let instances = h.store.list_instances_by_process(process_id).await.unwrap();
    assert_eq!(instances.len(), 2);
    let new_instance = instances.iter().find(|i| i.machine_id == m2).unwrap();
    assert_eq!(new_instance.deploy_path, "/custom/path");
    assert_eq!(new_instance.state, "running");
    assert_eq!(new_instance.pid.as_deref(), Some("4242"));

    // The pre-existing instance was untouched.
    let untouched = h.store.get_instance(existing).await.unwrap().unwrap();
    assert_eq!(untouched.state, "running");
    assert_eq!(untouched.pid.as_deref(), Some("9999"));

    // One task drove the whole initialize+start sequence.
    let detail = h.orchestrator.task_detail(&task_id).await.unwrap().unwrap();
    assert_eq!(detail.total_steps, 7);
    assert_eq!(detail.counts.completed, 7);
}

#[tokio::test]
async fn scale_out_onto_an_occupied_path_fails_and_creates_nothing() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let occupant = add_instance(&h.store, process_id, m1, "/opt/ls/1", "running").await;

    let request = ScaleRequest {
        add_machine_ids: vec![m1],
        custom_deploy_path: Some("/opt/ls/1".to_string()),
        ..Default::default()
    };
    let err = h.orchestrator.scale(process_id, &request).await.unwrap_err();

    match err {
        CoreError::PathConflict {
            machine_id,
            deploy_path,
            occupied_by_instance,
            ..
        } => {
            assert_eq!(machine_id, m1);
            assert_eq!(deploy_path, "/opt/ls/1");
            assert_eq!(occupied_by_instance, occupant);
        }
        other => panic!("expected PathConflict, got {:?}", other),
    }

    // No row was created, no task submitted.
    assert_eq!(
        h.store.list_instances_by_process(process_id).await.unwrap().len(),
        1
    );
    assert!(h.store.list_tasks_by_process(process_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn scale_out_same_machine_different_path_is_allowed() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    add_instance(&h.store, process_id, m1, "/opt/ls/1", "not_started").await;

    h.remote.respond("echo \"exists\"", "exists").await;
    h.remote.respond(".pid 2>/dev/null", "4242\n").await;
    h.remote.respond("ps -p 4242 -o pid=", "4242").await;

    let request = ScaleRequest {
        add_machine_ids: vec![m1],
        custom_deploy_path: Some("/opt/ls/2".to_string()),
        ..Default::default()
    };
    let task_id = h.orchestrator.scale(process_id, &request).await.unwrap();
    wait_for_task(&h.store, &task_id).await;

    // Two instances of the same process on one machine, at distinct paths.
    let instances = h.store.list_instances_by_process(process_id).await.unwrap();
    assert_eq!(instances.len(), 2);
}

#[tokio::test]
async fn scale_in_to_zero_instances_is_rejected() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let only = add_instance(&h.store, process_id, m1, "/opt/ls/1", "not_started").await;

    let request = ScaleRequest {
        remove_instance_ids: vec![only],
        ..Default::default()
    };
    let err = h.orchestrator.scale(process_id, &request).await.unwrap_err();
    assert!(matches!(err, CoreError::MinimumInstances { .. }));

    // All-or-nothing: the instance is still there.
    assert_eq!(
        h.store.list_instances_by_process(process_id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn scale_in_of_a_running_instance_requires_force() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let m2 = add_machine(&h.store, "m2").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let running = add_instance(&h.store, process_id, m1, "/opt/ls/1", "running").await;
    add_instance(&h.store, process_id, m2, "/opt/ls/2", "not_started").await;

    let request = ScaleRequest {
        remove_instance_ids: vec![running],
        force: false,
        ..Default::default()
    };
    let err = h.orchestrator.scale(process_id, &request).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError { .. }));

    // Rejected before anything was mutated.
    let instance = h.store.get_instance(running).await.unwrap().unwrap();
    assert_eq!(instance.state, "running");
    assert!(h.remote.commands().await.is_empty());
}

#[tokio::test]
async fn forced_scale_in_stops_and_removes_a_running_instance() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let m2 = add_machine(&h.store, "m2").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let doomed = add_instance(&h.store, process_id, m1, "/opt/ls/1", "running").await;
    let survivor = add_instance(&h.store, process_id, m2, "/opt/ls/2", "not_started").await;
    h.store.update_instance_pid(doomed, Some("4711")).await.unwrap();

    h.remote.respond("if ps -p 4711", "stopped").await;

    let request = ScaleRequest {
        remove_instance_ids: vec![doomed],
        force: true,
        ..Default::default()
    };
    let task_id = h.orchestrator.scale(process_id, &request).await.unwrap();
    let task = wait_for_task(&h.store, &task_id).await;
    assert_eq!(task.status, "completed");

    // The instance row is gone; the survivor is untouched.
    assert!(h.store.get_instance(doomed).await.unwrap().is_none());
    assert!(h.store.get_instance(survivor).await.unwrap().is_some());

    // The remote directory was cleaned up.
    assert!(h.remote.command_count("rm -rf /opt/ls/1").await >= 1);

    // Audit trail: the scale task and its steps are retained even though the
    // instance row is gone.
    let task_ids = h.orchestrator.instance_task_ids(doomed).await.unwrap();
    assert!(task_ids.contains(&task_id));
    let steps = h.store.list_steps_by_task(&task_id).await.unwrap();
    assert!(steps.iter().any(|s| s.instance_id == doomed));
}

#[tokio::test]
async fn forced_scale_in_removes_the_instance_even_when_the_stop_fails() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let m2 = add_machine(&h.store, "m2").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let doomed = add_instance(&h.store, process_id, m1, "/opt/ls/1", "running").await;
    add_instance(&h.store, process_id, m2, "/opt/ls/2", "not_started").await;
    h.store.update_instance_pid(doomed, Some("4711")).await.unwrap();

    // The process refuses to die: stop fails, removal proceeds anyway.
    h.remote.respond("if ps -p 4711", "running").await;

    let request = ScaleRequest {
        remove_instance_ids: vec![doomed],
        force: true,
        ..Default::default()
    };
    let task_id = h.orchestrator.scale(process_id, &request).await.unwrap();
    let task = wait_for_task(&h.store, &task_id).await;

    // Force mode's contract is "remove regardless".
    assert!(h.store.get_instance(doomed).await.unwrap().is_none());
    // The failed stop is still visible in the audit trail.
    assert_eq!(task.status, "failed");
    let detail = h.orchestrator.task_detail(&task_id).await.unwrap().unwrap();
    assert!(detail.counts.failed >= 1);
}

#[tokio::test]
async fn scale_request_with_both_directions_is_rejected() {
    let h = harness();
    let m1 = add_machine(&h.store, "m1").await;
    let process_id = add_process(&h.store, "nginx-access").await;
    let instance = add_instance(&h.store, process_id, m1, "/opt/ls/1", "not_started").await;

    let request = ScaleRequest {
        add_machine_ids: vec![m1],
        remove_instance_ids: vec![instance],
        ..Default::default()
    };
    let err = h.orchestrator.scale(process_id, &request).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError { .. }));

    let empty = ScaleRequest::default();
    let err = h.orchestrator.scale(process_id, &empty).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError { .. }));
}
