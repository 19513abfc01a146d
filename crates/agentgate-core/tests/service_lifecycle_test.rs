//! Integration tests for the work-order service: transitions through the
//! full status graph, cancellation from every permitted status, and
//! recursion-tree bookkeeping.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use agentgate_core::error::AgentGateError;
use agentgate_core::process::{ProcessManager, ProcessManagerConfig};
use agentgate_core::queue::{QueueConfig, SchedulerQueue};
use agentgate_core::retry::{RetryConfig, RetryManager};
use agentgate_core::service::{SubmitLimits, SubmitRequest, WorkOrderService};
use agentgate_store::WorkOrderStore;
use agentgate_store::models::{AgentKind, WorkOrderStatus, WorkspaceSource};
use agentgate_test_utils::TestDataDir;

fn service_with_limits(data: &TestDataDir, limits: SubmitLimits) -> WorkOrderService {
    let (queue_tx, _queue_rx) = mpsc::unbounded_channel();
    let (proc_tx, _proc_rx) = mpsc::unbounded_channel();
    let (retry_tx, _retry_rx) = mpsc::unbounded_channel();
    WorkOrderService::new(
        Arc::new(WorkOrderStore::new(data.path())),
        Arc::new(SchedulerQueue::new(QueueConfig::default(), queue_tx)),
        Arc::new(ProcessManager::new(ProcessManagerConfig::default(), proc_tx)),
        Arc::new(RetryManager::new(RetryConfig::default(), retry_tx)),
        limits,
    )
}

fn service(data: &TestDataDir) -> WorkOrderService {
    service_with_limits(data, SubmitLimits::default())
}

fn request(prompt: &str) -> SubmitRequest {
    SubmitRequest {
        prompt: prompt.to_owned(),
        workspace: WorkspaceSource::LocalPath {
            path: PathBuf::from("/tmp"),
        },
        agent: AgentKind::ClaudeCode,
        max_iterations: None,
        max_wall_clock_secs: None,
        gate_plan: None,
        policies: None,
        parent_id: None,
    }
}

#[tokio::test]
async fn recursion_path_reaches_succeeded() {
    // queued -> running -> waiting_for_children -> integrating -> succeeded
    let data = TestDataDir::new();
    let svc = service(&data);

    let order = svc.submit(request("parent with children")).await.unwrap();
    svc.mark_running(&order.id, "run_1").await.unwrap();
    let waiting = svc.mark_waiting_for_children(&order.id).await.unwrap();
    assert_eq!(waiting.status, WorkOrderStatus::WaitingForChildren);

    let integrating = svc.mark_integrating(&order.id).await.unwrap();
    assert_eq!(integrating.status, WorkOrderStatus::Integrating);

    let done = svc.mark_succeeded(&order.id).await.unwrap();
    assert_eq!(done.status, WorkOrderStatus::Succeeded);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn illegal_shortcuts_are_rejected_without_writes() {
    let data = TestDataDir::new();
    let svc = service(&data);

    let order = svc.submit(request("task")).await.unwrap();

    // queued cannot jump to integrating or waiting_for_children.
    assert!(svc.mark_integrating(&order.id).await.is_err());
    assert!(svc.mark_waiting_for_children(&order.id).await.is_err());
    assert_eq!(
        svc.load(&order.id).await.unwrap().status,
        WorkOrderStatus::Queued
    );

    // waiting_for_children cannot succeed directly.
    svc.mark_running(&order.id, "run_1").await.unwrap();
    svc.mark_waiting_for_children(&order.id).await.unwrap();
    let result = svc.mark_succeeded(&order.id).await;
    assert!(matches!(
        result,
        Err(AgentGateError::InvalidTransition { .. })
    ));
    assert_eq!(
        svc.load(&order.id).await.unwrap().status,
        WorkOrderStatus::WaitingForChildren
    );
}

#[tokio::test]
async fn cancel_permitted_from_every_live_status() {
    let data = TestDataDir::new();
    let svc = service(&data);

    // Queued.
    let queued = svc.submit(request("queued")).await.unwrap();
    assert_eq!(
        svc.cancel(&queued.id).await.unwrap().status,
        WorkOrderStatus::Canceled
    );

    // Running.
    let running = svc.submit(request("running")).await.unwrap();
    svc.mark_running(&running.id, "run_1").await.unwrap();
    assert_eq!(
        svc.cancel(&running.id).await.unwrap().status,
        WorkOrderStatus::Canceled
    );

    // Waiting for children.
    let waiting = svc.submit(request("waiting")).await.unwrap();
    svc.mark_running(&waiting.id, "run_1").await.unwrap();
    svc.mark_waiting_for_children(&waiting.id).await.unwrap();
    assert_eq!(
        svc.cancel(&waiting.id).await.unwrap().status,
        WorkOrderStatus::Canceled
    );

    // Integrating.
    let integrating = svc.submit(request("integrating")).await.unwrap();
    svc.mark_running(&integrating.id, "run_1").await.unwrap();
    svc.mark_waiting_for_children(&integrating.id).await.unwrap();
    svc.mark_integrating(&integrating.id).await.unwrap();
    assert_eq!(
        svc.cancel(&integrating.id).await.unwrap().status,
        WorkOrderStatus::Canceled
    );

    // Failed is terminal for cancel.
    let failed = svc.submit(request("failed")).await.unwrap();
    svc.mark_running(&failed.id, "run_1").await.unwrap();
    svc.mark_failed(&failed.id, "boom").await.unwrap();
    assert!(svc.cancel(&failed.id).await.is_err());
}

#[tokio::test]
async fn sibling_indexes_count_up() {
    let data = TestDataDir::new();
    let svc = service(&data);

    let parent = svc.submit(request("root")).await.unwrap();
    for expected in 0..3u32 {
        let mut req = request("child");
        req.parent_id = Some(parent.id.clone());
        let child = svc.submit(req).await.unwrap();
        assert_eq!(child.sibling_index, expected);
        assert_eq!(child.depth, 1);
        assert_eq!(child.root_id.as_deref(), Some(parent.id.as_str()));
    }

    let parent = svc.load(&parent.id).await.unwrap();
    assert_eq!(parent.child_ids.len(), 3);
}

#[tokio::test]
async fn tree_size_limit_counts_the_whole_tree() {
    let data = TestDataDir::new();
    let svc = service_with_limits(
        &data,
        SubmitLimits {
            max_tree_size: 3,
            ..Default::default()
        },
    );

    let root = svc.submit(request("root")).await.unwrap();

    let mut req = request("child a");
    req.parent_id = Some(root.id.clone());
    let child_a = svc.submit(req).await.unwrap();

    let mut req = request("grandchild");
    req.parent_id = Some(child_a.id.clone());
    svc.submit(req).await.unwrap();

    // Tree now holds 3 work orders; a fourth anywhere in it is rejected.
    let mut req = request("one too many");
    req.parent_id = Some(root.id.clone());
    let result = svc.submit(req).await;
    assert!(matches!(result, Err(AgentGateError::Validation(_))));
}

#[tokio::test]
async fn submit_with_unknown_parent_is_rejected() {
    let data = TestDataDir::new();
    let svc = service(&data);

    let mut req = request("orphan child");
    req.parent_id = Some("wo_never_existed".to_owned());
    let result = svc.submit(req).await;
    assert!(matches!(result, Err(AgentGateError::Validation(_))));
}
