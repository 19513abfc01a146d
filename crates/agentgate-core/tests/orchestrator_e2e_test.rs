//! End-to-end orchestrator tests: submit -> admit -> spawn -> stream ->
//! terminal status, against fake agents.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use agentgate_core::agent::{AgentCommandRegistry, AgentInvocation};
use agentgate_core::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorEvent};
use agentgate_core::queue::QueueConfig;
use agentgate_core::retry::RetryConfig;
use agentgate_core::service::SubmitRequest;
use agentgate_store::models::{AgentKind, WorkOrder, WorkOrderStatus, WorkspaceSource};
use agentgate_store::WorkOrderStore;
use agentgate_test_utils::{TestDataDir, failing_agent, sleepy_agent, succeeding_agent};

fn test_config(data: &TestDataDir, agent_script: &std::path::Path) -> OrchestratorConfig {
    let mut agents = AgentCommandRegistry::new();
    agents.register(
        AgentKind::ClaudeCode,
        AgentInvocation::new(agent_script.to_string_lossy(), &[]),
    );

    OrchestratorConfig {
        data_dir: data.path().to_path_buf(),
        queue: QueueConfig {
            max_concurrent: 2,
            max_queue_size: 10,
            tick_interval: Duration::from_millis(50),
        },
        retry: RetryConfig {
            base_delay: Duration::from_millis(50),
            multiplier: 1.0,
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
            max_attempts: 2,
        },
        poll_interval: Duration::from_millis(100),
        agents,
        ..Default::default()
    }
}

fn submit_request(workspace: &std::path::Path) -> SubmitRequest {
    SubmitRequest {
        prompt: "do the task".to_owned(),
        workspace: WorkspaceSource::LocalPath {
            path: workspace.to_path_buf(),
        },
        agent: AgentKind::ClaudeCode,
        max_iterations: None,
        max_wall_clock_secs: None,
        gate_plan: None,
        policies: None,
        parent_id: None,
    }
}

async fn wait_for_status(
    store: &WorkOrderStore,
    id: &str,
    status: WorkOrderStatus,
    timeout: Duration,
) -> WorkOrder {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(order) = store.load(id).await {
            if order.status == status {
                return order;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            let current = store
                .load(id)
                .await
                .map(|o| o.status.to_string())
                .unwrap_or_else(|_| "missing".to_owned());
            panic!("timed out waiting for {id} to reach {status}; currently {current}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn work_order_runs_to_succeeded() {
    let data = TestDataDir::new();
    let workspace = tempfile::tempdir().unwrap();
    let script = succeeding_agent(data.path());

    let orchestrator = Orchestrator::new(test_config(&data, &script));
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run().await })
    };

    let order = orchestrator
        .service()
        .submit(submit_request(workspace.path()))
        .await
        .expect("submit");
    assert!(orchestrator.admit(&order.id, 0).await);

    let store = data.work_orders();
    let done = wait_for_status(
        &store,
        &order.id,
        WorkOrderStatus::Succeeded,
        Duration::from_secs(10),
    )
    .await;

    // The run record captured the structured result and token usage.
    let run_id = done.run_id.expect("run id recorded");
    let run = orchestrator.runs().load(&run_id).await.expect("run saved");
    assert_eq!(run.work_order_id, order.id);
    assert_eq!(run.session_id.as_deref(), Some("sess_fake"));
    assert!(run.completed_at.is_some());

    let iterations = orchestrator.runs().load_iterations(&run_id).await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].input_tokens, 100);
    assert_eq!(iterations[0].output_tokens, 20);
    assert_eq!(iterations[0].verification_passed, Some(true));

    // Scheduler is drained.
    let stats = orchestrator.queue().stats().await;
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.running, 0);

    // The audit trail saw the lifecycle.
    let trail = orchestrator.observability().audit_trail(&order.id).await;
    assert!(!trail.is_empty());

    orchestrator.shutdown().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_agent_is_retried_until_attempts_exhausted() {
    let data = TestDataDir::new();
    let workspace = tempfile::tempdir().unwrap();
    let script = failing_agent(data.path(), 1);

    let orchestrator = Orchestrator::new(test_config(&data, &script));
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run().await })
    };

    let order = orchestrator
        .service()
        .submit(submit_request(workspace.path()))
        .await
        .expect("submit");
    orchestrator.admit(&order.id, 0).await;

    // max_attempts=2: attempt 1 fails and schedules a retry; attempt 2
    // fails and no further retry is scheduled.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let metrics = orchestrator.observability().metrics().await;
        if metrics.total_processed >= 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "second attempt never started: {metrics:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let store = data.work_orders();
    let done = wait_for_status(
        &store,
        &order.id,
        WorkOrderStatus::Failed,
        Duration::from_secs(10),
    )
    .await;
    assert!(done.error.is_some());

    // Settle, then confirm no third attempt fires.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let metrics = orchestrator.observability().metrics().await;
    assert_eq!(metrics.total_processed, 2, "exactly two attempts");
    assert_eq!(metrics.retried, 1, "one retry admission");

    orchestrator.shutdown().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_aborts_a_running_agent() {
    let data = TestDataDir::new();
    let workspace = tempfile::tempdir().unwrap();
    let script = sleepy_agent(data.path());

    let orchestrator = Orchestrator::new(test_config(&data, &script));
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run().await })
    };

    let order = orchestrator
        .service()
        .submit(submit_request(workspace.path()))
        .await
        .expect("submit");
    orchestrator.admit(&order.id, 0).await;

    let store = data.work_orders();
    wait_for_status(
        &store,
        &order.id,
        WorkOrderStatus::Running,
        Duration::from_secs(10),
    )
    .await;

    orchestrator.service().cancel(&order.id).await.expect("cancel");
    wait_for_status(
        &store,
        &order.id,
        WorkOrderStatus::Canceled,
        Duration::from_secs(10),
    )
    .await;

    orchestrator.shutdown().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn subscribers_see_agent_and_status_events() {
    let data = TestDataDir::new();
    let workspace = tempfile::tempdir().unwrap();
    let script = succeeding_agent(data.path());

    let orchestrator = Orchestrator::new(test_config(&data, &script));
    let mut events = orchestrator.subscribe().await;
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run().await })
    };

    let order = orchestrator
        .service()
        .submit(submit_request(workspace.path()))
        .await
        .expect("submit");
    orchestrator.admit(&order.id, 0).await;

    let mut saw_running = false;
    let mut saw_succeeded = false;
    let mut saw_agent_event = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !(saw_running && saw_succeeded && saw_agent_event) {
        let event = tokio::time::timeout_at(deadline, events.next())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        match event {
            OrchestratorEvent::StatusChanged { status, .. } => {
                saw_running |= status == WorkOrderStatus::Running;
                saw_succeeded |= status == WorkOrderStatus::Succeeded;
            }
            OrchestratorEvent::Agent(_) => saw_agent_event = true,
        }
    }

    orchestrator.shutdown().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn interrupted_running_work_is_readmitted_on_startup() {
    let data = TestDataDir::new();
    let workspace = tempfile::tempdir().unwrap();
    let script = succeeding_agent(data.path());

    // Simulate a crash: a work order persisted as running with no live
    // process behind it.
    let store = data.work_orders();
    let mut stranded = agentgate_test_utils::work_order("wo_stranded");
    stranded.workspace = WorkspaceSource::LocalPath {
        path: workspace.path().to_path_buf(),
    };
    stranded.status = WorkOrderStatus::Running;
    store.save(&stranded).await.unwrap();

    let orchestrator = Orchestrator::new(test_config(&data, &script));
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run().await })
    };

    // Recovery fails it, re-admits it, and the fresh attempt succeeds.
    wait_for_status(
        &store,
        "wo_stranded",
        WorkOrderStatus::Succeeded,
        Duration::from_secs(10),
    )
    .await;

    orchestrator.shutdown().await;
    runner.await.unwrap().unwrap();
}
