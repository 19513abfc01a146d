//! Integration tests for the streaming executor against fake agents that
//! speak the stream-JSON protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentgate_core::executor::{
    self, AgentEvent, EXIT_CANCELLED, EXIT_TIMEOUT, ExecOptions,
};
use agentgate_core::process::{ProcessManager, ProcessManagerConfig};
use agentgate_test_utils::{TestDataDir, failing_agent, sleepy_agent, succeeding_agent};

fn manager() -> Arc<ProcessManager> {
    let (tx, _rx) = mpsc::unbounded_channel();
    Arc::new(ProcessManager::new(ProcessManagerConfig::default(), tx))
}

#[tokio::test]
async fn full_stream_is_parsed_and_result_extracted() {
    let data = TestDataDir::new();
    let script = succeeding_agent(data.path());

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut options = ExecOptions::new("wo_stream", "run_stream");
    options.events = Some(events_tx);

    let result = executor::execute(
        &script.to_string_lossy(),
        &[],
        options,
        &manager(),
    )
    .await;

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.session_id.as_deref(), Some("sess_fake"));
    assert_eq!(result.tokens_used.unwrap().total, 120);
    assert!(result.stdout.contains("tool_use"));

    let mut saw_tool_call = false;
    let mut saw_tool_result = false;
    let mut saw_output = false;
    while let Ok(event) = events_rx.try_recv() {
        match event {
            AgentEvent::ToolCall {
                work_order_id,
                tool,
                ..
            } => {
                assert_eq!(work_order_id, "wo_stream");
                assert_eq!(tool, "Bash");
                saw_tool_call = true;
            }
            AgentEvent::ToolResult { run_id, .. } => {
                assert_eq!(run_id, "run_stream");
                saw_tool_result = true;
            }
            AgentEvent::Output { text, .. } => {
                assert_eq!(text, "finished");
                saw_output = true;
            }
            AgentEvent::Progress { update, .. } => {
                assert!(update.percentage < 100);
            }
        }
    }
    assert!(saw_tool_call && saw_tool_result && saw_output);
}

#[tokio::test]
async fn cancellation_kills_child_and_reports_130() {
    // Scenario: a 10-minute agent cancelled after 200ms resolves with
    // cancelled=true, exit code 130, and a duration of roughly the cancel
    // point plus the kill wait.
    let data = TestDataDir::new();
    let script = sleepy_agent(data.path());

    let token = CancellationToken::new();
    let mut options = ExecOptions::new("wo_cancel", "run_cancel");
    options.cancel = Some(token.clone());

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let processes = manager();
    let result = executor::execute(
        &script.to_string_lossy(),
        &[],
        options,
        &processes,
    )
    .await;

    assert!(result.cancelled);
    assert_eq!(result.exit_code, EXIT_CANCELLED);
    assert!(!result.success);
    assert!(result.duration >= Duration::from_millis(200));
    assert!(
        result.duration < Duration::from_secs(8),
        "cancel should resolve in cancel point + bounded kill wait, got {:?}",
        result.duration
    );

    // The child really is gone.
    assert!(!processes.has_active_process("wo_cancel").await);
}

#[tokio::test]
async fn timeout_kills_child_and_reports_124() {
    let data = TestDataDir::new();
    let script = sleepy_agent(data.path());

    let mut options = ExecOptions::new("wo_to", "run_to");
    options.timeout = Some(Duration::from_millis(250));

    let result = executor::execute(
        &script.to_string_lossy(),
        &[],
        options,
        &manager(),
    )
    .await;

    assert_eq!(result.exit_code, EXIT_TIMEOUT);
    assert!(!result.cancelled, "timeout is reported distinctly from cancel");
    assert!(!result.success);
}

#[tokio::test]
async fn failing_agent_surfaces_stderr() {
    let data = TestDataDir::new();
    let script = failing_agent(data.path(), 7);

    let result = executor::execute(
        &script.to_string_lossy(),
        &[],
        ExecOptions::new("wo_fail", "run_fail"),
        &manager(),
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 7);
    assert!(result.stderr.contains("agent blew up"));
    assert!(result.structured_output.is_none());
}
