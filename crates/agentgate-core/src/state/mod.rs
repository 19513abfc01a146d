//! Work-order and run state machines.
//!
//! Validates and applies status transitions, enforcing the allowed
//! transition graphs. Every store update in the service layer goes through
//! these checks first -- callers learn of illegal transitions by explicit
//! error, never by silent write.

use chrono::Utc;

use agentgate_store::models::{RunState, WorkOrder, WorkOrderStatus};

use crate::error::AgentGateError;

/// The work-order state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// queued               -> running | failed | canceled
/// running              -> waiting_for_children | succeeded | failed | canceled
/// waiting_for_children -> integrating | failed | canceled
/// integrating          -> succeeded | failed | canceled
/// succeeded            -> (terminal)
/// failed               -> running   (retry)
/// failed               -> failed    (idempotent re-fail)
/// canceled             -> (terminal)
/// ```
pub struct WorkOrderStateMachine;

impl WorkOrderStateMachine {
    /// Check whether `from -> to` is an edge in the state graph.
    pub fn is_valid_transition(from: WorkOrderStatus, to: WorkOrderStatus) -> bool {
        use WorkOrderStatus::*;
        matches!(
            (from, to),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Canceled)
                | (Running, WaitingForChildren)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (WaitingForChildren, Integrating)
                | (WaitingForChildren, Failed)
                | (WaitingForChildren, Canceled)
                | (Integrating, Succeeded)
                | (Integrating, Failed)
                | (Integrating, Canceled)
                | (Failed, Running)
                | (Failed, Failed)
        )
    }

    /// Apply a transition to a work order in memory.
    ///
    /// - Validates the edge; on an illegal transition the record is left
    ///   untouched and [`AgentGateError::InvalidTransition`] is returned.
    /// - Stamps `completed_at` when entering a terminal status (kept from
    ///   the first failure on an idempotent re-fail).
    /// - Clears `completed_at` and `error` when leaving `failed` for a
    ///   retry attempt.
    ///
    /// The caller persists the mutated record.
    pub fn transition(order: &mut WorkOrder, to: WorkOrderStatus) -> Result<(), AgentGateError> {
        let from = order.status;
        if !Self::is_valid_transition(from, to) {
            return Err(AgentGateError::InvalidTransition {
                id: order.id.clone(),
                from,
                to,
            });
        }

        if from == WorkOrderStatus::Failed && to == WorkOrderStatus::Running {
            order.completed_at = None;
            order.error = None;
        }

        order.status = to;

        if to.is_terminal() && order.completed_at.is_none() {
            order.completed_at = Some(Utc::now());
        }

        Ok(())
    }
}

/// The run state machine, covering one execution attempt.
///
/// ```text
/// created       -> agent_working | failed
/// agent_working -> verifying | failed
/// verifying     -> agent_working (next iteration) | complete | failed
/// complete      -> (terminal)
/// failed        -> (terminal)
/// ```
pub struct RunStateMachine;

impl RunStateMachine {
    /// Check whether `from -> to` is an edge in the run state graph.
    pub fn is_valid_transition(from: RunState, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (from, to),
            (Created, AgentWorking)
                | (Created, Failed)
                | (AgentWorking, Verifying)
                | (AgentWorking, Failed)
                | (Verifying, AgentWorking)
                | (Verifying, Complete)
                | (Verifying, Failed)
        )
    }

    /// Validate a run transition, returning the new state on success.
    pub fn transition(
        run_id: &str,
        from: RunState,
        to: RunState,
    ) -> Result<RunState, AgentGateError> {
        if !Self::is_valid_transition(from, to) {
            return Err(AgentGateError::Validation(format!(
                "invalid run transition for {run_id}: {from} -> {to}"
            )));
        }
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgate_store::models::{AgentKind, Policies, WorkspaceSource};
    use std::path::PathBuf;

    fn order(status: WorkOrderStatus) -> WorkOrder {
        WorkOrder {
            id: "wo_state".to_owned(),
            prompt: "p".to_owned(),
            workspace: WorkspaceSource::LocalPath {
                path: PathBuf::from("/tmp"),
            },
            agent: AgentKind::ClaudeCode,
            max_iterations: 1,
            max_wall_clock_secs: 60,
            gate_plan: None,
            policies: Policies::default(),
            parent_id: None,
            root_id: None,
            depth: 0,
            sibling_index: 0,
            child_ids: Vec::new(),
            created_at: Utc::now(),
            status,
            run_id: None,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn full_happy_path() {
        let mut o = order(WorkOrderStatus::Queued);
        WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::Running).unwrap();
        WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::Succeeded).unwrap();
        assert!(o.completed_at.is_some());
    }

    #[test]
    fn recursion_path() {
        let mut o = order(WorkOrderStatus::Running);
        WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::WaitingForChildren).unwrap();
        WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::Integrating).unwrap();
        WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::Succeeded).unwrap();
    }

    #[test]
    fn terminal_statuses_reject_everything() {
        for terminal in [WorkOrderStatus::Succeeded, WorkOrderStatus::Canceled] {
            for to in WorkOrderStatus::all() {
                let mut o = order(terminal);
                let result = WorkOrderStateMachine::transition(&mut o, to);
                assert!(
                    result.is_err(),
                    "{terminal} -> {to} should be rejected"
                );
                assert_eq!(o.status, terminal, "state must be unchanged on error");
            }
        }
    }

    #[test]
    fn failed_allows_retry_and_refail_only() {
        for to in WorkOrderStatus::all() {
            let mut o = order(WorkOrderStatus::Failed);
            let result = WorkOrderStateMachine::transition(&mut o, to);
            let should_pass =
                to == WorkOrderStatus::Running || to == WorkOrderStatus::Failed;
            assert_eq!(result.is_ok(), should_pass, "failed -> {to}");
        }
    }

    #[test]
    fn retry_clears_error_and_completion() {
        let mut o = order(WorkOrderStatus::Failed);
        o.error = Some("agent exited 1".to_owned());
        o.completed_at = Some(Utc::now());

        WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::Running).unwrap();
        assert_eq!(o.status, WorkOrderStatus::Running);
        assert!(o.error.is_none());
        assert!(o.completed_at.is_none());
    }

    #[test]
    fn refail_keeps_first_completion_time() {
        let mut o = order(WorkOrderStatus::Running);
        WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::Failed).unwrap();
        let first = o.completed_at.expect("completed_at set on failure");

        WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::Failed).unwrap();
        assert_eq!(o.completed_at, Some(first));
    }

    #[test]
    fn queued_cannot_succeed_directly() {
        let mut o = order(WorkOrderStatus::Queued);
        let result = WorkOrderStateMachine::transition(&mut o, WorkOrderStatus::Succeeded);
        assert!(matches!(
            result,
            Err(AgentGateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn run_iteration_loop() {
        use RunState::*;
        assert!(RunStateMachine::is_valid_transition(Created, AgentWorking));
        assert!(RunStateMachine::is_valid_transition(AgentWorking, Verifying));
        assert!(RunStateMachine::is_valid_transition(Verifying, AgentWorking));
        assert!(RunStateMachine::is_valid_transition(Verifying, Complete));
        assert!(!RunStateMachine::is_valid_transition(Complete, AgentWorking));
        assert!(!RunStateMachine::is_valid_transition(Failed, AgentWorking));
        assert!(!RunStateMachine::is_valid_transition(Created, Complete));
    }

    #[test]
    fn run_transition_error_names_run() {
        let result = RunStateMachine::transition("run_z", RunState::Complete, RunState::Created);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("run_z"), "got: {msg}");
    }
}
