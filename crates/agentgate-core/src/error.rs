//! Error taxonomy for the control plane.

use agentgate_store::StoreError;
use agentgate_store::models::WorkOrderStatus;
use thiserror::Error;

/// Errors surfaced by the control plane.
///
/// The variants map onto how a failure is handled: validation and capacity
/// errors go straight back to the caller, timeouts and execution failures
/// land on the work order (and may be retried), cancellation is terminal
/// for the attempt, and storage failures degrade rather than abort.
#[derive(Debug, Error)]
pub enum AgentGateError {
    /// Malformed submit request, invalid configuration, or any other input
    /// the caller must fix. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An illegal status transition was requested. State is unchanged.
    #[error("invalid transition for work order {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: WorkOrderStatus,
        to: WorkOrderStatus,
    },

    /// Queue full, duplicate enqueue, or slots withheld under memory
    /// pressure. The caller may retry later.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Queue max-wait, per-run wall clock, or per-exec timeout elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The agent subprocess failed: non-zero exit, spawn failure, or
    /// stderr-only failure.
    #[error("execution failed: {0}")]
    Execution(String),

    /// An abort was requested. Terminal for the current attempt.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Persistence failure. Non-fatal for in-memory state.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl AgentGateError {
    /// Whether the retry manager may schedule another attempt for this
    /// failure class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Timeout(_))
    }
}
