//! AgentGate control plane.
//!
//! Turns submitted work orders into controlled subprocess executions:
//! admission and scheduling ([`queue`]), validated lifecycle transitions
//! ([`state`]), child-process tracking and termination ([`process`]),
//! line-delimited event streaming from the agent ([`executor`]), retry
//! with backoff ([`retry`]), and the [`orchestrator`] loop that wires the
//! pieces together over the persistent stores.

pub mod agent;
pub mod error;
pub mod executor;
pub mod observability;
pub mod orchestrator;
pub mod process;
pub mod queue;
pub mod retry;
pub mod service;
pub mod state;

pub use error::AgentGateError;
