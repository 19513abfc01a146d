//! Work-order lifecycle service.
//!
//! Wraps the store, scheduler, process manager, and retry manager with
//! the validated lifecycle operations the orchestrator and CLI share:
//! submit, cancel, force-kill, the mark-* transitions, counts, and purge.
//! Every status write goes through the state machine first.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use agentgate_store::models::{
    AgentKind, Policies, WorkOrder, WorkOrderStatus, WorkspaceSource,
};
use agentgate_store::{WorkOrderStore, id};

use crate::error::AgentGateError;
use crate::process::{KillOptions, KillResult, ProcessManager};
use crate::queue::SchedulerQueue;
use crate::retry::RetryManager;
use crate::state::WorkOrderStateMachine;

/// Longest accepted task prompt, in bytes.
pub const MAX_PROMPT_LEN: usize = 100_000;

/// Bounds enforced at submit time.
#[derive(Debug, Clone)]
pub struct SubmitLimits {
    pub max_spawn_depth: u32,
    pub max_children_per_parent: u32,
    pub max_tree_size: u32,
    /// Used when a request does not set its own wall clock.
    pub default_wall_clock_secs: u64,
}

impl Default for SubmitLimits {
    fn default() -> Self {
        Self {
            max_spawn_depth: 3,
            max_children_per_parent: 10,
            max_tree_size: 100,
            default_wall_clock_secs: 3600,
        }
    }
}

/// A submit request from the API layer.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub prompt: String,
    pub workspace: WorkspaceSource,
    pub agent: AgentKind,
    pub max_iterations: Option<u32>,
    pub max_wall_clock_secs: Option<u64>,
    pub gate_plan: Option<String>,
    pub policies: Option<Policies>,
    /// Set when this work order was spawned by another work order.
    pub parent_id: Option<String>,
}

/// Options for [`WorkOrderService::purge`].
#[derive(Debug, Clone, Default)]
pub struct PurgeOptions {
    /// Statuses to purge; defaults to all terminal statuses. Non-terminal
    /// statuses are rejected.
    pub statuses: Option<Vec<WorkOrderStatus>>,
    /// Only purge work orders created before this time.
    pub older_than: Option<DateTime<Utc>>,
    pub dry_run: bool,
}

/// Outcome of a purge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted_count: usize,
    pub deleted_ids: Vec<String>,
    /// Filled on a dry run instead of deleting.
    pub would_delete: Vec<String>,
}

/// Outcome of [`WorkOrderService::force_kill`].
#[derive(Debug)]
pub struct ForceKillReport {
    /// The work order's status after the operation.
    pub status: WorkOrderStatus,
    /// The process-manager result, when a kill was actually attempted.
    pub kill: Option<KillResult>,
}

/// The work-order lifecycle service.
pub struct WorkOrderService {
    store: Arc<WorkOrderStore>,
    queue: Arc<SchedulerQueue>,
    processes: Arc<ProcessManager>,
    retries: Arc<RetryManager>,
    limits: SubmitLimits,
}

impl WorkOrderService {
    pub fn new(
        store: Arc<WorkOrderStore>,
        queue: Arc<SchedulerQueue>,
        processes: Arc<ProcessManager>,
        retries: Arc<RetryManager>,
        limits: SubmitLimits,
    ) -> Self {
        Self {
            store,
            queue,
            processes,
            retries,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<WorkOrderStore> {
        &self.store
    }

    // -----------------------------------------------------------------
    // Submit
    // -----------------------------------------------------------------

    /// Validate a request, assign an id, and persist the work order in
    /// `queued` status. Admission into the scheduler is the orchestrator's
    /// follow-up step.
    pub async fn submit(&self, request: SubmitRequest) -> Result<WorkOrder, AgentGateError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(AgentGateError::Validation("prompt must not be empty".into()));
        }
        if prompt.len() > MAX_PROMPT_LEN {
            return Err(AgentGateError::Validation(format!(
                "prompt exceeds {MAX_PROMPT_LEN} bytes"
            )));
        }

        let max_iterations = request.max_iterations.unwrap_or(3);
        if !(1..=10).contains(&max_iterations) {
            return Err(AgentGateError::Validation(format!(
                "max_iterations must be in 1..=10, got {max_iterations}"
            )));
        }

        let max_wall_clock_secs = request
            .max_wall_clock_secs
            .unwrap_or(self.limits.default_wall_clock_secs);
        if !(60..=86_400).contains(&max_wall_clock_secs) {
            return Err(AgentGateError::Validation(format!(
                "max_wall_clock_secs must be in 60..=86400, got {max_wall_clock_secs}"
            )));
        }

        // Recursion bookkeeping against a parent, when present.
        let mut parent = None;
        let mut depth = 0;
        let mut root_id = None;
        let mut sibling_index = 0;
        if let Some(parent_id) = &request.parent_id {
            let found = self.store.try_load(parent_id).await?.ok_or_else(|| {
                AgentGateError::Validation(format!("parent work order {parent_id} not found"))
            })?;

            depth = found.depth + 1;
            if depth > self.limits.max_spawn_depth {
                return Err(AgentGateError::Validation(format!(
                    "spawn depth {depth} exceeds limit {}",
                    self.limits.max_spawn_depth
                )));
            }
            if found.child_ids.len() as u32 >= self.limits.max_children_per_parent {
                return Err(AgentGateError::Validation(format!(
                    "parent {parent_id} already has {} children (limit {})",
                    found.child_ids.len(),
                    self.limits.max_children_per_parent
                )));
            }

            let root = found.root_id.clone().unwrap_or_else(|| found.id.clone());
            let tree_size = self.tree_size(&root).await?;
            if tree_size + 1 > self.limits.max_tree_size as usize {
                return Err(AgentGateError::Validation(format!(
                    "tree rooted at {root} already has {tree_size} work orders (limit {})",
                    self.limits.max_tree_size
                )));
            }

            sibling_index = found.child_ids.len() as u32;
            root_id = Some(root);
            parent = Some(found);
        }

        let order = WorkOrder {
            id: id::new_work_order_id(),
            prompt: prompt.to_owned(),
            workspace: request.workspace,
            agent: request.agent,
            max_iterations,
            max_wall_clock_secs,
            gate_plan: request.gate_plan,
            policies: request.policies.unwrap_or_default(),
            parent_id: request.parent_id,
            root_id,
            depth,
            sibling_index,
            child_ids: Vec::new(),
            created_at: Utc::now(),
            status: WorkOrderStatus::Queued,
            run_id: None,
            completed_at: None,
            error: None,
        };

        self.store.save(&order).await?;

        if let Some(mut parent) = parent {
            parent.child_ids.push(order.id.clone());
            self.store.save(&parent).await?;
        }

        info!(
            work_order_id = %order.id,
            agent = %order.agent,
            workspace = order.workspace.label(),
            "work order submitted"
        );
        Ok(order)
    }

    /// Number of live work orders in the tree rooted at `root_id`.
    async fn tree_size(&self, root_id: &str) -> Result<usize, AgentGateError> {
        let orders = self.store.list().await?;
        Ok(orders
            .iter()
            .filter(|o| o.id == root_id || o.root_id.as_deref() == Some(root_id))
            .count())
    }

    // -----------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------

    /// Cancel a work order. Permitted from `queued`, `running`,
    /// `waiting_for_children`, and `integrating`. Idempotent on an already
    /// canceled order.
    pub async fn cancel(&self, work_order_id: &str) -> Result<WorkOrder, AgentGateError> {
        let mut order = self.load(work_order_id).await?;

        match order.status {
            WorkOrderStatus::Canceled => return Ok(order),
            WorkOrderStatus::Queued => {
                self.queue.cancel(work_order_id).await;
            }
            WorkOrderStatus::Running => {
                // Prefer the cooperative cancel handle; fall back to a
                // direct kill when the run never registered one.
                if !self.queue.cancel_running(work_order_id).await {
                    self.processes
                        .kill(
                            work_order_id,
                            KillOptions {
                                grace_period: None,
                                reason: Some("work order canceled".to_owned()),
                                force_immediate: false,
                            },
                        )
                        .await;
                }
            }
            WorkOrderStatus::WaitingForChildren | WorkOrderStatus::Integrating => {}
            WorkOrderStatus::Failed => {
                // A failed order with a retry pending: cancelling clears
                // the timer and leaves the order failed.
                if self.retries.cancel_retry(work_order_id).await {
                    return Ok(order);
                }
                return Err(AgentGateError::Validation(format!(
                    "cannot cancel {work_order_id}: status is {}",
                    order.status
                )));
            }
            WorkOrderStatus::Succeeded => {
                return Err(AgentGateError::Validation(format!(
                    "cannot cancel {work_order_id}: status is {}",
                    order.status
                )));
            }
        }

        self.retries.cancel_retry(work_order_id).await;

        WorkOrderStateMachine::transition(&mut order, WorkOrderStatus::Canceled)?;
        order.error = Some("canceled by request".to_owned());
        self.store.save(&order).await?;
        Ok(order)
    }

    /// Force-kill a work order's process and write the resulting status.
    ///
    /// Terminal statuses are a fast path (no-op); queued orders are
    /// removed from the queue without touching the process manager.
    pub async fn force_kill(
        &self,
        work_order_id: &str,
        options: KillOptions,
    ) -> Result<ForceKillReport, AgentGateError> {
        let mut order = self.load(work_order_id).await?;

        if order.status.is_terminal() {
            return Ok(ForceKillReport {
                status: order.status,
                kill: None,
            });
        }

        self.retries.cancel_retry(work_order_id).await;

        if order.status == WorkOrderStatus::Queued {
            self.queue.cancel(work_order_id).await;
            WorkOrderStateMachine::transition(&mut order, WorkOrderStatus::Canceled)?;
            order.error = Some("force-killed while queued".to_owned());
            self.store.save(&order).await?;
            return Ok(ForceKillReport {
                status: order.status,
                kill: None,
            });
        }

        let reason = options
            .reason
            .clone()
            .unwrap_or_else(|| "force-killed".to_owned());
        let kill = self
            .processes
            .kill(
                work_order_id,
                KillOptions {
                    force_immediate: true,
                    ..options
                },
            )
            .await;
        if !kill.success {
            warn!(
                work_order_id,
                error = kill.error.as_deref().unwrap_or("unknown"),
                "force kill did not confirm process exit"
            );
        }

        self.queue.mark_completed(work_order_id).await;
        WorkOrderStateMachine::transition(&mut order, WorkOrderStatus::Canceled)?;
        order.error = Some(reason);
        self.store.save(&order).await?;

        Ok(ForceKillReport {
            status: order.status,
            kill: Some(kill),
        })
    }

    // -----------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------

    /// `queued -> running` (or `failed -> running` on retry), recording
    /// the run id.
    pub async fn mark_running(
        &self,
        work_order_id: &str,
        run_id: &str,
    ) -> Result<WorkOrder, AgentGateError> {
        let mut order = self.load(work_order_id).await?;
        WorkOrderStateMachine::transition(&mut order, WorkOrderStatus::Running)?;
        order.run_id = Some(run_id.to_owned());
        self.store.save(&order).await?;
        Ok(order)
    }

    pub async fn mark_succeeded(&self, work_order_id: &str) -> Result<WorkOrder, AgentGateError> {
        let mut order = self.load(work_order_id).await?;
        WorkOrderStateMachine::transition(&mut order, WorkOrderStatus::Succeeded)?;
        self.store.save(&order).await?;
        Ok(order)
    }

    pub async fn mark_failed(
        &self,
        work_order_id: &str,
        error: &str,
    ) -> Result<WorkOrder, AgentGateError> {
        let mut order = self.load(work_order_id).await?;
        WorkOrderStateMachine::transition(&mut order, WorkOrderStatus::Failed)?;
        order.error = Some(error.to_owned());
        self.store.save(&order).await?;
        Ok(order)
    }

    pub async fn mark_waiting_for_children(
        &self,
        work_order_id: &str,
    ) -> Result<WorkOrder, AgentGateError> {
        let mut order = self.load(work_order_id).await?;
        WorkOrderStateMachine::transition(&mut order, WorkOrderStatus::WaitingForChildren)?;
        self.store.save(&order).await?;
        Ok(order)
    }

    pub async fn mark_integrating(
        &self,
        work_order_id: &str,
    ) -> Result<WorkOrder, AgentGateError> {
        let mut order = self.load(work_order_id).await?;
        WorkOrderStateMachine::transition(&mut order, WorkOrderStatus::Integrating)?;
        self.store.save(&order).await?;
        Ok(order)
    }

    // -----------------------------------------------------------------
    // Queries & purge
    // -----------------------------------------------------------------

    pub async fn load(&self, work_order_id: &str) -> Result<WorkOrder, AgentGateError> {
        Ok(self.store.load(work_order_id).await?)
    }

    pub async fn get_counts(
        &self,
    ) -> Result<HashMap<WorkOrderStatus, usize>, AgentGateError> {
        Ok(self.store.count_by_status().await?)
    }

    /// Delete terminal work-order records matching the options.
    pub async fn purge(&self, options: PurgeOptions) -> Result<PurgeReport, AgentGateError> {
        let statuses = options.statuses.unwrap_or_else(|| {
            vec![
                WorkOrderStatus::Succeeded,
                WorkOrderStatus::Failed,
                WorkOrderStatus::Canceled,
            ]
        });
        if let Some(bad) = statuses.iter().find(|s| !s.is_terminal()) {
            return Err(AgentGateError::Validation(format!(
                "cannot purge non-terminal status {bad}"
            )));
        }

        let mut report = PurgeReport::default();
        for order in self.store.list().await? {
            if !statuses.contains(&order.status) {
                continue;
            }
            if let Some(cutoff) = options.older_than {
                if order.created_at >= cutoff {
                    continue;
                }
            }

            if options.dry_run {
                report.would_delete.push(order.id);
            } else {
                match self.store.delete(&order.id).await {
                    Ok(()) => {
                        report.deleted_count += 1;
                        report.deleted_ids.push(order.id);
                    }
                    Err(e) => {
                        warn!(work_order_id = %order.id, error = %e, "failed to purge work order");
                    }
                }
            }
        }

        Ok(report)
    }
}
