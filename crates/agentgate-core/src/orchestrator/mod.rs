//! The orchestrator: turns persisted work orders into controlled agent
//! executions.
//!
//! One logical loop owns every state-machine transition. Scheduler
//! decisions, retry firings, and process exits arrive as channel events;
//! agent executions run as spawned tasks that report back through the
//! store and the scheduler. A polling tick admits work orders written by
//! other processes (the CLI `submit` path) into the queue.

pub mod workspace;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentgate_store::models::{Run, RunState, WorkOrder, WorkOrderStatus};
use agentgate_store::{RunStore, WorkOrderStore, id};

use crate::agent::{AgentCommandRegistry, policy_env};
use crate::error::AgentGateError;
use crate::executor::{self, AgentEvent, EventFilter, ExecOptions, ExecutionResult};
use crate::observability::{
    AuditEventKind, HealthMonitor, Observability, start_health_reporter,
};
use crate::process::{KillOptions, ProcessEvent, ProcessManager, ProcessManagerConfig};
use crate::queue::{
    EnqueueOptions, QueueConfig, SchedulerEvent, SchedulerQueue, StartOptions,
};
use crate::retry::{RetryConfig, RetryFired, RetryManager};
use crate::service::{SubmitLimits, WorkOrderService};
use crate::state::RunStateMachine;
use workspace::{LocalOnlyMaterializer, WorkspaceMaterializer};

/// Top-level orchestrator configuration, assembled from the environment
/// by the CLI.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub data_dir: PathBuf,
    pub queue: QueueConfig,
    pub process: ProcessManagerConfig,
    pub retry: RetryConfig,
    pub limits: SubmitLimits,
    /// Store-poll cadence for work orders submitted by other processes,
    /// and the health-report cadence.
    pub poll_interval: Duration,
    /// Which agent events reach subscribers.
    pub event_filter: EventFilter,
    /// Agent command lines, keyed by kind.
    pub agents: AgentCommandRegistry,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            queue: QueueConfig::default(),
            process: ProcessManagerConfig::default(),
            retry: RetryConfig::default(),
            limits: SubmitLimits::default(),
            poll_interval: Duration::from_secs(5),
            event_filter: EventFilter::all(),
            agents: AgentCommandRegistry::with_defaults(),
        }
    }
}

/// The fan-out event union delivered to subscribers.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A streamed event from a running agent.
    Agent(AgentEvent),
    /// A work order changed status.
    StatusChanged {
        work_order_id: String,
        status: WorkOrderStatus,
    },
}

struct Channels {
    scheduler_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    retry_rx: mpsc::UnboundedReceiver<RetryFired>,
    process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// The orchestrator. Construct once at startup, share by `Arc`, tear
/// down with [`Orchestrator::shutdown`].
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<WorkOrderStore>,
    runs: Arc<RunStore>,
    queue: Arc<SchedulerQueue>,
    processes: Arc<ProcessManager>,
    retries: Arc<RetryManager>,
    service: Arc<WorkOrderService>,
    agents: AgentCommandRegistry,
    materializer: Arc<dyn WorkspaceMaterializer>,
    observability: Arc<Observability>,
    health: Arc<HealthMonitor>,
    shutdown: CancellationToken,
    channels: Mutex<Option<Channels>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<OrchestratorEvent>>>,
    /// Attempt counter per work order, for backoff scheduling. In-memory
    /// only: a restart starts the count over.
    attempts: Mutex<HashMap<String, u32>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (process_tx, process_rx) = mpsc::unbounded_channel();

        let store = Arc::new(WorkOrderStore::new(&config.data_dir));
        let runs = Arc::new(RunStore::new(&config.data_dir));
        let queue = Arc::new(SchedulerQueue::new(config.queue.clone(), scheduler_tx));
        let processes = Arc::new(ProcessManager::new(config.process.clone(), process_tx));
        let retries = Arc::new(RetryManager::new(config.retry.clone(), retry_tx));
        let service = Arc::new(WorkOrderService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&processes),
            Arc::clone(&retries),
            config.limits.clone(),
        ));

        let agents = config.agents.clone();
        Arc::new(Self {
            config,
            store,
            runs,
            queue,
            processes,
            retries,
            service,
            agents,
            materializer: Arc::new(LocalOnlyMaterializer),
            observability: Arc::new(Observability::new()),
            health: Arc::new(HealthMonitor::new()),
            shutdown: CancellationToken::new(),
            channels: Mutex::new(Some(Channels {
                scheduler_rx,
                retry_rx,
                process_rx,
            })),
            subscribers: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn service(&self) -> &Arc<WorkOrderService> {
        &self.service
    }

    pub fn queue(&self) -> &Arc<SchedulerQueue> {
        &self.queue
    }

    pub fn runs(&self) -> &Arc<RunStore> {
        &self.runs
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribe to the fan-out event stream.
    pub async fn subscribe(&self) -> UnboundedReceiverStream<OrchestratorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    async fn broadcast(&self, event: OrchestratorEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Admit a persisted queued work order into the scheduler.
    pub async fn admit(&self, work_order_id: &str, priority: i32) -> bool {
        let outcome = self
            .queue
            .enqueue(
                work_order_id,
                EnqueueOptions {
                    priority,
                    ..Default::default()
                },
            )
            .await;
        if outcome.accepted {
            self.observability
                .record(
                    work_order_id,
                    AuditEventKind::Enqueued,
                    format!("position {}", outcome.position.unwrap_or(0)),
                )
                .await;
        } else if let Some(error) = &outcome.error {
            debug!(work_order_id, error = %error, "admission rejected");
        }
        outcome.accepted
    }

    /// Run the orchestrator until [`Orchestrator::shutdown`] (or the
    /// shutdown token) fires. Call at most once.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let Some(mut channels) = self.channels.lock().await.take() else {
            anyhow::bail!("orchestrator is already running");
        };

        self.recover().await?;

        self.queue.start_watchdogs(self.shutdown.clone());
        self.processes.start_monitoring().await;
        start_health_reporter(
            Arc::clone(&self.health),
            Arc::clone(&self.queue),
            Arc::clone(&self.retries),
            self.config.poll_interval,
            self.shutdown.clone(),
        );

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(data_dir = %self.config.data_dir.display(), "orchestrator running");

        loop {
            tokio::select! {
                Some(event) = channels.scheduler_rx.recv() => {
                    self.handle_scheduler_event(event).await;
                }
                Some(fired) = channels.retry_rx.recv() => {
                    self.handle_retry_fired(fired).await;
                }
                Some(event) = channels.process_rx.recv() => {
                    let ProcessEvent::Exited(tracked) = event;
                    debug!(
                        work_order_id = %tracked.work_order_id,
                        pid = tracked.pid,
                        exit_code = ?tracked.exit_code,
                        exit_signal = ?tracked.exit_signal,
                        "agent process exited"
                    );
                }
                _ = poll.tick() => {
                    self.poll_store().await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("orchestrator loop stopped");
        Ok(())
    }

    /// Persist state and stop all background work. Safe to call once.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.queue.set_accepting(false).await;
        self.retries.cancel_all().await;

        let kills = self
            .processes
            .kill_all(KillOptions {
                grace_period: None,
                reason: Some("orchestrator shutdown".to_owned()),
                force_immediate: false,
            })
            .await;
        for (id, result) in &kills {
            if !result.success {
                warn!(
                    work_order_id = %id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "process survived shutdown kill"
                );
            }
        }

        self.processes.stop_monitoring().await;
        self.queue.persist(&self.config.data_dir).await;
        self.shutdown.cancel();
    }

    // -----------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------

    /// Restore the queue snapshot and re-admit interrupted work.
    ///
    /// Work orders left in `running` by a crash are failed and re-queued
    /// as fresh attempts; their in-flight cancellations do not survive
    /// the restart.
    async fn recover(&self) -> Result<()> {
        let restored = self.queue.restore(&self.config.data_dir).await;
        if restored {
            info!("queue snapshot restored");
        }

        for order in self.store.list_by_status(WorkOrderStatus::Running).await? {
            warn!(
                work_order_id = %order.id,
                "work order was running at last shutdown, re-admitting"
            );
            if let Err(e) = self
                .service
                .mark_failed(&order.id, "orchestrator restarted mid-run")
                .await
            {
                error!(work_order_id = %order.id, error = %e, "failed to reset interrupted work order");
                continue;
            }
            self.admit(&order.id, 0).await;
        }

        for order in self.store.list_by_status(WorkOrderStatus::Queued).await? {
            if !self.queue.is_tracked(&order.id).await {
                self.admit(&order.id, 0).await;
            }
        }

        Ok(())
    }

    /// Admit queued work orders persisted by other processes.
    async fn poll_store(&self) {
        let queued = match self.store.list_by_status(WorkOrderStatus::Queued).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "store poll failed");
                return;
            }
        };
        for order in queued {
            if !self.queue.is_tracked(&order.id).await {
                self.admit(&order.id, 0).await;
            }
        }
    }

    // -----------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------

    async fn handle_scheduler_event(self: &Arc<Self>, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Ready { work_order_id } => {
                self.start_attempt(&work_order_id).await;
            }
            SchedulerEvent::Timeout { work_order_id } => {
                self.observability
                    .record(
                        &work_order_id,
                        AuditEventKind::TimedOut,
                        "queue max wait exceeded",
                    )
                    .await;
                match self
                    .service
                    .mark_failed(&work_order_id, "queue wait exceeded")
                    .await
                {
                    Ok(order) => {
                        self.broadcast(OrchestratorEvent::StatusChanged {
                            work_order_id,
                            status: order.status,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!(work_order_id = %work_order_id, error = %e, "failed to record queue timeout");
                    }
                }
            }
            SchedulerEvent::RunTimeout {
                work_order_id,
                elapsed,
                cap,
            } => {
                // The executor's own timer normally fires first; this is
                // the backstop when it cannot (e.g. a wedged reader).
                warn!(
                    work_order_id = %work_order_id,
                    elapsed_secs = elapsed.as_secs(),
                    cap_secs = cap.as_secs(),
                    "run exceeded wall clock, terminating"
                );
                self.observability
                    .record(
                        &work_order_id,
                        AuditEventKind::TimedOut,
                        format!(
                            "wall clock exceeded: {}s > {}s",
                            elapsed.as_secs(),
                            cap.as_secs()
                        ),
                    )
                    .await;
                self.processes
                    .kill(
                        &work_order_id,
                        KillOptions {
                            grace_period: None,
                            reason: Some("wall clock exceeded".to_owned()),
                            force_immediate: false,
                        },
                    )
                    .await;
            }
            SchedulerEvent::StateChange => {}
        }
    }

    async fn handle_retry_fired(&self, fired: RetryFired) {
        let order = match self.store.try_load(&fired.work_order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                debug!(work_order_id = %fired.work_order_id, "retry fired for purged work order");
                return;
            }
            Err(e) => {
                warn!(work_order_id = %fired.work_order_id, error = %e, "retry fired but load failed");
                return;
            }
        };

        if order.status != WorkOrderStatus::Failed {
            debug!(
                work_order_id = %order.id,
                status = %order.status,
                "retry fired but work order is no longer failed"
            );
            return;
        }

        info!(work_order_id = %order.id, attempt = fired.attempt + 1, "re-admitting for retry");
        self.observability.record_retried().await;
        self.admit(&order.id, 0).await;
    }

    // -----------------------------------------------------------------
    // Attempt lifecycle
    // -----------------------------------------------------------------

    /// Answer a `Ready` event: transition the work order to running,
    /// create its run record, and spawn the execution task.
    async fn start_attempt(self: &Arc<Self>, work_order_id: &str) {
        let order = match self.store.try_load(work_order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(work_order_id, "ready for unknown work order, dropping");
                self.queue.cancel(work_order_id).await;
                return;
            }
            Err(e) => {
                warn!(work_order_id, error = %e, "ready but load failed, dropping");
                self.queue.cancel(work_order_id).await;
                return;
            }
        };

        if !matches!(
            order.status,
            WorkOrderStatus::Queued | WorkOrderStatus::Failed
        ) {
            debug!(
                work_order_id,
                status = %order.status,
                "ready for work order not in a startable status"
            );
            self.queue.cancel(work_order_id).await;
            return;
        }

        let attempt = {
            let mut attempts = self.attempts.lock().await;
            let counter = attempts.entry(work_order_id.to_owned()).or_insert(0);
            *counter += 1;
            *counter
        };

        // Create the run record first so a crash between the two writes
        // leaves an orphan run, not a runless running work order.
        let run = Run {
            id: id::new_run_id(),
            work_order_id: order.id.clone(),
            workspace_id: id::new_workspace_id(),
            iteration: 0,
            max_iterations: order.max_iterations,
            state: RunState::Created,
            snapshot_before: None,
            snapshot_after: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
            result: None,
            session_id: None,
            warnings: Vec::new(),
            branch: None,
            pr_url: None,
            pr_number: None,
            ci_status: None,
            ci_checks_passed: None,
            ci_iterations_used: None,
        };
        if let Err(e) = self.runs.save(&run).await {
            warn!(work_order_id, error = %e, "failed to create run record");
            self.queue.cancel(work_order_id).await;
            return;
        }

        let order = match self.service.mark_running(work_order_id, &run.id).await {
            Ok(order) => order,
            Err(e) => {
                warn!(work_order_id, error = %e, "could not transition to running");
                self.queue.cancel(work_order_id).await;
                return;
            }
        };
        self.broadcast(OrchestratorEvent::StatusChanged {
            work_order_id: order.id.clone(),
            status: order.status,
        })
        .await;
        self.observability.record_processed().await;
        self.observability
            .record(
                &order.id,
                AuditEventKind::Started,
                format!("attempt {attempt}, run {}", run.id),
            )
            .await;

        let cancel = CancellationToken::new();
        self.queue
            .mark_started(
                &order.id,
                StartOptions {
                    max_wall_clock: Some(Duration::from_secs(order.max_wall_clock_secs)),
                    cancel: Some(cancel.clone()),
                },
            )
            .await;

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut run = run;
            let result = orchestrator.execute_attempt(&order, &mut run, cancel).await;
            orchestrator
                .finish_attempt(&order, run, attempt, result)
                .await;
        });
    }

    /// Resolve the workspace, build the agent command, and run it.
    async fn execute_attempt(
        self: &Arc<Self>,
        order: &WorkOrder,
        run: &mut Run,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, AgentGateError> {
        let workspace = self
            .materializer
            .materialize(&order.id, &order.workspace)
            .await?;

        let invocation = self.agents.get(order.agent).ok_or_else(|| {
            AgentGateError::Validation(format!("no agent command registered for {}", order.agent))
        })?;

        run.state = RunStateMachine::transition(&run.id, run.state, RunState::AgentWorking)?;
        run.iteration = 1;
        self.runs.save(run).await?;

        let mut args = invocation.args.clone();
        args.push(order.prompt.clone());

        let mut env = policy_env(&order.policies);
        env.insert("AGENTGATE_WORK_ORDER_ID".to_owned(), order.id.clone());
        env.insert("AGENTGATE_RUN_ID".to_owned(), run.id.clone());

        // Forward agent events to subscribers for the life of the call.
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let forwarder = {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    orchestrator.broadcast(OrchestratorEvent::Agent(event)).await;
                }
            })
        };

        let options = ExecOptions {
            work_order_id: order.id.clone(),
            run_id: run.id.clone(),
            cwd: Some(workspace),
            env,
            timeout: Some(Duration::from_secs(order.max_wall_clock_secs)),
            cancel: Some(cancel),
            events: Some(events_tx),
            filter: self.config.event_filter,
        };

        let result = executor::execute(&invocation.program, &args, options, &self.processes).await;
        let _ = forwarder.await;
        Ok(result)
    }

    /// Reconcile stores and scheduler after an attempt resolves.
    async fn finish_attempt(
        self: &Arc<Self>,
        order: &WorkOrder,
        mut run: Run,
        attempt: u32,
        result: Result<ExecutionResult, AgentGateError>,
    ) {
        self.queue.mark_completed(&order.id).await;

        let status = match &result {
            Ok(exec) => {
                run.session_id = exec.session_id.clone();
                run.result = exec.structured_output.clone();
                run.completed_at = Some(chrono::Utc::now());
                // Verification gates live outside this crate, so the run
                // passes straight through the verifying step.
                let outcome = if exec.success {
                    RunState::Complete
                } else {
                    RunState::Failed
                };
                run.state = RunStateMachine::transition(&run.id, run.state, RunState::Verifying)
                    .and_then(|s| RunStateMachine::transition(&run.id, s, outcome))
                    .unwrap_or(outcome);
                if !exec.success && !exec.stderr.is_empty() {
                    run.warnings.push(format!(
                        "stderr: {}",
                        exec.stderr.chars().take(2000).collect::<String>()
                    ));
                }
                if let Err(e) = self.runs.save(&run).await {
                    warn!(run_id = %run.id, error = %e, "failed to persist run result");
                }

                let iteration = agentgate_store::models::IterationData {
                    iteration: run.iteration.max(1),
                    snapshot_id: None,
                    verification_passed: Some(exec.success),
                    agent_session_id: exec.session_id.clone(),
                    input_tokens: exec.tokens_used.map(|t| t.input).unwrap_or(0),
                    output_tokens: exec.tokens_used.map(|t| t.output).unwrap_or(0),
                    total_tokens: exec.tokens_used.map(|t| t.total).unwrap_or(0),
                    duration_ms: exec.duration.as_millis() as u64,
                    errors: if exec.success {
                        Vec::new()
                    } else {
                        vec![format!("exit code {}", exec.exit_code)]
                    },
                };
                if let Err(e) = self.runs.record_iteration(&run.id, &iteration).await {
                    debug!(run_id = %run.id, error = %e, "failed to record iteration");
                }

                if exec.cancelled {
                    self.observability
                        .record(&order.id, AuditEventKind::Canceled, "cancelled mid-run")
                        .await;
                    self.write_final_status(&order.id, WorkOrderStatus::Canceled, "canceled")
                        .await
                } else if exec.success {
                    self.observability
                        .record_completed(&order.id, exec.duration)
                        .await;
                    self.write_final_status(&order.id, WorkOrderStatus::Succeeded, "")
                        .await
                } else {
                    let message = if exec.exit_code == executor::EXIT_TIMEOUT {
                        format!(
                            "wall clock exceeded after {}s",
                            exec.duration.as_secs()
                        )
                    } else if exec.stderr.trim().is_empty() {
                        format!("agent exited with code {}", exec.exit_code)
                    } else {
                        format!(
                            "agent exited with code {}: {}",
                            exec.exit_code,
                            exec.stderr.trim().chars().take(500).collect::<String>()
                        )
                    };
                    self.fail_and_maybe_retry(&order.id, attempt, &message, true)
                        .await
                }
            }
            Err(e) => {
                run.completed_at = Some(chrono::Utc::now());
                run.state = RunStateMachine::transition(&run.id, run.state, RunState::Failed)
                    .unwrap_or(RunState::Failed);
                run.warnings.push(e.to_string());
                if let Err(save_err) = self.runs.save(&run).await {
                    warn!(run_id = %run.id, error = %save_err, "failed to persist run failure");
                }
                let retryable = e.is_retryable();
                let message = e.to_string();
                self.fail_and_maybe_retry(&order.id, attempt, &message, retryable)
                    .await
            }
        };

        if let Some(status) = status {
            self.broadcast(OrchestratorEvent::StatusChanged {
                work_order_id: order.id.clone(),
                status,
            })
            .await;
        }
    }

    async fn write_final_status(
        &self,
        work_order_id: &str,
        status: WorkOrderStatus,
        error: &str,
    ) -> Option<WorkOrderStatus> {
        let result = match status {
            WorkOrderStatus::Succeeded => self.service.mark_succeeded(work_order_id).await,
            WorkOrderStatus::Canceled => {
                // service::cancel handles the running -> canceled write and
                // the (already cancelled) handle.
                self.service.cancel(work_order_id).await
            }
            _ => self.service.mark_failed(work_order_id, error).await,
        };

        match result {
            Ok(order) => Some(order.status),
            Err(e) => {
                // A concurrent cancel/kill may have already written a
                // terminal status; that is not a defect.
                debug!(work_order_id, error = %e, "final status write skipped");
                None
            }
        }
    }

    async fn fail_and_maybe_retry(
        &self,
        work_order_id: &str,
        attempt: u32,
        message: &str,
        retryable: bool,
    ) -> Option<WorkOrderStatus> {
        let err = anyhow::anyhow!("{message}");
        self.observability.record_failure(work_order_id, &err).await;

        let status = self
            .write_final_status(work_order_id, WorkOrderStatus::Failed, message)
            .await;

        if self.retries.should_retry(attempt, retryable) {
            let retries = Arc::clone(&self.retries);
            let state = retries.schedule_retry(work_order_id, attempt, message).await;
            self.observability
                .record(
                    work_order_id,
                    AuditEventKind::RetryScheduled,
                    format!("attempt {attempt} failed, next at {}", state.next_retry_at),
                )
                .await;
        }

        status
    }
}
