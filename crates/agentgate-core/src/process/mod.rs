//! Child-process tracking and termination.
//!
//! The process manager exclusively owns spawned [`tokio::process::Child`]
//! handles, keyed by work-order id. Each registration gets a waiter task
//! that observes exit exactly once, records the code or signal, emits
//! [`ProcessEvent::Exited`], and drops the registration. Termination is
//! graceful-then-forceful: SIGTERM, a bounded grace wait, then SIGKILL.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AgentGateError;

/// Process-manager configuration.
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Grace wait between SIGTERM and SIGKILL when the caller does not
    /// override it.
    pub default_grace_period: Duration,
    /// How long to wait for exit after SIGKILL before reporting failure.
    pub forced_kill_wait: Duration,
    /// Runtime past which the stale-process monitor logs an entry.
    pub max_process_lifetime: Duration,
    /// Stale-check interval.
    pub monitor_interval: Duration,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            default_grace_period: Duration::from_secs(1),
            forced_kill_wait: Duration::from_secs(2),
            max_process_lifetime: Duration::from_secs(2 * 60 * 60),
            monitor_interval: Duration::from_secs(60),
        }
    }
}

/// Events emitted by the process manager.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A tracked child exited (normally or by signal).
    Exited(TrackedProcess),
}

/// Snapshot of one tracked child.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub work_order_id: String,
    pub run_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub kill_signal_sent: bool,
    pub kill_signal_at: Option<DateTime<Utc>>,
    pub has_exited: bool,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
}

/// Options for [`ProcessManager::kill`].
#[derive(Debug, Clone, Default)]
pub struct KillOptions {
    /// Override of the configured grace period.
    pub grace_period: Option<Duration>,
    /// Recorded in the log line for the kill.
    pub reason: Option<String>,
    /// Skip the graceful attempt entirely.
    pub force_immediate: bool,
}

/// Outcome of a kill attempt.
#[derive(Debug, Clone)]
pub struct KillResult {
    pub success: bool,
    pub forced_kill: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

impl KillResult {
    fn already_gone() -> Self {
        Self {
            success: true,
            forced_kill: false,
            duration: Duration::ZERO,
            error: None,
        }
    }
}

/// Shared per-registration state. The waiter task flips `exited` exactly
/// once; kill waits on it instead of racing for the child handle.
pub struct ProcessHandle {
    info: std::sync::Mutex<TrackedProcess>,
    started: Instant,
    exited_rx: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// Snapshot the tracked state.
    pub fn info(&self) -> TrackedProcess {
        self.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn runtime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait until the child has exited, up to `timeout`. Returns whether
    /// the exit was observed in time.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut rx = self.exited_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if *rx.borrow() {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped without flipping: waiter died, treat as
                // exited so callers do not hang.
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }

    /// Wait for exit with no deadline.
    pub async fn wait_exited_forever(&self) {
        let mut rx = self.exited_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Registration {
    generation: u64,
    handle: Arc<ProcessHandle>,
}

/// Tracks and terminates agent child processes.
pub struct ProcessManager {
    config: ProcessManagerConfig,
    processes: Mutex<HashMap<String, Registration>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    generation: AtomicU64,
    monitor: Mutex<Option<CancellationToken>>,
}

impl ProcessManager {
    pub fn new(config: ProcessManagerConfig, events: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
            events,
            generation: AtomicU64::new(0),
            monitor: Mutex::new(None),
        }
    }

    /// Register a spawned child under its work-order id.
    ///
    /// Rejects a child with no pid (already reaped). A live registration
    /// for the same work order is replaced with a warning; its waiter task
    /// keeps running and still reaps the old child.
    pub async fn register(
        self: &Arc<Self>,
        work_order_id: &str,
        run_id: &str,
        mut child: Child,
    ) -> Result<Arc<ProcessHandle>, AgentGateError> {
        let Some(pid) = child.id() else {
            return Err(AgentGateError::Execution(format!(
                "cannot register process for {work_order_id}: child has no pid"
            )));
        };

        let (exited_tx, exited_rx) = watch::channel(false);
        let handle = Arc::new(ProcessHandle {
            info: std::sync::Mutex::new(TrackedProcess {
                work_order_id: work_order_id.to_owned(),
                run_id: run_id.to_owned(),
                pid,
                started_at: Utc::now(),
                kill_signal_sent: false,
                kill_signal_at: None,
                has_exited: false,
                exit_code: None,
                exit_signal: None,
            }),
            started: Instant::now(),
            exited_rx,
        });

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut processes = self.processes.lock().await;
            if let Some(old) = processes.get(work_order_id) {
                if !old.handle.info().has_exited {
                    warn!(
                        work_order_id,
                        old_pid = old.handle.info().pid,
                        new_pid = pid,
                        "replacing live process registration"
                    );
                }
            }
            processes.insert(
                work_order_id.to_owned(),
                Registration {
                    generation,
                    handle: Arc::clone(&handle),
                },
            );
        }

        // Waiter: observe exit once, record it, emit, unregister.
        let manager = Arc::clone(self);
        let waiter_handle = Arc::clone(&handle);
        let id = work_order_id.to_owned();
        tokio::spawn(async move {
            let status = child.wait().await;

            let snapshot = {
                let mut info = waiter_handle.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                // Guard against a second completion path; the first
                // observation wins.
                if !info.has_exited {
                    info.has_exited = true;
                    match status {
                        Ok(status) => {
                            info.exit_code = status.code();
                            #[cfg(unix)]
                            {
                                use std::os::unix::process::ExitStatusExt;
                                info.exit_signal = status.signal();
                            }
                        }
                        Err(e) => {
                            debug!(work_order_id = %id, error = %e, "wait on child failed");
                        }
                    }
                }
                info.clone()
            };

            let _ = exited_tx.send(true);
            if manager.events.send(ProcessEvent::Exited(snapshot)).is_err() {
                debug!(work_order_id = %id, "process event receiver gone");
            }

            // Unregister, unless a newer registration took the slot.
            let mut processes = manager.processes.lock().await;
            if processes
                .get(&id)
                .is_some_and(|reg| reg.generation == generation)
            {
                processes.remove(&id);
            }
        });

        Ok(handle)
    }

    /// Terminate the process for a work order.
    ///
    /// Graceful path: SIGTERM, wait up to the grace period for exit.
    /// Escalation (or `force_immediate`): SIGKILL, wait up to the forced-
    /// kill wait. Idempotent: killing an id with no live process succeeds.
    pub async fn kill(&self, work_order_id: &str, options: KillOptions) -> KillResult {
        let start = Instant::now();

        let handle = {
            let processes = self.processes.lock().await;
            match processes.get(work_order_id) {
                Some(reg) => Arc::clone(&reg.handle),
                None => return KillResult::already_gone(),
            }
        };

        let info = handle.info();
        if info.has_exited {
            return KillResult::already_gone();
        }
        let pid = info.pid;

        debug!(
            work_order_id,
            pid,
            reason = options.reason.as_deref().unwrap_or("unspecified"),
            force_immediate = options.force_immediate,
            "killing process"
        );

        if !options.force_immediate {
            let grace = options
                .grace_period
                .unwrap_or(self.config.default_grace_period);

            {
                let mut info = handle.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                info.kill_signal_sent = true;
                info.kill_signal_at = Some(Utc::now());
            }

            if !send_signal(pid, TERM_SIGNAL) {
                warn!(work_order_id, pid, "terminate signal delivery failed, escalating");
            } else if handle.wait_exited(grace).await {
                return KillResult {
                    success: true,
                    forced_kill: false,
                    duration: start.elapsed(),
                    error: None,
                };
            }
        }

        // Forced kill.
        {
            let mut info = handle.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            info.kill_signal_sent = true;
            if info.kill_signal_at.is_none() {
                info.kill_signal_at = Some(Utc::now());
            }
        }
        let sent = send_signal(pid, KILL_SIGNAL);
        if handle.wait_exited(self.config.forced_kill_wait).await {
            return KillResult {
                success: true,
                forced_kill: true,
                duration: start.elapsed(),
                error: None,
            };
        }

        KillResult {
            success: false,
            forced_kill: true,
            duration: start.elapsed(),
            error: Some(if sent {
                format!("process {pid} did not exit after forced kill")
            } else {
                format!("failed to deliver kill signal to process {pid}")
            }),
        }
    }

    /// Kill with immediate escalation.
    pub async fn force_kill(&self, work_order_id: &str, reason: Option<String>) -> KillResult {
        self.kill(
            work_order_id,
            KillOptions {
                grace_period: None,
                reason,
                force_immediate: true,
            },
        )
        .await
    }

    /// Kill every tracked process in parallel.
    pub async fn kill_all(&self, options: KillOptions) -> HashMap<String, KillResult> {
        let ids: Vec<String> = {
            let processes = self.processes.lock().await;
            processes.keys().cloned().collect()
        };

        let kills = ids.into_iter().map(|id| {
            let options = options.clone();
            async move {
                let result = self.kill(&id, options).await;
                (id, result)
            }
        });

        futures::future::join_all(kills).await.into_iter().collect()
    }

    /// Whether a live (not yet exited) process is tracked for this id.
    pub async fn has_active_process(&self, work_order_id: &str) -> bool {
        let processes = self.processes.lock().await;
        processes
            .get(work_order_id)
            .is_some_and(|reg| !reg.handle.info().has_exited)
    }

    /// Snapshot of the tracked process for this id, if any.
    pub async fn get_process(&self, work_order_id: &str) -> Option<TrackedProcess> {
        let processes = self.processes.lock().await;
        processes.get(work_order_id).map(|reg| reg.handle.info())
    }

    pub async fn active_count(&self) -> usize {
        let processes = self.processes.lock().await;
        processes
            .values()
            .filter(|reg| !reg.handle.info().has_exited)
            .count()
    }

    pub async fn all_processes(&self) -> Vec<TrackedProcess> {
        let processes = self.processes.lock().await;
        processes.values().map(|reg| reg.handle.info()).collect()
    }

    /// Start the stale-process monitor: logs (never kills) entries whose
    /// runtime exceeds `max_process_lifetime`.
    pub async fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *monitor = Some(token.clone());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.monitor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let processes = manager.processes.lock().await;
                        for reg in processes.values() {
                            let runtime = reg.handle.runtime();
                            if runtime > manager.config.max_process_lifetime {
                                let info = reg.handle.info();
                                warn!(
                                    work_order_id = %info.work_order_id,
                                    pid = info.pid,
                                    runtime_secs = runtime.as_secs(),
                                    "process exceeds max lifetime"
                                );
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    pub async fn stop_monitoring(&self) {
        if let Some(token) = self.monitor.lock().await.take() {
            token.cancel();
        }
    }
}

#[cfg(unix)]
const TERM_SIGNAL: i32 = libc::SIGTERM;
#[cfg(unix)]
const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const TERM_SIGNAL: i32 = 15;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;

/// Deliver a signal to a pid. Returns whether delivery succeeded.
#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> bool {
    // SAFETY: pid comes from a child we spawned.
    unsafe { libc::kill(pid as i32, signal) == 0 }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn manager() -> (Arc<ProcessManager>, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ProcessManager::new(
                ProcessManagerConfig {
                    default_grace_period: Duration::from_millis(200),
                    forced_kill_wait: Duration::from_secs(2),
                    max_process_lifetime: Duration::from_secs(3600),
                    monitor_interval: Duration::from_secs(60),
                },
                tx,
            )),
            rx,
        )
    }

    fn spawn_sleep(secs: u32) -> Child {
        Command::new("sleep")
            .arg(secs.to_string())
            .spawn()
            .expect("spawn sleep")
    }

    #[tokio::test]
    async fn exit_is_tracked_and_emitted() {
        let (manager, mut rx) = manager();

        let child = Command::new("true").spawn().unwrap();
        let handle = manager.register("wo_a", "run_a", child).await.unwrap();

        assert!(handle.wait_exited(Duration::from_secs(5)).await);
        let info = handle.info();
        assert!(info.has_exited);
        assert_eq!(info.exit_code, Some(0));
        assert_eq!(info.exit_signal, None);

        let ProcessEvent::Exited(tracked) =
            rx.recv().await.expect("exited event");
        assert_eq!(tracked.work_order_id, "wo_a");
        assert_eq!(tracked.run_id, "run_a");

        // Registration is gone once exit has been observed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.has_active_process("wo_a").await);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn graceful_kill_of_cooperative_child() {
        let (manager, _rx) = manager();

        let child = spawn_sleep(600);
        manager.register("wo_a", "run_a", child).await.unwrap();
        assert!(manager.has_active_process("wo_a").await);

        let result = manager.kill("wo_a", KillOptions::default()).await;
        assert!(result.success, "kill failed: {:?}", result.error);
        assert!(!result.forced_kill, "sleep dies on SIGTERM, no escalation");
        assert!(!manager.has_active_process("wo_a").await);
    }

    #[tokio::test]
    async fn escalates_when_child_ignores_sigterm() {
        let (manager, _rx) = manager();

        // A shell that traps and ignores SIGTERM.
        let child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 0.1; done")
            .spawn()
            .unwrap();
        manager.register("wo_stubborn", "run_a", child).await.unwrap();

        let result = manager
            .kill(
                "wo_stubborn",
                KillOptions {
                    grace_period: Some(Duration::from_millis(300)),
                    reason: Some("test".to_owned()),
                    force_immediate: false,
                },
            )
            .await;

        assert!(result.success, "kill failed: {:?}", result.error);
        assert!(result.forced_kill, "escalation to SIGKILL expected");
        assert!(result.duration >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let (manager, _rx) = manager();

        let child = spawn_sleep(600);
        manager.register("wo_a", "run_a", child).await.unwrap();

        let first = manager.kill("wo_a", KillOptions::default()).await;
        assert!(first.success);

        let second = manager.kill("wo_a", KillOptions::default()).await;
        assert!(second.success, "second kill reports success");
        assert!(!second.forced_kill);
    }

    #[tokio::test]
    async fn force_kill_skips_grace() {
        let (manager, _rx) = manager();

        let child = spawn_sleep(600);
        manager.register("wo_a", "run_a", child).await.unwrap();

        let result = manager.force_kill("wo_a", Some("shutdown".to_owned())).await;
        assert!(result.success);
        assert!(result.forced_kill);
    }

    #[tokio::test]
    async fn kill_all_runs_in_parallel() {
        let (manager, _rx) = manager();

        for i in 0..3 {
            let child = spawn_sleep(600);
            manager
                .register(&format!("wo_{i}"), "run_a", child)
                .await
                .unwrap();
        }
        assert_eq!(manager.active_count().await, 3);

        let results = manager.kill_all(KillOptions::default()).await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.success));
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_registration_replaces() {
        let (manager, _rx) = manager();

        let first = spawn_sleep(600);
        manager.register("wo_a", "run_1", first).await.unwrap();
        let first_pid = manager.get_process("wo_a").await.unwrap().pid;

        let second = spawn_sleep(600);
        manager.register("wo_a", "run_2", second).await.unwrap();
        let info = manager.get_process("wo_a").await.unwrap();
        assert_ne!(info.pid, first_pid);
        assert_eq!(info.run_id, "run_2");

        // Clean up both children.
        manager.kill("wo_a", KillOptions::default()).await;
        let _ = send_signal(first_pid, KILL_SIGNAL);
    }

    #[tokio::test]
    async fn signalled_exit_records_signal() {
        let (manager, _rx) = manager();

        let child = spawn_sleep(600);
        let handle = manager.register("wo_sig", "run_a", child).await.unwrap();
        let pid = handle.info().pid;

        assert!(send_signal(pid, KILL_SIGNAL));
        assert!(handle.wait_exited(Duration::from_secs(5)).await);

        let info = handle.info();
        assert!(info.has_exited);
        assert_eq!(info.exit_code, None, "killed process has no exit code");
        #[cfg(unix)]
        assert_eq!(info.exit_signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn monitoring_start_stop() {
        let (manager, _rx) = manager();
        manager.start_monitoring().await;
        // Second start is a no-op.
        manager.start_monitoring().await;
        manager.stop_monitoring().await;
        // Stop again is harmless.
        manager.stop_monitoring().await;
    }
}
