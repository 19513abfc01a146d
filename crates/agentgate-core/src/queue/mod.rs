//! Priority queue and scheduler for work orders.
//!
//! A single ordered sequence with priority-then-FIFO ordering, admission
//! control against a depth cap and duplicate ids, a concurrency-capped
//! running set, wait-time estimation over a sliding window, and two
//! watchdog timers (queue max-wait and per-run wall clock).
//!
//! Scheduler decisions surface as [`SchedulerEvent`] values on a channel
//! handed in at construction; the orchestrator pairs every `Ready` with a
//! later [`SchedulerQueue::mark_started`] or [`SchedulerQueue::cancel`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agentgate_store::queue_state::{self, PersistedQueueEntry, QueueSnapshot};

use crate::observability::MemoryPressure;

/// Sliding window length for observed wait times.
const WAIT_WINDOW: usize = 50;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum concurrently running work orders.
    pub max_concurrent: usize,
    /// Maximum queued (not yet running) work orders.
    pub max_queue_size: usize,
    /// Watchdog tick interval. This is the worst-case lag on queue-wait
    /// and run-wall-clock timeout detection.
    pub tick_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue_size: 100,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The head of the queue may start; the consumer must follow up with
    /// `mark_started` or `cancel`.
    Ready { work_order_id: String },
    /// A queued entry exceeded its max wait and was dropped.
    Timeout { work_order_id: String },
    /// A running entry exceeded its wall-clock cap. Emitted at most once
    /// per entry; the consumer aborts the work.
    RunTimeout {
        work_order_id: String,
        elapsed: Duration,
        cap: Duration,
    },
    /// Queue or running-set membership changed.
    StateChange,
}

/// Options for [`SchedulerQueue::enqueue`].
#[derive(Debug, Default)]
pub struct EnqueueOptions {
    /// Higher runs first; equal priorities are FIFO.
    pub priority: i32,
    /// Drop the entry (emitting `Timeout`) if it has not started within
    /// this long of enqueue.
    pub max_wait: Option<Duration>,
    /// Receives the entry's new 1-indexed position whenever it changes.
    pub position_tx: Option<mpsc::UnboundedSender<usize>>,
}

/// Synchronous result of an enqueue attempt.
#[derive(Debug)]
pub struct EnqueueOutcome {
    pub accepted: bool,
    /// 1-indexed position on acceptance.
    pub position: Option<usize>,
    pub error: Option<String>,
}

/// Options for [`SchedulerQueue::mark_started`].
#[derive(Debug, Default)]
pub struct StartOptions {
    /// Wall-clock cap for this run; the run-timeout watchdog emits
    /// [`SchedulerEvent::RunTimeout`] once it elapses.
    pub max_wall_clock: Option<Duration>,
    /// Cancelled by [`SchedulerQueue::cancel_running`] to abort the work.
    pub cancel: Option<CancellationToken>,
}

/// Point-in-time position info for one work order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePosition {
    /// 1-indexed rank for queued entries; 0 means running.
    pub position: usize,
    /// Entries ahead in the queue.
    pub ahead: usize,
    /// `None` when no wait observations exist yet.
    pub estimated_wait: Option<Duration>,
    pub state: QueueEntryState,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEntryState {
    Queued,
    Running,
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub average_wait: Option<Duration>,
    pub accepting: bool,
}

struct QueuedEntry {
    work_order_id: String,
    priority: i32,
    enqueued_at: Instant,
    enqueued_at_wall: DateTime<Utc>,
    max_wait: Option<Duration>,
    position_tx: Option<mpsc::UnboundedSender<usize>>,
    last_notified_position: Option<usize>,
    /// `Ready` has been emitted for this entry.
    notified: bool,
}

struct RunningEntry {
    started_at: Instant,
    enqueued_at_wall: DateTime<Utc>,
    max_wall_clock: Option<Duration>,
    cancel: Option<CancellationToken>,
}

struct QueueInner {
    queue: Vec<QueuedEntry>,
    running: HashMap<String, RunningEntry>,
    wait_times: VecDeque<Duration>,
    accepting: bool,
    pressure: MemoryPressure,
}

impl QueueInner {
    fn average_wait(&self) -> Option<Duration> {
        if self.wait_times.is_empty() {
            return None;
        }
        let total: Duration = self.wait_times.iter().sum();
        Some(total / self.wait_times.len() as u32)
    }

    fn record_wait(&mut self, wait: Duration) {
        if self.wait_times.len() == WAIT_WINDOW {
            self.wait_times.pop_front();
        }
        self.wait_times.push_back(wait);
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.queue.iter().position(|e| e.work_order_id == id)
    }

    /// Whether a new run may be admitted right now.
    fn slot_free(&self, max_concurrent: usize) -> bool {
        if self.running.len() >= max_concurrent {
            return false;
        }
        match self.pressure {
            MemoryPressure::Critical => {
                debug!("slot withheld under critical memory pressure");
                false
            }
            MemoryPressure::Warning => {
                warn!("granting slot under memory-pressure warning");
                true
            }
            MemoryPressure::Normal => true,
        }
    }

    /// Notify every entry whose 1-indexed position changed since the last
    /// notification. A send to a dropped receiver is swallowed.
    fn notify_positions(&mut self) {
        for (idx, entry) in self.queue.iter_mut().enumerate() {
            let position = idx + 1;
            if entry.last_notified_position == Some(position) {
                continue;
            }
            entry.last_notified_position = Some(position);
            if let Some(tx) = &entry.position_tx {
                if tx.send(position).is_err() {
                    debug!(
                        work_order_id = %entry.work_order_id,
                        "position subscriber gone, dropping notification"
                    );
                }
            }
        }
    }
}

/// The scheduler.
pub struct SchedulerQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerQueue {
    pub fn new(config: QueueConfig, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner {
                queue: Vec::new(),
                running: HashMap::new(),
                wait_times: VecDeque::new(),
                accepting: true,
                pressure: MemoryPressure::Normal,
            }),
            events,
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if self.events.send(event).is_err() {
            debug!("scheduler event receiver gone");
        }
    }

    /// Admit a work order into the queue.
    ///
    /// Rejected when the id is already queued or running, when the queue is
    /// at `max_queue_size`, or when the scheduler is not accepting. On
    /// acceptance the entry is inserted at the first index whose priority
    /// is strictly lower (priority order, FIFO within a band).
    pub async fn enqueue(&self, work_order_id: &str, options: EnqueueOptions) -> EnqueueOutcome {
        let mut inner = self.inner.lock().await;

        if !inner.accepting {
            return EnqueueOutcome {
                accepted: false,
                position: None,
                error: Some("scheduler is not accepting new work".to_owned()),
            };
        }
        if inner.index_of(work_order_id).is_some() || inner.running.contains_key(work_order_id) {
            return EnqueueOutcome {
                accepted: false,
                position: None,
                error: Some(format!("{work_order_id} is already queued or running")),
            };
        }
        if inner.queue.len() >= self.config.max_queue_size {
            return EnqueueOutcome {
                accepted: false,
                position: None,
                error: Some(format!(
                    "queue is full ({} entries)",
                    self.config.max_queue_size
                )),
            };
        }

        let entry = QueuedEntry {
            work_order_id: work_order_id.to_owned(),
            priority: options.priority,
            enqueued_at: Instant::now(),
            enqueued_at_wall: Utc::now(),
            max_wait: options.max_wait,
            position_tx: options.position_tx,
            last_notified_position: None,
            notified: false,
        };

        let idx = inner
            .queue
            .iter()
            .position(|e| e.priority < options.priority)
            .unwrap_or(inner.queue.len());
        inner.queue.insert(idx, entry);
        inner.notify_positions();

        self.emit(SchedulerEvent::StateChange);
        self.process_locked(&mut inner);

        EnqueueOutcome {
            accepted: true,
            position: Some(idx + 1),
            error: None,
        }
    }

    /// Remove and return the head of the queue, if a slot is free.
    ///
    /// The id is moved into the running set with no wall-clock cap or
    /// cancel handle; use [`Self::mark_started`] to attach those.
    pub async fn dequeue(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        if !inner.slot_free(self.config.max_concurrent) || inner.queue.is_empty() {
            return None;
        }

        let entry = inner.queue.remove(0);
        let wait = entry.enqueued_at.elapsed();
        inner.record_wait(wait);
        inner.running.insert(
            entry.work_order_id.clone(),
            RunningEntry {
                started_at: Instant::now(),
                enqueued_at_wall: entry.enqueued_at_wall,
                max_wall_clock: None,
                cancel: None,
            },
        );
        inner.notify_positions();
        self.emit(SchedulerEvent::StateChange);

        Some(entry.work_order_id)
    }

    /// The id at the head of the queue, if any.
    pub async fn peek(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.queue.first().map(|e| e.work_order_id.clone())
    }

    /// Position info for a queued or running work order.
    pub async fn position(&self, work_order_id: &str) -> Option<QueuePosition> {
        let inner = self.inner.lock().await;

        if let Some(running) = inner.running.get(work_order_id) {
            return Some(QueuePosition {
                position: 0,
                ahead: 0,
                estimated_wait: Some(Duration::ZERO),
                state: QueueEntryState::Running,
                enqueued_at: running.enqueued_at_wall,
            });
        }

        let idx = inner.index_of(work_order_id)?;
        let entry = &inner.queue[idx];

        let estimated_wait = if idx == 0 && inner.slot_free(self.config.max_concurrent) {
            Some(Duration::ZERO)
        } else {
            inner.average_wait().map(|avg| {
                let batches = (idx + self.config.max_concurrent) / self.config.max_concurrent;
                avg * batches as u32
            })
        };

        Some(QueuePosition {
            position: idx + 1,
            ahead: idx,
            estimated_wait,
            state: QueueEntryState::Queued,
            enqueued_at: entry.enqueued_at_wall,
        })
    }

    /// Move a work order from the queue into the running set, recording
    /// its wait time and attaching the run's cap and cancel handle.
    ///
    /// Also accepts ids already moved by [`Self::dequeue`], in which case
    /// only the cap and cancel handle are updated.
    pub async fn mark_started(&self, work_order_id: &str, options: StartOptions) {
        let mut inner = self.inner.lock().await;

        let enqueued_at_wall = if let Some(idx) = inner.index_of(work_order_id) {
            let entry = inner.queue.remove(idx);
            let wait = entry.enqueued_at.elapsed();
            inner.record_wait(wait);
            inner.notify_positions();
            entry.enqueued_at_wall
        } else if let Some(existing) = inner.running.get_mut(work_order_id) {
            existing.max_wall_clock = options.max_wall_clock;
            existing.cancel = options.cancel;
            return;
        } else {
            Utc::now()
        };

        inner.running.insert(
            work_order_id.to_owned(),
            RunningEntry {
                started_at: Instant::now(),
                enqueued_at_wall,
                max_wall_clock: options.max_wall_clock,
                cancel: options.cancel,
            },
        );

        self.emit(SchedulerEvent::StateChange);
        self.process_locked(&mut inner);
    }

    /// Release a running slot and admit the next queued entry if possible.
    pub async fn mark_completed(&self, work_order_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.running.remove(work_order_id).is_none() {
            debug!(work_order_id, "mark_completed for id not in running set");
            return;
        }
        self.emit(SchedulerEvent::StateChange);
        self.process_locked(&mut inner);
    }

    /// Remove a queued entry. Returns `false` if the id was not queued.
    pub async fn cancel(&self, work_order_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(idx) = inner.index_of(work_order_id) else {
            return false;
        };
        inner.queue.remove(idx);
        inner.notify_positions();
        self.emit(SchedulerEvent::StateChange);
        self.process_locked(&mut inner);
        true
    }

    /// Abort a running work order through its cancel handle. Returns
    /// `false` when the id is not running or has no handle. Idempotent.
    pub async fn cancel_running(&self, work_order_id: &str) -> bool {
        let inner = self.inner.lock().await;
        match inner.running.get(work_order_id).and_then(|r| r.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether an id currently occupies the queue or a running slot.
    pub async fn is_tracked(&self, work_order_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.index_of(work_order_id).is_some() || inner.running.contains_key(work_order_id)
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        QueueStats {
            waiting: inner.queue.len(),
            running: inner.running.len(),
            max_concurrent: self.config.max_concurrent,
            max_queue_size: self.config.max_queue_size,
            average_wait: inner.average_wait(),
            accepting: inner.accepting,
        }
    }

    /// Stop or resume admitting new entries.
    pub async fn set_accepting(&self, accepting: bool) {
        self.inner.lock().await.accepting = accepting;
    }

    /// Feed the latest memory-pressure reading into slot decisions.
    pub async fn set_pressure(&self, pressure: MemoryPressure) {
        self.inner.lock().await.pressure = pressure;
    }

    /// Run one processing pass: drop expired entries, then emit `Ready`
    /// for the head if a slot is free.
    pub async fn process(&self) {
        let mut inner = self.inner.lock().await;
        self.process_locked(&mut inner);
    }

    fn process_locked(&self, inner: &mut QueueInner) {
        // Expire entries anywhere in the queue. Expiry does not wait for a
        // free slot -- an entry parked behind a long run still times out.
        let mut idx = 0;
        let mut expired = false;
        while idx < inner.queue.len() {
            let entry = &inner.queue[idx];
            let timed_out = entry
                .max_wait
                .is_some_and(|max| entry.enqueued_at.elapsed() > max);
            if timed_out {
                let entry = inner.queue.remove(idx);
                warn!(
                    work_order_id = %entry.work_order_id,
                    waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                    "dropping queued work order past its max wait"
                );
                self.emit(SchedulerEvent::Timeout {
                    work_order_id: entry.work_order_id,
                });
                expired = true;
            } else {
                idx += 1;
            }
        }
        if expired {
            inner.notify_positions();
            self.emit(SchedulerEvent::StateChange);
        }

        // Admit the head. One Ready per pass; the next is emitted when the
        // consumer answers with mark_started or cancel.
        if inner.slot_free(self.config.max_concurrent) {
            if let Some(head) = inner.queue.first_mut() {
                if !head.notified {
                    head.notified = true;
                    self.emit(SchedulerEvent::Ready {
                        work_order_id: head.work_order_id.clone(),
                    });
                }
            }
        }
    }

    /// One watchdog tick for running entries: emit `RunTimeout` for every
    /// run past its wall-clock cap. Each entry fires at most once.
    pub async fn check_run_timeouts(&self) {
        let mut inner = self.inner.lock().await;
        let mut events = Vec::new();
        for (id, entry) in inner.running.iter_mut() {
            if let Some(cap) = entry.max_wall_clock {
                let elapsed = entry.started_at.elapsed();
                if elapsed > cap {
                    entry.max_wall_clock = None;
                    events.push(SchedulerEvent::RunTimeout {
                        work_order_id: id.clone(),
                        elapsed,
                        cap,
                    });
                }
            }
        }
        drop(inner);
        for event in events {
            self.emit(event);
        }
    }

    /// Spawn the two periodic watchdogs. They stop when `shutdown` fires.
    ///
    /// The tick interval is the worst-case lag on queue-wait and run-wall-
    /// clock timeout detection.
    pub fn start_watchdogs(self: &Arc<Self>, shutdown: CancellationToken) {
        let queue = Arc::clone(self);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(queue.config.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => queue.process().await,
                    _ = token.cancelled() => break,
                }
            }
        });

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(queue.config.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => queue.check_run_timeouts().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Write a snapshot of queued entries and recent wait times. Failures
    /// are logged, never propagated.
    pub async fn persist(&self, data_dir: &PathBuf) {
        let snapshot = {
            let inner = self.inner.lock().await;
            let queue = inner
                .queue
                .iter()
                .map(|e| PersistedQueueEntry {
                    work_order_id: e.work_order_id.clone(),
                    priority: e.priority,
                    enqueued_at: e.enqueued_at_wall,
                    max_wait_ms: e.max_wait.map(|d| d.as_millis() as u64),
                })
                .collect();
            let running = inner.running.keys().cloned().collect();
            let wait_times = inner
                .wait_times
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect();
            QueueSnapshot::new(queue, running, wait_times)
        };

        if let Err(e) = queue_state::save_snapshot(data_dir, &snapshot).await {
            warn!(error = %e, "failed to persist queue snapshot");
        }
    }

    /// Restore queued entries and wait times from a snapshot.
    ///
    /// The persisted `running` set is discarded -- the orchestrator
    /// resubmits by scanning work orders left in `running` status.
    /// Returns `false` when no usable snapshot exists.
    pub async fn restore(&self, data_dir: &PathBuf) -> bool {
        let Some(snapshot) = queue_state::load_snapshot(data_dir).await else {
            return false;
        };

        let now_wall = Utc::now();
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        inner.wait_times = snapshot
            .wait_times
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();

        for persisted in snapshot.queue {
            if inner.index_of(&persisted.work_order_id).is_some() {
                continue;
            }
            // Reconstruct the monotonic enqueue instant from the wall-clock
            // age so max-wait expiry survives a restart.
            let age = (now_wall - persisted.enqueued_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let entry = QueuedEntry {
                work_order_id: persisted.work_order_id,
                priority: persisted.priority,
                enqueued_at: now.checked_sub(age).unwrap_or(now),
                enqueued_at_wall: persisted.enqueued_at,
                max_wait: persisted.max_wait_ms.map(Duration::from_millis),
                position_tx: None,
                last_notified_position: None,
                notified: false,
            };
            inner.queue.push(entry);
        }

        inner.notify_positions();
        drop(inner);

        self.emit(SchedulerEvent::StateChange);
        self.process().await;
        true
    }
}
