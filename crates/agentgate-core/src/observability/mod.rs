//! Counters, durations, audit trail, and health sampling.
//!
//! The audit trail is the place failure detail lives; the user-visible
//! work-order record only carries a one-line `error` string.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::System;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sliding window length for run durations.
const DURATION_WINDOW: usize = 100;
/// Cap on audit records kept per work order; oldest are dropped.
const AUDIT_CAP: usize = 500;

// ---------------------------------------------------------------------------
// Memory pressure & health
// ---------------------------------------------------------------------------

/// Memory pressure classification fed into the scheduler's slot decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Under 75% of memory used.
    Normal,
    /// 75-90% used: new slots are granted but logged.
    Warning,
    /// 90%+ used: no new slots are granted.
    Critical,
}

impl MemoryPressure {
    /// Classify a used-memory percentage.
    pub fn classify(used_pct: f64) -> Self {
        if used_pct >= 90.0 {
            Self::Critical
        } else if used_pct >= 75.0 {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

/// Overall system health, derived from memory pressure and retry backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// One health report sample.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub pressure: MemoryPressure,
    pub memory_used_pct: f64,
    pub active_slots: usize,
    pub available_slots: usize,
    pub pending_retries: usize,
    pub queue_depth: usize,
    pub sampled_at: DateTime<Utc>,
}

/// Samples process-wide memory via `sysinfo` and classifies pressure.
pub struct HealthMonitor {
    system: Mutex<System>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
        }
    }

    /// Percentage of physical memory currently used.
    pub async fn memory_used_pct(&self) -> f64 {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        (system.used_memory() as f64 / total as f64) * 100.0
    }

    /// Take a full health sample.
    pub async fn sample(
        &self,
        active_slots: usize,
        max_slots: usize,
        pending_retries: usize,
        queue_depth: usize,
    ) -> HealthSnapshot {
        let memory_used_pct = self.memory_used_pct().await;
        let pressure = MemoryPressure::classify(memory_used_pct);

        let status = match pressure {
            MemoryPressure::Critical => HealthStatus::Unhealthy,
            MemoryPressure::Warning => HealthStatus::Degraded,
            MemoryPressure::Normal => {
                if active_slots == max_slots && queue_depth > 0 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        };

        HealthSnapshot {
            status,
            pressure,
            memory_used_pct,
            active_slots,
            available_slots: max_slots.saturating_sub(active_slots),
            pending_retries,
            queue_depth,
            sampled_at: Utc::now(),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// Kind of audit event recorded per work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEventKind {
    Submitted,
    Enqueued,
    Started,
    Completed,
    Failed,
    Canceled,
    RetryScheduled,
    Killed,
    TimedOut,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Enqueued => "enqueued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::RetryScheduled => "retry_scheduled",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// One audit record. Ordered append within a work order.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub kind: AuditEventKind,
    pub at: DateTime<Utc>,
    pub detail: String,
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

struct ObsInner {
    metrics: MetricsSnapshot,
    durations: std::collections::VecDeque<Duration>,
    audit: HashMap<String, Vec<AuditRecord>>,
}

/// Counters, duration percentiles, and the per-work-order audit trail.
pub struct Observability {
    inner: Mutex<ObsInner>,
}

impl Observability {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ObsInner {
                metrics: MetricsSnapshot::default(),
                durations: std::collections::VecDeque::new(),
                audit: HashMap::new(),
            }),
        }
    }

    /// Append an audit record for a work order.
    pub async fn record(&self, work_order_id: &str, kind: AuditEventKind, detail: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        let trail = inner.audit.entry(work_order_id.to_owned()).or_default();
        if trail.len() == AUDIT_CAP {
            trail.remove(0);
        }
        trail.push(AuditRecord {
            kind,
            at: Utc::now(),
            detail: detail.into(),
        });
    }

    /// Record a failure with the full error chain. The detail is never an
    /// empty placeholder.
    pub async fn record_failure(&self, work_order_id: &str, error: &anyhow::Error) {
        let mut detail = format!("{error:#}");
        if detail.is_empty() {
            detail = "unknown error".to_owned();
        }
        self.record(work_order_id, AuditEventKind::Failed, detail).await;
        self.inner.lock().await.metrics.failed += 1;
    }

    pub async fn record_completed(&self, work_order_id: &str, duration: Duration) {
        self.record(
            work_order_id,
            AuditEventKind::Completed,
            format!("completed in {}ms", duration.as_millis()),
        )
        .await;
        let mut inner = self.inner.lock().await;
        inner.metrics.completed += 1;
        if inner.durations.len() == DURATION_WINDOW {
            inner.durations.pop_front();
        }
        inner.durations.push_back(duration);
    }

    pub async fn record_processed(&self) {
        self.inner.lock().await.metrics.total_processed += 1;
    }

    pub async fn record_retried(&self) {
        self.inner.lock().await.metrics.retried += 1;
    }

    /// The ordered audit trail for one work order.
    pub async fn audit_trail(&self, work_order_id: &str) -> Vec<AuditRecord> {
        self.inner
            .lock()
            .await
            .audit
            .get(work_order_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.inner.lock().await.metrics.clone()
    }

    /// Mean run duration over the sliding window.
    pub async fn average_duration(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        if inner.durations.is_empty() {
            return None;
        }
        let total: Duration = inner.durations.iter().sum();
        Some(total / inner.durations.len() as u32)
    }

    /// 95th-percentile run duration over the sliding window.
    pub async fn p95_duration(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        if inner.durations.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = inner.durations.iter().copied().collect();
        sorted.sort();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize - 1;
        Some(sorted[idx.min(sorted.len() - 1)])
    }
}

impl Default for Observability {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the periodic health reporter. Each tick samples memory, logs the
/// snapshot, and feeds the pressure level into the scheduler.
pub fn start_health_reporter(
    monitor: Arc<HealthMonitor>,
    queue: Arc<crate::queue::SchedulerQueue>,
    retry: Arc<crate::retry::RetryManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let stats = queue.stats().await;
                    let snapshot = monitor
                        .sample(
                            stats.running,
                            stats.max_concurrent,
                            retry.pending_count().await,
                            stats.waiting,
                        )
                        .await;
                    queue.set_pressure(snapshot.pressure).await;
                    match snapshot.status {
                        HealthStatus::Healthy => debug!(
                            memory_pct = format!("{:.1}", snapshot.memory_used_pct),
                            active = snapshot.active_slots,
                            queued = snapshot.queue_depth,
                            "health: healthy"
                        ),
                        HealthStatus::Degraded => info!(
                            memory_pct = format!("{:.1}", snapshot.memory_used_pct),
                            active = snapshot.active_slots,
                            queued = snapshot.queue_depth,
                            "health: degraded"
                        ),
                        HealthStatus::Unhealthy => warn!(
                            memory_pct = format!("{:.1}", snapshot.memory_used_pct),
                            active = snapshot.active_slots,
                            queued = snapshot.queue_depth,
                            "health: unhealthy, withholding new slots"
                        ),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}
