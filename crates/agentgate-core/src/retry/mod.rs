//! Retry scheduling with exponential backoff and jitter.
//!
//! A failed work order classified as retryable is handed here; the
//! manager arms a timer for `min(base * multiplier^attempt, max)` plus a
//! uniform jitter, and announces the firing on a channel the orchestrator
//! listens to. Scheduled retries are cooperatively cancellable, singly
//! and in bulk.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Exponential growth factor per attempt.
    pub multiplier: f64,
    /// Cap on the computed delay, before jitter.
    pub max_delay: Duration,
    /// Jitter is uniform in `[0, capped_delay * jitter_factor]`.
    pub jitter_factor: f64,
    /// Attempts after which [`RetryManager::should_retry`] says stop.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
            max_attempts: 3,
        }
    }
}

/// Announcement that a scheduled retry is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFired {
    pub work_order_id: String,
    /// The attempt number that just failed; the next run is attempt + 1.
    pub attempt: u32,
}

/// In-memory record of one scheduled retry.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub work_order_id: String,
    pub attempt: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
}

struct ScheduledRetry {
    state: RetryState,
    cancel: CancellationToken,
}

/// Schedules and cancels retry timers.
pub struct RetryManager {
    config: RetryConfig,
    scheduled: Mutex<HashMap<String, ScheduledRetry>>,
    fired: mpsc::UnboundedSender<RetryFired>,
}

impl RetryManager {
    pub fn new(config: RetryConfig, fired: mpsc::UnboundedSender<RetryFired>) -> Self {
        Self {
            config,
            scheduled: Mutex::new(HashMap::new()),
            fired,
        }
    }

    /// Whether another attempt may be scheduled: the failure must be
    /// classified retryable and the attempt count under the cap.
    pub fn should_retry(&self, attempt: u32, retryable: bool) -> bool {
        retryable && attempt < self.config.max_attempts
    }

    /// The delay before retrying after `attempt` failures:
    /// `min(base * multiplier^attempt, max) + uniform[0, capped * jitter]`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential =
            self.config.base_delay.as_millis() as f64 * self.config.multiplier.powi(attempt as i32);
        let capped = exponential.min(self.config.max_delay.as_millis() as f64);

        let jitter_cap = capped * self.config.jitter_factor;
        let jitter = if jitter_cap > 0.0 {
            rand::rng().random_range(0.0..=jitter_cap)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter) as u64)
    }

    /// Schedule a retry for a work order, replacing any prior schedule.
    /// When the timer fires, a [`RetryFired`] lands on the channel and the
    /// record is cleared.
    pub async fn schedule_retry(
        self: &std::sync::Arc<Self>,
        work_order_id: &str,
        attempt: u32,
        last_error: &str,
    ) -> RetryState {
        let delay = self.calculate_delay(attempt);
        let state = RetryState {
            work_order_id: work_order_id.to_owned(),
            attempt,
            next_retry_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
            last_error: last_error.to_owned(),
        };

        let cancel = CancellationToken::new();
        {
            let mut scheduled = self.scheduled.lock().await;
            if let Some(prior) = scheduled.insert(
                work_order_id.to_owned(),
                ScheduledRetry {
                    state: state.clone(),
                    cancel: cancel.clone(),
                },
            ) {
                prior.cancel.cancel();
                debug!(work_order_id, "replaced previously scheduled retry");
            }
        }

        info!(
            work_order_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        let manager = std::sync::Arc::clone(self);
        let id = work_order_id.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let mut scheduled = manager.scheduled.lock().await;
                    // A replacement cancels this token under the same lock,
                    // so an un-cancelled token means this schedule still owns
                    // the map entry.
                    if cancel.is_cancelled() {
                        return;
                    }
                    scheduled.remove(&id);
                    drop(scheduled);
                    let _ = manager.fired.send(RetryFired {
                        work_order_id: id,
                        attempt,
                    });
                }
                _ = cancel.cancelled() => {
                    debug!(work_order_id = %id, "scheduled retry cancelled");
                }
            }
        });

        state
    }

    /// Cancel the scheduled retry for a work order. Returns whether one
    /// was pending.
    pub async fn cancel_retry(&self, work_order_id: &str) -> bool {
        let mut scheduled = self.scheduled.lock().await;
        match scheduled.remove(work_order_id) {
            Some(retry) => {
                retry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every scheduled retry.
    pub async fn cancel_all(&self) {
        let mut scheduled = self.scheduled.lock().await;
        for (_, retry) in scheduled.drain() {
            retry.cancel.cancel();
        }
    }

    /// Snapshot of the pending retry for a work order, if any.
    pub async fn get_retry_state(&self, work_order_id: &str) -> Option<RetryState> {
        let scheduled = self.scheduled.lock().await;
        scheduled.get(work_order_id).map(|s| s.state.clone())
    }

    pub async fn pending_count(&self) -> usize {
        self.scheduled.lock().await.len()
    }
}
