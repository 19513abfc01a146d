//! Scheduler queue snapshot persistence.
//!
//! The scheduler periodically (and on shutdown) writes its queued entries
//! and recent wait times to `<data_dir>/queue-state.json`. The `running`
//! set is written for operator visibility but deliberately discarded on
//! restore -- the orchestrator re-admits in-flight work by scanning work
//! orders left in `running` status.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::fs::{read_json, write_json_atomic};

const QUEUE_STATE_FILE: &str = "queue-state.json";

/// The snapshot format version this build reads and writes.
pub const QUEUE_SNAPSHOT_VERSION: &str = "1.0";

/// One queued entry as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedQueueEntry {
    pub work_order_id: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
}

/// On-disk snapshot of the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub version: String,
    pub queue: Vec<PersistedQueueEntry>,
    /// Ids running at save time. Ignored on restore.
    #[serde(default)]
    pub running: Vec<String>,
    /// Recent observed wait times in milliseconds, oldest first.
    #[serde(default)]
    pub wait_times: Vec<u64>,
    pub saved_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn new(
        queue: Vec<PersistedQueueEntry>,
        running: Vec<String>,
        wait_times: Vec<u64>,
    ) -> Self {
        Self {
            version: QUEUE_SNAPSHOT_VERSION.to_owned(),
            queue,
            running,
            wait_times,
            saved_at: Utc::now(),
        }
    }
}

fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join(QUEUE_STATE_FILE)
}

/// Write the snapshot atomically.
pub async fn save_snapshot(data_dir: &Path, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
    write_json_atomic(&snapshot_path(data_dir), snapshot).await
}

/// Load the snapshot, if one exists and its version is understood.
///
/// Returns `None` (and logs) for a missing file, an unreadable file, or an
/// unknown version -- in all three cases the queue starts empty.
pub async fn load_snapshot(data_dir: &Path) -> Option<QueueSnapshot> {
    let path = snapshot_path(data_dir);
    let snapshot: QueueSnapshot = match read_json(&path).await {
        Ok(s) => s,
        Err(StoreError::NotFound(_)) => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable queue snapshot");
            return None;
        }
    };

    if snapshot.version != QUEUE_SNAPSHOT_VERSION {
        warn!(
            version = %snapshot.version,
            expected = QUEUE_SNAPSHOT_VERSION,
            "ignoring queue snapshot with unknown version"
        );
        return None;
    }

    Some(snapshot)
}
