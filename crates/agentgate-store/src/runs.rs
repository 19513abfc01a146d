//! File-backed run store and orphan cleanup.
//!
//! Each run owns a directory `<data_dir>/runs/<run_id>/` holding `run.json`
//! plus one `iteration-N.json` per completed iteration. Runs reference
//! their work order by id only; when that work order has been purged the
//! run directory is an orphan and eligible for cleanup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::fs::{dir_size, read_json, write_json_atomic};
use crate::models::{IterationData, Run};

const RUNS_DIR: &str = "runs";
const RUN_FILE: &str = "run.json";

/// Options for [`RunStore::cleanup_orphaned_runs`].
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Report what would be deleted without touching disk.
    pub dry_run: bool,
    /// Cap on how many orphans to delete in one pass. `None` = unlimited.
    pub max_orphans: Option<usize>,
}

/// Outcome of an orphan-cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Orphans discovered (whether or not they were deleted).
    pub orphaned_count: usize,
    /// Orphans actually deleted. Always 0 on a dry run.
    pub deleted_count: usize,
    pub deleted_run_ids: Vec<String>,
    /// Orphans whose deletion failed; left on disk for the next pass.
    pub failed_run_ids: Vec<String>,
    /// Bytes reclaimed by deletion (0 on a dry run).
    pub freed_bytes: u64,
}

/// Persistent store for [`Run`] records and their iteration snapshots.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    /// Create a store rooted at `<data_dir>/runs`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(RUNS_DIR),
        }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.dir.join(run_id)
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(RUN_FILE)
    }

    fn iteration_path(&self, run_id: &str, iteration: u32) -> PathBuf {
        self.run_dir(run_id).join(format!("iteration-{iteration}.json"))
    }

    /// Persist a run record, replacing any existing `run.json`.
    pub async fn save(&self, run: &Run) -> Result<(), StoreError> {
        write_json_atomic(&self.run_path(&run.id), run).await
    }

    /// Load a run by id.
    pub async fn load(&self, run_id: &str) -> Result<Run, StoreError> {
        match read_json(&self.run_path(run_id)).await {
            Err(StoreError::NotFound(_)) => Err(StoreError::NotFound(run_id.to_owned())),
            other => other,
        }
    }

    /// Load a run, mapping "not found" to `None`.
    pub async fn try_load(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        match self.load(run_id).await {
            Ok(run) => Ok(Some(run)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Append an iteration snapshot. Iteration files are append-only:
    /// writing an index that already exists is rejected.
    pub async fn record_iteration(
        &self,
        run_id: &str,
        data: &IterationData,
    ) -> Result<(), StoreError> {
        let path = self.iteration_path(run_id, data.iteration);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::io(
                &path,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("iteration {} already recorded for {run_id}", data.iteration),
                ),
            ));
        }
        write_json_atomic(&path, data).await
    }

    /// Load all iteration snapshots for a run, ordered by iteration.
    pub async fn load_iterations(&self, run_id: &str) -> Result<Vec<IterationData>, StoreError> {
        let dir = self.run_dir(run_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut iterations = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("iteration-") && name.ends_with(".json") {
                match read_json::<IterationData>(&entry.path()).await {
                    Ok(data) => iterations.push(data),
                    Err(e) => {
                        warn!(run_id, file = name, error = %e, "skipping unreadable iteration");
                    }
                }
            }
        }

        iterations.sort_by_key(|i| i.iteration);
        Ok(iterations)
    }

    /// List run ids present on disk. A missing runs directory means no runs
    /// have been recorded and is not an error.
    pub async fn list_run_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_owned());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// List runs ordered by start time, newest first, with paging.
    ///
    /// Directories whose `run.json` fails to load are skipped.
    pub async fn list_runs(&self, limit: usize, offset: usize) -> Result<Vec<Run>, StoreError> {
        let mut runs = Vec::new();
        for id in self.list_run_ids().await? {
            match self.load(&id).await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    debug!(run_id = %id, error = %e, "skipping unreadable run");
                }
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    /// Delete a run directory and everything in it.
    pub async fn delete(&self, run_id: &str) -> Result<(), StoreError> {
        let dir = self.run_dir(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    /// Walk the runs directory and reconcile against the set of live work
    /// orders. Runs whose `work_order_id` is not in `valid_work_order_ids`
    /// are orphans; they are deleted unless `dry_run` is set. Entries that
    /// fail to load at all are left alone (they may be mid-write).
    pub async fn cleanup_orphaned_runs(
        &self,
        valid_work_order_ids: &HashSet<String>,
        options: &CleanupOptions,
    ) -> Result<CleanupReport, StoreError> {
        let mut report = CleanupReport::default();

        for run_id in self.list_run_ids().await? {
            let run = match self.load(&run_id).await {
                Ok(run) => run,
                Err(e) => {
                    debug!(run_id = %run_id, error = %e, "ignoring unloadable run during cleanup");
                    continue;
                }
            };

            if valid_work_order_ids.contains(&run.work_order_id) {
                continue;
            }

            report.orphaned_count += 1;

            if options.dry_run {
                continue;
            }
            if let Some(max) = options.max_orphans {
                if report.deleted_count >= max {
                    continue;
                }
            }

            let size = dir_size(&self.run_dir(&run_id));
            match self.delete(&run_id).await {
                Ok(()) => {
                    report.deleted_count += 1;
                    report.freed_bytes += size;
                    report.deleted_run_ids.push(run_id);
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "failed to delete orphaned run");
                    report.failed_run_ids.push(run_id);
                }
            }
        }

        Ok(report)
    }
}
