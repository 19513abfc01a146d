//! File-backed work-order store.
//!
//! One JSON file per work order under `<data_dir>/work-orders/`. The store
//! is the single owner of those files; the service layer mutates records
//! only through it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::StoreError;
use crate::fs::{read_json, write_json_atomic};
use crate::models::{WorkOrder, WorkOrderStatus};

const WORK_ORDERS_DIR: &str = "work-orders";

/// Persistent store for [`WorkOrder`] records.
#[derive(Debug, Clone)]
pub struct WorkOrderStore {
    dir: PathBuf,
}

impl WorkOrderStore {
    /// Create a store rooted at `<data_dir>/work-orders`. The directory is
    /// created lazily on first write.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(WORK_ORDERS_DIR),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist a work order, replacing any existing record with the same id.
    pub async fn save(&self, order: &WorkOrder) -> Result<(), StoreError> {
        write_json_atomic(&self.path_for(&order.id), order).await
    }

    /// Load a work order by id.
    pub async fn load(&self, id: &str) -> Result<WorkOrder, StoreError> {
        match read_json(&self.path_for(id)).await {
            Err(StoreError::NotFound(_)) => Err(StoreError::NotFound(id.to_owned())),
            other => other,
        }
    }

    /// Load a work order, mapping "not found" to `None`.
    pub async fn try_load(&self, id: &str) -> Result<Option<WorkOrder>, StoreError> {
        match self.load(id).await {
            Ok(order) => Ok(Some(order)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether a record exists for `id`.
    pub async fn exists(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.path_for(id)).await.unwrap_or(false)
    }

    /// Enumerate all persisted work-order ids.
    ///
    /// A missing directory means no work orders have been saved yet and is
    /// not an error. Files that do not look like records are skipped.
    pub async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
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
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_owned());
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Load every persisted work order. Records that fail to parse are
    /// skipped with a warning so one corrupt file cannot take down a scan.
    pub async fn list(&self) -> Result<Vec<WorkOrder>, StoreError> {
        let mut orders = Vec::new();
        for id in self.list_ids().await? {
            match self.load(&id).await {
                Ok(order) => orders.push(order),
                Err(e) => {
                    warn!(work_order_id = %id, error = %e, "skipping unreadable work order");
                }
            }
        }
        Ok(orders)
    }

    /// Load all work orders currently in `status`.
    pub async fn list_by_status(
        &self,
        status: WorkOrderStatus,
    ) -> Result<Vec<WorkOrder>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|o| o.status == status)
            .collect())
    }

    /// Count work orders by status.
    pub async fn count_by_status(
        &self,
    ) -> Result<HashMap<WorkOrderStatus, usize>, StoreError> {
        let mut counts: HashMap<WorkOrderStatus, usize> = HashMap::new();
        for order in self.list().await? {
            *counts.entry(order.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Delete a work-order record. Deleting a missing record is a no-op.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}
