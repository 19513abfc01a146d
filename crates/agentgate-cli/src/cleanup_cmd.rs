//! The `agentgate cleanup` command: reconcile persisted runs against
//! live work orders and delete the orphans.

use std::collections::HashSet;

use anyhow::Result;

use agentgate_store::{CleanupOptions, RunStore, WorkOrderStore};

use crate::config::AgentGateConfig;

pub async fn run_cleanup(
    config: &AgentGateConfig,
    dry_run: bool,
    max_orphans: Option<usize>,
) -> Result<()> {
    let work_orders = WorkOrderStore::new(&config.data_dir);
    let runs = RunStore::new(&config.data_dir);

    let valid: HashSet<String> = work_orders.list_ids().await?.into_iter().collect();
    let report = runs
        .cleanup_orphaned_runs(
            &valid,
            &CleanupOptions {
                dry_run,
                max_orphans,
            },
        )
        .await?;

    if dry_run {
        println!(
            "{} orphaned runs (dry run, nothing deleted).",
            report.orphaned_count
        );
    } else {
        println!(
            "{} orphaned runs, {} deleted, {} freed bytes.",
            report.orphaned_count, report.deleted_count, report.freed_bytes
        );
        for id in &report.deleted_run_ids {
            println!("  deleted {id}");
        }
        for id in &report.failed_run_ids {
            println!("  failed to delete {id}");
        }
    }

    Ok(())
}
