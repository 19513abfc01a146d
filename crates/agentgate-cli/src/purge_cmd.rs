//! The `agentgate purge` command: delete terminal work-order records.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use agentgate_core::orchestrator::Orchestrator;
use agentgate_core::service::PurgeOptions;
use agentgate_store::models::WorkOrderStatus;

use crate::config::AgentGateConfig;

pub async fn run_purge(
    config: &AgentGateConfig,
    statuses: Option<&str>,
    older_than_days: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let statuses = match statuses {
        None => None,
        Some(raw) => {
            let parsed = raw
                .split(',')
                .map(|s| WorkOrderStatus::from_str(s.trim()))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid status list {raw:?}"))?;
            Some(parsed)
        }
    };

    let older_than = older_than_days.map(|days| Utc::now() - chrono::Duration::days(days as i64));

    let orchestrator = Orchestrator::new(config.orchestrator_config());
    let service = Arc::clone(orchestrator.service());

    let report = service
        .purge(PurgeOptions {
            statuses,
            older_than,
            dry_run,
        })
        .await?;

    if dry_run {
        println!("Would delete {} work orders:", report.would_delete.len());
        for id in &report.would_delete {
            println!("  {id}");
        }
    } else {
        println!("Deleted {} work orders.", report.deleted_count);
        for id in &report.deleted_ids {
            println!("  {id}");
        }
    }

    Ok(())
}
