//! The `agentgate status` command.

use anyhow::Result;

use agentgate_store::models::WorkOrderStatus;
use agentgate_store::{RunStore, WorkOrderStore};

use crate::config::AgentGateConfig;

/// Show one work order in detail, or counts by status when no id is
/// given. `json` switches to the raw record for scripting.
pub async fn run_status(
    config: &AgentGateConfig,
    work_order_id: Option<&str>,
    json: bool,
) -> Result<()> {
    let store = WorkOrderStore::new(&config.data_dir);

    match work_order_id {
        Some(id) => {
            let order = store.load(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&order)?);
                return Ok(());
            }
            println!("{}", order.id);
            println!("  status:     {}", order.status);
            println!("  agent:      {}", order.agent);
            println!("  workspace:  {}", order.workspace.label());
            println!("  created:    {}", order.created_at.to_rfc3339());
            if let Some(completed) = order.completed_at {
                println!("  completed:  {}", completed.to_rfc3339());
            }
            if let Some(error) = &order.error {
                println!("  error:      {error}");
            }
            if let Some(parent) = &order.parent_id {
                println!("  parent:     {parent}");
            }
            if !order.child_ids.is_empty() {
                println!("  children:   {}", order.child_ids.join(", "));
            }

            if let Some(run_id) = &order.run_id {
                let runs = RunStore::new(&config.data_dir);
                if let Some(run) = runs.try_load(run_id).await? {
                    println!("  run {}:", run.id);
                    println!("    state:     {}", run.state);
                    println!("    iteration: {}/{}", run.iteration, run.max_iterations);
                    if let Some(session) = &run.session_id {
                        println!("    session:   {session}");
                    }
                }
            }
        }
        None => {
            let counts = store.count_by_status().await?;
            let total: usize = counts.values().sum();
            println!("{total} work orders");
            for status in WorkOrderStatus::all() {
                if let Some(count) = counts.get(&status) {
                    println!("  {status:<22} {count}");
                }
            }
        }
    }

    Ok(())
}
