//! The `agentgate log` command: print a work order's run history.

use anyhow::Result;

use agentgate_store::{RunStore, WorkOrderStore};

use crate::config::AgentGateConfig;

pub async fn run_log(config: &AgentGateConfig, work_order_id: &str) -> Result<()> {
    let store = WorkOrderStore::new(&config.data_dir);
    let runs = RunStore::new(&config.data_dir);

    let order = store.load(work_order_id).await?;
    println!("{} ({})", order.id, order.status);

    // All runs for this work order, newest first.
    let mut shown = 0usize;
    for run in runs.list_runs(usize::MAX, 0).await? {
        if run.work_order_id != order.id {
            continue;
        }
        shown += 1;
        println!(
            "run {} [{}] started {}",
            run.id,
            run.state,
            run.started_at.to_rfc3339()
        );
        if let Some(completed) = run.completed_at {
            println!("  completed {}", completed.to_rfc3339());
        }
        if let Some(session) = &run.session_id {
            println!("  session {session}");
        }
        for warning in &run.warnings {
            println!("  warning: {warning}");
        }

        for iteration in runs.load_iterations(&run.id).await? {
            println!(
                "  iteration {}: tokens {} in / {} out, {}ms, verified: {}",
                iteration.iteration,
                iteration.input_tokens,
                iteration.output_tokens,
                iteration.duration_ms,
                iteration
                    .verification_passed
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_owned()),
            );
            for error in &iteration.errors {
                println!("    error: {error}");
            }
        }
    }

    if shown == 0 {
        println!("no runs recorded");
    }

    Ok(())
}
