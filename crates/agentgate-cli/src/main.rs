mod cleanup_cmd;
mod config;
mod log_cmd;
mod purge_cmd;
mod serve_cmd;
mod status_cmd;
mod submit_cmd;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

use agentgate_core::orchestrator::Orchestrator;
use agentgate_core::process::KillOptions;

use config::AgentGateConfig;

#[derive(Parser)]
#[command(name = "agentgate", about = "AI coding agent orchestrator")]
struct Cli {
    /// Data directory (overrides DATA_DIR env var)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Serve,
    /// Submit a new work order
    Submit {
        /// Task prompt for the agent
        prompt: String,
        /// Local workspace directory
        #[arg(long)]
        path: Option<PathBuf>,
        /// Git URL to clone as the workspace
        #[arg(long)]
        git_url: Option<String>,
        /// Branch for --git-url
        #[arg(long, default_value = "main")]
        branch: String,
        /// Agent kind: claude_code, codex, custom
        #[arg(long, default_value = "claude_code")]
        agent: String,
        /// Maximum iterations (1-10)
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Wall-clock cap in seconds (60-86400)
        #[arg(long)]
        timeout: Option<u64>,
        /// Gate-plan source identifier
        #[arg(long)]
        gate_plan: Option<String>,
        /// Deny the agent network access
        #[arg(long)]
        no_network: bool,
        /// Parent work-order id (for spawned children)
        #[arg(long)]
        parent: Option<String>,
    },
    /// Show a work order, or counts by status
    Status {
        /// Work-order id (omit for counts)
        work_order_id: Option<String>,
        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },
    /// Cancel a queued or running work order
    Cancel {
        /// Work-order id
        work_order_id: String,
    },
    /// Force-kill a work order's process
    Kill {
        /// Work-order id
        work_order_id: String,
        /// Grace period before escalation, in milliseconds
        #[arg(long)]
        grace_ms: Option<u64>,
        /// Reason recorded on the work order
        #[arg(long)]
        reason: Option<String>,
    },
    /// Delete terminal work-order records
    Purge {
        /// Comma-separated statuses (defaults to all terminal)
        #[arg(long)]
        statuses: Option<String>,
        /// Only purge work orders older than this many days
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete orphaned run directories
    Cleanup {
        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
        /// Cap on deletions in one pass
        #[arg(long)]
        max_orphans: Option<usize>,
    },
    /// Show the run history for a work order
    Log {
        /// Work-order id
        work_order_id: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "agentgate", &mut std::io::stdout());
        return Ok(());
    }

    let config = AgentGateConfig::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Serve => {
            serve_cmd::run_serve(&config).await?;
        }
        Commands::Submit {
            prompt,
            path,
            git_url,
            branch,
            agent,
            max_iterations,
            timeout,
            gate_plan,
            no_network,
            parent,
        } => {
            submit_cmd::run_submit(
                &config,
                submit_cmd::SubmitArgs {
                    prompt,
                    path,
                    git_url,
                    branch,
                    agent,
                    max_iterations,
                    timeout_secs: timeout,
                    gate_plan,
                    no_network,
                    parent,
                },
            )
            .await?;
        }
        Commands::Status {
            work_order_id,
            json,
        } => {
            status_cmd::run_status(&config, work_order_id.as_deref(), json).await?;
        }
        Commands::Cancel { work_order_id } => {
            let orchestrator = Orchestrator::new(config.orchestrator_config());
            let order = orchestrator.service().cancel(&work_order_id).await?;
            println!("{} is now {}", order.id, order.status);
        }
        Commands::Kill {
            work_order_id,
            grace_ms,
            reason,
        } => {
            let orchestrator = Orchestrator::new(config.orchestrator_config());
            let service = Arc::clone(orchestrator.service());
            let report = service
                .force_kill(
                    &work_order_id,
                    KillOptions {
                        grace_period: grace_ms.map(Duration::from_millis),
                        reason,
                        force_immediate: true,
                    },
                )
                .await?;
            println!("{work_order_id} is now {}", report.status);
            if let Some(kill) = report.kill {
                println!(
                    "  kill: success={} forced={} in {}ms",
                    kill.success,
                    kill.forced_kill,
                    kill.duration.as_millis()
                );
            }
        }
        Commands::Purge {
            statuses,
            older_than_days,
            dry_run,
        } => {
            purge_cmd::run_purge(&config, statuses.as_deref(), older_than_days, dry_run).await?;
        }
        Commands::Cleanup {
            dry_run,
            max_orphans,
        } => {
            cleanup_cmd::run_cleanup(&config, dry_run, max_orphans).await?;
        }
        Commands::Log { work_order_id } => {
            log_cmd::run_log(&config, &work_order_id).await?;
        }
        Commands::Completions { .. } => {
            // Handled above, before config resolution.
        }
    }

    Ok(())
}
