//! The `agentgate submit` command: validate and persist a work order.
//!
//! The record lands in the shared data directory in `queued` status; a
//! running `agentgate serve` picks it up on its next store poll.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use agentgate_core::orchestrator::Orchestrator;
use agentgate_core::service::SubmitRequest;
use agentgate_store::models::{AgentKind, Policies, WorkspaceSource};

use crate::config::AgentGateConfig;

/// Arguments for one submit.
#[derive(Debug)]
pub struct SubmitArgs {
    pub prompt: String,
    pub path: Option<PathBuf>,
    pub git_url: Option<String>,
    pub branch: String,
    pub agent: String,
    pub max_iterations: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub gate_plan: Option<String>,
    pub no_network: bool,
    pub parent: Option<String>,
}

fn workspace_from_args(args: &SubmitArgs) -> Result<WorkspaceSource> {
    match (&args.path, &args.git_url) {
        (Some(_), Some(_)) => bail!("--path and --git-url are mutually exclusive"),
        (Some(path), None) => Ok(WorkspaceSource::LocalPath { path: path.clone() }),
        (None, Some(url)) => Ok(WorkspaceSource::GitUrl {
            url: url.clone(),
            branch: args.branch.clone(),
        }),
        (None, None) => bail!("a workspace is required: pass --path or --git-url"),
    }
}

pub async fn run_submit(config: &AgentGateConfig, args: SubmitArgs) -> Result<()> {
    let workspace = workspace_from_args(&args)?;
    let agent = AgentKind::from_str(&args.agent)
        .with_context(|| format!("unknown agent kind {:?}", args.agent))?;

    let orchestrator = Orchestrator::new(config.orchestrator_config());
    let service = Arc::clone(orchestrator.service());

    let order = service
        .submit(SubmitRequest {
            prompt: args.prompt,
            workspace,
            agent,
            max_iterations: args.max_iterations,
            max_wall_clock_secs: args.timeout_secs,
            gate_plan: args.gate_plan,
            policies: Some(Policies {
                network_allowed: !args.no_network,
                ..Default::default()
            }),
            parent_id: args.parent,
        })
        .await?;

    println!("Submitted {}", order.id);
    println!("  agent:      {}", order.agent);
    println!("  workspace:  {}", order.workspace.label());
    println!("  iterations: {}", order.max_iterations);
    println!("  wall clock: {}s", order.max_wall_clock_secs);
    Ok(())
}
