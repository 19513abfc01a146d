//! The `agentgate serve` command: run the orchestrator until a signal.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use agentgate_core::orchestrator::Orchestrator;

use crate::config::AgentGateConfig;

/// Run the orchestrator loop. Returns when SIGINT/SIGTERM arrives and
/// shutdown (queue persist, timer cancel, child kill) has completed.
pub async fn run_serve(config: &AgentGateConfig) -> Result<()> {
    info!(
        host = %config.host,
        port = config.port,
        data_dir = %config.data_dir.display(),
        max_concurrent = config.max_concurrent_runs,
        "starting agentgate"
    );

    let orchestrator = Orchestrator::new(config.orchestrator_config());

    // Shut down cleanly on SIGINT or SIGTERM.
    let signal_target = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_target.shutdown().await;
    });

    orchestrator.run().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
