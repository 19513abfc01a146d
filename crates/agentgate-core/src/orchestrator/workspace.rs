//! Workspace materialisation seam.
//!
//! Cloning repositories, creating remotes, and template expansion belong
//! to an external collaborator; the orchestrator consumes it through this
//! narrow interface. The built-in implementation resolves local paths
//! only and rejects everything else.

use std::path::PathBuf;

use async_trait::async_trait;

use agentgate_store::models::WorkspaceSource;

use crate::error::AgentGateError;

/// Resolves a work order's workspace source to a directory on this host.
#[async_trait]
pub trait WorkspaceMaterializer: Send + Sync {
    async fn materialize(
        &self,
        work_order_id: &str,
        source: &WorkspaceSource,
    ) -> Result<PathBuf, AgentGateError>;
}

/// Materializer that accepts only [`WorkspaceSource::LocalPath`].
pub struct LocalOnlyMaterializer;

#[async_trait]
impl WorkspaceMaterializer for LocalOnlyMaterializer {
    async fn materialize(
        &self,
        work_order_id: &str,
        source: &WorkspaceSource,
    ) -> Result<PathBuf, AgentGateError> {
        match source {
            WorkspaceSource::LocalPath { path } => {
                let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
                if !exists {
                    return Err(AgentGateError::Validation(format!(
                        "workspace path {} for {work_order_id} does not exist",
                        path.display()
                    )));
                }
                Ok(path.clone())
            }
            other => Err(AgentGateError::Validation(format!(
                "no materializer configured for {} workspace of {work_order_id}",
                other.label()
            ))),
        }
    }
}
