use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Queued,
    Running,
    WaitingForChildren,
    Integrating,
    Succeeded,
    Failed,
    Canceled,
}

impl WorkOrderStatus {
    /// Terminal statuses admit no further transitions (except the
    /// idempotent `failed -> failed` re-fail).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// All statuses, in lifecycle order. Useful for counting.
    pub fn all() -> [WorkOrderStatus; 7] {
        [
            Self::Queued,
            Self::Running,
            Self::WaitingForChildren,
            Self::Integrating,
            Self::Succeeded,
            Self::Failed,
            Self::Canceled,
        ]
    }
}

impl fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingForChildren => "waiting_for_children",
            Self::Integrating => "integrating",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkOrderStatus {
    type Err = WorkOrderStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "waiting_for_children" => Ok(Self::WaitingForChildren),
            "integrating" => Ok(Self::Integrating),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(WorkOrderStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkOrderStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkOrderStatusParseError(pub String);

impl fmt::Display for WorkOrderStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid work order status: {:?}", self.0)
    }
}

impl std::error::Error for WorkOrderStatusParseError {}

// ---------------------------------------------------------------------------

/// State of a single run (one execution attempt of a work order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    AgentWorking,
    Verifying,
    Complete,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::AgentWorking => "agent_working",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RunState {
    type Err = RunStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "agent_working" => Ok(Self::AgentWorking),
            "verifying" => Ok(Self::Verifying),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(RunStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunState`] string.
#[derive(Debug, Clone)]
pub struct RunStateParseError(pub String);

impl fmt::Display for RunStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run state: {:?}", self.0)
    }
}

impl std::error::Error for RunStateParseError {}

// ---------------------------------------------------------------------------

/// Which agent CLI executes the work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Custom,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClaudeCode => "claude_code",
            Self::Codex => "codex",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentKind {
    type Err = AgentKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            "custom" => Ok(Self::Custom),
            other => Err(AgentKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentKind`] string.
#[derive(Debug, Clone)]
pub struct AgentKindParseError(pub String);

impl fmt::Display for AgentKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent kind: {:?}", self.0)
    }
}

impl std::error::Error for AgentKindParseError {}

// ---------------------------------------------------------------------------
// Workspace source & policies
// ---------------------------------------------------------------------------

/// Where the workspace for a work order comes from.
///
/// Only `LocalPath` is resolved in-process; the remaining variants are
/// handed to an external materializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkspaceSource {
    /// An existing directory on this host.
    LocalPath { path: PathBuf },
    /// Clone of a git URL at a branch.
    GitUrl { url: String, branch: String },
    /// Fresh workspace created from a named template.
    Template { template: String },
    /// An existing remote repository (owner/name).
    ExistingRemote { repo: String },
    /// A remote repository to be created.
    NewRemote { name: String },
}

impl WorkspaceSource {
    /// Short label for logs and status output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::LocalPath { .. } => "local_path",
            Self::GitUrl { .. } => "git_url",
            Self::Template { .. } => "template",
            Self::ExistingRemote { .. } => "existing_remote",
            Self::NewRemote { .. } => "new_remote",
        }
    }
}

/// Execution policies attached to a work order. Enforcement happens on the
/// agent side; the orchestrator only carries and forwards them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policies {
    /// Whether the agent may reach the network.
    pub network_allowed: bool,
    /// Paths the agent is allowed to touch (empty = workspace only).
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Glob patterns the agent must never write.
    #[serde(default)]
    pub forbidden_patterns: Vec<String>,
    /// Optional cap on workspace disk usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_disk_bytes: Option<u64>,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            network_allowed: true,
            allowed_paths: Vec::new(),
            forbidden_patterns: Vec::new(),
            max_disk_bytes: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A work order -- one submitted task request.
///
/// Persisted as `work-orders/<id>.json`. Mutated only by the work-order
/// service, destroyed only by purge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: String,
    pub prompt: String,
    pub workspace: WorkspaceSource,
    pub agent: AgentKind,
    /// 1..=10.
    pub max_iterations: u32,
    /// 60..=86400.
    pub max_wall_clock_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_plan: Option<String>,
    #[serde(default)]
    pub policies: Policies,
    // Recursion bookkeeping for work orders spawned by other work orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub sibling_index: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub status: WorkOrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One execution attempt of a work order.
///
/// Persisted as `runs/<run_id>/run.json`. A run references its work order
/// weakly, by id; runs whose work order is gone are orphans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub work_order_id: String,
    pub workspace_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_after: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Non-fatal warnings accumulated during the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    // VCS delivery fields, filled in by the delivery layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    // CI tracking, populated when the CI config subgroup is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_checks_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_iterations_used: Option<u32>,
}

/// Per-iteration snapshot within a run. Append-only.
///
/// Persisted as `runs/<run_id>/iteration-N.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationData {
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
