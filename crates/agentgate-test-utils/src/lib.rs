//! Shared test utilities for agentgate integration tests.
//!
//! Provides a temp-directory data dir wired to the file stores, plus
//! fake-agent shell scripts that speak the stream-JSON protocol, so tests
//! exercise the real spawn/stream/kill paths without any agent CLI
//! installed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::TempDir;

use agentgate_store::models::{
    AgentKind, Policies, WorkOrder, WorkOrderStatus, WorkspaceSource,
};
use agentgate_store::{RunStore, WorkOrderStore};

/// A temporary data directory with stores attached. The directory is
/// removed when the value drops.
pub struct TestDataDir {
    dir: TempDir,
}

impl TestDataDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp data dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn work_orders(&self) -> WorkOrderStore {
        WorkOrderStore::new(self.dir.path())
    }

    pub fn runs(&self) -> RunStore {
        RunStore::new(self.dir.path())
    }
}

impl Default for TestDataDir {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal queued work order pointing at `/tmp` for tests that never
/// spawn an agent.
pub fn work_order(id: &str) -> WorkOrder {
    WorkOrder {
        id: id.to_owned(),
        prompt: "test task".to_owned(),
        workspace: WorkspaceSource::LocalPath {
            path: PathBuf::from("/tmp"),
        },
        agent: AgentKind::ClaudeCode,
        max_iterations: 3,
        max_wall_clock_secs: 3600,
        gate_plan: None,
        policies: Policies::default(),
        parent_id: None,
        root_id: None,
        depth: 0,
        sibling_index: 0,
        child_ids: Vec::new(),
        created_at: Utc::now(),
        status: WorkOrderStatus::Queued,
        run_id: None,
        completed_at: None,
        error: None,
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write fake agent script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake agent script");
    }
    path
}

/// A fake agent that echoes the given stream-JSON lines and exits 0.
pub fn fake_agent(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let body: String = lines
        .iter()
        .map(|line| format!("echo '{line}'\n"))
        .collect();
    write_script(dir, name, &body)
}

/// A fake agent that emits one tool call and a successful final result.
pub fn succeeding_agent(dir: &Path) -> PathBuf {
    fake_agent(
        dir,
        "agent_ok.sh",
        &[
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"assistant","message":{"type":"tool_use","tool_use_id":"tu_1","tool":"Bash","input":{"command":"ls"}}}"#,
            r#"{"type":"user","message":{"type":"tool_result","tool_use_id":"tu_1","success":true,"content":"ok","durationMs":5}}"#,
            r#"{"type":"assistant","message":{"type":"text","content":"finished"}}"#,
            r#"{"result":"done","sessionId":"sess_fake","tokensUsed":{"input":100,"output":20}}"#,
        ],
    )
}

/// A fake agent that prints to stderr and exits with the given code.
pub fn failing_agent(dir: &Path, exit_code: i32) -> PathBuf {
    write_script(
        dir,
        "agent_fail.sh",
        &format!("echo 'agent blew up' >&2\nexit {exit_code}\n"),
    )
}

/// A fake agent that sleeps far longer than any test timeout.
pub fn sleepy_agent(dir: &Path) -> PathBuf {
    write_script(dir, "agent_sleepy.sh", "sleep 600\n")
}

/// A fake agent that ignores SIGTERM, forcing kill escalation.
pub fn stubborn_agent(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "agent_stubborn.sh",
        "trap '' TERM\nwhile true; do sleep 0.1; done\n",
    )
}
