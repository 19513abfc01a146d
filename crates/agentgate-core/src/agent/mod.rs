//! Agent command registry.
//!
//! Maps an [`AgentKind`] to the CLI invocation that produces the
//! stream-JSON protocol the executor consumes. The registry ships with
//! defaults for the known agents and lets deployments override the binary
//! path or register extra kinds at startup.

use std::collections::HashMap;

use agentgate_store::models::{AgentKind, Policies};

/// The command line for one agent kind. The work-order prompt is appended
/// as the final argument at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentInvocation {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// A collection of agent invocations, keyed by [`AgentKind`].
#[derive(Debug, Clone)]
pub struct AgentCommandRegistry {
    agents: HashMap<AgentKind, AgentInvocation>,
}

impl AgentCommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// The stock registry: every known agent kind with its default binary
    /// found via `$PATH`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            AgentKind::ClaudeCode,
            AgentInvocation::new(
                "claude",
                &["-p", "--output-format", "stream-json", "--verbose"],
            ),
        );
        registry.register(
            AgentKind::Codex,
            AgentInvocation::new("codex", &["exec", "--json"]),
        );
        registry
    }

    /// Register (or replace) the invocation for a kind. Returns the
    /// replaced invocation, if any.
    pub fn register(
        &mut self,
        kind: AgentKind,
        invocation: AgentInvocation,
    ) -> Option<AgentInvocation> {
        self.agents.insert(kind, invocation)
    }

    /// Look up the invocation for a kind.
    pub fn get(&self, kind: AgentKind) -> Option<&AgentInvocation> {
        self.agents.get(&kind)
    }

    /// The registered kinds.
    pub fn kinds(&self) -> Vec<AgentKind> {
        self.agents.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentCommandRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Environment variables carrying a work order's policies into the child.
/// Enforcement happens agent-side; the orchestrator only forwards.
pub fn policy_env(policies: &Policies) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "AGENTGATE_NETWORK".to_owned(),
        if policies.network_allowed { "1" } else { "0" }.to_owned(),
    );
    if !policies.allowed_paths.is_empty() {
        env.insert(
            "AGENTGATE_ALLOWED_PATHS".to_owned(),
            policies.allowed_paths.join(":"),
        );
    }
    if !policies.forbidden_patterns.is_empty() {
        env.insert(
            "AGENTGATE_FORBIDDEN_PATTERNS".to_owned(),
            policies.forbidden_patterns.join(":"),
        );
    }
    if let Some(cap) = policies.max_disk_bytes {
        env.insert("AGENTGATE_MAX_DISK_BYTES".to_owned(), cap.to_string());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_known_agents() {
        let registry = AgentCommandRegistry::with_defaults();
        let claude = registry.get(AgentKind::ClaudeCode).unwrap();
        assert_eq!(claude.program, "claude");
        assert!(claude.args.contains(&"stream-json".to_owned()));

        let codex = registry.get(AgentKind::Codex).unwrap();
        assert_eq!(codex.program, "codex");

        assert!(registry.get(AgentKind::Custom).is_none());
    }

    #[test]
    fn register_replaces() {
        let mut registry = AgentCommandRegistry::with_defaults();
        let old = registry.register(
            AgentKind::ClaudeCode,
            AgentInvocation::new("/opt/claude/bin/claude", &["-p"]),
        );
        assert!(old.is_some());
        assert_eq!(
            registry.get(AgentKind::ClaudeCode).unwrap().program,
            "/opt/claude/bin/claude"
        );
    }

    #[test]
    fn policy_env_minimal() {
        let env = policy_env(&Policies::default());
        assert_eq!(env.get("AGENTGATE_NETWORK"), Some(&"1".to_owned()));
        assert!(!env.contains_key("AGENTGATE_ALLOWED_PATHS"));
        assert!(!env.contains_key("AGENTGATE_MAX_DISK_BYTES"));
    }

    #[test]
    fn policy_env_full() {
        let policies = Policies {
            network_allowed: false,
            allowed_paths: vec!["src".to_owned(), "tests".to_owned()],
            forbidden_patterns: vec!["*.pem".to_owned()],
            max_disk_bytes: Some(1_000_000),
        };
        let env = policy_env(&policies);
        assert_eq!(env.get("AGENTGATE_NETWORK"), Some(&"0".to_owned()));
        assert_eq!(env.get("AGENTGATE_ALLOWED_PATHS"), Some(&"src:tests".to_owned()));
        assert_eq!(env.get("AGENTGATE_FORBIDDEN_PATTERNS"), Some(&"*.pem".to_owned()));
        assert_eq!(env.get("AGENTGATE_MAX_DISK_BYTES"), Some(&"1000000".to_owned()));
    }
}
