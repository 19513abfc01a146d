//! Configuration for the agentgate binary.
//!
//! Every knob is an environment variable with a bounded range; violations
//! are collected and reported as one aggregated startup error rather than
//! failing on the first. The data directory resolves through the chain
//! CLI flag > `DATA_DIR` env > config file > default, with an optional
//! TOML file at `~/.config/agentgate/config.toml`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use agentgate_core::executor::EventFilter;
use agentgate_core::orchestrator::OrchestratorConfig;
use agentgate_core::process::ProcessManagerConfig;
use agentgate_core::queue::QueueConfig;
use agentgate_core::retry::RetryConfig;
use agentgate_core::service::SubmitLimits;

// -----------------------------------------------------------------------
// Config file
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StorageSection {
    pub data_dir: Option<String>,
}

/// The agentgate config directory. Always XDG layout:
/// `$XDG_CONFIG_HOME/agentgate` or `~/.config/agentgate`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("agentgate");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("agentgate")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config_file() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Bounded env readers
// -----------------------------------------------------------------------

fn bounded_u64(name: &str, min: u64, max: u64, default: u64, errors: &mut Vec<String>) -> u64 {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.parse::<u64>() {
            Ok(value) if (min..=max).contains(&value) => value,
            Ok(value) => {
                errors.push(format!("{name} must be in {min}..={max}, got {value}"));
                default
            }
            Err(_) => {
                errors.push(format!("{name} must be an integer, got {raw:?}"));
                default
            }
        },
    }
}

fn env_bool(name: &str, default: bool, errors: &mut Vec<String>) -> bool {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            other => {
                errors.push(format!("{name} must be a boolean, got {other:?}"));
                default
            }
        },
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// CI-loop tracking knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_iterations: u32,
    pub skip_if_no_workflows: bool,
    pub log_retention_count: u32,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct AgentGateConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub max_concurrent_runs: usize,
    pub max_spawn_depth: u32,
    pub max_children_per_parent: u32,
    pub max_tree_size: u32,
    pub default_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub lease_duration_seconds: u64,
    pub ci: CiConfig,
}

impl AgentGateConfig {
    /// Resolve configuration from the environment (and the optional
    /// config file for the data directory). All violations are aggregated
    /// into a single error.
    pub fn resolve(cli_data_dir: Option<&str>) -> Result<Self> {
        let mut errors = Vec::new();

        let file = load_config_file().ok();
        let data_dir = if let Some(dir) = cli_data_dir {
            PathBuf::from(dir)
        } else if let Ok(dir) = std::env::var("DATA_DIR") {
            PathBuf::from(dir)
        } else if let Some(dir) = file.as_ref().and_then(|f| f.storage.data_dir.clone()) {
            PathBuf::from(dir)
        } else {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("agentgate")
        };

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_owned());
        let port = bounded_u64("PORT", 1, 65_535, 3001, &mut errors) as u16;

        let max_concurrent_runs =
            bounded_u64("MAX_CONCURRENT_RUNS", 1, 100, 5, &mut errors) as usize;
        let max_spawn_depth = bounded_u64("MAX_SPAWN_DEPTH", 1, 10, 3, &mut errors) as u32;
        let max_children_per_parent =
            bounded_u64("MAX_CHILDREN_PER_PARENT", 1, 50, 10, &mut errors) as u32;
        let max_tree_size = bounded_u64("MAX_TREE_SIZE", 1, 1000, 100, &mut errors) as u32;

        let default_timeout_seconds =
            bounded_u64("DEFAULT_TIMEOUT_SECONDS", 60, 86_400, 3600, &mut errors);
        let poll_interval_ms = bounded_u64("POLL_INTERVAL_MS", 1000, 60_000, 5000, &mut errors);
        let lease_duration_seconds =
            bounded_u64("LEASE_DURATION_SECONDS", 300, 86_400, 3600, &mut errors);

        let ci = CiConfig {
            enabled: env_bool("CI_ENABLED", false, &mut errors),
            poll_interval_ms: bounded_u64("CI_POLL_INTERVAL_MS", 5000, 300_000, 30_000, &mut errors),
            timeout_ms: bounded_u64("CI_TIMEOUT_MS", 60_000, 7_200_000, 1_800_000, &mut errors),
            max_iterations: bounded_u64("CI_MAX_ITERATIONS", 1, 10, 3, &mut errors) as u32,
            skip_if_no_workflows: env_bool("CI_SKIP_IF_NO_WORKFLOWS", true, &mut errors),
            log_retention_count: bounded_u64("CI_LOG_RETENTION_COUNT", 1, 20, 5, &mut errors)
                as u32,
        };

        if !errors.is_empty() {
            bail!("configuration invalid:\n  - {}", errors.join("\n  - "));
        }

        Ok(Self {
            data_dir,
            host,
            port,
            max_concurrent_runs,
            max_spawn_depth,
            max_children_per_parent,
            max_tree_size,
            default_timeout_seconds,
            poll_interval_ms,
            lease_duration_seconds,
            ci,
        })
    }

    /// Map this surface onto the orchestrator's component configs.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            data_dir: self.data_dir.clone(),
            queue: QueueConfig {
                max_concurrent: self.max_concurrent_runs,
                max_queue_size: 100,
                tick_interval: Duration::from_secs(1),
            },
            process: ProcessManagerConfig {
                max_process_lifetime: Duration::from_secs(self.lease_duration_seconds),
                ..Default::default()
            },
            retry: RetryConfig::default(),
            limits: SubmitLimits {
                max_spawn_depth: self.max_spawn_depth,
                max_children_per_parent: self.max_children_per_parent,
                max_tree_size: self.max_tree_size,
                default_wall_clock_secs: self.default_timeout_seconds,
            },
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            event_filter: EventFilter::all(),
            agents: agentgate_core::agent::AgentCommandRegistry::with_defaults(),
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
