//! Configuration types.

use crate::types::{DEFAULT_MAX_RETRIES, GENERAL_EXECUTOR, NodeSpec};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where persistent state lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file (default: `task-dispatch/dispatch.db`).
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory for PID and stop files (default: `task-dispatch/state`).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            state_dir: default_state_dir(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("task-dispatch/dispatch.db")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("task-dispatch/state")
}

/// Scheduling loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between cycles (default: 10).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// A running task with no heartbeat for this long is reset (default: 1800).
    #[serde(default = "default_stuck_timeout")]
    pub stuck_timeout_secs: u64,

    /// Run the stuck sweep every N cycles (default: 5).
    #[serde(default = "default_stuck_sweep_every")]
    pub stuck_sweep_every: u64,

    /// Upper bound on concurrent status polls and health checks (default: 8).
    #[serde(default = "default_max_parallel_polls")]
    pub max_parallel_polls: usize,

    /// Retry ceiling for specs that do not set `max_retries` (default: 2).
    #[serde(default = "default_max_retries")]
    pub default_max_retries: i32,

    /// Executor class tried when no node offers the one a task asks for.
    #[serde(default = "default_fallback_executor")]
    pub fallback_executor: String,

    /// Stop after this many cycles (unbounded when absent).
    #[serde(default)]
    pub max_cycles: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            stuck_timeout_secs: default_stuck_timeout(),
            stuck_sweep_every: default_stuck_sweep_every(),
            max_parallel_polls: default_max_parallel_polls(),
            default_max_retries: default_max_retries(),
            fallback_executor: default_fallback_executor(),
            max_cycles: None,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stuck_timeout_ms(&self) -> i64 {
        (self.stuck_timeout_secs as i64).saturating_mul(1000)
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_stuck_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_stuck_sweep_every() -> u64 {
    5
}

fn default_max_parallel_polls() -> usize {
    8
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_fallback_executor() -> String {
    GENERAL_EXECUTOR.to_string()
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_no_progress_threshold")]
    pub no_progress_threshold: u32,

    #[serde(default = "default_repeat_error_threshold")]
    pub repeat_error_threshold: u32,

    /// Seconds an open breaker waits before the half-open trial (default: 300).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            no_progress_threshold: default_no_progress_threshold(),
            repeat_error_threshold: default_repeat_error_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown_ms(&self) -> i64 {
        (self.cooldown_secs as i64).saturating_mul(1000)
    }
}

fn default_no_progress_threshold() -> u32 {
    5
}

fn default_repeat_error_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    300
}

/// How tasks reach nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Worker daemon over HTTP (default).
    #[default]
    Http,
    /// Plain SSH; nodes need no daemon.
    Ssh,
}

/// What gets sent to a node for each task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub transport: TransportKind,

    /// Command template; `{task_id}`, `{project}` and `{spec_file}` are substituted.
    #[serde(default = "default_command")]
    pub command: String,

    /// Working directory on the node unless the node sets its own `work_dir`.
    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Execution time limit passed to the node (default: 3600).
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,

    /// Identifies this dispatcher to the nodes.
    #[serde(default = "default_lease_owner")]
    pub lease_owner: String,

    /// Per-request timeout for transport calls (default: 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connection timeout for transport calls (default: 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Remote directory for SSH pid/exit/log files.
    #[serde(default = "default_remote_run_dir")]
    pub remote_run_dir: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            command: default_command(),
            cwd: None,
            env: BTreeMap::new(),
            timeout_secs: default_task_timeout(),
            lease_owner: default_lease_owner(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            remote_run_dir: default_remote_run_dir(),
        }
    }
}

impl DispatchConfig {
    /// Render the command template for one task.
    pub fn render_command(&self, task_id: &str, project: &str, spec_file: &str) -> String {
        self.command
            .replace("{task_id}", task_id)
            .replace("{project}", project)
            .replace("{spec_file}", spec_file)
    }
}

fn default_command() -> String {
    "run-task {spec_file}".to_string()
}

fn default_task_timeout() -> u64 {
    3600
}

fn default_lease_owner() -> String {
    "task-dispatch".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_remote_run_dir() -> String {
    "/tmp/task-dispatch".to_string()
}

/// Per-project settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub specs_dir: PathBuf,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,

    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl Config {
    /// Load a single YAML file (no tier merging).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.poll_interval_secs == 0 {
            return Err(anyhow!("scheduler.poll_interval_secs must be greater than zero"));
        }
        if self.scheduler.max_parallel_polls == 0 {
            return Err(anyhow!("scheduler.max_parallel_polls must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.slots <= 0 {
                return Err(anyhow!("node '{}' must have at least one slot", node.name));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(anyhow!("node '{}' is declared more than once", node.name));
            }
        }
        Ok(())
    }

    /// Spec directory for a project: configured, or `specs/<project>`.
    pub fn specs_dir(&self, project: &str) -> PathBuf {
        self.projects
            .get(project)
            .map(|p| p.specs_dir.clone())
            .unwrap_or_else(|| PathBuf::from("specs").join(project))
    }
}
