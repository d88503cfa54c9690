//! Core types for the task dispatcher.

use crate::error::SpecError;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task priority (lower = scheduled first).
pub type Priority = i32;

/// Priority assigned to specs that do not declare one.
pub const DEFAULT_PRIORITY: Priority = 100;

/// Retry ceiling for specs that do not declare one.
pub const DEFAULT_MAX_RETRIES: i32 = 2;

/// Executor class every node belongs to unless configured otherwise.
pub const GENERAL_EXECUTOR: &str = "general";

/// Lifecycle status of a task. No other value is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "claimed" => Some(TaskStatus::Claimed),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Holding a node slot (reserved or executing).
    pub fn occupies_slot(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        TaskStatus::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown task status '{}'", s).into()))
    }
}

/// A task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project: String,
    pub title: Option<String>,
    pub spec_file: String,
    pub spec_hash: String,
    pub status: TaskStatus,
    pub node: Option<String>,
    pub pid: Option<i64>,
    pub attempt: i32,
    pub max_retries: i32,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub collected_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    /// Set while a kill has been sent but not confirmed by the node.
    pub kill_requested_at: Option<i64>,
    pub error: Option<String>,
    pub depends_on: Vec<String>,
    pub modifies: Vec<String>,
    pub exclusive: bool,
    pub priority: Priority,
    pub executor: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// True once a failed attempt may no longer be retried automatically.
    pub fn retries_exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }

    pub fn kill_pending(&self) -> bool {
        self.kill_requested_at.is_some() && self.status == TaskStatus::Running
    }
}

/// A validated task produced by the spec scanner, not yet persisted.
///
/// The only constructor rejects an empty write-set, so every draft that
/// reaches the store declares the files it modifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDraft {
    id: String,
    project: String,
    title: Option<String>,
    spec_file: String,
    spec_hash: String,
    depends_on: Vec<String>,
    modifies: Vec<String>,
    exclusive: bool,
    priority: Priority,
    max_retries: i32,
    executor: Option<String>,
}

impl TaskDraft {
    pub fn new(
        id: impl Into<String>,
        project: impl Into<String>,
        spec_file: impl Into<String>,
        spec_hash: impl Into<String>,
        modifies: Vec<String>,
    ) -> Result<Self, SpecError> {
        let id = id.into();
        let spec_file = spec_file.into();
        if id.trim().is_empty() {
            return Err(SpecError::MissingId { file: spec_file });
        }
        let modifies: Vec<String> = modifies
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if modifies.is_empty() {
            return Err(SpecError::EmptyModifies { file: spec_file });
        }
        Ok(Self {
            id,
            project: project.into(),
            title: None,
            spec_file,
            spec_hash: spec_hash.into(),
            depends_on: Vec::new(),
            modifies,
            exclusive: false,
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            executor: None,
        })
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(0);
        self
    }

    pub fn with_executor(mut self, executor: Option<String>) -> Self {
        self.executor = executor;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn project(&self) -> &str {
        &self.project
    }
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
    pub fn spec_file(&self) -> &str {
        &self.spec_file
    }
    pub fn spec_hash(&self) -> &str {
        &self.spec_hash
    }
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
    pub fn modifies(&self) -> &[String] {
        &self.modifies
    }
    pub fn exclusive(&self) -> bool {
        self.exclusive
    }
    pub fn priority(&self) -> Priority {
        self.priority
    }
    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }
    pub fn executor(&self) -> Option<&str> {
        self.executor.as_deref()
    }
}

/// Worker node descriptor as declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    /// HTTP base URL for the worker daemon, or an SSH destination.
    pub host: String,
    pub slots: i32,
    #[serde(default = "default_executor")]
    pub executor: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub work_dir: Option<String>,
}

fn default_executor() -> String {
    GENERAL_EXECUTOR.to_string()
}

fn default_true() -> bool {
    true
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, host: impl Into<String>, slots: i32) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            slots,
            executor: default_executor(),
            priority: 0,
            enabled: true,
            work_dir: None,
        }
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A registered worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub host: String,
    pub slots: i32,
    /// Cache of claimed + running tasks on this node; recomputed every cycle.
    pub running_count: i32,
    pub enabled: bool,
    pub executor: String,
    pub priority: i32,
    pub work_dir: Option<String>,
    pub last_seen: Option<i64>,
    pub registered_at: i64,
}

impl Node {
    pub fn free_slots(&self) -> i32 {
        (self.slots - self.running_count).max(0)
    }
}

/// Cached running count that disagreed with ground truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDrift {
    pub node: String,
    pub cached: i32,
    pub actual: i32,
}

/// An advisory file lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    pub file_path: String,
    pub task_id: String,
    pub locked_at: i64,
}

/// A path another active task holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflict {
    pub path: String,
    pub holder: String,
}

/// Kind of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TasksScanned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetried,
    TaskRecovered,
    TimeoutRefreshed,
    DeployFailed,
    PollError,
    ExecutorFallback,
    KillRequested,
    TaskKilled,
    SlotDrift,
    LocksPruned,
    BreakerOpened,
    BreakerHalfOpen,
    BreakerClosed,
    OperatorRetry,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TasksScanned => "tasks_scanned",
            EventType::TaskStarted => "task_started",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::TaskRetried => "task_retried",
            EventType::TaskRecovered => "task_recovered",
            EventType::TimeoutRefreshed => "timeout_refreshed",
            EventType::DeployFailed => "deploy_failed",
            EventType::PollError => "poll_error",
            EventType::ExecutorFallback => "executor_fallback",
            EventType::KillRequested => "kill_requested",
            EventType::TaskKilled => "task_killed",
            EventType::SlotDrift => "slot_drift",
            EventType::LocksPruned => "locks_pruned",
            EventType::BreakerOpened => "breaker_opened",
            EventType::BreakerHalfOpen => "breaker_half_open",
            EventType::BreakerClosed => "breaker_closed",
            EventType::OperatorRetry => "operator_retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let all = [
            EventType::TasksScanned,
            EventType::TaskStarted,
            EventType::TaskCompleted,
            EventType::TaskFailed,
            EventType::TaskRetried,
            EventType::TaskRecovered,
            EventType::TimeoutRefreshed,
            EventType::DeployFailed,
            EventType::PollError,
            EventType::ExecutorFallback,
            EventType::KillRequested,
            EventType::TaskKilled,
            EventType::SlotDrift,
            EventType::LocksPruned,
            EventType::BreakerOpened,
            EventType::BreakerHalfOpen,
            EventType::BreakerClosed,
            EventType::OperatorRetry,
        ];
        all.into_iter().find(|e| e.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for EventType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EventType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        EventType::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown event type '{}'", s).into()))
    }
}

/// An entry in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: i64,
    pub project: String,
    pub task_id: Option<String>,
    pub event_type: EventType,
    pub node: Option<String>,
    pub details: serde_json::Value,
}

/// Task counts for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub claimed: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.claimed + self.running + self.completed + self.failed
    }

    /// Pending, claimed or running.
    pub fn unfinished(&self) -> i64 {
        self.pending + self.claimed + self.running
    }

    pub fn add(&mut self, status: TaskStatus, n: i64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Claimed => self.claimed += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
        }
    }
}
