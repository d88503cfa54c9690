//! Persisted-state summary of one project.

use crate::breaker::CircuitBreaker;
use crate::db::Database;
use crate::db::deps::blocked_by_failure;
use crate::types::{StatusCounts, TaskStatus};
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub id: String,
    pub attempt: i32,
    pub max_retries: i32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveTask {
    pub id: String,
    pub status: TaskStatus,
    pub node: Option<String>,
    pub started_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    pub kill_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectReport {
    pub project: String,
    pub counts: StatusCounts,
    pub active: Vec<ActiveTask>,
    pub failed: Vec<FailedTask>,
    /// Pending tasks that can never run without an operator retry.
    pub blocked: Vec<String>,
    pub breaker: CircuitBreaker,
    pub mean_duration_ms: Option<f64>,
}

impl ProjectReport {
    pub fn build(db: &Database, project: &str) -> Result<Self> {
        let mut tasks = db.list_tasks(Some(project))?;
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut counts = StatusCounts::default();
        for t in &tasks {
            counts.add(t.status, 1);
        }

        let blocked_set = blocked_by_failure(&tasks);
        let blocked = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && blocked_set.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();

        let active = tasks
            .iter()
            .filter(|t| t.status.occupies_slot())
            .map(|t| ActiveTask {
                id: t.id.clone(),
                status: t.status,
                node: t.node.clone(),
                started_at: t.started_at,
                heartbeat_at: t.heartbeat_at,
                kill_requested: t.kill_requested_at.is_some(),
            })
            .collect();

        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| FailedTask {
                id: t.id.clone(),
                attempt: t.attempt,
                max_retries: t.max_retries,
                error: t.error.clone(),
            })
            .collect();

        Ok(Self {
            project: project.to_string(),
            counts,
            active,
            failed,
            blocked,
            breaker: db.load_breaker(project)?,
            mean_duration_ms: db.mean_task_duration_ms(project)?,
        })
    }
}
