//! Task rows and their lifecycle transitions.
//!
//! Every transition that ends an attempt updates the task, its file locks,
//! the node's slot cache and the event log inside one SQL transaction.

use super::events::append_event;
use super::locks::{acquire_locks_internal, release_locks_internal};
use super::{Database, json_list, now_ms};
use crate::types::{EventType, Task, TaskDraft, TaskStatus};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::json;

/// Error annotation left on a task reset by the stuck sweep.
pub const TIMEOUT_REFRESHED: &str = "timeout_refreshed";
/// Error annotation left on a task whose stuck resets used up its retries.
pub const TIMEOUT_EXHAUSTED: &str = "timeout_exhausted";
/// Error annotation left on a task cancelled by an operator.
pub const KILLED: &str = "killed";

/// Result of inserting a scanned draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Row already existed with the same spec hash.
    Unchanged,
    /// Row already existed but the spec file changed since it was scanned.
    Drifted,
}

/// What happened to a task whose attempt ended badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending for another attempt.
    Retrying,
    /// Permanently failed; needs an operator.
    Exhausted,
}

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let exclusive: i64 = row.get("exclusive")?;

    Ok(Task {
        id: row.get("id")?,
        project: row.get("project")?,
        title: row.get("title")?,
        spec_file: row.get("spec_file")?,
        spec_hash: row.get("spec_hash")?,
        status: row.get("status")?,
        node: row.get("node")?,
        pid: row.get("pid")?,
        attempt: row.get("attempt")?,
        max_retries: row.get("max_retries")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        collected_at: row.get("collected_at")?,
        heartbeat_at: row.get("heartbeat_at")?,
        kill_requested_at: row.get("kill_requested_at")?,
        error: row.get("error")?,
        depends_on: json_list(row, "depends_on")?,
        modifies: json_list(row, "modifies")?,
        exclusive: exclusive != 0,
        priority: row.get("priority")?,
        executor: row.get("executor")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
pub(crate) fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
    let task = stmt.query_row(params![task_id], parse_task_row).optional()?;
    Ok(task)
}

fn require_task(conn: &Connection, task_id: &str) -> Result<Task> {
    get_task_internal(conn, task_id)?.ok_or_else(|| anyhow!("Task not found: {}", task_id))
}

/// Move a node's cached running count by `delta`, never below zero.
pub(crate) fn adjust_node_count(conn: &Connection, node: Option<&str>, delta: i32) -> Result<()> {
    if let Some(node) = node {
        conn.execute(
            "UPDATE nodes SET running_count = MAX(running_count + ?1, 0) WHERE name = ?2",
            params![delta, node],
        )?;
    }
    Ok(())
}

/// Drop a task's locks at the end of an attempt.
///
/// Exclusive tasks that go back to pending keep their locks so no other task
/// takes the files between attempts.
fn release_for_attempt_end(conn: &Connection, task: &Task, next: TaskStatus) -> Result<usize> {
    if task.exclusive && next == TaskStatus::Pending {
        return Ok(0);
    }
    release_locks_internal(conn, &task.id)
}

impl Database {
    /// Insert a scanned draft unless a task with the same id already exists.
    pub fn insert_draft(&self, draft: &TaskDraft) -> Result<InsertOutcome> {
        let now = now_ms();
        let depends_on = serde_json::to_string(draft.depends_on())?;
        let modifies = serde_json::to_string(draft.modifies())?;

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO tasks (
                    id, project, title, spec_file, spec_hash, status, max_retries,
                    depends_on, modifies, exclusive, priority, executor, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    draft.id(),
                    draft.project(),
                    draft.title(),
                    draft.spec_file(),
                    draft.spec_hash(),
                    draft.max_retries(),
                    depends_on,
                    modifies,
                    draft.exclusive() as i64,
                    draft.priority(),
                    draft.executor(),
                    now,
                ],
            )?;

            if inserted > 0 {
                return Ok(InsertOutcome::Inserted);
            }

            let stored_hash: String = conn.query_row(
                "SELECT spec_hash FROM tasks WHERE id = ?1",
                params![draft.id()],
                |row| row.get(0),
            )?;

            if stored_hash == draft.spec_hash() {
                Ok(InsertOutcome::Unchanged)
            } else {
                Ok(InsertOutcome::Drifted)
            }
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// List tasks, optionally restricted to one project, in scheduling order.
    pub fn list_tasks(&self, project: Option<&str>) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE (?1 IS NULL OR project = ?1)
                 ORDER BY project, priority, id",
            )?;
            let tasks = stmt
                .query_map(params![project], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Tasks of a project in the given status, ordered by (priority, id).
    pub fn tasks_with_status(&self, project: &str, status: TaskStatus) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks WHERE project = ?1 AND status = ?2 ORDER BY priority, id",
            )?;
            let tasks = stmt
                .query_map(params![project, status], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Reserve a pending task on a node: `pending -> claimed`, locks taken,
    /// slot cache incremented. Returns `None` if the task was not pending.
    pub fn claim_task(&self, task_id: &str, node: &str) -> Result<Option<Task>> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = require_task(&tx, task_id)?;
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }

            tx.execute(
                "UPDATE tasks SET status = 'claimed', node = ?1, pid = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![node, now, task_id],
            )?;
            acquire_locks_internal(&tx, task_id, &task.modifies, now)?;
            adjust_node_count(&tx, Some(node), 1)?;

            tx.commit()?;

            Ok(Some(Task {
                status: TaskStatus::Claimed,
                node: Some(node.to_string()),
                pid: None,
                updated_at: now,
                ..task
            }))
        })
    }

    /// Deploy accepted: `claimed -> running`. Returns `None` if the task
    /// stopped being claimed meanwhile (killed by an operator).
    pub fn mark_running(&self, task_id: &str, pid: Option<i64>) -> Result<Option<Task>> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = require_task(&tx, task_id)?;
            if task.status != TaskStatus::Claimed {
                return Ok(None);
            }

            tx.execute(
                "UPDATE tasks SET status = 'running', pid = ?1, started_at = ?2, heartbeat_at = ?2,
                 completed_at = NULL, kill_requested_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![pid, now, task_id],
            )?;
            append_event(
                &tx,
                &task.project,
                Some(task_id),
                EventType::TaskStarted,
                task.node.as_deref(),
                json!({ "attempt": task.attempt, "pid": pid }),
            )?;

            tx.commit()?;

            Ok(Some(Task {
                status: TaskStatus::Running,
                pid,
                started_at: Some(now),
                heartbeat_at: Some(now),
                completed_at: None,
                kill_requested_at: None,
                updated_at: now,
                ..task
            }))
        })
    }

    /// Deploy did not happen (transient failure): `claimed -> pending`,
    /// slot freed, attempt unchanged.
    pub fn unclaim_task(&self, task_id: &str, reason: &str) -> Result<()> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = require_task(&tx, task_id)?;
            if task.status != TaskStatus::Claimed {
                return Ok(());
            }

            tx.execute(
                "UPDATE tasks SET status = 'pending', node = NULL, pid = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now, task_id],
            )?;
            release_for_attempt_end(&tx, &task, TaskStatus::Pending)?;
            adjust_node_count(&tx, task.node.as_deref(), -1)?;
            append_event(
                &tx,
                &task.project,
                Some(task_id),
                EventType::DeployFailed,
                task.node.as_deref(),
                json!({ "reason": reason }),
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    /// Refresh a running task's liveness signal.
    pub fn heartbeat(&self, task_id: &str) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tasks SET heartbeat_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![now, task_id],
            )?;
            Ok(updated > 0)
        })
    }

    /// Node reported completion. Returns the run duration in milliseconds,
    /// or `None` if the task was no longer active.
    pub fn complete_task(&self, task_id: &str, completed_at: Option<i64>) -> Result<Option<i64>> {
        let now = now_ms();
        let completed_at = completed_at.unwrap_or(now);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = require_task(&tx, task_id)?;
            if !task.status.occupies_slot() {
                return Ok(None);
            }

            let duration_ms = task.started_at.map(|s| (completed_at - s).max(0));

            tx.execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1, error = NULL,
                 kill_requested_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![completed_at, now, task_id],
            )?;
            release_locks_internal(&tx, task_id)?;
            adjust_node_count(&tx, task.node.as_deref(), -1)?;
            append_event(
                &tx,
                &task.project,
                Some(task_id),
                EventType::TaskCompleted,
                task.node.as_deref(),
                json!({ "attempt": task.attempt, "duration_ms": duration_ms }),
            )?;

            tx.commit()?;
            Ok(Some(duration_ms.unwrap_or(0)))
        })
    }

    /// An attempt failed (node report or rejected deploy).
    ///
    /// The attempt counter is incremented. If retries remain the task goes
    /// straight back to `pending` in the same transaction; otherwise it is
    /// permanently `failed`.
    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<Option<FailOutcome>> {
        self.end_attempt(task_id, error, EventType::TaskFailed, error)
    }

    /// Stuck-sweep reset of a running task whose heartbeat went stale.
    pub fn refresh_stuck_task(&self, task_id: &str) -> Result<Option<FailOutcome>> {
        self.end_attempt(task_id, TIMEOUT_REFRESHED, EventType::TimeoutRefreshed, TIMEOUT_EXHAUSTED)
    }

    fn end_attempt(
        &self,
        task_id: &str,
        retry_error: &str,
        event_type: EventType,
        exhausted_error: &str,
    ) -> Result<Option<FailOutcome>> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = require_task(&tx, task_id)?;
            if !task.status.occupies_slot() {
                return Ok(None);
            }

            let attempt = task.attempt + 1;
            let outcome = if attempt < task.max_retries {
                FailOutcome::Retrying
            } else {
                FailOutcome::Exhausted
            };

            let (recorded_attempt, recorded_error) = match outcome {
                FailOutcome::Retrying => (attempt, retry_error),
                FailOutcome::Exhausted => (task.attempt.max(task.max_retries), exhausted_error),
            };

            match outcome {
                FailOutcome::Retrying => {
                    tx.execute(
                        "UPDATE tasks SET status = 'pending', attempt = ?1, error = ?2, node = NULL,
                         pid = NULL, started_at = NULL, heartbeat_at = NULL,
                         kill_requested_at = NULL, updated_at = ?3
                         WHERE id = ?4",
                        params![recorded_attempt, recorded_error, now, task_id],
                    )?;
                    release_for_attempt_end(&tx, &task, TaskStatus::Pending)?;
                }
                FailOutcome::Exhausted => {
                    tx.execute(
                        "UPDATE tasks SET status = 'failed', attempt = ?1, error = ?2,
                         completed_at = ?3, kill_requested_at = NULL, updated_at = ?3
                         WHERE id = ?4",
                        params![recorded_attempt, recorded_error, now, task_id],
                    )?;
                    release_locks_internal(&tx, task_id)?;
                }
            }
            adjust_node_count(&tx, task.node.as_deref(), -1)?;

            append_event(
                &tx,
                &task.project,
                Some(task_id),
                event_type,
                task.node.as_deref(),
                json!({ "attempt": recorded_attempt, "error": recorded_error }),
            )?;
            if outcome == FailOutcome::Retrying {
                append_event(
                    &tx,
                    &task.project,
                    Some(task_id),
                    EventType::TaskRetried,
                    None,
                    json!({ "attempt": attempt, "max_retries": task.max_retries }),
                )?;
            }

            tx.commit()?;
            Ok(Some(outcome))
        })
    }

    /// Running tasks of a project whose last liveness signal is older than
    /// `cutoff_ms`. Tasks with an unconfirmed kill are excluded: they stay
    /// running until the node confirms the kill or reports an exit.
    pub fn stale_running_tasks(&self, project: &str, cutoff_ms: i64) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE project = ?1 AND status = 'running' AND kill_requested_at IS NULL
                 AND COALESCE(heartbeat_at, started_at, updated_at) < ?2
                 ORDER BY priority, id",
            )?;
            let tasks = stmt
                .query_map(params![project, cutoff_ms], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Reset `failed` tasks that still have retries left back to `pending`.
    ///
    /// Tasks in `skip` (blocked behind a permanently failed dependency) are
    /// left alone. Returns the IDs that were reset.
    pub fn retry_failed_tasks(&self, project: &str, skip: &[String]) -> Result<Vec<String>> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let candidates: Vec<(String, i32)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, attempt FROM tasks
                     WHERE project = ?1 AND status = 'failed' AND attempt < max_retries
                     ORDER BY priority, id",
                )?;
                stmt.query_map(params![project], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            let mut reset = Vec::new();
            for (id, attempt) in candidates {
                if skip.contains(&id) {
                    continue;
                }
                tx.execute(
                    "UPDATE tasks SET status = 'pending', node = NULL, pid = NULL,
                     started_at = NULL, completed_at = NULL, heartbeat_at = NULL, updated_at = ?1
                     WHERE id = ?2",
                    params![now, &id],
                )?;
                append_event(
                    &tx,
                    project,
                    Some(&id),
                    EventType::TaskRetried,
                    None,
                    json!({ "attempt": attempt }),
                )?;
                reset.push(id);
            }

            tx.commit()?;
            Ok(reset)
        })
    }

    /// Operator retry: every failed task of the project back to `pending`
    /// with a fresh attempt budget.
    pub fn reset_failed_tasks(&self, project: &str) -> Result<Vec<String>> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM tasks WHERE project = ?1 AND status = 'failed' ORDER BY priority, id",
                )?;
                stmt.query_map(params![project], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            for id in &ids {
                tx.execute(
                    "UPDATE tasks SET status = 'pending', attempt = 0, error = NULL, node = NULL,
                     pid = NULL, started_at = NULL, completed_at = NULL, heartbeat_at = NULL,
                     kill_requested_at = NULL, updated_at = ?1
                     WHERE id = ?2",
                    params![now, id],
                )?;
                release_locks_internal(&tx, id)?;
                append_event(&tx, project, Some(id), EventType::OperatorRetry, None, json!({}))?;
            }

            tx.commit()?;
            Ok(ids)
        })
    }

    /// Return tasks left `claimed` by a previous scheduler process to `pending`.
    pub fn recover_claimed_tasks(&self, project: &str) -> Result<Vec<String>> {
        let claimed = self.tasks_with_status(project, TaskStatus::Claimed)?;
        let mut recovered = Vec::new();

        for task in claimed {
            let now = now_ms();
            self.with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE tasks SET status = 'pending', node = NULL, pid = NULL, updated_at = ?1
                     WHERE id = ?2 AND status = 'claimed'",
                    params![now, &task.id],
                )?;
                release_for_attempt_end(&tx, &task, TaskStatus::Pending)?;
                adjust_node_count(&tx, task.node.as_deref(), -1)?;
                append_event(
                    &tx,
                    project,
                    Some(&task.id),
                    EventType::TaskRecovered,
                    task.node.as_deref(),
                    json!({}),
                )?;
                tx.commit()?;
                Ok(())
            })?;
            recovered.push(task.id);
        }

        Ok(recovered)
    }

    /// Record that a kill was sent but not confirmed. The task stays running.
    pub fn request_kill(&self, task_id: &str, reason: &str) -> Result<()> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = require_task(&tx, task_id)?;

            tx.execute(
                "UPDATE tasks SET kill_requested_at = COALESCE(kill_requested_at, ?1), updated_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![now, task_id],
            )?;
            append_event(
                &tx,
                &task.project,
                Some(task_id),
                EventType::KillRequested,
                task.node.as_deref(),
                json!({ "reason": reason }),
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    /// Kill confirmed (or the task never reached a node): permanently
    /// failed, slot and locks released. Operator kills are never retried.
    pub fn mark_killed(&self, task_id: &str) -> Result<bool> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = require_task(&tx, task_id)?;
            if task.status.is_terminal() {
                return Ok(false);
            }

            tx.execute(
                "UPDATE tasks SET status = 'failed', error = ?1, attempt = MAX(attempt, max_retries),
                 completed_at = ?2, kill_requested_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![KILLED, now, task_id],
            )?;
            release_locks_internal(&tx, task_id)?;
            if task.status.occupies_slot() {
                adjust_node_count(&tx, task.node.as_deref(), -1)?;
            }
            append_event(
                &tx,
                &task.project,
                Some(task_id),
                EventType::TaskKilled,
                task.node.as_deref(),
                json!({ "previous_status": task.status }),
            )?;

            tx.commit()?;
            Ok(true)
        })
    }
}
