//! Operator kill.

use super::SchedulerContext;
use crate::types::TaskStatus;
use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillOutcome {
    /// Confirmed dead (or never reached a node); the task is failed.
    Killed,
    /// Sent but not confirmed; the scheduler keeps re-sending.
    Requested,
    /// Already completed or failed.
    AlreadyFinished,
}

/// Kill one task.
///
/// Pending and claimed tasks are failed directly. Running tasks get a
/// transport kill; without confirmation the request is recorded and the
/// reconcile step resends it every cycle.
pub async fn kill_task(ctx: &SchedulerContext, task_id: &str) -> Result<KillOutcome> {
    let db = &ctx.db;
    let Some(task) = db.get_task(task_id)? else {
        bail!("task '{}' not found", task_id);
    };

    match task.status {
        TaskStatus::Completed | TaskStatus::Failed => Ok(KillOutcome::AlreadyFinished),
        TaskStatus::Pending | TaskStatus::Claimed => {
            db.mark_killed(task_id)?;
            info!(task_id, status = %task.status, "task killed before it ran");
            Ok(KillOutcome::Killed)
        }
        TaskStatus::Running => {
            let node = match task.node.as_deref() {
                Some(name) => db.get_node(name)?,
                None => None,
            };
            let Some(node) = node else {
                warn!(task_id, node = ?task.node, "running task has no registered node; recording kill request");
                db.request_kill(task_id, "node unknown")?;
                return Ok(KillOutcome::Requested);
            };

            match ctx.transport.kill(&node, task_id).await {
                Ok(ack) if ack.killed => {
                    db.mark_killed(task_id)?;
                    info!(task_id, node = %node.name, "task killed");
                    Ok(KillOutcome::Killed)
                }
                Ok(_) => {
                    db.request_kill(task_id, "not confirmed")?;
                    warn!(task_id, node = %node.name, "kill not confirmed; will resend");
                    Ok(KillOutcome::Requested)
                }
                Err(e) => {
                    db.request_kill(task_id, &e.to_string())?;
                    warn!(task_id, node = %node.name, error = %e, "kill failed; will resend");
                    Ok(KillOutcome::Requested)
                }
            }
        }
    }
}
