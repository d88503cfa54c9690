//! Stuck-task sweep and automatic retry.

use super::{CycleReport, Scheduler};
use crate::db::deps::blocked_by_failure;
use crate::db::now_ms;
use crate::db::tasks::{FailOutcome, TIMEOUT_EXHAUSTED, TIMEOUT_REFRESHED};
use anyhow::Result;
use tracing::{debug, info, warn};

impl Scheduler {
    /// Reset running tasks whose heartbeat is older than the stuck timeout.
    /// Tasks with an unconfirmed kill are not touched here; they hold their slot
    /// and locks until the node confirms the kill or reports an exit.
    pub(super) async fn sweep_stuck(&self, report: &mut CycleReport) -> Result<()> {
        let db = &self.ctx.db;
        let cutoff = now_ms() - self.ctx.config.scheduler.stuck_timeout_ms();
        let stale = db.stale_running_tasks(&self.project, cutoff)?;

        for task in stale {
            let Some(outcome) = db.refresh_stuck_task(&task.id)? else {
                continue;
            };

            // Best effort: a process that is merely silent should not keep running
            if let Some(node) = task.node.as_deref().map(|n| db.get_node(n)).transpose()?.flatten()
                && let Err(e) = self.ctx.transport.kill(&node, &task.id).await
            {
                debug!(task_id = %task.id, node = %node.name, error = %e, "could not kill stuck task");
            }

            match outcome {
                FailOutcome::Retrying => {
                    warn!(task_id = %task.id, node = ?task.node, "no heartbeat; task returned to pending");
                    report.stuck_reset.push(task.id.clone());
                    report.failure_messages.push(TIMEOUT_REFRESHED.to_string());
                }
                FailOutcome::Exhausted => {
                    warn!(task_id = %task.id, node = ?task.node, "no heartbeat; retries exhausted");
                    report.failed.push(task.id.clone());
                    report.failure_messages.push(TIMEOUT_EXHAUSTED.to_string());
                }
            }
        }
        Ok(())
    }

    /// Return leftover failed tasks with budget to pending, except those
    /// blocked behind a permanently failed dependency.
    pub(super) fn retry_failed(&self, report: &mut CycleReport) -> Result<()> {
        let db = &self.ctx.db;
        let tasks = db.list_tasks(Some(&self.project))?;
        let mut blocked: Vec<String> = blocked_by_failure(&tasks).into_iter().collect();
        blocked.sort();

        report.retried = db.retry_failed_tasks(&self.project, &blocked)?;
        if !report.retried.is_empty() {
            info!(project = %self.project, tasks = ?report.retried, "failed tasks returned to pending");
        }
        Ok(())
    }
}
