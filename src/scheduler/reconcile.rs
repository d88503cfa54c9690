//! Health checks and status reconciliation against the nodes.

use super::{CycleReport, Scheduler, bounded};
use crate::db::tasks::FailOutcome;
use crate::transport::{DispatchError, RemoteStatus, TaskReport};
use crate::types::{EventType, Node, Task, TaskStatus};
use anyhow::Result;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

impl Scheduler {
    /// Health-check every enabled node. Returns the names of those that answered.
    pub(super) async fn check_health(&self, report: &mut CycleReport) -> Result<HashSet<String>> {
        let nodes: Vec<Node> = self.ctx.db.list_nodes()?.into_iter().filter(|n| n.enabled).collect();
        let limit = self.ctx.config.scheduler.max_parallel_polls;

        let transport = self.ctx.transport.clone();
        let results = bounded(limit, nodes, |node| {
            let transport = transport.clone();
            async move {
                let result = transport.health(&node).await;
                (node.name, result)
            }
        })
        .await;

        let mut healthy = HashSet::new();
        for (name, result) in results {
            match result {
                Ok(_) => {
                    self.ctx.db.touch_node(&name)?;
                    healthy.insert(name);
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "node failed health check");
                    report.unhealthy.push(name);
                }
            }
        }
        report.unhealthy.sort();
        Ok(healthy)
    }

    /// Poll every running task and apply what the nodes report.
    pub(super) async fn reconcile_running(&self, report: &mut CycleReport) -> Result<()> {
        let running = self.ctx.db.tasks_with_status(&self.project, TaskStatus::Running)?;
        if running.is_empty() {
            return Ok(());
        }

        let nodes: HashMap<String, Node> = self
            .ctx
            .db
            .list_nodes()?
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();

        // Tasks on unreachable or unknown nodes wait for the stuck sweep
        let mut targets = Vec::new();
        for task in running {
            let Some(node) = task.node.as_ref().and_then(|n| nodes.get(n)) else {
                warn!(task_id = %task.id, node = ?task.node, "running task has no registered node");
                continue;
            };
            if report.unhealthy.contains(&node.name) {
                continue;
            }
            targets.push((task, node.clone()));
        }

        let transport = self.ctx.transport.clone();
        let mut results = bounded(self.ctx.config.scheduler.max_parallel_polls, targets, |(task, node)| {
            let transport = transport.clone();
            async move {
                let result = transport.poll_status(&node, &task.id).await;
                (task, node, result)
            }
        })
        .await;
        results.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        for (task, node, result) in results {
            match result {
                Ok(status) => self.apply_report(&task, &node, status, report).await?,
                Err(e) => self.record_poll_error(&task, &node, &e, report)?,
            }
        }
        Ok(())
    }

    async fn apply_report(&self, task: &Task, node: &Node, status: TaskReport, report: &mut CycleReport) -> Result<()> {
        let db = &self.ctx.db;

        match status.status {
            RemoteStatus::Running if task.kill_pending() => {
                match self.ctx.transport.kill(node, &task.id).await {
                    Ok(ack) if ack.killed => {
                        if db.mark_killed(&task.id)? {
                            info!(task_id = %task.id, node = %node.name, "kill confirmed");
                            report.killed.push(task.id.clone());
                        }
                    }
                    Ok(_) => {
                        db.heartbeat(&task.id)?;
                        debug!(task_id = %task.id, "kill still unconfirmed");
                    }
                    Err(e) => {
                        db.heartbeat(&task.id)?;
                        warn!(task_id = %task.id, error = %e, "kill resend failed");
                    }
                }
            }
            RemoteStatus::Running => {
                db.heartbeat(&task.id)?;
            }
            RemoteStatus::Completed => {
                if let Some(duration_ms) = db.complete_task(&task.id, status.completed_at)? {
                    info!(task_id = %task.id, node = %node.name, duration_ms, "task completed");
                    report.completed.push(task.id.clone());
                }
            }
            RemoteStatus::Failed if task.kill_pending() => {
                if db.mark_killed(&task.id)? {
                    info!(task_id = %task.id, node = %node.name, "killed task exited");
                    report.killed.push(task.id.clone());
                }
            }
            RemoteStatus::Failed => {
                let error = status.error.unwrap_or_else(|| "task failed".to_string());
                match db.fail_task(&task.id, &error)? {
                    Some(FailOutcome::Retrying) => {
                        warn!(task_id = %task.id, node = %node.name, error = %error, attempt = task.attempt + 1, "task failed; retrying");
                    }
                    Some(FailOutcome::Exhausted) => {
                        warn!(task_id = %task.id, node = %node.name, error = %error, "task failed; retries exhausted");
                    }
                    None => return Ok(()),
                }
                report.failed.push(task.id.clone());
                report.failure_messages.push(error);
            }
        }
        Ok(())
    }

    fn record_poll_error(&self, task: &Task, node: &Node, err: &DispatchError, report: &mut CycleReport) -> Result<()> {
        warn!(task_id = %task.id, node = %node.name, error = %err, "status poll failed");
        report.poll_errors += 1;
        report.failure_messages.push(err.to_string());
        self.ctx.db.append_event(
            &self.project,
            Some(&task.id),
            EventType::PollError,
            Some(&node.name),
            json!({ "error": err.to_string() }),
        )?;
        Ok(())
    }
}
