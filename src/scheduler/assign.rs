//! Assignment: match ready tasks to nodes and deploy them.

use super::{CycleReport, Scheduler};
use crate::db::deps::{blocked_by_failure, dependencies_met};
use crate::db::tasks::FailOutcome;
use crate::transport::DeployRequest;
use crate::types::{EventType, Node, Task, TaskStatus};
use anyhow::Result;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

impl Scheduler {
    pub(super) async fn assign(&self, healthy: &HashSet<String>, report: &mut CycleReport) -> Result<()> {
        let db = &self.ctx.db;
        let tasks = db.list_tasks(Some(&self.project))?;
        let status_of: HashMap<String, TaskStatus> = tasks.iter().map(|t| (t.id.clone(), t.status)).collect();
        let blocked = blocked_by_failure(&tasks);

        let mut pending: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending && !blocked.contains(&t.id))
            .collect();
        pending.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));

        let mut claimed_paths: HashSet<String> = HashSet::new();

        for task in pending {
            if !dependencies_met(&task, &status_of) {
                continue;
            }

            if let Some(path) = task.modifies.iter().find(|p| claimed_paths.contains(*p)) {
                debug!(task_id = %task.id, path = %path, "path claimed earlier this cycle");
                continue;
            }

            let conflicts = db.check_conflicts(&task.modifies, &task.id)?;
            if !conflicts.is_empty() {
                debug!(task_id = %task.id, ?conflicts, "file conflict; waiting");
                continue;
            }

            let Some(node) = self.pick_node(&task, healthy)? else {
                report.unplaced += 1;
                continue;
            };

            let Some(claimed) = db.claim_task(&task.id, &node.name)? else {
                continue;
            };
            claimed_paths.extend(claimed.modifies.iter().cloned());

            self.deploy(&claimed, &node, report).await?;
        }
        Ok(())
    }

    /// Best healthy node for `task`, falling back to the configured class
    /// only when no healthy node of the required class exists at all.
    fn pick_node(&self, task: &Task, healthy: &HashSet<String>) -> Result<Option<Node>> {
        let db = &self.ctx.db;
        let first_healthy =
            |nodes: Vec<Node>| -> Option<Node> { nodes.into_iter().find(|n| healthy.contains(&n.name)) };

        let Some(required) = task.executor.as_deref() else {
            return Ok(first_healthy(db.available_nodes(None)?));
        };

        if let Some(node) = first_healthy(db.available_nodes(Some(required))?) {
            return Ok(Some(node));
        }

        let class_exists = db
            .list_nodes()?
            .iter()
            .any(|n| n.enabled && n.executor == required && healthy.contains(&n.name));
        let fallback = self.ctx.config.scheduler.fallback_executor.as_str();
        if class_exists || fallback == required {
            return Ok(None);
        }

        let Some(node) = first_healthy(db.available_nodes(Some(fallback))?) else {
            return Ok(None);
        };

        info!(task_id = %task.id, required, fallback, node = %node.name, "no node of required class; falling back");
        db.append_event(
            &self.project,
            Some(&task.id),
            EventType::ExecutorFallback,
            Some(&node.name),
            json!({ "required": required, "fallback": fallback }),
        )?;
        Ok(Some(node))
    }

    async fn deploy(&self, task: &Task, node: &Node, report: &mut CycleReport) -> Result<()> {
        let db = &self.ctx.db;
        let request = DeployRequest::for_task(task, node, &self.ctx.config.dispatch);

        match self.ctx.transport.deploy(node, &request).await {
            Ok(ack) => match db.mark_running(&task.id, ack.pid)? {
                Some(_) => {
                    info!(task_id = %task.id, node = %node.name, pid = ?ack.pid, attempt = task.attempt, "task deployed");
                    report.deployed.push(task.id.clone());
                }
                None => {
                    // Killed between claim and deploy; stop what the node just started
                    warn!(task_id = %task.id, node = %node.name, "task no longer claimed after deploy");
                    if let Err(e) = self.ctx.transport.kill(node, &task.id).await {
                        warn!(task_id = %task.id, error = %e, "could not stop orphaned deploy");
                    }
                }
            },
            Err(e) if e.is_transient() => {
                warn!(task_id = %task.id, node = %node.name, error = %e, "deploy failed; task stays pending");
                db.unclaim_task(&task.id, &e.to_string())?;
                report.deploy_failures.push(task.id.clone());
                report.failure_messages.push(e.to_string());
            }
            Err(e) => {
                let message = e.to_string();
                match db.fail_task(&task.id, &message)? {
                    Some(FailOutcome::Retrying) => {
                        warn!(task_id = %task.id, node = %node.name, error = %message, "deploy rejected; will retry")
                    }
                    Some(FailOutcome::Exhausted) => {
                        warn!(task_id = %task.id, node = %node.name, error = %message, "deploy rejected; retries exhausted")
                    }
                    None => {}
                }
                report.deploy_failures.push(task.id.clone());
                report.failed.push(task.id.clone());
                report.failure_messages.push(message);
            }
        }
        Ok(())
    }
}
