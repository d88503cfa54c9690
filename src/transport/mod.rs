//! How the scheduler talks to worker nodes.
//!
//! The scheduler only sees [`Transport`]; the HTTP worker-daemon client and
//! the SSH shell-out are interchangeable behind it.

pub mod http;
pub mod ssh;

use crate::config::{DispatchConfig, TransportKind};
use crate::types::{Node, Task};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use http::HttpTransport;
pub use ssh::SshTransport;

/// Failure talking to a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Try again later: node busy, 5xx, timeout.
    #[error("transient: {0}")]
    Transient(String),

    /// The node refused the task itself; retrying unchanged will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The node has no record of the task.
    #[error("not found: {0}")]
    NotFound(String),

    /// The node answered with something unintelligible.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl DispatchError {
    /// Transient errors leave a task pending; the rest count against it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Transient(_) | DispatchError::Unreachable(_) | DispatchError::Protocol(_)
        )
    }
}

/// Everything a node needs to start one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub task_id: String,
    pub project: String,
    pub spec_file: String,
    pub command: String,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub lease_owner: String,
}

impl DeployRequest {
    /// Build the request for `task` on `node` from the dispatch settings.
    pub fn for_task(task: &Task, node: &Node, dispatch: &DispatchConfig) -> Self {
        let mut env = dispatch.env.clone();
        env.insert("TASK_ID".into(), task.id.clone());
        env.insert("TASK_PROJECT".into(), task.project.clone());
        env.insert("TASK_SPEC_FILE".into(), task.spec_file.clone());
        env.insert("TASK_ATTEMPT".into(), task.attempt.to_string());

        Self {
            task_id: task.id.clone(),
            project: task.project.clone(),
            spec_file: task.spec_file.clone(),
            command: dispatch.render_command(&task.id, &task.project, &task.spec_file),
            cwd: node.work_dir.clone().or_else(|| dispatch.cwd.clone()),
            env,
            timeout_secs: dispatch.timeout_secs,
            lease_owner: dispatch.lease_owner.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAck {
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub slots_free: Option<i32>,
}

/// Status of a task as the node sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub status: RemoteStatus,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pid: Option<i64>,
}

impl TaskReport {
    pub fn running(pid: Option<i64>) -> Self {
        Self {
            status: RemoteStatus::Running,
            completed_at: None,
            error: None,
            pid,
        }
    }

    pub fn completed() -> Self {
        Self {
            status: RemoteStatus::Completed,
            completed_at: None,
            error: None,
            pid: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Failed,
            completed_at: None,
            error: Some(error.into()),
            pid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillAck {
    pub killed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    #[serde(default)]
    pub slots_free: Option<i32>,
    #[serde(default)]
    pub running_tasks: Option<i32>,
}

/// Node-facing operations. Implementations must be safe to call
/// concurrently for different nodes and tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a task. Deploying a task the node already runs must succeed.
    async fn deploy(&self, node: &Node, request: &DeployRequest) -> Result<DeployAck, DispatchError>;

    async fn poll_status(&self, node: &Node, task_id: &str) -> Result<TaskReport, DispatchError>;

    async fn kill(&self, node: &Node, task_id: &str) -> Result<KillAck, DispatchError>;

    async fn health(&self, node: &Node) -> Result<NodeHealth, DispatchError>;
}

/// Build the configured transport.
pub fn build_transport(dispatch: &DispatchConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match dispatch.transport {
        TransportKind::Http => Arc::new(HttpTransport::new(dispatch)?),
        TransportKind::Ssh => Arc::new(SshTransport::new(dispatch)),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GENERAL_EXECUTOR, TaskStatus};

    fn task() -> Task {
        Task {
            id: "T-1".into(),
            project: "web".into(),
            title: None,
            spec_file: "specs/T-1.md".into(),
            spec_hash: "h".into(),
            status: TaskStatus::Claimed,
            node: Some("n1".into()),
            pid: None,
            attempt: 1,
            max_retries: 2,
            started_at: None,
            completed_at: None,
            collected_at: None,
            heartbeat_at: None,
            kill_requested_at: None,
            error: None,
            depends_on: vec![],
            modifies: vec!["a".into()],
            exclusive: false,
            priority: 100,
            executor: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn node(work_dir: Option<&str>) -> Node {
        Node {
            name: "n1".into(),
            host: "http://n1".into(),
            slots: 2,
            running_count: 0,
            enabled: true,
            executor: GENERAL_EXECUTOR.into(),
            priority: 0,
            work_dir: work_dir.map(str::to_string),
            last_seen: None,
            registered_at: 0,
        }
    }

    #[test]
    fn transient_classification() {
        assert!(DispatchError::Transient("x".into()).is_transient());
        assert!(DispatchError::Unreachable("x".into()).is_transient());
        assert!(!DispatchError::Rejected("x".into()).is_transient());
        assert!(!DispatchError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn request_uses_node_work_dir_over_default() {
        let dispatch = DispatchConfig {
            cwd: Some("/srv/default".into()),
            command: "run {task_id}".into(),
            ..Default::default()
        };
        let req = DeployRequest::for_task(&task(), &node(Some("/srv/n1")), &dispatch);
        assert_eq!(req.cwd.as_deref(), Some("/srv/n1"));
        assert_eq!(req.command, "run T-1");
        assert_eq!(req.env["TASK_ATTEMPT"], "1");

        let req = DeployRequest::for_task(&task(), &node(None), &dispatch);
        assert_eq!(req.cwd.as_deref(), Some("/srv/default"));
    }

    #[test]
    fn report_parses_worker_json() {
        let report: TaskReport =
            serde_json::from_str(r#"{"status":"failed","error":"exit 2","completed_at":5}"#).unwrap();
        assert_eq!(report.status, RemoteStatus::Failed);
        assert_eq!(report.completed_at, Some(5));
        assert!(serde_json::from_str::<TaskReport>(r#"{"status":"done"}"#).is_err());
    }
}
