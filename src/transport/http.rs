//! Client for the HTTP worker daemon.
//!
//! - `POST /execute` starts a task (202 accepted, 409 already running)
//! - `GET /status?task_id=` reports on one task
//! - `POST /kill` stops one task
//! - `GET /health` answers when the daemon is up

use super::{DeployAck, DeployRequest, DispatchError, KillAck, NodeHealth, TaskReport, Transport};
use crate::config::DispatchConfig;
use crate::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct ExecuteBody<'a> {
    task_id: &'a str,
    project: &'a str,
    spec_file: &'a str,
    command: &'a str,
    cwd: Option<&'a str>,
    env: &'a BTreeMap<String, String>,
    timeout: u64,
    lease_owner: &'a str,
}

#[derive(Serialize)]
struct KillBody<'a> {
    task_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(dispatch: &DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(dispatch.request_timeout_secs))
            .connect_timeout(Duration::from_secs(dispatch.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }

    fn url(node: &Node, path: &str) -> String {
        let base = node.host.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{}/{}", base, path)
        } else {
            format!("http://{}/{}", base, path)
        }
    }
}

fn send_error(err: reqwest::Error) -> DispatchError {
    if err.is_connect() {
        DispatchError::Unreachable(err.to_string())
    } else {
        DispatchError::Transient(err.to_string())
    }
}

/// Map a non-success status to an error. 4xx other than those handled by
/// the caller mean the node does not speak this protocol.
async fn status_error(response: reqwest::Response) -> DispatchError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => DispatchError::Transient(format!("node at capacity ({})", detail)),
        StatusCode::BAD_REQUEST => DispatchError::Rejected(detail),
        StatusCode::NOT_FOUND => DispatchError::NotFound(detail),
        s if s.is_server_error() => DispatchError::Transient(detail),
        _ => DispatchError::Protocol(detail),
    }
}

async fn json_body<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, DispatchError> {
    let text = response.text().await.map_err(send_error)?;
    serde_json::from_str(&text).map_err(|e| DispatchError::Protocol(format!("bad response body: {}", e)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deploy(&self, node: &Node, request: &DeployRequest) -> Result<DeployAck, DispatchError> {
        let body = ExecuteBody {
            task_id: &request.task_id,
            project: &request.project,
            spec_file: &request.spec_file,
            command: &request.command,
            cwd: request.cwd.as_deref(),
            env: &request.env,
            timeout: request.timeout_secs,
            lease_owner: &request.lease_owner,
        };

        let response = self
            .client
            .post(Self::url(node, "execute"))
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        match response.status() {
            StatusCode::CONFLICT => {
                debug!(node = %node.name, task_id = %request.task_id, "task already running on node");
                Ok(DeployAck::default())
            }
            s if s.is_success() => {
                // Body is informational; an empty or odd body still means accepted
                let text = response.text().await.unwrap_or_default();
                Ok(serde_json::from_str(&text).unwrap_or_default())
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn poll_status(&self, node: &Node, task_id: &str) -> Result<TaskReport, DispatchError> {
        let response = self
            .client
            .get(Self::url(node, "status"))
            .query(&[("task_id", task_id)])
            .send()
            .await
            .map_err(send_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        json_body(response).await
    }

    async fn kill(&self, node: &Node, task_id: &str) -> Result<KillAck, DispatchError> {
        let response = self
            .client
            .post(Self::url(node, "kill"))
            .json(&KillBody { task_id })
            .send()
            .await
            .map_err(send_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        json_body(response).await
    }

    async fn health(&self, node: &Node) -> Result<NodeHealth, DispatchError> {
        let response = self
            .client
            .get(Self::url(node, "health"))
            .send()
            .await
            .map_err(send_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let text = response.text().await.unwrap_or_default();
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }
}
