//! SSH transport: runs tasks through plain `ssh`, no daemon on the node.
//!
//! Each task gets `<run_dir>/<task>.pid`, `.exit` and `.log` on the node.
//! The task runs in its own process group so a kill reaches its children.

use super::{DeployAck, DeployRequest, DispatchError, KillAck, NodeHealth, TaskReport, Transport};
use crate::config::DispatchConfig;
use crate::types::Node;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// ssh's own exit status for connection failures.
const SSH_CONNECT_FAILURE: i32 = 255;

/// Exit status the deploy script uses when the working directory is missing.
const NO_WORKDIR: i32 = 3;

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct Output {
    code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    run_dir: String,
    connect_timeout_secs: u64,
    request_timeout: Duration,
}

impl SshTransport {
    pub fn new(dispatch: &DispatchConfig) -> Self {
        Self {
            run_dir: dispatch.remote_run_dir.trim_end_matches('/').to_string(),
            connect_timeout_secs: dispatch.connect_timeout_secs,
            request_timeout: Duration::from_secs(dispatch.request_timeout_secs),
        }
    }

    fn destination(node: &Node) -> &str {
        node.host.strip_prefix("ssh://").unwrap_or(&node.host)
    }

    fn file(&self, task_id: &str, ext: &str) -> String {
        shell_quote(&format!("{}/{}.{}", self.run_dir, task_id, ext))
    }

    async fn run(&self, node: &Node, script: &str) -> Result<Output, DispatchError> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg(Self::destination(node))
            .arg(script)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.request_timeout, cmd.output())
            .await
            .map_err(|_| DispatchError::Transient(format!("ssh to {} timed out", node.name)))?
            .map_err(|e| DispatchError::Unreachable(format!("cannot run ssh: {}", e)))?;

        let out = Output {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if out.code == SSH_CONNECT_FAILURE {
            return Err(DispatchError::Unreachable(out.stderr));
        }
        Ok(out)
    }

    fn deploy_script(&self, request: &DeployRequest) -> Result<String, DispatchError> {
        let pid = self.file(&request.task_id, "pid");
        let exit = self.file(&request.task_id, "exit");
        let log = self.file(&request.task_id, "log");

        let mut exports = String::new();
        for (key, value) in &request.env {
            if !valid_env_name(key) {
                return Err(DispatchError::Rejected(format!("invalid environment variable name '{}'", key)));
            }
            exports.push_str(&format!("export {}={}; ", key, shell_quote(value)));
        }

        let inner = format!(
            "{}timeout {} sh -c {}; echo $? > {}",
            exports,
            request.timeout_secs,
            shell_quote(&request.command),
            exit
        );

        let cd = match &request.cwd {
            Some(dir) => format!("cd {} || exit {}; ", shell_quote(dir), NO_WORKDIR),
            None => String::new(),
        };

        Ok(format!(
            "mkdir -p {run}; {cd}\
             if [ -f {pid} ] && kill -0 \"$(cat {pid})\" 2>/dev/null; then echo \"running $(cat {pid})\"; exit 0; fi; \
             rm -f {exit}; \
             setsid nohup sh -c {inner} > {log} 2>&1 < /dev/null & \
             echo $! > {pid}; echo \"started $!\"",
            run = shell_quote(&self.run_dir),
            cd = cd,
            pid = pid,
            exit = exit,
            inner = shell_quote(&inner),
            log = log,
        ))
    }

    fn poll_script(&self, task_id: &str) -> String {
        let pid = self.file(task_id, "pid");
        let exit = self.file(task_id, "exit");
        format!(
            "if [ -f {exit} ]; then echo \"exit $(cat {exit})\"; \
             elif [ -f {pid} ] && kill -0 \"$(cat {pid})\" 2>/dev/null; then echo \"running $(cat {pid})\"; \
             elif [ -f {pid} ]; then echo vanished; \
             else echo missing; fi",
            exit = exit,
            pid = pid,
        )
    }

    fn kill_script(&self, task_id: &str) -> String {
        let pid = self.file(task_id, "pid");
        format!(
            "if [ ! -f {pid} ]; then echo killed; exit 0; fi; \
             P=$(cat {pid}); \
             kill -TERM -- \"-$P\" 2>/dev/null || kill -TERM \"$P\" 2>/dev/null; \
             for i in 1 2 3 4 5; do kill -0 \"$P\" 2>/dev/null || {{ echo killed; exit 0; }}; sleep 1; done; \
             echo alive",
            pid = pid,
        )
    }
}

/// Interpret the poll script's single line of output.
fn parse_poll(task_id: &str, line: &str) -> Result<TaskReport, DispatchError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("exit"), Some("0")) => Ok(TaskReport::completed()),
        (Some("exit"), Some(code)) => Ok(TaskReport::failed(format!("exit code {}", code))),
        (Some("running"), pid) => Ok(TaskReport::running(pid.and_then(|p| p.parse().ok()))),
        (Some("vanished"), _) => Ok(TaskReport::failed("process vanished")),
        (Some("missing"), _) => Err(DispatchError::NotFound(task_id.to_string())),
        _ => Err(DispatchError::Protocol(format!("unexpected poll output '{}'", line))),
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn deploy(&self, node: &Node, request: &DeployRequest) -> Result<DeployAck, DispatchError> {
        let script = self.deploy_script(request)?;
        let out = self.run(node, &script).await?;

        match out.code {
            0 => {
                debug!(node = %node.name, task_id = %request.task_id, output = %out.stdout, "ssh deploy");
                let pid = out.stdout.split_whitespace().nth(1).and_then(|p| p.parse().ok());
                Ok(DeployAck { pid, slots_free: None })
            }
            NO_WORKDIR => Err(DispatchError::Rejected(format!(
                "working directory {:?} missing on {}",
                request.cwd, node.name
            ))),
            code => Err(DispatchError::Transient(format!("deploy script exited {}: {}", code, out.stderr))),
        }
    }

    async fn poll_status(&self, node: &Node, task_id: &str) -> Result<TaskReport, DispatchError> {
        let out = self.run(node, &self.poll_script(task_id)).await?;
        if out.code != 0 {
            return Err(DispatchError::Transient(format!("poll exited {}: {}", out.code, out.stderr)));
        }
        parse_poll(task_id, &out.stdout)
    }

    async fn kill(&self, node: &Node, task_id: &str) -> Result<KillAck, DispatchError> {
        let out = self.run(node, &self.kill_script(task_id)).await?;
        Ok(KillAck {
            killed: out.code == 0 && out.stdout.ends_with("killed"),
        })
    }

    async fn health(&self, node: &Node) -> Result<NodeHealth, DispatchError> {
        let script = format!("mkdir -p {} && echo ok", shell_quote(&self.run_dir));
        let out = self.run(node, &script).await?;
        if out.code == 0 && out.stdout.ends_with("ok") {
            Ok(NodeHealth::default())
        } else {
            Err(DispatchError::Transient(format!("health check exited {}: {}", out.code, out.stderr)))
        }
    }
}
