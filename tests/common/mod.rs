//! Shared helpers for integration tests: an in-process worker fleet behind
//! the `Transport` trait, spec-file writers and a ready-made config.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use task_dispatch::config::Config;
use task_dispatch::db::Database;
use task_dispatch::scheduler::{Scheduler, SchedulerContext};
use task_dispatch::transport::{
    DeployAck, DeployRequest, DispatchError, KillAck, NodeHealth, TaskReport, Transport,
};
use task_dispatch::types::{Node, NodeSpec};

pub fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

/// What a deployed attempt does when polled.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Report running for `polls` polls, then completed.
    Succeed { polls: u32 },
    /// Report running for `polls` polls, then failed with the message.
    Fail { polls: u32, error: String },
    /// Run forever.
    Hang,
}

impl Outcome {
    pub fn ok() -> Self {
        Outcome::Succeed { polls: 0 }
    }

    pub fn fail(error: &str) -> Self {
        Outcome::Fail {
            polls: 0,
            error: error.to_string(),
        }
    }
}

#[derive(Debug)]
struct Active {
    node: String,
    polls_left: u32,
    outcome: Outcome,
    modifies: Vec<String>,
}

#[derive(Debug, Default)]
struct FleetState {
    /// Per task, one outcome per attempt; default is immediate success.
    scripts: HashMap<String, VecDeque<Outcome>>,
    deploy_errors: HashMap<String, VecDeque<DispatchError>>,
    /// Write-sets by task id, for overlap checks.
    modifies: HashMap<String, Vec<String>>,
    active: HashMap<String, Active>,
    unhealthy: HashSet<String>,
    refuse_kills: bool,
    /// Nodes with a poll error scripted for every poll.
    poll_errors: HashSet<String>,

    deploys: Vec<(String, String)>,
    finished: Vec<String>,
    kills: Vec<String>,
    peak_per_node: HashMap<String, usize>,
    overlaps: Vec<(String, String)>,
}

/// In-process stand-in for a fleet of worker daemons.
#[derive(Debug, Clone, Default)]
pub struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut FleetState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn script(&self, task_id: &str, outcomes: Vec<Outcome>) {
        self.with(|s| s.scripts.insert(task_id.to_string(), outcomes.into()));
    }

    pub fn fail_deploy(&self, task_id: &str, errors: Vec<DispatchError>) {
        self.with(|s| s.deploy_errors.insert(task_id.to_string(), errors.into()));
    }

    pub fn declare_modifies(&self, task_id: &str, paths: &[&str]) {
        self.with(|s| {
            s.modifies
                .insert(task_id.to_string(), paths.iter().map(|p| p.to_string()).collect())
        });
    }

    pub fn set_unhealthy(&self, node: &str, unhealthy: bool) {
        self.with(|s| {
            if unhealthy {
                s.unhealthy.insert(node.to_string());
            } else {
                s.unhealthy.remove(node);
            }
        });
    }

    pub fn refuse_kills(&self, refuse: bool) {
        self.with(|s| s.refuse_kills = refuse);
    }

    pub fn fail_polls_on(&self, node: &str) {
        self.with(|s| s.poll_errors.insert(node.to_string()));
    }

    /// Let a hanging task finish on its next poll.
    pub fn release(&self, task_id: &str, outcome: Outcome) {
        self.with(|s| {
            if let Some(a) = s.active.get_mut(task_id) {
                a.outcome = outcome;
                a.polls_left = 0;
            }
        });
    }

    pub fn deploys(&self) -> Vec<(String, String)> {
        self.with(|s| s.deploys.clone())
    }

    pub fn deploy_count(&self, task_id: &str) -> usize {
        self.with(|s| s.deploys.iter().filter(|(t, _)| t == task_id).count())
    }

    pub fn node_of_first_deploy(&self, task_id: &str) -> Option<String> {
        self.with(|s| s.deploys.iter().find(|(t, _)| t == task_id).map(|(_, n)| n.clone()))
    }

    pub fn finished(&self) -> Vec<String> {
        self.with(|s| s.finished.clone())
    }

    pub fn kills(&self) -> Vec<String> {
        self.with(|s| s.kills.clone())
    }

    pub fn peak(&self, node: &str) -> usize {
        self.with(|s| s.peak_per_node.get(node).copied().unwrap_or(0))
    }

    pub fn overlaps(&self) -> Vec<(String, String)> {
        self.with(|s| s.overlaps.clone())
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.with(|s| s.active.contains_key(task_id))
    }
}

#[async_trait]
impl Transport for FakeFleet {
    async fn deploy(&self, node: &Node, request: &DeployRequest) -> Result<DeployAck, DispatchError> {
        self.with(|s| {
            if s.unhealthy.contains(&node.name) {
                return Err(DispatchError::Unreachable(node.name.clone()));
            }
            if let Some(err) = s.deploy_errors.get_mut(&request.task_id).and_then(|q| q.pop_front()) {
                return Err(err);
            }
            if s.active.contains_key(&request.task_id) {
                return Ok(DeployAck::default());
            }

            let modifies = s.modifies.get(&request.task_id).cloned().unwrap_or_default();
            for (other, active) in &s.active {
                if active.modifies.iter().any(|p| modifies.contains(p)) {
                    s.overlaps.push((request.task_id.clone(), other.clone()));
                }
            }

            let outcome = s
                .scripts
                .get_mut(&request.task_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Outcome::ok());
            let polls_left = match &outcome {
                Outcome::Succeed { polls } | Outcome::Fail { polls, .. } => *polls,
                Outcome::Hang => u32::MAX,
            };
            s.active.insert(
                request.task_id.clone(),
                Active {
                    node: node.name.clone(),
                    polls_left,
                    outcome,
                    modifies,
                },
            );
            s.deploys.push((request.task_id.clone(), node.name.clone()));

            let on_node = s.active.values().filter(|a| a.node == node.name).count();
            let peak = s.peak_per_node.entry(node.name.clone()).or_default();
            *peak = (*peak).max(on_node);

            Ok(DeployAck {
                pid: Some(1000 + s.deploys.len() as i64),
                slots_free: None,
            })
        })
    }

    async fn poll_status(&self, node: &Node, task_id: &str) -> Result<TaskReport, DispatchError> {
        self.with(|s| {
            if s.poll_errors.contains(&node.name) {
                return Err(DispatchError::Transient(format!("poll to {} timed out", node.name)));
            }
            let Some(active) = s.active.get_mut(task_id) else {
                return Err(DispatchError::NotFound(task_id.to_string()));
            };
            if active.polls_left > 0 {
                if !matches!(active.outcome, Outcome::Hang) {
                    active.polls_left -= 1;
                }
                return Ok(TaskReport::running(None));
            }
            let report = match &active.outcome {
                Outcome::Succeed { .. } => TaskReport::completed(),
                Outcome::Fail { error, .. } => TaskReport::failed(error.clone()),
                Outcome::Hang => return Ok(TaskReport::running(None)),
            };
            s.active.remove(task_id);
            s.finished.push(task_id.to_string());
            Ok(report)
        })
    }

    async fn kill(&self, _node: &Node, task_id: &str) -> Result<KillAck, DispatchError> {
        self.with(|s| {
            s.kills.push(task_id.to_string());
            if s.refuse_kills {
                return Ok(KillAck { killed: false });
            }
            s.active.remove(task_id);
            Ok(KillAck { killed: true })
        })
    }

    async fn health(&self, node: &Node) -> Result<NodeHealth, DispatchError> {
        self.with(|s| {
            if s.unhealthy.contains(&node.name) {
                Err(DispatchError::Unreachable(node.name.clone()))
            } else {
                Ok(NodeHealth::default())
            }
        })
    }
}

/// Config tuned for tests: no sleeping between cycles, bounded runs.
pub fn test_config(nodes: Vec<NodeSpec>) -> Config {
    let mut config = Config::default();
    config.scheduler.poll_interval_secs = 0;
    config.scheduler.max_cycles = Some(60);
    config.scheduler.stuck_sweep_every = 1;
    config.breaker.no_progress_threshold = 1000;
    config.breaker.repeat_error_threshold = 1000;
    config.nodes = nodes;
    config
}

/// Register the config's nodes and build a scheduler over `fleet`.
pub fn scheduler(db: &Database, fleet: &FakeFleet, config: Config, project: &str) -> Scheduler {
    for node in &config.nodes {
        db.register_node(node).unwrap();
    }
    let transport: Arc<dyn Transport> = Arc::new(fleet.clone());
    Scheduler::new(SchedulerContext::new(db.clone(), transport, config), project)
}

/// Front-matter for a spec file.
pub struct Spec<'a> {
    pub id: &'a str,
    pub modifies: &'a [&'a str],
    pub depends_on: &'a [&'a str],
    pub extra: &'a str,
}

impl<'a> Spec<'a> {
    pub fn new(id: &'a str, modifies: &'a [&'a str]) -> Self {
        Self {
            id,
            modifies,
            depends_on: &[],
            extra: "",
        }
    }

    pub fn after(mut self, deps: &'a [&'a str]) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with(mut self, extra: &'a str) -> Self {
        self.extra = extra;
        self
    }

    pub fn render(&self) -> String {
        let list = |items: &[&str]| format!("[{}]", items.join(", "));
        let mut out = format!("---\nid: {}\nmodifies: {}\n", self.id, list(self.modifies));
        if !self.depends_on.is_empty() {
            out.push_str(&format!("depends_on: {}\n", list(self.depends_on)));
        }
        if !self.extra.is_empty() {
            out.push_str(self.extra);
            out.push('\n');
        }
        out.push_str(&format!("---\n# {}\n\nDo the work.\n", self.id));
        out
    }
}

pub fn write_spec(dir: &Path, spec: &Spec) {
    std::fs::write(dir.join(format!("{}.md", spec.id)), spec.render()).unwrap();
}

/// Write specs and import them into `project`.
pub fn import_specs(db: &Database, dir: &Path, project: &str, specs: &[Spec]) {
    for spec in specs {
        write_spec(dir, spec);
    }
    let report = task_dispatch::scanner::import(db, project, dir, 2).unwrap();
    assert!(report.rejected.is_empty(), "{:?}", report.rejected);
}
