//! The scheduling loop.
//!
//! One cycle: recover (first cycle only), slot reconcile, health checks,
//! status reconcile, stuck sweep, retry, lock prune, breaker gate,
//! assignment, breaker record. `run` repeats cycles until the project is
//! finished, a stop is requested, or the cycle limit is hit.

mod assign;
pub mod kill;
pub mod lease;
mod reconcile;
pub mod report;
mod sweep;

pub use kill::{KillOutcome, kill_task};
pub use lease::ProjectLease;
pub use report::ProjectReport;

use crate::breaker::{CycleSignals, Gate, Transition};
use crate::config::Config;
use crate::db::deps::blocked_by_failure;
use crate::db::{Database, now_ms};
use crate::transport::Transport;
use crate::types::{SlotDrift, StatusCounts, TaskStatus};
use anyhow::Result;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Everything a scheduler needs, passed explicitly.
#[derive(Clone)]
pub struct SchedulerContext {
    pub db: Database,
    pub transport: Arc<dyn Transport>,
    pub config: Arc<Config>,
    stop: Arc<AtomicBool>,
}

impl SchedulerContext {
    pub fn new(db: Database, transport: Arc<dyn Transport>, config: Config) -> Self {
        Self {
            db,
            transport,
            config: Arc::new(config),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag; setting it stops the loop at the next check.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Nothing pending, claimed or running.
    AllComplete,
    /// Only tasks stuck behind permanently failed dependencies remain.
    Blocked,
    StopRequested,
    CycleLimit,
}

/// Final state of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub project: String,
    pub halt: HaltReason,
    pub cycles: u64,
    pub counts: StatusCounts,
    pub blocked: Vec<String>,
    pub elapsed_ms: u128,
}

impl RunSummary {
    /// 0 when everything that ran succeeded (or the run was stopped), 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.halt {
            HaltReason::Blocked => 1,
            _ if self.counts.failed > 0 => 1,
            _ => 0,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub recovered: Vec<String>,
    pub drift: Vec<SlotDrift>,
    pub unhealthy: Vec<String>,
    pub completed: Vec<String>,
    /// Attempts that ended in failure (node report, rejected deploy, stuck budget exhausted).
    pub failed: Vec<String>,
    pub deployed: Vec<String>,
    pub deploy_failures: Vec<String>,
    pub stuck_reset: Vec<String>,
    pub retried: Vec<String>,
    pub killed: Vec<String>,
    pub poll_errors: usize,
    pub locks_pruned: usize,
    /// Ready tasks that found no node.
    pub unplaced: usize,
    pub breaker_skipped: bool,
    /// Error text of every failure signal, for the breaker.
    pub failure_messages: Vec<String>,
}

impl CycleReport {
    pub fn signals(&self, running: usize) -> CycleSignals {
        CycleSignals {
            completed: self.completed.len(),
            failures: self.failure_messages.clone(),
            running,
            unplaced: self.unplaced,
        }
    }
}

/// Run `f` over `items` with at most `limit` in flight. Results come back
/// in completion order once all have finished.
pub(crate) async fn bounded<I, T, F, Fut>(limit: usize, items: I, f: F) -> Vec<T>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set: JoinSet<T> = JoinSet::new();

    for item in items {
        let fut = f(item);
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            fut.await
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(value) => results.push(value),
            Err(e) => error!(error = %e, "transport call panicked"),
        }
    }
    results
}

/// Drives one project.
pub struct Scheduler {
    ctx: SchedulerContext,
    project: String,
    cycle: u64,
    recovered: bool,
    stop_file: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext, project: impl Into<String>) -> Self {
        Self {
            ctx,
            project: project.into(),
            cycle: 0,
            recovered: false,
            stop_file: None,
        }
    }

    /// Stop when this file appears.
    pub fn with_stop_file(mut self, path: PathBuf) -> Self {
        self.stop_file = Some(path);
        self
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn stop_requested(&self) -> bool {
        if self.ctx.stop_requested() {
            return true;
        }
        if let Some(path) = &self.stop_file
            && path.exists()
        {
            info!(project = %self.project, path = %path.display(), "stop file found");
            self.ctx.request_stop();
            return true;
        }
        false
    }

    /// Run one full cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycle += 1;
        let db = &self.ctx.db;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };

        if !self.recovered {
            report.recovered = db.recover_claimed_tasks(&self.project)?;
            for id in &report.recovered {
                warn!(task_id = %id, "returned task left claimed by a previous run to pending");
            }
            self.recovered = true;
        }

        report.drift = db.reconcile_running_counts(&self.project)?;
        for d in &report.drift {
            warn!(node = %d.node, cached = d.cached, actual = d.actual, "slot count drift corrected");
        }

        let healthy = self.check_health(&mut report).await?;

        self.reconcile_running(&mut report).await?;

        let every = self.ctx.config.scheduler.stuck_sweep_every.max(1);
        if self.cycle % every == 0 {
            self.sweep_stuck(&mut report).await?;
        }

        self.retry_failed(&mut report)?;

        report.locks_pruned = db.prune_stale_locks(&self.project)?;
        if report.locks_pruned > 0 {
            warn!(project = %self.project, count = report.locks_pruned, "pruned locks held by finished tasks");
        }

        let mut breaker = db.load_breaker(&self.project)?;
        let (gate, opened) = breaker.gate(now_ms());
        if let Some(t) = &opened {
            info!(project = %self.project, "circuit breaker half-open; trial cycle");
            db.save_breaker(&breaker, Some(t))?;
        }

        match gate {
            Gate::Skip { remaining_ms } => {
                report.breaker_skipped = true;
                info!(
                    project = %self.project,
                    remaining_secs = remaining_ms / 1000,
                    "circuit breaker open; skipping assignment"
                );
            }
            Gate::Allow => {
                self.assign(&healthy, &mut report).await?;

                let counts = db.status_counts(&self.project)?;
                let active = (counts.running + counts.claimed) as usize;
                let signals = report.signals(active);
                let transition = breaker.record(&signals, &self.ctx.config.breaker, now_ms());
                match &transition {
                    Some(Transition::Opened { reason }) => warn!(
                        project = %self.project,
                        reason = %reason,
                        cooldown_secs = self.ctx.config.breaker.cooldown_secs,
                        "circuit breaker opened"
                    ),
                    Some(Transition::Closed) => info!(project = %self.project, "circuit breaker closed"),
                    _ => {}
                }
                db.save_breaker(&breaker, transition.as_ref())?;
            }
        }

        debug!(
            project = %self.project,
            cycle = self.cycle,
            completed = report.completed.len(),
            failed = report.failed.len(),
            deployed = report.deployed.len(),
            "cycle finished"
        );

        Ok(report)
    }

    /// Whether the project is finished.
    pub fn completion(&self) -> Result<Option<HaltReason>> {
        let tasks = self.ctx.db.list_tasks(Some(&self.project))?;

        if tasks.iter().any(|t| t.status.occupies_slot()) {
            return Ok(None);
        }

        let pending: Vec<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.as_str())
            .collect();
        if pending.is_empty() {
            return Ok(Some(HaltReason::AllComplete));
        }

        let blocked = blocked_by_failure(&tasks);
        if pending.iter().all(|id| blocked.contains(*id)) {
            return Ok(Some(HaltReason::Blocked));
        }
        Ok(None)
    }

    /// Loop until finished, stopped, or out of cycles.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let max_cycles = self.ctx.config.scheduler.max_cycles;
        let interval = self.ctx.config.scheduler.poll_interval();

        info!(project = %self.project, ?max_cycles, interval_secs = interval.as_secs(), "scheduler started");

        let halt = loop {
            if self.stop_requested() {
                break HaltReason::StopRequested;
            }

            // Store errors inside a cycle are not fatal; the next cycle retries
            match self.run_cycle().await {
                Ok(_) => match self.completion() {
                    Ok(Some(halt)) => break halt,
                    Ok(None) => {}
                    Err(e) => error!(project = %self.project, error = %e, "completion check failed"),
                },
                Err(e) => error!(project = %self.project, cycle = self.cycle, error = %e, "cycle failed"),
            }

            if max_cycles.is_some_and(|max| self.cycle >= max) {
                break HaltReason::CycleLimit;
            }

            self.sleep(interval).await;
        };

        let summary = self.summary(halt, started)?;
        info!(
            project = %self.project,
            halt = ?summary.halt,
            cycles = summary.cycles,
            completed = summary.counts.completed,
            failed = summary.counts.failed,
            "scheduler stopped"
        );
        Ok(summary)
    }

    fn summary(&self, halt: HaltReason, started: Instant) -> Result<RunSummary> {
        let tasks = self.ctx.db.list_tasks(Some(&self.project))?;
        let mut counts = StatusCounts::default();
        for t in &tasks {
            counts.add(t.status, 1);
        }
        let blocked_set = blocked_by_failure(&tasks);
        let mut blocked: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && blocked_set.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();
        blocked.sort();

        Ok(RunSummary {
            project: self.project.clone(),
            halt,
            cycles: self.cycle,
            counts,
            blocked,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    /// Sleep between cycles, waking early on a stop request.
    async fn sleep(&self, total: Duration) {
        let slice = Duration::from_millis(200);
        let deadline = Instant::now() + total;
        while !self.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(slice.min(deadline - now)).await;
        }
    }
}
