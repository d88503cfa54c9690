//! Start-up sequence for `start` and `retry`.

use super::RunArgs;
use crate::breaker::Transition;
use crate::config::Config;
use crate::db::Database;
use crate::scanner::{self, ScanReport};
use crate::scheduler::{ProjectLease, RunSummary, Scheduler, SchedulerContext};
use crate::transport::{Transport, build_transport};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Register every configured node.
pub fn register_nodes(db: &Database, config: &Config) -> Result<()> {
    for node in &config.nodes {
        db.register_node(node)?;
    }
    Ok(())
}

/// A project ready to run: lease held, specs imported, graph validated.
pub struct PreparedRun {
    pub scheduler: Scheduler,
    pub scan: ScanReport,
    lease: ProjectLease,
}

impl PreparedRun {
    pub fn lease(&self) -> &ProjectLease {
        &self.lease
    }

    /// Run to completion. The lease is released when this returns.
    pub async fn run(mut self) -> Result<RunSummary> {
        let summary = self.scheduler.run().await;
        drop(self.lease);
        summary
    }
}

/// Take the project, import its specs and check the dependency graph.
///
/// With `operator_retry` every failed task is first reset to a fresh
/// attempt budget and the breaker is closed.
pub fn prepare(
    mut config: Config,
    db: Database,
    transport: Option<Arc<dyn Transport>>,
    args: &RunArgs,
    operator_retry: bool,
) -> Result<PreparedRun> {
    let project = args.project.as_str();
    if args.max_cycles.is_some() {
        config.scheduler.max_cycles = args.max_cycles;
    }

    let lease = ProjectLease::acquire(&config.store.state_dir, project)?;

    register_nodes(&db, &config)?;

    if operator_retry {
        let reset = db.reset_failed_tasks(project)?;
        let mut breaker = db.load_breaker(project)?;
        if breaker.close() {
            db.save_breaker(&breaker, Some(&Transition::Closed))?;
        }
        info!(project, count = reset.len(), "operator retry: failed tasks reset");
    }

    let specs_dir = args.specs.clone().unwrap_or_else(|| config.specs_dir(project));
    let scan = scanner::import(&db, project, &specs_dir, config.scheduler.default_max_retries)?;
    for err in &scan.rejected {
        warn!(project, error = %err, "spec rejected");
    }

    db.validate_dependencies(project)?;

    let transport = match transport {
        Some(t) => t,
        None => build_transport(&config.dispatch)?,
    };

    let stop_file = lease.stop_file().to_path_buf();
    let ctx = SchedulerContext::new(db, transport, config);
    let scheduler = Scheduler::new(ctx, project).with_stop_file(stop_file);

    Ok(PreparedRun { scheduler, scan, lease })
}
