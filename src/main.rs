//! task-dispatch
//!
//! Scans per-task spec files, assigns tasks to worker nodes, and tracks
//! them to completion.

use anyhow::{Result, bail};
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::atomic::Ordering;
use task_dispatch::cli::run::{prepare, register_nodes};
use task_dispatch::cli::{Cli, Command, NodeAction, RunArgs};
use task_dispatch::config::{Config, ConfigLoader};
use task_dispatch::db::Database;
use task_dispatch::error::{CliError, ScheduleError};
use task_dispatch::format::{self, OutputFormat};
use task_dispatch::scanner;
use task_dispatch::scheduler::{KillOutcome, ProjectReport, SchedulerContext, kill_task, lease};
use task_dispatch::transport::build_transport;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    // RUST_LOG wins over --verbose when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    match cli.log.as_str() {
        "0" | "off" => {}
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            let file = OpenOptions::new().create(true).append(true).open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut loader = ConfigLoader::load(cli.config.clone())?;
    for (tier, path) in loader.sources() {
        tracing::debug!(%tier, path = %path.display(), "config source");
    }

    let config = loader.config_mut();
    if let Some(db_path) = &cli.database {
        config.store.db_path = db_path.clone();
    }
    if let Some(state_dir) = &cli.state_dir {
        config.store.state_dir = state_dir.clone();
    }
    Ok(loader.into_config())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let output = cli.command.format();

    if let Err(e) = init_logging(&cli) {
        eprintln!("failed to initialise logging: {:#}", e);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            match output {
                OutputFormat::Json => println!("{}", format::to_json(&CliError::from_anyhow(&e))),
                OutputFormat::Text => eprintln!("error: {:#}", e),
            }
            match e.downcast_ref::<ScheduleError>() {
                Some(s) => s.exit_code(),
                None => 2,
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Start(args) => run_project(config, args, false).await,
        Command::Retry(args) => run_project(config, args, true).await,
        Command::Status { project, format } => {
            let db = Database::open(&config.store.db_path)?;
            let mut all = db.all_status_counts()?;
            if let Some(project) = &project {
                all.retain(|p, _| p == project);
            }
            match format {
                OutputFormat::Json => println!("{}", format::to_json(&all)),
                OutputFormat::Text => {
                    print!("{}", format::format_status_text(&all));
                    for project in all.keys() {
                        if let Some(pid) = lease::holder(&config.store.state_dir, project) {
                            println!("{}: scheduler running (pid {})", project, pid);
                        }
                    }
                }
            }
            Ok(0)
        }
        Command::Stop { project } => {
            if lease::request_stop(&config.store.state_dir, &project)? {
                println!("stop requested for {}", project);
                Ok(0)
            } else {
                println!("no scheduler is running {}", project);
                Ok(1)
            }
        }
        Command::Scan { project, specs, format } => {
            let db = Database::open(&config.store.db_path)?;
            let dir = specs.unwrap_or_else(|| config.specs_dir(&project));
            let report = scanner::import(&db, &project, &dir, config.scheduler.default_max_retries)?;
            match format {
                OutputFormat::Json => println!("{}", format::to_json(&report)),
                OutputFormat::Text => print!("{}", format::format_scan_text(&project, &report)),
            }
            Ok(if report.rejected.is_empty() { 0 } else { 1 })
        }
        Command::Kill { task_id } => {
            let db = Database::open(&config.store.db_path)?;
            let transport = build_transport(&config.dispatch)?;
            let ctx = SchedulerContext::new(db, transport, config);
            match kill_task(&ctx, &task_id).await? {
                KillOutcome::Killed => println!("{} killed", task_id),
                KillOutcome::Requested => println!("{}: kill sent, not yet confirmed; the scheduler will resend it", task_id),
                KillOutcome::AlreadyFinished => println!("{} already finished", task_id),
            }
            Ok(0)
        }
        Command::Report { project, format } => {
            let db = Database::open(&config.store.db_path)?;
            let report = ProjectReport::build(&db, &project)?;
            if report.counts.total() == 0 {
                bail!(ScheduleError::EmptyProject { project });
            }
            match format {
                OutputFormat::Json => println!("{}", format::to_json(&report)),
                OutputFormat::Text => print!("{}", format::format_report_text(&report)),
            }
            Ok(0)
        }
        Command::Nodes { format } => {
            let db = Database::open(&config.store.db_path)?;
            register_nodes(&db, &config)?;
            let nodes = db.list_nodes()?;
            match format {
                OutputFormat::Json => println!("{}", format::to_json(&nodes)),
                OutputFormat::Text => print!("{}", format::format_nodes_text(&nodes)),
            }
            Ok(0)
        }
        Command::Node { action } => {
            let db = Database::open(&config.store.db_path)?;
            register_nodes(&db, &config)?;
            let (name, enabled) = match action {
                NodeAction::Enable { name } => (name, true),
                NodeAction::Disable { name } => (name, false),
            };
            if !db.set_node_enabled(&name, enabled)? {
                bail!("node '{}' is not registered", name);
            }
            println!("{} {}", name, if enabled { "enabled" } else { "disabled" });
            Ok(0)
        }
        Command::Events { project, limit, format } => {
            let db = Database::open(&config.store.db_path)?;
            let events = db.recent_events(&project, limit)?;
            match format {
                OutputFormat::Json => println!("{}", format::to_json(&events)),
                OutputFormat::Text => print!("{}", format::format_events_text(&events)),
            }
            Ok(0)
        }
    }
}

async fn run_project(config: Config, args: RunArgs, operator_retry: bool) -> Result<i32> {
    let db = Database::open(&config.store.db_path)?;
    let prepared = prepare(config, db, None, &args, operator_retry)?;

    if !prepared.scan.rejected.is_empty() {
        warn!(
            project = %args.project,
            count = prepared.scan.rejected.len(),
            "some specs were rejected; see `scan` for details"
        );
    }

    let stop = prepared.scheduler.context().stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping after this cycle");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let summary = prepared.run().await?;
    match args.format {
        OutputFormat::Json => println!("{}", format::to_json(&summary)),
        OutputFormat::Text => print!("{}", format::format_summary_text(&summary)),
    }
    Ok(summary.exit_code())
}
