//! sokovand — the Sokovan scheduler daemon.
//!
//! Single binary that assembles the scheduler subsystems:
//! - Session store (redb)
//! - Per-resource-group scheduling provisioners
//! - Launch/teardown lifecycle handlers
//! - Retry handler and pending-queue sweeper
//! - Phase timers under file-based phase locks
//!
//! # Usage
//!
//! ```text
//! sokovand standalone --data-dir /var/lib/sokovan --config sokovand.toml
//! ```

mod config;
mod handlers;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use sokovan_coordinator::{
    Coordinator, EventBus, FileLockFactory, LockFactory, PhaseHandler, PhaseTimer, TimerConfig,
};
use sokovan_lifecycle::{Launcher, MockAgent, RetryHandler, Sweeper, Terminator};
use sokovan_scheduler::{Provisioner, SelectionStrategy, Sequencer};
use sokovan_state::SessionStore;

use config::DaemonConfig;
use handlers::{
    CreateProgressHandler, PrecondHandler, PullProgressHandler, RetryPhaseHandler,
    ScheduleHandler, StartHandler, SweepHandler, TerminateProgressHandler,
};

#[derive(Parser)]
#[command(name = "sokovand", about = "Sokovan scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single process, all phases in one).
    Standalone {
        /// Data directory for persistent state and phase locks.
        #[arg(long, default_value = "/var/lib/sokovan")]
        data_dir: PathBuf,

        /// TOML config file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sokovand=debug,sokovan=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone { data_dir, config } => run_standalone(data_dir, config).await,
    }
}

async fn run_standalone(data_dir: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("sokovan daemon starting in standalone mode");

    let config = DaemonConfig::load(config_path.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("sokovan.redb");
    let store = SessionStore::open(&db_path)?;
    info!(path = ?db_path, "session store opened");

    let locks = FileLockFactory::new(
        data_dir.join("locks"),
        Duration::from_secs(config.timers.lock_lifetime_secs),
    )?;
    let coordinator = Arc::new(Coordinator::new(store.clone(), locks, EventBus::default()));

    // Agent transport: implementations plug in through `AgentClient`;
    // standalone mode drives the in-memory fleet.
    let client = MockAgent::new();

    let timer_config = TimerConfig {
        check_interval: Duration::from_secs(config.timers.check_interval_secs),
        force_interval: Duration::from_secs(config.timers.force_interval_secs),
    };
    let groups: Vec<String> = config.resource_groups.keys().cloned().collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // One scheduling timer per resource group.
    for (group, group_config) in &config.resource_groups {
        let sequencer = Sequencer::from_str(&group_config.sequencer)?;
        let strategy = SelectionStrategy::from_str(&group_config.selector)?;
        info!(group, ?sequencer, ?strategy, "resource group configured");

        let handler = ScheduleHandler::new(
            group.clone(),
            Provisioner::new(store.clone(), sequencer, strategy),
        );
        tasks.push(spawn_timer(
            &coordinator,
            timer_config,
            handler,
            shutdown_rx.clone(),
        ));
    }

    // Launch pipeline.
    tasks.push(spawn_timer(
        &coordinator,
        timer_config,
        PrecondHandler::new(Launcher::new(store.clone(), client.clone())),
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_timer(
        &coordinator,
        timer_config,
        PullProgressHandler::new(Launcher::new(store.clone(), client.clone())),
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_timer(
        &coordinator,
        timer_config,
        StartHandler::new(Launcher::new(store.clone(), client.clone())),
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_timer(
        &coordinator,
        timer_config,
        CreateProgressHandler::new(Launcher::new(store.clone(), client.clone())),
        shutdown_rx.clone(),
    ));

    // Teardown and maintenance.
    tasks.push(spawn_timer(
        &coordinator,
        timer_config,
        TerminateProgressHandler::new(
            Terminator::new(store.clone(), client.clone()),
            groups.clone(),
        ),
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_timer(
        &coordinator,
        timer_config,
        RetryPhaseHandler::new(
            RetryHandler::new(
                store.clone(),
                client.clone(),
                Duration::from_secs(config.retry.staleness_secs),
                config.retry.max_retries,
            ),
            coordinator.events().clone(),
        ),
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_timer(
        &coordinator,
        timer_config,
        SweepHandler::new(Sweeper::new(
            store,
            Duration::from_secs(config.sweep.pending_timeout_secs),
        )),
        shutdown_rx.clone(),
    ));

    info!(timers = tasks.len(), "phase timers running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    info!("sokovan daemon stopped");
    Ok(())
}

fn spawn_timer<L, H>(
    coordinator: &Arc<Coordinator<L>>,
    config: TimerConfig,
    handler: H,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    L: LockFactory,
    H: PhaseHandler,
{
    let coordinator = Arc::clone(coordinator);
    tokio::spawn(async move {
        PhaseTimer::new(config)
            .run(coordinator, handler, shutdown)
            .await;
    })
}
