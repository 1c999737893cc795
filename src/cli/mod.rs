//! Command-line interface for sensord.
//!
//! Provides commands for running the daemon, inspecting sensors, ticks and
//! runs, toggling sensors, and pausing the daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::adapters::{CommandEvaluator, QueuedRunCoordinator};
use crate::config;
use crate::core::{
    is_paused, set_paused, EngineError, SensorDaemon, Services, SystemClock, TickEngine,
};
use crate::domain::{Instigator, InstigatorState, InstigatorStatus, SENSOR_NAME_TAG};
use crate::store::{FileStorage, InstigatorStore, RunStore, RunsFilter, Storage, TickStore};
use crate::workspace::{WorkspaceSource, YamlWorkspace};

/// sensord - Sensor tick daemon
#[derive(Parser, Debug)]
#[command(name = "sensord")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sensor daemon
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        until_seconds: Option<u64>,

        /// Run a single iteration and exit
        #[arg(long)]
        once: bool,
    },

    /// List sensors in the workspace with their status
    State,

    /// Show recent ticks of a sensor
    Ticks {
        /// Sensor name
        sensor: String,

        /// Maximum number of ticks to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List runs created by sensors
    Runs {
        /// Only runs created by this sensor
        #[arg(short, long)]
        sensor: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Start a sensor
    Start {
        /// Sensor name
        sensor: String,
    },

    /// Stop a sensor
    Stop {
        /// Sensor name
        sensor: String,
    },

    /// Pause the daemon for every sensor
    Pause,

    /// Resume the daemon
    Unpause,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                until_seconds,
                once,
            } => run_daemon(until_seconds, once).await,
            Commands::State => show_state().await,
            Commands::Ticks { sensor, limit } => show_ticks(&sensor, limit).await,
            Commands::Runs { sensor, limit } => list_runs(sensor.as_deref(), limit).await,
            Commands::Start { sensor } => set_status(&sensor, InstigatorStatus::Running).await,
            Commands::Stop { sensor } => set_status(&sensor, InstigatorStatus::Stopped).await,
            Commands::Pause => toggle_pause(true).await,
            Commands::Unpause => toggle_pause(false).await,
            Commands::Config => show_config(),
        }
    }
}

fn open_storage() -> Result<Arc<FileStorage>> {
    let storage = FileStorage::open_default().context("Failed to open storage")?;
    Ok(Arc::new(storage))
}

fn open_workspace() -> Result<YamlWorkspace> {
    Ok(YamlWorkspace::new(config::workspace_dir()?))
}

/// Find exactly one workspace sensor by name
async fn find_instigator(name: &str) -> Result<Instigator> {
    let snapshot = open_workspace()?.snapshot().await?;
    let mut matches: Vec<Instigator> = snapshot
        .instigators()
        .filter(|i| i.name == name)
        .cloned()
        .collect();

    match matches.len() {
        0 => anyhow::bail!("Sensor not found in workspace: {}", name),
        1 => Ok(matches.remove(0)),
        n => anyhow::bail!("Sensor name '{}' is ambiguous ({} matches)", name, n),
    }
}

/// Run the daemon loop until Ctrl-C or the deadline
async fn run_daemon(until_seconds: Option<u64>, once: bool) -> Result<()> {
    let cfg = config::config()?;
    let storage: Arc<dyn Storage> = open_storage()?;
    let clock = Arc::new(SystemClock);

    let services =
        Services::new(Arc::clone(&storage), clock).with_retention(cfg.retention.clone());
    let engine = TickEngine::new(
        services,
        Arc::new(CommandEvaluator::new(cfg.daemon.evaluation_timeout())),
        Arc::new(QueuedRunCoordinator::new(Arc::clone(&storage))),
    );
    let workspace = Arc::new(open_workspace()?);
    let mut daemon = SensorDaemon::new(engine, workspace, &cfg.daemon);

    let until = if once {
        Some(chrono::Utc::now())
    } else {
        until_seconds
            .and_then(|s| i64::try_from(s).ok())
            .map(|s| chrono::Utc::now() + Duration::seconds(s))
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    match daemon.run(shutdown_rx, until).await {
        Ok(()) | Err(EngineError::Interrupted) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// List sensors with their effective status
async fn show_state() -> Result<()> {
    let storage = open_storage()?;
    let snapshot = open_workspace()?.snapshot().await?;

    if is_paused(storage.as_ref()).await? {
        println!("Daemon is PAUSED");
        println!();
    }

    println!(
        "{:<24} {:<24} {:<22} {:<20}",
        "SENSOR", "LOCATION/REPOSITORY", "STATUS", "CURSOR"
    );
    println!("{}", "-".repeat(92));

    for location in &snapshot.locations {
        if let Some(err) = &location.load_error {
            println!("{:<24} {:<24} load error: {}", "-", location.name, err);
            continue;
        }
        for instigator in location.repositories.iter().flat_map(|r| &r.instigators) {
            let state = storage
                .get_instigator_state(&instigator.selector_id())
                .await?;
            let status = instigator.current_status(state.as_ref());
            let cursor = state
                .as_ref()
                .and_then(InstigatorState::cursor)
                .unwrap_or("-");
            println!(
                "{:<24} {:<24} {:<22} {:<20}",
                instigator.name,
                format!(
                    "{}/{}",
                    instigator.origin.location_name, instigator.origin.repository_name
                ),
                format!("{:?}", status),
                cursor
            );
        }
    }

    Ok(())
}

/// Show the latest ticks of one sensor
async fn show_ticks(sensor: &str, limit: usize) -> Result<()> {
    let instigator = find_instigator(sensor).await?;
    let storage = open_storage()?;
    let ticks = storage
        .get_ticks(&instigator.selector_id(), Some(limit))
        .await?;

    if ticks.is_empty() {
        println!("No ticks found");
        return Ok(());
    }

    println!("{:<26} {:<10} {:<6} {}", "TIMESTAMP", "STATUS", "RUNS", "DETAIL");
    println!("{}", "-".repeat(75));

    for tick in ticks {
        let detail = match (&tick.error, &tick.skip_reason) {
            (Some(err), _) => err.to_string(),
            (None, Some(reason)) => reason.clone(),
            (None, None) => tick.run_keys.join(", "),
        };
        println!(
            "{:<26} {:<10} {:<6} {}",
            tick.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            format!("{:?}", tick.status),
            tick.run_ids.len(),
            detail
        );
    }

    Ok(())
}

/// List sensor-created runs, newest first
async fn list_runs(sensor: Option<&str>, limit: usize) -> Result<()> {
    let storage = open_storage()?;
    let filter = match sensor {
        Some(name) => RunsFilter::new().with_tag_values(SENSOR_NAME_TAG, [name]),
        None => RunsFilter::new(),
    };
    let runs = storage.get_runs(&filter).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<12} {}", "RUN ID", "JOB", "STATUS", "RUN KEY");
    println!("{}", "-".repeat(85));

    for run in runs.iter().rev().take(limit) {
        println!(
            "{:<38} {:<20} {:<12} {}",
            run.run_id,
            run.job_name,
            run.status,
            run.run_key().unwrap_or("-")
        );
    }

    Ok(())
}

/// Persist a sensor's status, creating its state if needed
async fn set_status(sensor: &str, status: InstigatorStatus) -> Result<()> {
    let instigator = find_instigator(sensor).await?;
    let storage = open_storage()?;

    match storage
        .get_instigator_state(&instigator.selector_id())
        .await?
    {
        Some(state) => {
            storage
                .update_instigator_state(state.with_status(status))
                .await?;
        }
        None => {
            storage
                .add_instigator_state(instigator.initial_state().with_status(status))
                .await?;
        }
    }

    println!("Sensor {} is now {:?}", instigator.name, status);
    Ok(())
}

async fn toggle_pause(paused: bool) -> Result<()> {
    let storage = open_storage()?;
    set_paused(storage.as_ref(), paused).await?;
    println!(
        "Sensor daemon {}",
        if paused { "paused" } else { "unpaused" }
    );
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("sensord configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", config::sensord_home()?.display());
    println!("  Storage:   {}", config::storage_dir()?.display());
    println!("  Workspace: {}", cfg.workspace.display());
    println!();
    println!("Daemon:");
    println!("  Use threads:        {}", cfg.daemon.use_threads);
    println!("  Workers:            {}", cfg.daemon.num_workers);
    println!("  Submit workers:     {}", cfg.daemon.num_submit_workers);
    println!("  Loop interval:      {}s", cfg.daemon.loop_interval_seconds);
    println!("  Evaluation timeout: {}s", cfg.daemon.evaluation_timeout_seconds);

    Ok(())
}
