//! CLI Entry Point for daq-sequencer
//!
//! Provides command-line interface for:
//! - Running the scan described in a configuration file against its axes
//! - Checking a configuration without touching any axis
//!
//! # Usage
//!
//! Run a scan:
//! ```bash
//! daq-sequencer run --config config/demo.toml
//! ```
//!
//! Check a configuration:
//! ```bash
//! daq-sequencer check --config config/demo.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_sequencer::axis::registry::RegistryBuilder;
use daq_sequencer::config::Settings;
use daq_sequencer::engine::RunEngine;
use daq_sequencer::logging;
use daq_sequencer::record::RecordEvent;
use daq_sequencer::scan::Scan;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-sequencer")]
#[command(about = "Inverted-control scan sequencer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured scan and persist the record
    Run {
        /// Configuration file
        #[arg(long, default_value = "config/demo.toml")]
        config: PathBuf,

        /// Substitute mocks for every external adapter
        #[arg(long)]
        mock: bool,
    },

    /// Load and validate a configuration, then print the scan size
    Check {
        /// Configuration file
        #[arg(long, default_value = "config/demo.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, mock } => run_scan(config, mock).await,
        Commands::Check { config } => check_config(config),
    }
}

fn load_settings(path: &PathBuf) -> Result<Settings> {
    let settings = Settings::load(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

fn check_config(path: PathBuf) -> Result<()> {
    let settings = load_settings(&path)?;
    println!("✅ Configuration valid: {}", path.display());
    println!("   Axes: {}", settings.axes.len());

    match &settings.scan {
        Some(definition) => {
            let scan = definition.build()?;
            match scan.num_steps() {
                Some(n) => println!("   Scan '{}': {} steps", scan.plan_type(), n),
                None => println!("   Scan '{}': unknown length", scan.plan_type()),
            }
        }
        None => println!("   No scan configured"),
    }
    Ok(())
}

async fn run_scan(path: PathBuf, mock: bool) -> Result<()> {
    let mut settings = load_settings(&path)?;
    settings.mock_everything |= mock;
    logging::init_from_config(&settings).map_err(anyhow::Error::msg)?;

    let Some(definition) = settings.scan.clone() else {
        bail!("{} has no [scan] section", path.display());
    };
    let scan = definition.build()?;

    let registry = Arc::new(settings.build_registry(RegistryBuilder::new())?);
    let persister = settings.persister()?;
    let engine = RunEngine::with_capacity(
        registry,
        persister,
        settings.runtime.subscriber_capacity,
    );

    // Live feed of appended entries
    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    println!("   ... {} events skipped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                RecordEvent::EntryAppended { entry, .. } => {
                    let values: Vec<String> = entry
                        .outcomes
                        .iter()
                        .map(|o| match &o.resolved {
                            Some(v) => format!("{}={}", o.axis, v),
                            None => format!("{}=<failed>", o.axis),
                        })
                        .collect();
                    println!("   [{:>4}] {}", entry.seq, values.join("  "));
                }
                RecordEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.trigger("interrupted (Ctrl+C)");
        }
    });

    info!(config = %path.display(), "Starting scan");
    let outcome = engine.run(scan, settings.run_config()).await?;
    let _ = printer.await;

    println!();
    println!(
        "Run {} finished: {} ({} entries)",
        outcome.run.metadata.run_index,
        outcome.run.status,
        outcome.run.entries.len()
    );
    if let Some(cause) = &outcome.run.cause {
        println!("   Cause: {} {}", cause.kind, cause.message);
    }
    if let Some(location) = &outcome.location {
        println!("   Saved to {}", location.display());
    }
    if let Some(err) = outcome.persist_error {
        warn!(error = %err, "Run was not persisted");
        return Err(err.into());
    }
    Ok(())
}
