//! Tracing setup for the sequencer binary and for embedding applications that
//! do not install their own subscriber.
//!
//! Filtering follows `RUST_LOG` when it is set. Otherwise the configured level
//! applies to everything except axis I/O events (target
//! [`AXIS_IO_TARGET`]), which are shown at `info` when `log_axis_io` is on and
//! silenced when it is off, whatever the global level.
//!
//! # Example
//! ```no_run
//! use daq_sequencer::{config::Settings, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load("config/demo.toml")?;
//! logging::init_from_config(&settings)?;
//! tracing::info!("Sequencer started");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

pub use crate::axis::events::AXIS_IO_TARGET;
use crate::config::Settings;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored, with source locations
    #[default]
    Pretty,
    /// One line per event, no colors
    Compact,
    /// One JSON object per event
    Json,
}

/// What to log and how.
#[derive(Debug, Clone, PartialEq)]
pub struct LogOptions {
    /// Global level
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Show axis I/O events
    pub axis_io: bool,
}

impl LogOptions {
    /// Options from the `[application]` section and `log_axis_io`.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: settings.application.log_format,
            axis_io: settings.log_axis_io,
        })
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        format!(
            "{},{}={}",
            self.level.as_str().to_lowercase(),
            AXIS_IO_TARGET,
            if self.axis_io { "info" } else { "off" }
        )
    }
}

/// Install the global subscriber described by `settings`.
pub fn init_from_config(settings: &Settings) -> Result<(), String> {
    init(&LogOptions::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Does nothing if a subscriber is already installed, so tests and embedding
/// applications can call it freely.
pub fn init(options: &LogOptions) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.directives()));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match options.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        OutputFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
        OutputFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing: {}", e))
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level.trim().parse::<Level>().map_err(|_| {
        format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}
