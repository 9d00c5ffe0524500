//! Sequencer configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQ_SEQUENCER_`, nested keys
//!    separated by `__` (e.g. `DAQ_SEQUENCER_RUNTIME__MAX_RETRIES=5`)
//!
//! Everything has a default, so an empty file is a valid configuration with no
//! axes and no scan.
//!
//! # Example
//! ```no_run
//! use daq_sequencer::config::Settings;
//!
//! let settings = Settings::load("config/demo.toml")?;
//! settings.validate()?;
//! println!("Application: {}", settings.application.name);
//! # Ok::<(), daq_sequencer::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::axis::registry::{AxisConfig, RegistryBuilder};
use crate::axis::{AxisRegistry, TracingSink};
use crate::backoff::Backoff;
use crate::engine::{RetryPolicy, RunConfig, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::error::{AppResult, DaqError};
use crate::logging::{parse_log_level, OutputFormat};
use crate::scan::ScanDefinition;
use crate::storage::{create_persister, RunPersister, SaveLayout, StorageBackend, DEFAULT_TEMPLATE};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_SEQUENCER_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Execution runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Run metadata defaults
    #[serde(default)]
    pub run: RunDefaults,
    /// Substitute mocks for every external driver adapter
    #[serde(default)]
    pub mock_everything: bool,
    /// Report every axis read/write through tracing
    #[serde(default)]
    pub log_axis_io: bool,
    /// Axis definitions
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
    /// Scan to run
    #[serde(default)]
    pub scan: Option<ScanDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Execution runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Retries of a transient driver failure before the run fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay curve between retries
    #[serde(default)]
    pub retry_backoff: Backoff,
    /// Per-intent timeout (e.g. "5s"); none by default
    #[serde(default, with = "humantime_serde")]
    pub intent_timeout: Option<Duration>,
    /// Buffered record events per subscriber
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend used for finalized runs
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for run data
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    /// Per-run directory template below the root
    #[serde(default = "default_directory_template")]
    pub directory_template: String,
}

/// Metadata recorded with every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDefaults {
    /// Operator
    #[serde(default = "default_user")]
    pub user: String,
    /// Session or sample name
    #[serde(default = "default_session")]
    pub session: String,
    /// Extra key/value pairs
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// Default value functions
fn default_name() -> String {
    "daq-sequencer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_directory_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_user() -> String {
    "anonymous".to_string()
}

fn default_session() -> String {
    "default".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff: Backoff::default(),
            intent_timeout: None,
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_directory: default_data_directory(),
            directory_template: default_directory_template(),
        }
    }
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            user: default_user(),
            session: default_session(),
            metadata: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from a TOML file and environment variables
    ///
    /// A missing file yields the defaults, still overridable from the
    /// environment.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::string(toml)).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level).map_err(DaqError::Configuration)?;

        self.runtime
            .retry_backoff
            .validate()
            .map_err(|e| DaqError::Configuration(format!("runtime.retry_backoff: {}", e)))?;
        if self.runtime.subscriber_capacity == 0 {
            return Err(DaqError::Configuration(
                "runtime.subscriber_capacity must be at least 1".to_string(),
            ));
        }
        if self.runtime.intent_timeout == Some(Duration::ZERO) {
            return Err(DaqError::Configuration(
                "runtime.intent_timeout must be positive".to_string(),
            ));
        }

        if self.storage.directory_template.trim().is_empty() {
            return Err(DaqError::Configuration(
                "storage.directory_template must not be empty".to_string(),
            ));
        }

        // Axis paths are unique
        let mut paths = HashSet::new();
        for axis in &self.axes {
            if axis.path.trim().is_empty() {
                return Err(DaqError::Configuration("axis with empty path".to_string()));
            }
            if !paths.insert(axis.path.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate axis path: {}",
                    axis.path
                )));
            }
            if let Some(settle) = &axis.settle {
                settle
                    .backoff
                    .validate()
                    .map_err(|e| DaqError::Configuration(format!("{}.settle: {}", axis.path, e)))?;
            }
        }

        if let Some(scan) = &self.scan {
            scan.validate()?;
            let referenced = scan
                .ranges
                .iter()
                .map(|r| r.axis.as_str())
                .chain(scan.reads.iter().map(String::as_str))
                .chain(
                    scan.setup
                        .iter()
                        .chain(&scan.teardown)
                        .flat_map(|step| step.intents().iter().map(|i| i.axis.as_str())),
                );
            for axis in referenced {
                if !paths.contains(axis) {
                    return Err(DaqError::Configuration(format!(
                        "scan references undefined axis '{}'",
                        axis
                    )));
                }
            }
        }

        Ok(())
    }

    /// Immutable per-run parameters handed to the engine
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            retry: RetryPolicy {
                max_retries: self.runtime.max_retries,
                backoff: self.runtime.retry_backoff,
            },
            intent_timeout: self.runtime.intent_timeout,
            user: self.run.user.clone(),
            session: self.run.session.clone(),
            metadata: self.run.metadata.clone(),
        }
    }

    /// Build the axis registry, honouring `mock_everything` and `log_axis_io`
    pub fn build_registry(&self, builder: RegistryBuilder) -> AppResult<AxisRegistry> {
        let mut builder = builder.mock_everything(self.mock_everything);
        if self.log_axis_io {
            builder = builder.sink(Arc::new(TracingSink));
        }
        builder.build(&self.axes)
    }

    /// Save directory layout for runs
    pub fn save_layout(&self) -> SaveLayout {
        SaveLayout::new(
            self.storage.data_directory.clone(),
            self.storage.directory_template.clone(),
        )
    }

    /// Instantiate the configured persistence backend
    pub fn persister(&self) -> AppResult<Arc<dyn RunPersister>> {
        create_persister(self.storage.backend, self.save_layout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::registry::DriverSelection;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const DEMO: &str = r#"
mock_everything = true

[application]
name = "bench"
log_level = "debug"
log_format = "json"

[runtime]
max_retries = 5
intent_timeout = "2s"

[runtime.retry_backoff]
initial = "10ms"
factor = 2.0
max = "80ms"

[storage]
backend = "memory"

[run]
user = "ada"
session = "sample_7"

[[axes]]
path = "mc.x"
domain = { limits = { min = -5.0, max = 5.0 } }
driver = { kind = "mock", initial = 0.0 }

[[axes]]
path = "sensor.value"
writable = false
driver = { kind = "derived", source = "mc.x", scale = 10.0 }

[scan]
reads = ["sensor.value"]

[[scan.ranges]]
axis = "mc.x"
start = 0.0
stop = 2.0
points = 3
"#;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.runtime.max_retries, 3);
        assert_eq!(settings.storage.backend, StorageBackend::Json);
        assert!(settings.scan.is_none());
    }

    #[test]
    fn test_parse_demo() {
        let settings = Settings::from_toml_str(DEMO).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.application.log_format, OutputFormat::Json);
        assert_eq!(settings.runtime.intent_timeout, Some(Duration::from_secs(2)));
        assert_eq!(settings.runtime.retry_backoff.max, Duration::from_millis(80));
        assert_eq!(settings.axes.len(), 2);
        assert!(matches!(
            settings.axes[1].driver,
            DriverSelection::Derived { .. }
        ));

        let run = settings.run_config();
        assert_eq!(run.retry.max_retries, 5);
        assert_eq!(run.user, "ada");
    }

    #[test]
    fn test_duplicate_axis_paths() {
        let mut settings = Settings::default();
        settings.axes = vec![AxisConfig::mock("mc.x", 0.0), AxisConfig::mock("mc.x", 1.0)];
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("mc.x")
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_scan_must_reference_defined_axes() {
        let mut settings = Settings::from_toml_str(DEMO).unwrap();
        settings.axes.pop();
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("sensor.value")
        ));
    }

    #[tokio::test]
    async fn test_build_registry_from_settings() {
        let settings = Settings::from_toml_str(DEMO).unwrap();
        let registry = settings.build_registry(RegistryBuilder::new()).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("mc.x").is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(DEMO.as_bytes()).unwrap();

        std::env::set_var("DAQ_SEQUENCER_RUNTIME__MAX_RETRIES", "9");
        std::env::set_var("DAQ_SEQUENCER_RUN__USER", "grace");
        let settings = Settings::load(file.path());
        std::env::remove_var("DAQ_SEQUENCER_RUNTIME__MAX_RETRIES");
        std::env::remove_var("DAQ_SEQUENCER_RUN__USER");

        let settings = settings.unwrap();
        assert_eq!(settings.runtime.max_retries, 9);
        assert_eq!(settings.run.user, "grace");
        assert_eq!(settings.application.name, "bench");
    }

    #[test]
    #[serial]
    fn test_missing_file_yields_defaults() {
        let settings = Settings::load("/nonexistent/daq_sequencer.toml").unwrap();
        assert_eq!(settings, Settings::default());
    }
}
