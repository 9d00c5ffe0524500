//! Axis Registry
//!
//! Central path → [`Axis`] map consulted by the run engine when it resolves the
//! intents of a step. The registry is built once, before any run starts, and is
//! shared behind an `Arc` afterwards; it exposes no mutation through shared
//! references, so its topology cannot change while a run is in progress.
//!
//! # Driver Selection
//!
//! Each configured axis names its driver:
//!
//! - `mock` - a [`MockAxisDriver`] holding the last written value
//! - `derived` - a read-only [`ComputedDriver`] reporting `scale * source + offset`
//!   of another mock axis (a simulated sensor)
//! - `external` - a named adapter supplied by the driver layer through a
//!   [`DriverFactory`]
//!
//! Setting `mock_everything` swaps every external adapter for a mock at build
//! time. The choice is made here, from configuration, and never by inspecting
//! drivers at runtime.
//!
//! # Example Usage
//!
//! ```rust
//! use daq_sequencer::axis::registry::{AxisConfig, RegistryBuilder};
//!
//! let axes = vec![
//!     AxisConfig::mock("mc.x", 0.0),
//!     AxisConfig::derived("sensor.value", "mc.x", 10.0),
//! ];
//! let registry = RegistryBuilder::new().build(&axes).unwrap();
//! assert_eq!(registry.len(), 2);
//! assert!(registry.resolve("nope").is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::axis::driver::{AxisDriver, Capabilities};
use crate::axis::events::AxisEventSink;
use crate::axis::mock::{ComputedDriver, MockAxisDriver};
use crate::axis::value::{AxisValue, Domain, ValueType};
use crate::axis::{Axis, SettlePolicy};
use crate::error::{AppResult, DaqError};

// =============================================================================
// Configuration
// =============================================================================

/// Driver backing a configured axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverSelection {
    /// In-memory mock
    Mock {
        /// Starting value
        #[serde(default)]
        initial: Option<AxisValue>,
        /// Transient failures injected on the first reads
        #[serde(default)]
        fail_reads: u32,
        /// Transient failures injected on the first writes
        #[serde(default)]
        fail_writes: u32,
        /// Simulated I/O latency
        #[serde(default, with = "humantime_serde")]
        latency: Option<std::time::Duration>,
    },

    /// Read-only mock computing `scale * source + offset`
    Derived {
        /// Path of the mock axis it follows
        source: String,
        /// Multiplier
        #[serde(default = "default_scale")]
        scale: f64,
        /// Additive offset
        #[serde(default)]
        offset: f64,
    },

    /// Adapter provided by the driver layer
    External {
        /// Adapter name registered with [`RegistryBuilder::adapter`]
        adapter: String,
        /// Adapter-specific parameters (ports, channels, addresses)
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

fn default_scale() -> f64 {
    1.0
}

impl Default for DriverSelection {
    fn default() -> Self {
        DriverSelection::Mock {
            initial: None,
            fail_reads: 0,
            fail_writes: 0,
            latency: None,
        }
    }
}

/// Declarative description of one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Unique axis path (e.g. "mc.stages[0]")
    pub path: String,
    /// Declared value type
    #[serde(default)]
    pub value_type: ValueType,
    /// Reads permitted
    #[serde(default = "default_true")]
    pub readable: bool,
    /// Writes permitted
    #[serde(default = "default_true")]
    pub writable: bool,
    /// Optional choice list or limits
    #[serde(default)]
    pub domain: Option<Domain>,
    /// Poll the settling predicate after writes
    #[serde(default)]
    pub settle: Option<SettlePolicy>,
    /// Driver selection
    #[serde(default)]
    pub driver: DriverSelection,
}

fn default_true() -> bool {
    true
}

impl AxisConfig {
    /// Read/write float mock starting at `initial`.
    pub fn mock(path: impl Into<String>, initial: f64) -> Self {
        Self {
            path: path.into(),
            value_type: ValueType::Float,
            readable: true,
            writable: true,
            domain: None,
            settle: None,
            driver: DriverSelection::Mock {
                initial: Some(AxisValue::Float(initial)),
                fail_reads: 0,
                fail_writes: 0,
                latency: None,
            },
        }
    }

    /// Read-only float sensor following `scale * source`.
    pub fn derived(path: impl Into<String>, source: impl Into<String>, scale: f64) -> Self {
        Self {
            path: path.into(),
            value_type: ValueType::Float,
            readable: true,
            writable: false,
            domain: None,
            settle: None,
            driver: DriverSelection::Derived {
                source: source.into(),
                scale,
                offset: 0.0,
            },
        }
    }

    /// Capability set described by the flags.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            readable: self.readable,
            writable: self.writable,
        }
    }
}

/// Creates drivers for a named external adapter.
pub trait DriverFactory: Send + Sync {
    /// Build the driver for the axis described by `config`.
    fn create(
        &self,
        config: &AxisConfig,
        params: &BTreeMap<String, String>,
    ) -> AppResult<Arc<dyn AxisDriver>>;
}

// =============================================================================
// Axis Info (for introspection)
// =============================================================================

/// Summary of a registered axis (returned by list operations)
#[derive(Debug, Clone, PartialEq)]
pub struct AxisInfo {
    /// Axis path
    pub path: String,
    /// Driver adapter name (e.g. "mock", "computed")
    pub driver_type: String,
    /// Declared type
    pub value_type: ValueType,
    /// Capability set
    pub capabilities: Capabilities,
}

// =============================================================================
// Axis Registry
// =============================================================================

/// Path → axis map used to resolve intents.
#[derive(Debug, Default)]
pub struct AxisRegistry {
    axes: HashMap<String, Arc<Axis>>,
}

impl AxisRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an axis.
    ///
    /// # Errors
    /// `Configuration` if the path is already registered.
    pub fn register(&mut self, axis: Axis) -> AppResult<()> {
        if self.axes.contains_key(axis.path()) {
            return Err(DaqError::Configuration(format!(
                "axis '{}' is already registered",
                axis.path()
            )));
        }
        debug!(axis = %axis.path(), driver = axis.driver_type(), "registered axis");
        self.axes.insert(axis.path().to_string(), Arc::new(axis));
        Ok(())
    }

    /// Look up an axis.
    pub fn get(&self, path: &str) -> Option<Arc<Axis>> {
        self.axes.get(path).cloned()
    }

    /// Look up an axis, failing with `UnknownAxis`.
    pub fn resolve(&self, path: &str) -> AppResult<Arc<Axis>> {
        self.get(path)
            .ok_or_else(|| DaqError::UnknownAxis(path.to_string()))
    }

    /// Whether `path` is registered
    pub fn contains(&self, path: &str) -> bool {
        self.axes.contains_key(path)
    }

    /// Number of registered axes
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// All axes, sorted by path.
    pub fn list_axes(&self) -> Vec<AxisInfo> {
        let mut infos: Vec<AxisInfo> = self
            .axes
            .values()
            .map(|axis| AxisInfo {
                path: axis.path().to_string(),
                driver_type: axis.driver_type().to_string(),
                value_type: axis.value_type(),
                capabilities: axis.capabilities(),
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        infos
    }

    /// Paths of writable axes, sorted.
    pub fn writable_axes(&self) -> Vec<String> {
        self.paths_where(|c| c.writable)
    }

    /// Paths of readable axes, sorted.
    pub fn readable_axes(&self) -> Vec<String> {
        self.paths_where(|c| c.readable)
    }

    fn paths_where(&self, pred: impl Fn(Capabilities) -> bool) -> Vec<String> {
        let mut paths: Vec<String> = self
            .axes
            .values()
            .filter(|axis| pred(axis.capabilities()))
            .map(|axis| axis.path().to_string())
            .collect();
        paths.sort();
        paths
    }
}

// =============================================================================
// Registry Builder
// =============================================================================

/// Builds an [`AxisRegistry`] from axis configurations.
#[derive(Default)]
pub struct RegistryBuilder {
    mock_everything: bool,
    adapters: HashMap<String, Arc<dyn DriverFactory>>,
    sink: Option<Arc<dyn AxisEventSink>>,
}

impl RegistryBuilder {
    /// New builder with no adapters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every external adapter with a mock.
    pub fn mock_everything(mut self, enabled: bool) -> Self {
        self.mock_everything = enabled;
        self
    }

    /// Make an external adapter available by name.
    pub fn adapter(mut self, name: impl Into<String>, factory: Arc<dyn DriverFactory>) -> Self {
        self.adapters.insert(name.into(), factory);
        self
    }

    /// Report axis I/O of every built axis to `sink`.
    pub fn sink(mut self, sink: Arc<dyn AxisEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Instantiate drivers and register every axis.
    ///
    /// Derived axes are wired after all other axes so they may follow any mock.
    pub fn build(&self, configs: &[AxisConfig]) -> AppResult<AxisRegistry> {
        let mut registry = AxisRegistry::new();
        let mut mocks: HashMap<String, Arc<MockAxisDriver>> = HashMap::new();

        let (derived, direct): (Vec<&AxisConfig>, Vec<&AxisConfig>) = configs
            .iter()
            .partition(|c| matches!(c.driver, DriverSelection::Derived { .. }));

        for config in direct {
            let driver: Arc<dyn AxisDriver> = match &config.driver {
                DriverSelection::External { adapter, .. } if self.mock_everything => {
                    debug!(axis = %config.path, adapter = %adapter, "substituting mock");
                    let mock = Arc::new(MockAxisDriver::with_value(default_value(config)));
                    mocks.insert(config.path.clone(), mock.clone());
                    mock
                }
                DriverSelection::External { adapter, params } => {
                    let factory = self.adapters.get(adapter).ok_or_else(|| {
                        DaqError::Configuration(format!(
                            "axis '{}' uses unknown adapter '{}'",
                            config.path, adapter
                        ))
                    })?;
                    factory.create(config, params)?
                }
                DriverSelection::Mock {
                    initial,
                    fail_reads,
                    fail_writes,
                    latency,
                } => {
                    let initial = initial.clone().unwrap_or_else(|| default_value(config));
                    let mut mock = MockAxisDriver::with_value(initial)
                        .failing_reads(*fail_reads)
                        .failing_writes(*fail_writes);
                    if let Some(latency) = latency {
                        mock = mock.with_latency(*latency);
                    }
                    let mock = Arc::new(mock);
                    mocks.insert(config.path.clone(), mock.clone());
                    mock
                }
                DriverSelection::Derived { .. } => continue,
            };
            registry.register(self.axis(config, driver)?)?;
        }

        for config in derived {
            let DriverSelection::Derived {
                source,
                scale,
                offset,
            } = &config.driver
            else {
                continue;
            };
            let followed = mocks.get(source).cloned().ok_or_else(|| {
                DaqError::Configuration(format!(
                    "derived axis '{}' follows '{}', which is not a mock axis",
                    config.path, source
                ))
            })?;
            let (scale, offset) = (*scale, *offset);
            let driver = Arc::new(ComputedDriver::new(move || {
                Ok(AxisValue::Float(scale * followed.current_f64() + offset))
            }));
            registry.register(self.axis(config, driver)?)?;
        }

        info!(
            axes = registry.len(),
            mock_everything = self.mock_everything,
            "axis registry built"
        );
        Ok(registry)
    }

    fn axis(&self, config: &AxisConfig, driver: Arc<dyn AxisDriver>) -> AppResult<Axis> {
        let mut builder = Axis::builder(config.path.clone())
            .value_type(config.value_type)
            .capabilities(config.capabilities())
            .domain(config.domain.clone())
            .driver(driver);
        if let Some(policy) = config.settle {
            builder = builder.settle(policy);
        }
        if let Some(sink) = &self.sink {
            builder = builder.sink(sink.clone());
        }
        builder.build()
    }
}

/// Neutral starting value for a mock of `config`'s type.
fn default_value(config: &AxisConfig) -> AxisValue {
    if let Some(Domain::Choices(choices)) = &config.domain {
        if let Some(first) = choices.first() {
            return first.clone();
        }
    }
    match config.value_type {
        ValueType::Float | ValueType::Choice => AxisValue::Float(0.0),
        ValueType::Int => AxisValue::Int(0),
        ValueType::Str => AxisValue::Str(String::new()),
    }
}

/// Registry with a mock stage `mc.x` and a sensor `sensor.value` reporting `10 * x`.
pub fn create_mock_registry() -> AppResult<AxisRegistry> {
    RegistryBuilder::new().build(&[
        AxisConfig::mock("mc.x", 0.0),
        AxisConfig::derived("sensor.value", "mc.x", 10.0),
    ])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;

    struct FixedFactory;

    impl DriverFactory for FixedFactory {
        fn create(
            &self,
            _config: &AxisConfig,
            params: &BTreeMap<String, String>,
        ) -> AppResult<Arc<dyn AxisDriver>> {
            let value: f64 = params
                .get("value")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            Ok(Arc::new(ComputedDriver::new(move || {
                Ok::<_, DriverError>(AxisValue::Float(value))
            })))
        }
    }

    fn external(path: &str, adapter: &str) -> AxisConfig {
        AxisConfig {
            path: path.to_string(),
            value_type: ValueType::Float,
            readable: true,
            writable: false,
            domain: None,
            settle: None,
            driver: DriverSelection::External {
                adapter: adapter.to_string(),
                params: BTreeMap::from([("value".to_string(), "7.5".to_string())]),
            },
        }
    }

    #[tokio::test]
    async fn test_mock_registry_sensor_follows_stage() {
        let registry = create_mock_registry().unwrap();
        assert_eq!(registry.len(), 2);

        let x = registry.resolve("mc.x").unwrap();
        let sensor = registry.resolve("sensor.value").unwrap();
        x.write(&AxisValue::Float(2.0)).await.unwrap();
        assert_eq!(sensor.read().await.unwrap(), AxisValue::Float(20.0));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = RegistryBuilder::new().build(&[
            AxisConfig::mock("mc.x", 0.0),
            AxisConfig::mock("mc.x", 1.0),
        ]);
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_unknown_axis() {
        let registry = create_mock_registry().unwrap();
        assert!(matches!(
            registry.resolve("mc.y"),
            Err(DaqError::UnknownAxis(path)) if path == "mc.y"
        ));
    }

    #[test]
    fn test_capability_listing() {
        let registry = create_mock_registry().unwrap();
        assert_eq!(registry.writable_axes(), vec!["mc.x".to_string()]);
        assert_eq!(
            registry.readable_axes(),
            vec!["mc.x".to_string(), "sensor.value".to_string()]
        );
        let infos = registry.list_axes();
        assert_eq!(infos[1].driver_type, "computed");
    }

    #[tokio::test]
    async fn test_external_adapter_used() {
        let registry = RegistryBuilder::new()
            .adapter("fixed", Arc::new(FixedFactory))
            .build(&[external("meter.power", "fixed")])
            .unwrap();
        let meter = registry.resolve("meter.power").unwrap();
        assert_eq!(meter.read().await.unwrap(), AxisValue::Float(7.5));
    }

    #[test]
    fn test_unknown_adapter_fails() {
        let result = RegistryBuilder::new().build(&[external("meter.power", "fixed")]);
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_mock_everything_substitutes_external() {
        let registry = RegistryBuilder::new()
            .mock_everything(true)
            .build(&[external("meter.power", "missing")])
            .unwrap();
        let meter = registry.resolve("meter.power").unwrap();
        assert_eq!(meter.driver_type(), "mock");
        assert_eq!(meter.read().await.unwrap(), AxisValue::Float(0.0));
    }

    #[test]
    fn test_derived_requires_mock_source() {
        let result =
            RegistryBuilder::new().build(&[AxisConfig::derived("sensor.value", "mc.x", 10.0)]);
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_axis_config_from_toml() {
        let config: AxisConfig = toml::from_str(
            r#"
            path = "laser.mode"
            value_type = "choice"
            writable = true
            domain = { choices = ["cw", "pulsed"] }

            [driver]
            kind = "mock"
            "#,
        )
        .unwrap();
        assert_eq!(config.value_type, ValueType::Choice);
        let registry = RegistryBuilder::new().build(&[config]).unwrap();
        assert!(registry.contains("laser.mode"));
    }
}
