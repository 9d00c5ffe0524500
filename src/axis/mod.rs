//! Axis abstraction.
//!
//! An [`Axis`] is a uniform async read/write handle over one physical or logical
//! instrument quantity: a stage position, a sensor reading, a mode selector. It
//! wraps an [`AxisDriver`] and adds the parts the sequencer relies on:
//!
//! - a fixed [`Capabilities`] set checked before any driver call
//! - a declared [`ValueType`] and optional [`Domain`] checked on every write
//! - an optional settling predicate, polled with a [`SettlePolicy`] after writes
//! - reporting of every completed operation to an [`AxisEventSink`]
//!
//! Axes are built once through [`AxisBuilder`] and never structurally mutated
//! afterwards; only the driver's hidden state changes.

pub mod driver;
pub mod events;
pub mod mock;
pub mod registry;
pub mod value;

pub use driver::{AxisDriver, Capabilities};
pub use events::{AxisEvent, AxisEventSink, AxisOp, ChannelSink, TracingSink};
pub use mock::{ComputedDriver, MockAxisDriver};
pub use registry::AxisRegistry;
pub use value::{AxisValue, Domain, ValueType};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::{AppResult, DaqError, DriverError, DriverErrorKind};

/// How long and how often to poll an axis' settling predicate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettlePolicy {
    /// Poll spacing
    #[serde(default)]
    pub backoff: Backoff,
    /// Give up after this long; expiry is a transient driver error
    #[serde(with = "humantime_serde", default = "default_settle_timeout")]
    pub timeout: Duration,
}

fn default_settle_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            timeout: default_settle_timeout(),
        }
    }
}

/// A registered instrument quantity.
pub struct Axis {
    path: String,
    value_type: ValueType,
    capabilities: Capabilities,
    domain: Option<Domain>,
    settle: Option<SettlePolicy>,
    driver: Arc<dyn AxisDriver>,
    sink: Option<Arc<dyn AxisEventSink>>,
    moving: AtomicBool,
}

impl std::fmt::Debug for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Axis")
            .field("path", &self.path)
            .field("value_type", &self.value_type)
            .field("capabilities", &self.capabilities)
            .field("domain", &self.domain)
            .field("driver", &self.driver.driver_type())
            .finish()
    }
}

impl Axis {
    /// Start building an axis at `path`.
    pub fn builder(path: impl Into<String>) -> AxisBuilder {
        AxisBuilder::new(path)
    }

    /// Stable path, unique within a registry.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Declared value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Capability set fixed at registration.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Declared value domain, if any.
    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    /// Name of the backing driver adapter.
    pub fn driver_type(&self) -> &str {
        self.driver.driver_type()
    }

    /// Check `value` against the declared type and domain without touching the driver.
    pub fn validate_value(&self, value: &AxisValue) -> AppResult<AxisValue> {
        let coerced = self
            .value_type
            .coerce(value)
            .map_err(|reason| self.validation(reason))?;
        if let Some(domain) = &self.domain {
            domain.check(&coerced).map_err(|reason| self.validation(reason))?;
        }
        Ok(coerced)
    }

    /// Read the current value.
    ///
    /// Waits for any motion left over from a previous write to settle first.
    pub async fn read(&self) -> AppResult<AxisValue> {
        if !self.capabilities.readable {
            return Err(DaqError::Capability {
                axis: self.path.clone(),
                operation: "read",
            });
        }
        let result = self.read_settled().await;
        match &result {
            Ok(value) => self.report(AxisOp::Read, Some(value), None),
            Err(e) => self.report(AxisOp::Read, None, Some(e)),
        }
        result
    }

    async fn read_settled(&self) -> AppResult<AxisValue> {
        if self.moving.load(Ordering::SeqCst) {
            self.wait_settled().await?;
        }

        let raw = self.driver.read().await?;
        self.value_type
            .coerce(&raw)
            .map_err(|reason| self.validation(format!("driver returned {}", reason)))
    }

    /// Write `value` and suspend until the driver confirms and the axis settles.
    ///
    /// Returns the value as written, after type coercion.
    pub async fn write(&self, value: &AxisValue) -> AppResult<AxisValue> {
        if !self.capabilities.writable {
            return Err(DaqError::Capability {
                axis: self.path.clone(),
                operation: "write",
            });
        }
        let result = self.write_settled(value).await;
        match &result {
            Ok(written) => self.report(AxisOp::Write, Some(written), None),
            Err(e) => self.report(AxisOp::Write, Some(value), Some(e)),
        }
        result
    }

    async fn write_settled(&self, value: &AxisValue) -> AppResult<AxisValue> {
        let value = self.validate_value(value)?;
        if self.moving.load(Ordering::SeqCst) {
            self.wait_settled().await?;
        }

        self.driver.write(&value).await?;
        if self.settle.is_some() {
            self.moving.store(true, Ordering::SeqCst);
            self.wait_settled().await?;
        }
        Ok(value)
    }

    /// Poll the settling predicate until it reports settled or the policy times out.
    ///
    /// Axes without a settle policy are always settled.
    pub async fn wait_settled(&self) -> AppResult<()> {
        let Some(policy) = self.settle else {
            self.moving.store(false, Ordering::SeqCst);
            return Ok(());
        };

        let deadline = tokio::time::Instant::now() + policy.timeout;
        for delay in policy.backoff.delays() {
            tokio::time::sleep(delay).await;
            if self.driver.is_settled().await? {
                self.moving.store(false, Ordering::SeqCst);
                debug!(axis = %self.path, "settled");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        warn!(axis = %self.path, timeout = ?policy.timeout, "axis did not settle");
        Err(DriverError::new(
            self.driver.driver_type(),
            DriverErrorKind::Settle,
            format!("'{}' did not settle within {:?}", self.path, policy.timeout),
        )
        .into())
    }

    fn validation(&self, reason: String) -> DaqError {
        DaqError::Validation {
            axis: self.path.clone(),
            reason,
        }
    }

    fn report(&self, op: AxisOp, value: Option<&AxisValue>, error: Option<&DaqError>) {
        if let Some(sink) = &self.sink {
            sink.record(&AxisEvent {
                axis: self.path.clone(),
                op,
                value: value.cloned(),
                error: error.map(ToString::to_string),
                timestamp: Utc::now(),
            });
        }
    }
}

/// Explicit builder for [`Axis`].
///
/// # Example
///
/// ```rust
/// use daq_sequencer::axis::{Axis, Capabilities, MockAxisDriver, ValueType};
/// use std::sync::Arc;
///
/// let axis = Axis::builder("mc.x")
///     .value_type(ValueType::Float)
///     .capabilities(Capabilities::READ_WRITE)
///     .driver(Arc::new(MockAxisDriver::new(0.0)))
///     .build()
///     .unwrap();
/// assert_eq!(axis.path(), "mc.x");
/// ```
pub struct AxisBuilder {
    path: String,
    value_type: ValueType,
    capabilities: Capabilities,
    domain: Option<Domain>,
    settle: Option<SettlePolicy>,
    driver: Option<Arc<dyn AxisDriver>>,
    sink: Option<Arc<dyn AxisEventSink>>,
}

impl AxisBuilder {
    /// New builder for a read/write float axis at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value_type: ValueType::Float,
            capabilities: Capabilities::READ_WRITE,
            domain: None,
            settle: None,
            driver: None,
            sink: None,
        }
    }

    /// Declared value type.
    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Capability set.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Shorthand for a sensor.
    pub fn read_only(self) -> Self {
        self.capabilities(Capabilities::READ_ONLY)
    }

    /// Restrict values to a list of choices.
    pub fn choices(mut self, choices: Vec<AxisValue>) -> Self {
        self.domain = Some(Domain::Choices(choices));
        self
    }

    /// Restrict values to inclusive numeric limits.
    pub fn limits(mut self, min: f64, max: f64) -> Self {
        self.domain = Some(Domain::Limits { min, max });
        self
    }

    /// Set the domain directly.
    pub fn domain(mut self, domain: Option<Domain>) -> Self {
        self.domain = domain;
        self
    }

    /// Poll the driver's settling predicate after each write.
    pub fn settle(mut self, policy: SettlePolicy) -> Self {
        self.settle = Some(policy);
        self
    }

    /// Backing driver.
    pub fn driver(mut self, driver: Arc<dyn AxisDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Destination for I/O events.
    pub fn sink(mut self, sink: Arc<dyn AxisEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Finish the axis.
    ///
    /// # Errors
    /// `Configuration` if the path is empty, no driver was given, the capability
    /// set is empty, or a `Choice` axis has no choice list.
    pub fn build(self) -> AppResult<Axis> {
        if self.path.trim().is_empty() {
            return Err(DaqError::Configuration("axis path cannot be empty".into()));
        }
        let driver = self.driver.ok_or_else(|| {
            DaqError::Configuration(format!("axis '{}' has no driver", self.path))
        })?;
        if !self.capabilities.readable && !self.capabilities.writable {
            return Err(DaqError::Configuration(format!(
                "axis '{}' must be readable or writable",
                self.path
            )));
        }
        if self.value_type == ValueType::Choice
            && !matches!(self.domain, Some(Domain::Choices(_)))
        {
            return Err(DaqError::Configuration(format!(
                "choice axis '{}' needs a choice list",
                self.path
            )));
        }

        Ok(Axis {
            path: self.path,
            value_type: self.value_type,
            capabilities: self.capabilities,
            domain: self.domain,
            settle: self.settle,
            driver,
            sink: self.sink,
            moving: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(driver: Arc<MockAxisDriver>) -> Axis {
        Axis::builder("mc.x")
            .limits(-10.0, 10.0)
            .driver(driver)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let axis = stage(Arc::new(MockAxisDriver::new(0.0)));
        let written = axis.write(&AxisValue::Int(2)).await.unwrap();
        assert_eq!(written, AxisValue::Float(2.0));
        assert_eq!(axis.read().await.unwrap(), AxisValue::Float(2.0));
    }

    #[tokio::test]
    async fn write_outside_limits_is_validation_error() {
        let driver = Arc::new(MockAxisDriver::new(0.0));
        let axis = stage(driver.clone());
        let err = axis.write(&AxisValue::Float(11.0)).await.unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));
        assert_eq!(driver.write_count(), 0);
    }

    #[tokio::test]
    async fn nan_write_to_limited_axis_never_reaches_driver() {
        let driver = Arc::new(MockAxisDriver::new(0.0));
        let axis = stage(driver.clone());
        let err = axis.write(&AxisValue::Float(f64::NAN)).await.unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));
        assert_eq!(driver.write_count(), 0);
    }

    #[tokio::test]
    async fn read_only_axis_rejects_write() {
        let axis = Axis::builder("sensor.value")
            .read_only()
            .driver(Arc::new(MockAxisDriver::new(1.0)))
            .build()
            .unwrap();
        let err = axis.write(&AxisValue::Float(1.0)).await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::Capability {
                operation: "write",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn write_only_axis_rejects_read() {
        let axis = Axis::builder("shutter")
            .capabilities(Capabilities::WRITE_ONLY)
            .driver(Arc::new(MockAxisDriver::new(0.0)))
            .build()
            .unwrap();
        assert!(matches!(
            axis.read().await,
            Err(DaqError::Capability {
                operation: "read",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn choice_axis_checks_domain() {
        let axis = Axis::builder("laser.mode")
            .value_type(ValueType::Choice)
            .choices(vec!["cw".into(), "pulsed".into()])
            .driver(Arc::new(MockAxisDriver::with_value("cw".into())))
            .build()
            .unwrap();
        assert!(axis.write(&"pulsed".into()).await.is_ok());
        assert!(matches!(
            axis.write(&"off".into()).await,
            Err(DaqError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn driver_type_mismatch_on_read_is_validation_error() {
        let axis = Axis::builder("counter")
            .value_type(ValueType::Int)
            .read_only()
            .driver(Arc::new(MockAxisDriver::new(0.5)))
            .build()
            .unwrap();
        assert!(matches!(
            axis.read().await,
            Err(DaqError::Validation { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn write_waits_for_settle() {
        let driver = Arc::new(MockAxisDriver::new(0.0).with_settle_polls(3));
        let axis = Axis::builder("mc.x")
            .settle(SettlePolicy::default())
            .driver(driver.clone())
            .build()
            .unwrap();

        axis.write(&AxisValue::Float(1.0)).await.unwrap();
        assert_eq!(driver.settle_poll_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_timeout_is_transient() {
        let driver = Arc::new(MockAxisDriver::new(0.0).with_settle_polls(u32::MAX));
        let axis = Axis::builder("mc.x")
            .settle(SettlePolicy {
                backoff: Backoff::default(),
                timeout: Duration::from_millis(500),
            })
            .driver(driver)
            .build()
            .unwrap();

        let err = axis.write(&AxisValue::Float(1.0)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn builder_rejects_choice_without_list() {
        let err = Axis::builder("laser.mode")
            .value_type(ValueType::Choice)
            .driver(Arc::new(MockAxisDriver::new(0.0)))
            .build()
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test]
    async fn events_reach_sink() {
        let (sink, mut rx) = ChannelSink::new(8);
        let axis = Axis::builder("mc.x")
            .driver(Arc::new(MockAxisDriver::new(0.0)))
            .sink(Arc::new(sink))
            .build()
            .unwrap();

        axis.write(&AxisValue::Float(4.0)).await.unwrap();
        axis.read().await.unwrap();

        let write = rx.recv().await.unwrap();
        let read = rx.recv().await.unwrap();
        assert_eq!(write.op, AxisOp::Write);
        assert_eq!(read.op, AxisOp::Read);
        assert_eq!(read.value, Some(AxisValue::Float(4.0)));
        assert!(write.is_ok() && read.is_ok());
    }

    #[tokio::test]
    async fn failed_attempts_reach_sink_with_error() {
        let (sink, mut rx) = ChannelSink::new(8);
        let axis = Axis::builder("mc.x")
            .limits(-1.0, 1.0)
            .driver(Arc::new(MockAxisDriver::new(0.0).failing_reads(1)))
            .sink(Arc::new(sink))
            .build()
            .unwrap();

        assert!(axis.read().await.is_err());
        assert!(axis.write(&AxisValue::Float(5.0)).await.is_err());

        let read = rx.recv().await.unwrap();
        assert_eq!(read.op, AxisOp::Read);
        assert_eq!(read.value, None);
        assert!(read.error.is_some());

        let write = rx.recv().await.unwrap();
        assert_eq!(write.op, AxisOp::Write);
        assert_eq!(write.value, Some(AxisValue::Float(5.0)));
        assert!(write.error.unwrap().contains("outside limits"));
    }
}
