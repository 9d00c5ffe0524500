//! Mock Axis Drivers
//!
//! Simulated drivers for running scans without physical hardware. Selected by the
//! registry when an axis is configured with `driver = "mock"` or when
//! `mock_everything` is set.
//!
//! # Available Mocks
//!
//! - `MockAxisDriver` - Stores the last written value, with optional latency,
//!   scripted transient failures and a settling delay
//! - `ComputedDriver` - Read-only value derived from a closure, e.g. a sensor
//!   that reports `10 * x` of some other mock

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::axis::driver::AxisDriver;
use crate::axis::value::AxisValue;
use crate::error::{DriverError, DriverErrorKind};

// =============================================================================
// MockAxisDriver - Simulated settable quantity
// =============================================================================

/// Mock driver that remembers the last written value.
///
/// # Example
///
/// ```rust
/// use daq_sequencer::axis::{AxisDriver, AxisValue, MockAxisDriver};
///
/// # tokio_test::block_on(async {
/// let driver = MockAxisDriver::new(0.0).failing_reads(1);
/// assert!(driver.read().await.is_err());
/// assert_eq!(driver.read().await.unwrap(), AxisValue::Float(0.0));
/// # })
/// ```
pub struct MockAxisDriver {
    value: Mutex<AxisValue>,
    latency: Duration,
    read_failures: AtomicU32,
    write_failures: AtomicU32,
    settle_polls: u32,
    polls_since_write: AtomicU32,
    read_count: AtomicU32,
    write_count: AtomicU32,
    settle_poll_count: AtomicU32,
}

impl MockAxisDriver {
    /// Float-valued mock starting at `initial`.
    pub fn new(initial: f64) -> Self {
        Self::with_value(AxisValue::Float(initial))
    }

    /// Mock starting at an arbitrary value.
    pub fn with_value(initial: AxisValue) -> Self {
        Self {
            value: Mutex::new(initial),
            latency: Duration::ZERO,
            read_failures: AtomicU32::new(0),
            write_failures: AtomicU32::new(0),
            settle_polls: 1,
            polls_since_write: AtomicU32::new(0),
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
            settle_poll_count: AtomicU32::new(0),
        }
    }

    /// Simulated I/O latency for every read and write.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `n` reads with a communication error.
    pub fn failing_reads(self, n: u32) -> Self {
        self.read_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` writes with a communication error.
    pub fn failing_writes(self, n: u32) -> Self {
        self.write_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Report settled only on the `n`th poll after each write.
    pub fn with_settle_polls(mut self, n: u32) -> Self {
        self.settle_polls = n.max(1);
        self
    }

    /// Current stored value.
    pub fn current(&self) -> AxisValue {
        self.value.lock().clone()
    }

    /// Current value as a float, 0.0 for non-numeric values.
    pub fn current_f64(&self) -> f64 {
        self.current().as_f64().unwrap_or(0.0)
    }

    /// Number of read calls, failed ones included.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Number of write calls, failed ones included.
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Number of settling polls.
    pub fn settle_poll_count(&self) -> u32 {
        self.settle_poll_count.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

/// Consume one scripted failure, if any remain.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl AxisDriver for MockAxisDriver {
    fn driver_type(&self) -> &str {
        "mock"
    }

    async fn read(&self) -> Result<AxisValue, DriverError> {
        let attempt = self.read_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.simulate_latency().await;
        if take_failure(&self.read_failures) {
            return Err(DriverError::communication(
                "mock",
                format!("scripted read failure (call {})", attempt),
            ));
        }
        Ok(self.current())
    }

    async fn write(&self, value: &AxisValue) -> Result<(), DriverError> {
        let attempt = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        if take_failure(&self.write_failures) {
            return Err(DriverError::communication(
                "mock",
                format!("scripted write failure (call {})", attempt),
            ));
        }
        // Stored before the latency so concurrent reads in the same step observe it.
        *self.value.lock() = value.clone();
        self.polls_since_write.store(0, Ordering::SeqCst);
        self.simulate_latency().await;
        Ok(())
    }

    async fn is_settled(&self) -> Result<bool, DriverError> {
        self.settle_poll_count.fetch_add(1, Ordering::SeqCst);
        let polls = self.polls_since_write.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(polls >= self.settle_polls)
    }
}

// =============================================================================
// ComputedDriver - Derived read-only quantity
// =============================================================================

type ComputeFn = dyn Fn() -> Result<AxisValue, DriverError> + Send + Sync;

/// Read-only driver whose value is computed on every read.
pub struct ComputedDriver {
    compute: Box<ComputeFn>,
    read_count: AtomicU32,
}

impl ComputedDriver {
    /// Wrap a closure producing the current value.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> Result<AxisValue, DriverError> + Send + Sync + 'static,
    {
        Self {
            compute: Box::new(compute),
            read_count: AtomicU32::new(0),
        }
    }

    /// Number of reads served.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AxisDriver for ComputedDriver {
    fn driver_type(&self) -> &str {
        "computed"
    }

    async fn read(&self) -> Result<AxisValue, DriverError> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        (self.compute)()
    }

    async fn write(&self, _value: &AxisValue) -> Result<(), DriverError> {
        Err(DriverError::new(
            "computed",
            DriverErrorKind::Hardware,
            "computed axes cannot be written",
        ))
    }
}
