//! Driver Boundary and Axis Capabilities
//!
//! The sequencer never talks to instruments directly. Every axis is backed by an
//! [`AxisDriver`], a small async trait that an external driver layer implements
//! for each instrument quantity it exposes:
//!
//! - A motion stage axis implements `read` (position), `write` (move) and
//!   `is_settled` (motion done)
//! - A power meter axis implements `read` and rejects `write`
//! - A software setting implements `read` and `write` and never moves
//!
//! Which operations the sequencer will actually issue is decided by the axis'
//! [`Capabilities`], fixed when the axis is registered. Drivers do not need to
//! police capabilities themselves.
//!
//! # Design Philosophy
//!
//! The driver trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Reports failures as [`DriverError`], which the run engine treats as transient
//! - Knows nothing about scans, steps or records
//!
//! # Example
//!
//! ```rust,ignore
//! struct Esp300Axis { port: SerialPort, channel: u8 }
//!
//! #[async_trait]
//! impl AxisDriver for Esp300Axis {
//!     fn driver_type(&self) -> &str { "esp300" }
//!
//!     async fn read(&self) -> Result<AxisValue, DriverError> {
//!         let reply = self.port.query(&format!("{}TP?", self.channel)).await?;
//!         Ok(AxisValue::Float(reply.parse()?))
//!     }
//!
//!     async fn write(&self, value: &AxisValue) -> Result<(), DriverError> {
//!         self.port.send(&format!("{}PA{}", self.channel, value)).await
//!     }
//!
//!     async fn is_settled(&self) -> Result<bool, DriverError> {
//!         Ok(self.port.query(&format!("{}MD?", self.channel)).await? == "1")
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::axis::value::AxisValue;
use crate::error::DriverError;

/// Operations an axis permits, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `read` may be issued
    pub readable: bool,
    /// `write` may be issued
    pub writable: bool,
}

impl Capabilities {
    /// Sensor-style axis.
    pub const READ_ONLY: Capabilities = Capabilities {
        readable: true,
        writable: false,
    };
    /// Output-only axis (e.g. a shutter with no readback).
    pub const WRITE_ONLY: Capabilities = Capabilities {
        readable: false,
        writable: true,
    };
    /// Axis supporting both operations.
    pub const READ_WRITE: Capabilities = Capabilities {
        readable: true,
        writable: true,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::READ_WRITE
    }
}

/// Instrument-facing half of an axis.
///
/// # Contract
/// - `write` returns once the driver has accepted the command; motion may still
///   be in progress, which `is_settled` reports
/// - `read` returns the current value, approximate while moving
/// - Errors are [`DriverError`]s; the run engine retries them
///
/// # Thread Safety
/// - All methods take `&self`; use interior mutability for state
#[async_trait]
pub trait AxisDriver: Send + Sync {
    /// Short adapter name used in errors and logs.
    fn driver_type(&self) -> &str {
        "external"
    }

    /// Read the current value.
    async fn read(&self) -> Result<AxisValue, DriverError>;

    /// Command a new value.
    ///
    /// # Returns
    /// - Ok(()) once the command was accepted
    /// - Err on communication or hardware failure
    async fn write(&self, value: &AxisValue) -> Result<(), DriverError>;

    /// Settling predicate polled after writes.
    ///
    /// # Default Implementation
    /// Always settled.
    async fn is_settled(&self) -> Result<bool, DriverError> {
        Ok(true)
    }
}
