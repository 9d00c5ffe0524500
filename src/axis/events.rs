//! Axis I/O event reporting.
//!
//! Every read or write attempted on an [`Axis`](crate::axis::Axis) is reported to
//! an optional [`AxisEventSink`], failed attempts included. Sinks are fire-and-forget: `record` cannot fail
//! and must not block, so a slow or broken logger never stalls a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::axis::value::AxisValue;

/// Axis operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisOp {
    /// Value read from the axis
    Read,
    /// Value written to the axis
    Write,
}

impl AxisOp {
    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            AxisOp::Read => "read",
            AxisOp::Write => "write",
        }
    }
}

impl std::fmt::Display for AxisOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One axis I/O observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisEvent {
    /// Axis path
    pub axis: String,
    /// Operation performed
    pub op: AxisOp,
    /// Value read or written; the requested value for a failed write, none
    /// for a failed read
    pub value: Option<AxisValue>,
    /// Failure message when the operation did not succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

impl AxisEvent {
    /// Whether the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// `tracing` target of axis I/O events.
pub const AXIS_IO_TARGET: &str = "daq_sequencer::axis_io";

/// Receiver of axis I/O events.
pub trait AxisEventSink: Send + Sync {
    /// Report an event. Must not block or fail.
    fn record(&self, event: &AxisEvent);
}

/// Emits each event as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AxisEventSink for TracingSink {
    fn record(&self, event: &AxisEvent) {
        let value = event
            .value
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        match &event.error {
            None => info!(
                target: AXIS_IO_TARGET,
                axis = %event.axis,
                op = event.op.as_str(),
                value = %value,
                timestamp = %event.timestamp.to_rfc3339(),
                "axis io"
            ),
            Some(error) => warn!(
                target: AXIS_IO_TARGET,
                axis = %event.axis,
                op = event.op.as_str(),
                value = %value,
                error = %error,
                timestamp = %event.timestamp.to_rfc3339(),
                "axis io failed"
            ),
        }
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<AxisEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AxisEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AxisEventSink for ChannelSink {
    fn record(&self, event: &AxisEvent) {
        // Full or closed channels drop the event.
        let _ = self.tx.try_send(event.clone());
    }
}
