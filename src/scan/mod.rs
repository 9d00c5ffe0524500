//! Scan sequences for inverted-control experiment definitions.
//!
//! A scan describes an experiment without executing it. It is a lazy, finite
//! sequence of [`Step`]s; each step groups [`Intent`]s (read or write requests
//! against axis paths) that the run engine issues concurrently before moving on
//! to the next step.
//!
//! # Construction Modes
//!
//! - **Declarative** ([`DeclarativeScan`]) - Cartesian product of axis ranges
//!   plus a fixed read set, one step per point
//! - **Imperative** ([`ImperativeScan`]) - any user-authored iterator of steps,
//!   used as-is
//!
//! # Example
//!
//! ```rust
//! use daq_sequencer::scan::{AxisRange, DeclarativeScan, Scan};
//!
//! let mut scan = DeclarativeScan::new()
//!     .with_range(AxisRange::values("mc.x", vec![0.0, 1.0, 2.0]))
//!     .with_read("sensor.value");
//!
//! assert_eq!(scan.num_steps(), Some(3));
//! let first = scan.next_step().unwrap();
//! // Step 0: write mc.x = 0, read sensor.value
//! assert_eq!(first.intents().len(), 2);
//! ```

pub mod declarative;
pub mod definition;
pub mod imperative;
pub mod range;

pub use declarative::{Combine, DeclarativeScan, ProductOrder};
pub use definition::{RangeDefinition, ScanDefinition};
pub use imperative::ImperativeScan;
pub use range::AxisRange;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::axis::value::AxisValue;
use crate::axis::AxisOp;
use crate::error::{AppResult, DaqError};

/// Requested operation of an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Operation {
    /// Read the axis' current value
    Read,
    /// Write a value to the axis
    Write(AxisValue),
}

/// A single read or write request against one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Axis path to resolve against the registry
    pub axis: String,
    /// Requested operation
    pub operation: Operation,
}

impl Intent {
    /// Read request.
    pub fn read(axis: impl Into<String>) -> Self {
        Self {
            axis: axis.into(),
            operation: Operation::Read,
        }
    }

    /// Write request.
    pub fn write(axis: impl Into<String>, value: impl Into<AxisValue>) -> Self {
        Self {
            axis: axis.into(),
            operation: Operation::Write(value.into()),
        }
    }

    /// Operation kind without the payload.
    pub fn op(&self) -> AxisOp {
        match self.operation {
            Operation::Read => AxisOp::Read,
            Operation::Write(_) => AxisOp::Write,
        }
    }

    /// Value requested by a write.
    pub fn requested(&self) -> Option<&AxisValue> {
        match &self.operation {
            Operation::Read => None,
            Operation::Write(value) => Some(value),
        }
    }
}

/// A group of intents issued concurrently and awaited together.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Step {
    label: Option<String>,
    intents: Vec<Intent>,
}

impl Step {
    /// Empty step.
    pub fn new() -> Self {
        Self::default()
    }

    /// Step from a list of intents.
    pub fn from_intents(intents: Vec<Intent>) -> Self {
        Self {
            label: None,
            intents,
        }
    }

    /// Add a write intent.
    pub fn write(mut self, axis: impl Into<String>, value: impl Into<AxisValue>) -> Self {
        self.intents.push(Intent::write(axis, value));
        self
    }

    /// Add a read intent.
    pub fn read(mut self, axis: impl Into<String>) -> Self {
        self.intents.push(Intent::read(axis));
        self
    }

    /// Attach a label carried into the record.
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Optional label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Intents in declaration order.
    pub fn intents(&self) -> &[Intent] {
        &self.intents
    }

    /// Consume the step.
    pub fn into_intents(self) -> Vec<Intent> {
        self.intents
    }

    /// Check that every intent names a distinct, non-empty axis path.
    pub fn validate(&self) -> AppResult<()> {
        let mut seen = HashSet::with_capacity(self.intents.len());
        for intent in &self.intents {
            if intent.axis.trim().is_empty() {
                return Err(DaqError::StepValidation(
                    "intent with empty axis path".to_string(),
                ));
            }
            if !seen.insert(intent.axis.as_str()) {
                return Err(DaqError::StepValidation(format!(
                    "axis '{}' appears more than once",
                    intent.axis
                )));
            }
        }
        Ok(())
    }
}

/// Scan trait: all scans implement this to produce steps.
pub trait Scan: Send {
    /// Scan type identifier (e.g., "declarative", "imperative")
    fn plan_type(&self) -> &str;

    /// Scan arguments, recorded in run metadata
    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Total number of steps, if known in advance
    fn num_steps(&self) -> Option<usize>;

    /// Produce the next step, returning None when complete
    fn next_step(&mut self) -> Option<Step>;
}

impl<S: Scan + ?Sized> Scan for Box<S> {
    fn plan_type(&self) -> &str {
        (**self).plan_type()
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        (**self).plan_args()
    }

    fn num_steps(&self) -> Option<usize> {
        (**self).num_steps()
    }

    fn next_step(&mut self) -> Option<Step> {
        (**self).next_step()
    }
}

/// Iterator over a scan's steps, validating each one as it is produced.
///
/// Stops after the first invalid step.
pub struct ScanSequence<'a> {
    scan: &'a mut dyn Scan,
    failed: bool,
}

impl<'a> ScanSequence<'a> {
    /// Wrap a scan.
    pub fn new(scan: &'a mut dyn Scan) -> Self {
        Self {
            scan,
            failed: false,
        }
    }
}

impl Iterator for ScanSequence<'_> {
    type Item = AppResult<Step>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let step = self.scan.next_step()?;
        match step.validate() {
            Ok(()) => Some(Ok(step)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Setup steps, then an inner scan, then teardown steps.
pub struct Chain {
    setup: VecDeque<Step>,
    inner: Box<dyn Scan>,
    teardown: VecDeque<Step>,
    inner_done: bool,
}

impl Chain {
    /// Wrap `inner` with no setup or teardown.
    pub fn new(inner: Box<dyn Scan>) -> Self {
        Self {
            setup: VecDeque::new(),
            inner,
            teardown: VecDeque::new(),
            inner_done: false,
        }
    }

    /// Run `step` before the inner scan.
    pub fn setup(mut self, step: Step) -> Self {
        self.setup.push_back(step);
        self
    }

    /// Run `step` after the inner scan.
    pub fn teardown(mut self, step: Step) -> Self {
        self.teardown.push_back(step);
        self
    }
}

impl Scan for Chain {
    fn plan_type(&self) -> &str {
        self.inner.plan_type()
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        let mut args = self.inner.plan_args();
        args.insert("setup_steps".to_string(), self.setup.len().to_string());
        args.insert("teardown_steps".to_string(), self.teardown.len().to_string());
        args
    }

    fn num_steps(&self) -> Option<usize> {
        let inner = if self.inner_done {
            0
        } else {
            self.inner.num_steps()?
        };
        self.setup
            .len()
            .checked_add(inner)?
            .checked_add(self.teardown.len())
    }

    fn next_step(&mut self) -> Option<Step> {
        if let Some(step) = self.setup.pop_front() {
            return Some(step);
        }
        if !self.inner_done {
            match self.inner.next_step() {
                Some(step) => return Some(step),
                None => self.inner_done = true,
            }
        }
        self.teardown.pop_front()
    }
}
