//! Scan definitions loaded from configuration.
//!
//! A [`ScanDefinition`] is the serializable form of a declarative scan. Scans
//! built from a definition record it as JSON under the `definition` plan
//! argument (and its name under `name`), so the run metadata of a persisted
//! record is enough to regenerate the exact step sequence with
//! [`ScanDefinition::from_plan_args`].
//!
//! ```toml
//! [scan]
//! name = "xy_map"
//! order = "snake"
//! reads = ["sensor.value"]
//!
//! [[scan.ranges]]
//! axis = "mc.x"
//! start = 0.0
//! stop = 2.0
//! points = 3
//!
//! [[scan.ranges]]
//! axis = "mc.y"
//! values = [0.0, 0.5]
//! forwards_and_backwards = true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::axis::value::AxisValue;
use crate::error::{AppResult, DaqError};
use crate::scan::declarative::{Combine, DeclarativeScan, ProductOrder};
use crate::scan::range::AxisRange;
use crate::scan::{Chain, Scan, Step};

/// Largest number of points a configured scan may produce.
pub const MAX_SCAN_POINTS: usize = 10_000_000;

/// One axis range in a scan definition.
///
/// Either `values`, or all of `start`, `stop` and `points`, must be given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDefinition {
    /// Axis path
    pub axis: String,
    /// Linspace start
    #[serde(default)]
    pub start: Option<f64>,
    /// Linspace stop (inclusive)
    #[serde(default)]
    pub stop: Option<f64>,
    /// Linspace point count
    #[serde(default)]
    pub points: Option<usize>,
    /// Explicit values
    #[serde(default)]
    pub values: Option<Vec<AxisValue>>,
    /// Sweep there and back
    #[serde(default)]
    pub forwards_and_backwards: bool,
    /// Iterate in reverse
    #[serde(default)]
    pub reversed: bool,
    /// Keep only the first n values
    #[serde(default)]
    pub only: Option<usize>,
    /// Shuffle with this seed
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
}

impl RangeDefinition {
    /// Linspace range definition.
    pub fn linspace(axis: impl Into<String>, start: f64, stop: f64, points: usize) -> Self {
        Self {
            axis: axis.into(),
            start: Some(start),
            stop: Some(stop),
            points: Some(points),
            values: None,
            forwards_and_backwards: false,
            reversed: false,
            only: None,
            shuffle_seed: None,
        }
    }

    /// Build the range, applying strategies in a fixed order:
    /// reverse, there-and-back, truncate, shuffle.
    pub fn to_range(&self) -> AppResult<AxisRange> {
        let mut range = match (&self.values, self.start, self.stop, self.points) {
            (Some(values), None, None, None) => AxisRange::values(&self.axis, values.clone()),
            (None, Some(start), Some(stop), Some(points)) => {
                AxisRange::linspace(&self.axis, start, stop, points)
            }
            _ => {
                return Err(DaqError::Configuration(format!(
                    "range for '{}' needs either `values` or `start`, `stop` and `points`",
                    self.axis
                )))
            }
        };
        if self.reversed {
            range = range.reversed();
        }
        if self.forwards_and_backwards {
            range = range.forwards_and_backwards();
        }
        if let Some(n) = self.only {
            range = range.only(n);
        }
        if let Some(seed) = self.shuffle_seed {
            range = range.randomly(seed);
        }
        Ok(range)
    }
}

/// Serializable declarative scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScanDefinition {
    /// Descriptive name recorded with the run
    #[serde(default)]
    pub name: Option<String>,
    /// Ranges, outermost first
    #[serde(default)]
    pub ranges: Vec<RangeDefinition>,
    /// Axes read at every point
    #[serde(default)]
    pub reads: Vec<String>,
    /// Product traversal order
    #[serde(default)]
    pub order: ProductOrder,
    /// Product or zip
    #[serde(default)]
    pub combine: Combine,
    /// Steps run before the first point
    #[serde(default)]
    pub setup: Vec<Step>,
    /// Steps run after the last point
    #[serde(default)]
    pub teardown: Vec<Step>,
}

impl ScanDefinition {
    /// Semantic checks: ranges well-formed, no axis scanned twice, no axis both
    /// scanned and read (that would duplicate it within a step).
    pub fn validate(&self) -> AppResult<()> {
        let mut seen = std::collections::HashSet::new();
        let mut lengths = Vec::with_capacity(self.ranges.len());
        for range in &self.ranges {
            if range.points.is_some_and(|n| n > MAX_SCAN_POINTS) {
                return Err(DaqError::Configuration(format!(
                    "range for '{}' has more than {} points",
                    range.axis, MAX_SCAN_POINTS
                )));
            }
            lengths.push(range.to_range()?.len());
            if !seen.insert(range.axis.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "axis '{}' is scanned more than once",
                    range.axis
                )));
            }
        }
        for read in &self.reads {
            if !seen.insert(read.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "axis '{}' is both scanned and read, or read twice",
                    read
                )));
            }
        }
        let total = match self.combine {
            Combine::Product => lengths
                .iter()
                .try_fold(1usize, |acc, len| acc.checked_mul(*len)),
            Combine::Together => lengths.iter().copied().min(),
        };
        // Any empty range makes the whole scan empty
        let empty = lengths.contains(&0);
        if !empty && total.map_or(true, |n| n > MAX_SCAN_POINTS) {
            return Err(DaqError::Configuration(format!(
                "scan has more than {} points",
                MAX_SCAN_POINTS
            )));
        }
        for step in self.setup.iter().chain(&self.teardown) {
            step.validate()?;
        }
        Ok(())
    }

    /// Build the product part only.
    pub fn build_declarative(&self) -> AppResult<DeclarativeScan> {
        self.validate()?;
        let mut scan = DeclarativeScan::new()
            .with_order(self.order)
            .with_combine(self.combine);
        for range in &self.ranges {
            scan = scan.with_range(range.to_range()?);
        }
        for read in &self.reads {
            scan = scan.with_read(read.clone());
        }
        Ok(scan)
    }

    /// Build the full scan including setup and teardown steps.
    ///
    /// The returned scan records this definition in its plan arguments.
    pub fn build(&self) -> AppResult<Box<dyn Scan>> {
        let scan = self.build_declarative()?;
        let inner: Box<dyn Scan> = if self.setup.is_empty() && self.teardown.is_empty() {
            Box::new(scan)
        } else {
            let mut chain = Chain::new(Box::new(scan));
            for step in &self.setup {
                chain = chain.setup(step.clone());
            }
            for step in &self.teardown {
                chain = chain.teardown(step.clone());
            }
            Box::new(chain)
        };
        Ok(Box::new(DefinedScan {
            name: self.name.clone(),
            definition: serde_json::to_string(self)?,
            inner,
        }))
    }

    /// Recover the definition a recorded run was built from.
    ///
    /// Returns `None` when the run was not built from a definition.
    pub fn from_plan_args(args: &BTreeMap<String, String>) -> AppResult<Option<Self>> {
        args.get(DEFINITION_ARG)
            .map(|json| serde_json::from_str(json).map_err(DaqError::from))
            .transpose()
    }
}

/// Plan argument holding the JSON scan definition.
pub const DEFINITION_ARG: &str = "definition";
/// Plan argument holding the definition's name.
pub const NAME_ARG: &str = "name";

/// Scan built from a [`ScanDefinition`], carrying it into run metadata.
struct DefinedScan {
    name: Option<String>,
    definition: String,
    inner: Box<dyn Scan>,
}

impl Scan for DefinedScan {
    fn plan_type(&self) -> &str {
        self.inner.plan_type()
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        let mut args = self.inner.plan_args();
        if let Some(name) = &self.name {
            args.insert(NAME_ARG.to_string(), name.clone());
        }
        args.insert(DEFINITION_ARG.to_string(), self.definition.clone());
        args
    }

    fn num_steps(&self) -> Option<usize> {
        self.inner.num_steps()
    }

    fn next_step(&mut self) -> Option<Step> {
        self.inner.next_step()
    }
}
