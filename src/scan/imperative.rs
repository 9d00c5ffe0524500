//! Imperative scans: user-authored step sequences.
//!
//! Any iterator of [`Step`]s can drive a run. The iterator is consumed lazily,
//! one step per engine iteration, so it can be a generator-style closure whose
//! later steps are computed on demand.

use std::collections::BTreeMap;

use crate::scan::{Scan, Step};

type StepIter = Box<dyn Iterator<Item = Step> + Send>;

/// Wraps a user iterator of steps, used as-is.
///
/// # Example
///
/// ```rust
/// use daq_sequencer::scan::{ImperativeScan, Scan, Step};
///
/// let mut scan = ImperativeScan::new(
///     "warmup",
///     (0..3).map(|i| Step::new().write("laser.power", i as f64).read("meter.power")),
/// );
/// assert_eq!(scan.plan_type(), "imperative");
/// assert!(scan.next_step().is_some());
/// ```
pub struct ImperativeScan {
    name: String,
    steps: StepIter,
    hint: Option<usize>,
}

impl ImperativeScan {
    /// Wrap an iterator of steps under a descriptive name.
    pub fn new<I>(name: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = Step>,
        I::IntoIter: Send + 'static,
    {
        let steps = steps.into_iter();
        let (lower, upper) = steps.size_hint();
        let hint = upper.filter(|&upper| upper == lower);
        Self {
            name: name.into(),
            steps: Box::new(steps),
            hint,
        }
    }

    /// Scan over a fixed list of steps.
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self::new("steps", steps)
    }

    /// Override the step-count hint reported to progress consumers.
    pub fn with_num_steps(mut self, n: usize) -> Self {
        self.hint = Some(n);
        self
    }
}

impl Scan for ImperativeScan {
    fn plan_type(&self) -> &str {
        "imperative"
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("name".to_string(), self.name.clone())])
    }

    fn num_steps(&self) -> Option<usize> {
        self.hint
    }

    fn next_step(&mut self) -> Option<Step> {
        self.steps.next()
    }
}
