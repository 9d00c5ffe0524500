//! Axis value ranges and range strategies.
//!
//! An [`AxisRange`] is the finite list of values one axis takes during a
//! declarative scan. Strategies rewrite that list before the product is taken:
//! sweep there and back, truncate, reverse, or shuffle.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::axis::value::AxisValue;

/// Values a single axis takes, in iteration order.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisRange {
    axis: String,
    values: Vec<AxisValue>,
}

impl AxisRange {
    /// `n` evenly spaced points from `start` to `stop`, both inclusive.
    ///
    /// `n == 0` gives an empty range and `n == 1` gives `[start]`.
    pub fn linspace(axis: impl Into<String>, start: f64, stop: f64, n: usize) -> Self {
        Self {
            axis: axis.into(),
            values: (0..n)
                .map(|i| AxisValue::Float(position_at(start, stop, n, i)))
                .collect(),
        }
    }

    /// Explicit list of values.
    pub fn values<V: Into<AxisValue>>(axis: impl Into<String>, values: Vec<V>) -> Self {
        Self {
            axis: axis.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Axis path.
    pub fn axis(&self) -> &str {
        &self.axis
    }

    /// Values in iteration order.
    pub fn points(&self) -> &[AxisValue] {
        &self.values
    }

    /// Cardinality.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the range yields nothing.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sweep forwards, then the same values backwards (`[0,1,2]` → `[0,1,2,2,1,0]`).
    pub fn forwards_and_backwards(mut self) -> Self {
        let back: Vec<AxisValue> = self.values.iter().rev().cloned().collect();
        self.values.extend(back);
        self
    }

    /// Iterate in reverse order.
    pub fn reversed(mut self) -> Self {
        self.values.reverse();
        self
    }

    /// Keep at most the first `n` values.
    pub fn only(mut self, n: usize) -> Self {
        self.values.truncate(n);
        self
    }

    /// Shuffle the values with a seeded generator, so replays are reproducible.
    pub fn randomly(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.values.shuffle(&mut rng);
        self
    }
}

/// Linear interpolation used by [`AxisRange::linspace`].
fn position_at(start: f64, stop: f64, n: usize, index: usize) -> f64 {
    if n <= 1 {
        return start;
    }
    if index == n - 1 {
        return stop;
    }
    start + (stop - start) * index as f64 / (n - 1) as f64
}
