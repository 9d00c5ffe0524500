//! Independent-axis statistics over a record.
//!
//! Axes that were written during a run are its independent variables. For each
//! of them the collation tracks the range of values observed and the distinct
//! values in first-seen order, which together give downstream consumers the
//! grid shape of the scan without re-deriving it from the configuration.

use serde::{Deserialize, Serialize};

use crate::axis::value::AxisValue;
use crate::axis::AxisOp;
use crate::record::RecordEntry;

/// Statistics for one written axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndependentAxis {
    /// Axis path
    pub axis: String,
    /// Smallest numeric value written
    pub min: Option<f64>,
    /// Largest numeric value written
    pub max: Option<f64>,
    /// Distinct values in first-seen order
    pub distinct: Vec<AxisValue>,
    /// Successful writes
    pub count: usize,
}

impl IndependentAxis {
    fn new(axis: &str) -> Self {
        Self {
            axis: axis.to_string(),
            min: None,
            max: None,
            distinct: Vec::new(),
            count: 0,
        }
    }

    fn receive(&mut self, value: &AxisValue) {
        self.count += 1;
        if let Some(v) = value.as_f64() {
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
        if !self.distinct.contains(value) {
            self.distinct.push(value.clone());
        }
    }
}

/// Collated statistics for every independent axis of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Collation {
    /// Independent axes in first-written order
    pub independent: Vec<IndependentAxis>,
    /// Entries with at least one successful write
    pub points: usize,
}

impl Collation {
    /// Collate successful writes of `entries`.
    pub fn from_entries(entries: &[RecordEntry]) -> Self {
        let mut collation = Collation::default();
        for entry in entries {
            let mut wrote = false;
            for outcome in &entry.outcomes {
                if outcome.op != AxisOp::Write {
                    continue;
                }
                let Some(value) = &outcome.resolved else {
                    continue;
                };
                wrote = true;
                collation.receive(&outcome.axis, value);
            }
            if wrote {
                collation.points += 1;
            }
        }
        collation
    }

    fn receive(&mut self, axis: &str, value: &AxisValue) {
        match self.independent.iter_mut().find(|a| a.axis == axis) {
            Some(stats) => stats.receive(value),
            None => {
                let mut stats = IndependentAxis::new(axis);
                stats.receive(value);
                self.independent.push(stats);
            }
        }
    }

    /// Statistics for `axis`.
    pub fn axis(&self, axis: &str) -> Option<&IndependentAxis> {
        self.independent.iter().find(|a| a.axis == axis)
    }

    /// Distinct value counts per independent axis.
    pub fn shape(&self) -> Vec<usize> {
        self.independent.iter().map(|a| a.distinct.len()).collect()
    }

    /// Whether the points fill the full grid spanned by the distinct values.
    ///
    /// Sweeps that revisit values (there-and-back, snake) still form a grid as
    /// long as every point was visited the same number of times.
    pub fn is_grid(&self) -> bool {
        let cells: usize = self.shape().iter().product();
        !self.independent.is_empty() && cells > 0 && self.points % cells == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::entry;

    #[test]
    fn collates_written_axis() {
        let entries: Vec<RecordEntry> = [0.0, 2.0, 1.0, 2.0]
            .iter()
            .enumerate()
            .map(|(i, x)| entry(i as u64, *x, Some(10.0 * x)))
            .collect();
        let collation = Collation::from_entries(&entries);

        assert_eq!(collation.points, 4);
        assert_eq!(collation.shape(), vec![3]);
        let x = collation.axis("mc.x").unwrap();
        assert_eq!(x.min, Some(0.0));
        assert_eq!(x.max, Some(2.0));
        assert_eq!(x.count, 4);
        assert!(collation.axis("sensor.value").is_none());
    }

    #[test]
    fn empty_record_is_not_a_grid() {
        let collation = Collation::from_entries(&[]);
        assert!(!collation.is_grid());
        assert!(collation.shape().is_empty());
    }
}
