//! Declarative scans: Cartesian products of axis ranges.
//!
//! Each point of the product becomes one step: a write intent for every scanned
//! axis (in configured order) followed by a read intent for every axis of the
//! read set. Points are generated lazily from a linear index, so arbitrarily
//! large grids cost nothing until executed.
//!
//! Ordering is deterministic. In raster order the last range varies fastest,
//! exactly like nested loops. In snake order every range after the first
//! reverses direction on alternate passes, so consecutive points differ by a
//! single move:
//!
//! ```text
//! raster:  (10,0) (10,1) (10,2) (11,0) (11,1) (11,2)
//! snake:   (10,0) (10,1) (10,2) (11,2) (11,1) (11,0)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::axis::value::AxisValue;
use crate::scan::range::AxisRange;
use crate::scan::{Chain, Scan, Step};

/// Traversal order of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductOrder {
    /// Nested loops, last range fastest
    #[default]
    Raster,
    /// Staircase: inner ranges alternate direction on each pass
    Snake,
}

/// How ranges combine into points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    /// Cartesian product
    #[default]
    Product,
    /// Step all ranges together, pairing their i-th values (shortest wins)
    Together,
}

/// Scan over the product of one or more axis ranges.
#[derive(Debug, Clone, Default)]
pub struct DeclarativeScan {
    ranges: Vec<AxisRange>,
    reads: Vec<String>,
    order: ProductOrder,
    combine: Combine,
    current: usize,
}

impl DeclarativeScan {
    /// Scan with no ranges; add them with [`with_range`](Self::with_range).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range. Ranges added later vary faster.
    pub fn with_range(mut self, range: AxisRange) -> Self {
        self.ranges.push(range);
        self
    }

    /// Read `axis` at every point.
    pub fn with_read(mut self, axis: impl Into<String>) -> Self {
        self.reads.push(axis.into());
        self
    }

    /// Product traversal order.
    pub fn with_order(mut self, order: ProductOrder) -> Self {
        self.order = order;
        self
    }

    /// Zip the ranges instead of taking their product.
    pub fn step_together(mut self) -> Self {
        self.combine = Combine::Together;
        self
    }

    /// Set how ranges combine.
    pub fn with_combine(mut self, combine: Combine) -> Self {
        self.combine = combine;
        self
    }

    /// Run `step` before the first point.
    pub fn with_setup(self, step: Step) -> Chain {
        Chain::new(Box::new(self)).setup(step)
    }

    /// Run `step` after the last point.
    pub fn with_teardown(self, step: Step) -> Chain {
        Chain::new(Box::new(self)).teardown(step)
    }

    /// Configured ranges.
    pub fn ranges(&self) -> &[AxisRange] {
        &self.ranges
    }

    /// Number of points, or `None` when the product does not fit in a `usize`.
    /// Zero when there are no ranges or any range is empty.
    pub fn checked_points(&self) -> Option<usize> {
        if self.ranges.is_empty() || self.ranges.iter().any(AxisRange::is_empty) {
            return Some(0);
        }
        match self.combine {
            Combine::Product => self
                .ranges
                .iter()
                .try_fold(1usize, |acc, range| acc.checked_mul(range.len())),
            Combine::Together => self.ranges.iter().map(AxisRange::len).min(),
        }
    }

    /// Number of points, saturating at `usize::MAX`.
    pub fn total_points(&self) -> usize {
        self.checked_points().unwrap_or(usize::MAX)
    }

    /// Axis values at linear point `index`.
    fn point_at(&self, index: usize) -> Vec<AxisValue> {
        match self.combine {
            Combine::Together => self
                .ranges
                .iter()
                .map(|r| r.points()[index].clone())
                .collect(),
            Combine::Product => {
                let sizes: Vec<usize> = self.ranges.iter().map(AxisRange::len).collect();
                let mut point = Vec::with_capacity(sizes.len());
                for (k, range) in self.ranges.iter().enumerate() {
                    // Saturated strides exceed every reachable index
                    let inner = sizes[k + 1..]
                        .iter()
                        .fold(1usize, |acc, size| acc.saturating_mul(*size));
                    let mut digit = (index / inner) % sizes[k];
                    if self.order == ProductOrder::Snake && k > 0 {
                        let pass = index / inner.saturating_mul(sizes[k]);
                        if pass % 2 == 1 {
                            digit = sizes[k] - 1 - digit;
                        }
                    }
                    point.push(range.points()[digit].clone());
                }
                point
            }
        }
    }

    fn step_at(&self, index: usize) -> Step {
        let mut step = Step::new().labeled(format!("point_{}", index));
        for (range, value) in self.ranges.iter().zip(self.point_at(index)) {
            step = step.write(range.axis(), value);
        }
        for axis in &self.reads {
            step = step.read(axis.clone());
        }
        step
    }
}

impl Scan for DeclarativeScan {
    fn plan_type(&self) -> &str {
        "declarative"
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        let axes: Vec<&str> = self.ranges.iter().map(AxisRange::axis).collect();
        args.insert("axes".to_string(), axes.join(","));
        for range in &self.ranges {
            args.insert(format!("{}.points", range.axis()), range.len().to_string());
        }
        args.insert("reads".to_string(), self.reads.join(","));
        args.insert(
            "order".to_string(),
            match self.order {
                ProductOrder::Raster => "raster",
                ProductOrder::Snake => "snake",
            }
            .to_string(),
        );
        args.insert(
            "combine".to_string(),
            match self.combine {
                Combine::Product => "product",
                Combine::Together => "together",
            }
            .to_string(),
        );
        args
    }

    fn num_steps(&self) -> Option<usize> {
        self.checked_points()
    }

    fn next_step(&mut self) -> Option<Step> {
        if self.current >= self.total_points() {
            return None;
        }
        let step = self.step_at(self.current);
        self.current += 1;
        Some(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::Operation;

    fn written(step: &Step) -> Vec<f64> {
        step.intents()
            .iter()
            .filter_map(|i| match &i.operation {
                Operation::Write(v) => v.as_f64(),
                Operation::Read => None,
            })
            .collect()
    }

    fn drain(mut scan: impl Scan) -> Vec<Step> {
        std::iter::from_fn(move || scan.next_step()).collect()
    }

    #[test]
    fn product_cardinality() {
        let scan = DeclarativeScan::new()
            .with_range(AxisRange::linspace("a", 0.0, 1.0, 3))
            .with_range(AxisRange::linspace("b", 0.0, 1.0, 4))
            .with_range(AxisRange::linspace("c", 0.0, 1.0, 2));
        assert_eq!(scan.num_steps(), Some(24));
        assert_eq!(drain(scan).len(), 24);
    }

    #[test]
    fn oversized_product_has_no_step_count() {
        let mut scan = DeclarativeScan::new().with_order(ProductOrder::Snake);
        for k in 0..10 {
            scan = scan.with_range(AxisRange::linspace(format!("ax{}", k), 0.0, 99.0, 100));
        }
        assert_eq!(scan.checked_points(), None);
        assert_eq!(scan.num_steps(), None);
        assert_eq!(scan.total_points(), usize::MAX);

        let first = scan.next_step().unwrap();
        assert_eq!(written(&first), vec![0.0; 10]);
        let second = scan.next_step().unwrap();
        assert_eq!(written(&second)[9], 1.0);
    }

    #[test]
    fn empty_range_yields_no_steps() {
        let scan = DeclarativeScan::new()
            .with_range(AxisRange::linspace("a", 0.0, 1.0, 3))
            .with_range(AxisRange::linspace("b", 0.0, 1.0, 0))
            .with_read("sensor");
        assert_eq!(scan.num_steps(), Some(0));
        assert!(drain(scan).is_empty());
    }

    #[test]
    fn raster_inner_fastest() {
        let scan = DeclarativeScan::new()
            .with_range(AxisRange::values("outer", vec![10.0, 11.0]))
            .with_range(AxisRange::values("inner", vec![0.0, 1.0, 2.0]));
        let points: Vec<Vec<f64>> = drain(scan).iter().map(written).collect();
        assert_eq!(
            points,
            vec![
                vec![10.0, 0.0],
                vec![10.0, 1.0],
                vec![10.0, 2.0],
                vec![11.0, 0.0],
                vec![11.0, 1.0],
                vec![11.0, 2.0],
            ]
        );
    }

    #[test]
    fn snake_alternates_inner_direction() {
        let scan = DeclarativeScan::new()
            .with_range(AxisRange::linspace("outer", 10.0, 12.0, 3))
            .with_range(AxisRange::linspace("inner", 0.0, 2.0, 3))
            .with_order(ProductOrder::Snake);
        let points: Vec<Vec<f64>> = drain(scan).iter().map(written).collect();
        assert_eq!(
            points,
            vec![
                vec![10.0, 0.0],
                vec![10.0, 1.0],
                vec![10.0, 2.0],
                vec![11.0, 2.0],
                vec![11.0, 1.0],
                vec![11.0, 0.0],
                vec![12.0, 0.0],
                vec![12.0, 1.0],
                vec![12.0, 2.0],
            ]
        );
    }

    #[test]
    fn snake_three_axes_moves_one_axis_at_a_time() {
        let scan = DeclarativeScan::new()
            .with_range(AxisRange::linspace("a", 0.0, 1.0, 2))
            .with_range(AxisRange::linspace("b", 0.0, 2.0, 3))
            .with_range(AxisRange::linspace("c", 0.0, 1.0, 2))
            .with_order(ProductOrder::Snake);
        let points: Vec<Vec<f64>> = drain(scan).iter().map(written).collect();
        assert_eq!(points.len(), 12);
        for pair in points.windows(2) {
            let changed = pair[0]
                .iter()
                .zip(&pair[1])
                .filter(|(x, y)| x != y)
                .count();
            assert_eq!(changed, 1, "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn step_together_zips() {
        let scan = DeclarativeScan::new()
            .with_range(AxisRange::linspace("x", 0.0, 2.0, 3))
            .with_range(AxisRange::linspace("y", 0.0, 4.0, 3))
            .with_range(AxisRange::linspace("z", 0.0, -2.0, 3))
            .step_together();
        let points: Vec<Vec<f64>> = drain(scan).iter().map(written).collect();
        assert_eq!(
            points,
            vec![
                vec![0.0, 0.0, 0.0],
                vec![1.0, 2.0, -1.0],
                vec![2.0, 4.0, -2.0]
            ]
        );
    }

    #[test]
    fn writes_precede_reads() {
        let mut scan = DeclarativeScan::new()
            .with_range(AxisRange::values("mc.x", vec![0.0]))
            .with_read("sensor.value");
        let step = scan.next_step().unwrap();
        assert_eq!(step.intents()[0].axis, "mc.x");
        assert_eq!(step.intents()[1].operation, Operation::Read);
        assert_eq!(step.label(), Some("point_0"));
    }

    #[test]
    fn setup_does_not_change_product_part() {
        let scan = DeclarativeScan::new()
            .with_range(AxisRange::linspace("a", 0.0, 1.0, 5))
            .with_setup(Step::new().write("shutter", "open"));
        assert_eq!(scan.num_steps(), Some(6));
    }

    #[test]
    fn plan_args_describe_ranges() {
        let scan = DeclarativeScan::new()
            .with_range(AxisRange::linspace("mc.x", 0.0, 1.0, 5))
            .with_read("sensor.value");
        let args = scan.plan_args();
        assert_eq!(args["axes"], "mc.x");
        assert_eq!(args["mc.x.points"], "5");
        assert_eq!(args["order"], "raster");
    }
}
