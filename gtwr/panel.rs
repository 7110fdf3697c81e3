//! # Balanced Panels
//!
//! A panel is a stack of per-period cross sections. Everything downstream
//! assumes the balanced, time-major layout produced here: rows of period 1,
//! then period 2, and so on, every period holding the same number of rows in a
//! canonical (lat, lon) order.

use crate::kernel::{self, KernelError, PriorConfig};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("The {what} has {found} rows, but {expected} were expected.")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("The panel contains no rows.")]
    Empty,
    #[error("Coordinates must have exactly 2 columns (lat, lon); found {0}.")]
    BadCoordinateShape(usize),
    #[error("Non-finite {what} value found in row {row}.")]
    NonFinite { what: &'static str, row: usize },
    #[error("This split needs at least {required} time periods, but the panel has {found}.")]
    NotEnoughPeriods { required: usize, found: usize },
}

/// Shape of a balanced panel: `periods` blocks of `rows_per_period` rows each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodLayout {
    pub periods: usize,
    pub rows_per_period: usize,
}

impl PeriodLayout {
    pub fn total_rows(&self) -> usize {
        self.periods * self.rows_per_period
    }

    pub fn period_range(&self, period: usize) -> Range<usize> {
        let start = period * self.rows_per_period;
        start..start + self.rows_per_period
    }
}

/// Balanced, time-major panel arrays.
#[derive(Debug, Clone)]
pub struct Panel {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    /// `[N, 2]` latitude/longitude in degrees.
    pub coords: Array2<f64>,
    /// Time stamp of each row.
    pub times: Array1<f64>,
    /// Distinct, sorted period times.
    pub period_times: Vec<f64>,
    pub rows_per_period: usize,
}

/// Row indices of a chronological train/validation/test split.
#[derive(Debug, Clone)]
pub struct PanelSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
    pub train_times: Vec<f64>,
    pub validation_time: Option<f64>,
    pub test_time: f64,
}

fn check_finite(values: ArrayView2<f64>, what: &'static str) -> Result<(), PanelError> {
    for (row, values) in values.rows().into_iter().enumerate() {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PanelError::NonFinite { what, row });
        }
    }
    Ok(())
}

impl Panel {
    /// Sorts rows by (time, lat, lon), groups them by time, and truncates every
    /// period to the smallest period's row count.
    pub fn balanced(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        coords: ArrayView2<f64>,
        times: ArrayView1<f64>,
    ) -> Result<Self, PanelError> {
        let n = x.nrows();
        if n == 0 {
            return Err(PanelError::Empty);
        }
        for (what, found) in [
            ("target vector", y.len()),
            ("coordinate matrix", coords.nrows()),
            ("time vector", times.len()),
        ] {
            if found != n {
                return Err(PanelError::LengthMismatch {
                    what,
                    expected: n,
                    found,
                });
            }
        }
        if coords.ncols() != 2 {
            return Err(PanelError::BadCoordinateShape(coords.ncols()));
        }
        check_finite(x, "feature")?;
        check_finite(coords, "coordinate")?;
        check_finite(y.insert_axis(Axis(1)), "target")?;
        check_finite(times.insert_axis(Axis(1)), "time")?;
        let times = times.mapv(kernel::canonical_time);

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            times[a]
                .total_cmp(&times[b])
                .then_with(|| coords[[a, 0]].total_cmp(&coords[[b, 0]]))
                .then_with(|| coords[[a, 1]].total_cmp(&coords[[b, 1]]))
        });

        let groups: Vec<(f64, Vec<usize>)> = order
            .into_iter()
            .chunk_by(|&row| times[row].to_bits())
            .into_iter()
            .map(|(_, rows)| {
                let rows: Vec<usize> = rows.collect();
                (times[rows[0]], rows)
            })
            .collect();

        let rows_per_period = groups.iter().map(|(_, rows)| rows.len()).min().unwrap_or(0);
        if groups.iter().any(|(_, rows)| rows.len() != rows_per_period) {
            log::warn!(
                "Unbalanced panel: truncating every period to {} rows",
                rows_per_period
            );
        }

        let selected: Vec<usize> = groups
            .iter()
            .flat_map(|(_, rows)| rows.iter().take(rows_per_period).copied())
            .collect();

        Ok(Self {
            x: x.select(Axis(0), &selected),
            y: y.select(Axis(0), &selected),
            coords: coords.select(Axis(0), &selected),
            times: times.select(Axis(0), &selected),
            period_times: groups.iter().map(|(t, _)| *t).collect(),
            rows_per_period,
        })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn layout(&self) -> PeriodLayout {
        PeriodLayout {
            periods: self.period_times.len(),
            rows_per_period: self.rows_per_period,
        }
    }

    pub fn coord_blocks(&self) -> Vec<Array2<f64>> {
        let layout = self.layout();
        (0..layout.periods)
            .map(|t| {
                let range = layout.period_range(t);
                self.coords.slice(ndarray::s![range, ..]).to_owned()
            })
            .collect()
    }

    pub fn period_rows(&self, period: usize) -> Vec<usize> {
        if period >= self.period_times.len() {
            return Vec::new();
        }
        self.layout().period_range(period).collect()
    }

    /// Rows observed at time `t` (empty if `t` is not a period of this panel).
    pub fn rows_for_time(&self, t: f64) -> Vec<usize> {
        self.period_times
            .iter()
            .position(|&pt| pt.total_cmp(&kernel::canonical_time(t)) == Ordering::Equal)
            .map(|period| self.period_rows(period))
            .unwrap_or_default()
    }

    /// The geometric prior over this panel's rows.
    pub fn prior_kernel(&self, config: &PriorConfig) -> Result<Array2<f64>, KernelError> {
        kernel::build_spatiotemporal_kernel(&self.coord_blocks(), &self.period_times, config)
    }

    /// Last period is the test set; with `use_validation`, the one before it is
    /// the validation set; all earlier periods train.
    pub fn chronological_split(&self, use_validation: bool) -> Result<PanelSplit, PanelError> {
        let periods = self.period_times.len();
        let required = if use_validation { 3 } else { 2 };
        if periods < required {
            return Err(PanelError::NotEnoughPeriods {
                required,
                found: periods,
            });
        }
        let test_period = periods - 1;
        let (train_end, validation_period) = if use_validation {
            (periods - 2, Some(periods - 2))
        } else {
            (periods - 1, None)
        };

        Ok(PanelSplit {
            train: (0..train_end).flat_map(|t| self.period_rows(t)).collect(),
            validation: validation_period
                .map(|t| self.period_rows(t))
                .unwrap_or_default(),
            test: self.period_rows(test_period),
            train_times: self.period_times[..train_end].to_vec(),
            validation_time: validation_period.map(|t| self.period_times[t]),
            test_time: self.period_times[test_period],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Three periods, one of which has an extra location, rows shuffled.
    fn messy_panel() -> Panel {
        let coords = array![
            [1.0, 1.0],
            [0.0, 0.0],
            [0.0, 0.0],
            [1.0, 1.0],
            [2.0, 2.0],
            [1.0, 1.0],
            [0.0, 0.0]
        ];
        let times = array![2021.0, 2020.0, 2021.0, 2020.0, 2020.0, 2022.0, 2022.0];
        let x = Array2::from_shape_fn((7, 2), |(i, j)| (i * 10 + j) as f64);
        let y = Array1::from_shape_fn(7, |i| i as f64);
        Panel::balanced(x.view(), y.view(), coords.view(), times.view()).unwrap()
    }

    #[test]
    fn balancing_truncates_and_orders_time_major() {
        let panel = messy_panel();
        assert_eq!(panel.len(), 6);
        assert_eq!(panel.rows_per_period, 2);
        assert_eq!(panel.period_times, vec![2020.0, 2021.0, 2022.0]);
        assert_eq!(panel.times.to_vec(), vec![2020.0, 2020.0, 2021.0, 2021.0, 2022.0, 2022.0]);
        // Within each period rows are ordered by (lat, lon); the 2020 extra
        // location at (2, 2) sorts last and is dropped.
        for block in panel.coord_blocks() {
            assert_eq!(block, array![[0.0, 0.0], [1.0, 1.0]]);
        }
        // Targets follow their rows.
        assert_eq!(panel.y.to_vec(), vec![1.0, 3.0, 2.0, 0.0, 6.0, 5.0]);
    }

    #[test]
    fn chronological_split_assigns_periods() {
        let panel = messy_panel();
        let split = panel.chronological_split(true).unwrap();
        assert_eq!(split.train, vec![0, 1]);
        assert_eq!(split.validation, vec![2, 3]);
        assert_eq!(split.test, vec![4, 5]);
        assert_eq!(split.validation_time, Some(2021.0));

        let split = panel.chronological_split(false).unwrap();
        assert_eq!(split.train, vec![0, 1, 2, 3]);
        assert!(split.validation.is_empty());
        assert_eq!(split.test_time, 2022.0);
        assert_eq!(panel.rows_for_time(2021.0), vec![2, 3]);
        assert!(panel.rows_for_time(1999.0).is_empty());
    }

    #[test]
    fn negative_zero_time_is_the_same_period_as_zero() {
        let coords = array![[0.0, 0.0], [1.0, 1.0], [0.0, 0.0], [1.0, 1.0]];
        let times = array![0.0, -0.0, 1.0, 1.0];
        let x = Array2::from_shape_fn((4, 1), |(i, _)| i as f64);
        let y = Array1::from_shape_fn(4, |i| i as f64);
        let panel = Panel::balanced(x.view(), y.view(), coords.view(), times.view()).unwrap();

        assert_eq!(panel.len(), 4);
        assert_eq!(panel.rows_per_period, 2);
        assert_eq!(panel.period_times, vec![0.0, 1.0]);
        assert!(panel.times.iter().all(|t| t.is_sign_positive()));
        assert_eq!(panel.rows_for_time(-0.0), vec![0, 1]);

        let split = panel.chronological_split(false).unwrap();
        assert_eq!(split.train, vec![0, 1]);
        assert_eq!(split.test, vec![2, 3]);
        assert_eq!(panel.prior_kernel(&PriorConfig::default()).unwrap().dim(), (4, 4));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let x = Array2::zeros((3, 1));
        let y = Array1::zeros(2);
        let coords = Array2::zeros((3, 2));
        let times = Array1::zeros(3);
        assert!(matches!(
            Panel::balanced(x.view(), y.view(), coords.view(), times.view()),
            Err(PanelError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn prior_over_consistent_panel_is_row_stochastic() {
        let panel = messy_panel();
        let prior = panel.prior_kernel(&PriorConfig::default()).unwrap();
        assert_eq!(prior.dim(), (6, 6));
        for row in prior.rows() {
            approx::assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }
}
