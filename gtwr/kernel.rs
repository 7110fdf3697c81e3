//! # Spatio-Temporal Prior Kernel
//!
//! Builds the fixed geometric affinity matrix that seeds the learned weighting.
//! Entry `(i, j)` is a Gaussian decay in great-circle distance times a Gaussian
//! decay in time gap, with global bandwidths taken from median pairwise
//! distances. The dense kernel is pruned to the `k` strongest neighbours per row,
//! the diagonal is forced to a self-weight, and rows are normalized.
//!
//! Two construction paths exist:
//!
//! - **Consistent panels** (every period holds the same coordinates in the same
//!   order): one location kernel and one period kernel, combined by a Kronecker
//!   product. Distance work is `O(T² + n²)`.
//! - **General panels**: every period pair is computed block by block, `O(N²)`.
//!
//! Both paths agree whenever the consistent path applies.

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Bandwidths used when no positive pairwise distance exists.
const FALLBACK_SPATIAL_BANDWIDTH_KM: f64 = 100.0;
const FALLBACK_TEMPORAL_BANDWIDTH: f64 = 1.0;

const MIN_BANDWIDTH: f64 = 1e-6;
const MIN_TAU: f64 = 1e-6;

/// Tolerances for deciding whether every period shares the same coordinates.
const CONSISTENCY_ATOL: f64 = 1e-6;
const CONSISTENCY_RTOL: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("At least one period block is required to build a prior kernel.")]
    NoPeriods,
    #[error("Received {blocks} coordinate blocks but {times} time values; they must match one-to-one.")]
    MismatchedPeriods { blocks: usize, times: usize },
    #[error("Coordinate matrices must have exactly 2 columns (lat, lon); found {0}.")]
    BadCoordinateShape(usize),
    #[error("Coordinates have {coords} rows but {times} time stamps were supplied.")]
    MismatchedRows { coords: usize, times: usize },
    #[error("Non-finite time value encountered: {0}")]
    NonFiniteTime(f64),
}

/// Hyperparameters of the geometric prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorConfig {
    /// Spatial bandwidth divisor; larger values give faster spatial decay.
    pub tau_s: f64,
    /// Temporal bandwidth divisor.
    pub tau_t: f64,
    /// Off-diagonal neighbours retained per row.
    pub k_neighbors: usize,
    /// Value forced onto the diagonal before normalization.
    pub self_weight: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            tau_s: 1.0,
            tau_t: 1.0,
            k_neighbors: 8,
            self_weight: 1.0,
        }
    }
}

/// Global spatial (km) and temporal (time units) decay scales.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bandwidths {
    pub spatial: f64,
    pub temporal: f64,
}

impl Bandwidths {
    /// Spatio-temporal affinity for a pair at the given distances.
    #[inline]
    pub fn affinity(&self, spatial_km: f64, time_gap: f64) -> f64 {
        gaussian(spatial_km, self.spatial) * gaussian(time_gap, self.temporal)
    }
}

#[inline]
fn gaussian(distance: f64, bandwidth: f64) -> f64 {
    let z = distance / bandwidth;
    (-0.5 * z * z).exp()
}

/// Great-circle distance in kilometres between two (lat, lon) points in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// All pairwise great-circle distances between two coordinate sets.
pub fn pairwise_distances(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let mut d = Array2::zeros((a.nrows(), b.nrows()));
    Zip::indexed(&mut d).par_for_each(|(i, j), v| {
        *v = haversine_km(a[[i, 0]], a[[i, 1]], b[[j, 0]], b[[j, 1]]);
    });
    d
}

/// Median with the midpoint convention for even lengths.
fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    })
}

/// Maps `-0.0` to `0.0`; every other value is returned unchanged.
pub(crate) fn canonical_time(t: f64) -> f64 {
    t + 0.0
}

/// Sorted, de-duplicated time values.
pub fn distinct_times(times: ArrayView1<f64>) -> Vec<f64> {
    times
        .iter()
        .map(|&t| canonical_time(t))
        .sorted_by(f64::total_cmp)
        .dedup_by(|a, b| a.total_cmp(b).is_eq())
        .collect()
}

/// Estimates global bandwidths from per-period coordinate blocks and the distinct
/// period times.
///
/// Spatial: median of all positive within-period distances. Periods with fewer
/// than two locations contribute nothing. Temporal: median of all positive gaps
/// between period times. Both are divided by their `tau` and floored.
pub fn estimate_bandwidths(blocks: &[Array2<f64>], times: &[f64], config: &PriorConfig) -> Bandwidths {
    let mut spatial: Vec<f64> = Vec::new();
    for block in blocks.iter().filter(|b| b.nrows() > 1) {
        let n = block.nrows();
        for i in 0..n {
            for j in (i + 1)..n {
                let d = haversine_km(block[[i, 0]], block[[i, 1]], block[[j, 0]], block[[j, 1]]);
                if d > 0.0 {
                    spatial.push(d);
                }
            }
        }
    }
    let mut gaps: Vec<f64> = Vec::new();
    for (a, &ta) in times.iter().enumerate() {
        for &tb in &times[a + 1..] {
            let gap = (ta - tb).abs();
            if gap > 0.0 {
                gaps.push(gap);
            }
        }
    }

    let hs = median(&mut spatial).unwrap_or(FALLBACK_SPATIAL_BANDWIDTH_KM);
    let ht = median(&mut gaps).unwrap_or(FALLBACK_TEMPORAL_BANDWIDTH);
    let bandwidths = Bandwidths {
        spatial: (hs / config.tau_s.max(MIN_TAU)).max(MIN_BANDWIDTH),
        temporal: (ht / config.tau_t.max(MIN_TAU)).max(MIN_BANDWIDTH),
    };
    log::debug!(
        "Prior bandwidths: spatial {:.4} km, temporal {:.4}",
        bandwidths.spatial,
        bandwidths.temporal
    );
    bandwidths
}

fn blocks_are_consistent(blocks: &[Array2<f64>]) -> bool {
    let base = &blocks[0];
    blocks[1..].iter().all(|b| {
        b.dim() == base.dim()
            && b.iter()
                .zip(base.iter())
                .all(|(&x, &y)| (x - y).abs() <= CONSISTENCY_ATOL + CONSISTENCY_RTOL * y.abs())
    })
}

fn period_kernel(times: &[f64], bandwidth: f64) -> Array2<f64> {
    let t = times.len();
    let mut k = Array2::from_shape_fn((t, t), |(a, b)| gaussian((times[a] - times[b]).abs(), bandwidth));
    k.diag_mut().fill(1.0);
    k
}

/// Dense (unsparsified) kernel for a panel whose periods share identical
/// coordinates: `kron(K_T, K_S)`.
pub(crate) fn dense_kernel_consistent(
    blocks: &[Array2<f64>],
    times: &[f64],
    bandwidths: &Bandwidths,
    self_weight: f64,
) -> Array2<f64> {
    let base = &blocks[0];
    let n = base.nrows();
    let mut k_s = pairwise_distances(base.view(), base.view()).mapv(|d| gaussian(d, bandwidths.spatial));
    k_s.diag_mut().fill(self_weight);
    let k_t = period_kernel(times, bandwidths.temporal);

    let t = times.len();
    let mut full = Array2::zeros((t * n, t * n));
    for a in 0..t {
        for b in 0..t {
            full.slice_mut(s![a * n..(a + 1) * n, b * n..(b + 1) * n])
                .assign(&(&k_s * k_t[[a, b]]));
        }
    }
    full
}

/// Dense (unsparsified) kernel computed block by block across every period pair.
pub(crate) fn dense_kernel_general(
    blocks: &[Array2<f64>],
    times: &[f64],
    bandwidths: &Bandwidths,
) -> Array2<f64> {
    let sizes: Vec<usize> = blocks.iter().map(|b| b.nrows()).collect();
    let total: usize = sizes.iter().sum();
    let mut full = Array2::zeros((total, total));

    let mut r0 = 0;
    for (a, block_a) in blocks.iter().enumerate() {
        let mut c0 = 0;
        for (b, block_b) in blocks.iter().enumerate() {
            let k_t = gaussian((times[a] - times[b]).abs(), bandwidths.temporal);
            let k_s = pairwise_distances(block_a.view(), block_b.view())
                .mapv(|d| k_t * gaussian(d, bandwidths.spatial));
            full.slice_mut(s![r0..r0 + sizes[a], c0..c0 + sizes[b]])
                .assign(&k_s);
            c0 += sizes[b];
        }
        r0 += sizes[a];
    }
    full
}

/// Keeps the `k` strongest off-diagonal entries of each row, forces the diagonal
/// to `self_weight`, and normalizes rows (zero-sum rows are left as is).
pub fn sparsify_knn(w: &Array2<f64>, k: usize, self_weight: f64) -> Array2<f64> {
    let n = w.nrows();
    if n <= 1 {
        return Array2::eye(n) * self_weight;
    }
    let k_eff = k.min(n - 1);
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        let row = w.row(i);
        let strongest = (0..n)
            .filter(|&j| j != i)
            .k_smallest_by(k_eff, |&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
        for j in strongest {
            out[[i, j]] = w[[i, j]];
        }
    }
    out.diag_mut().fill(self_weight);
    let sums = out.sum_axis(Axis(1)).mapv(|s| if s > 0.0 { s } else { 1.0 });
    out / &sums.insert_axis(Axis(1))
}

fn validate_blocks(blocks: &[Array2<f64>], times: &[f64]) -> Result<(), KernelError> {
    if blocks.is_empty() {
        return Err(KernelError::NoPeriods);
    }
    if blocks.len() != times.len() {
        return Err(KernelError::MismatchedPeriods {
            blocks: blocks.len(),
            times: times.len(),
        });
    }
    if let Some(bad) = blocks.iter().find(|b| b.ncols() != 2) {
        return Err(KernelError::BadCoordinateShape(bad.ncols()));
    }
    if let Some(&t) = times.iter().find(|t| !t.is_finite()) {
        return Err(KernelError::NonFiniteTime(t));
    }
    Ok(())
}

/// Builds the sparsified, row-normalized prior over time-major stacked blocks.
///
/// Row `r` of the output corresponds to the `r`-th location when the blocks are
/// stacked in the order given.
pub fn build_spatiotemporal_kernel(
    blocks: &[Array2<f64>],
    times: &[f64],
    config: &PriorConfig,
) -> Result<Array2<f64>, KernelError> {
    validate_blocks(blocks, times)?;
    log::debug!(
        "Building spatio-temporal kernel: {} periods, {} locations in the first period",
        times.len(),
        blocks[0].nrows()
    );

    let bandwidths = estimate_bandwidths(blocks, times, config);
    let dense = if blocks_are_consistent(blocks) {
        dense_kernel_consistent(blocks, times, &bandwidths, config.self_weight)
    } else {
        log::debug!("Period coordinates differ; using the general cross-period kernel");
        dense_kernel_general(blocks, times, &bandwidths)
    };

    let sparse = sparsify_knn(&dense, config.k_neighbors, config.self_weight);
    let zeros = sparse.iter().filter(|&&v| v == 0.0).count();
    log::debug!(
        "Kernel construction complete. Sparsity: {:.3}",
        zeros as f64 / sparse.len().max(1) as f64
    );
    Ok(sparse)
}

/// Rows grouped by distinct time value, preserving the input order within a group.
pub(crate) struct PeriodGrouping {
    pub times: Vec<f64>,
    pub rows: Vec<Vec<usize>>,
}

impl PeriodGrouping {
    pub(crate) fn new(times: ArrayView1<f64>) -> Self {
        let distinct = distinct_times(times);
        let mut rows = vec![Vec::new(); distinct.len()];
        for (row, t) in times.iter().enumerate() {
            let t = canonical_time(*t);
            if let Ok(period) = distinct.binary_search_by(|candidate| candidate.total_cmp(&t)) {
                rows[period].push(row);
            }
        }
        Self {
            times: distinct,
            rows,
        }
    }

    pub(crate) fn coord_blocks(&self, coords: ArrayView2<f64>) -> Vec<Array2<f64>> {
        self.rows
            .iter()
            .map(|rows| coords.select(Axis(0), rows))
            .collect()
    }
}

/// Builds the prior for rows in arbitrary order.
///
/// Rows are grouped by time, the kernel is built on the grouped order, and the
/// result is mapped back so row/column `r` refers to input row `r`.
pub fn kernel_for_rows(
    coords: ArrayView2<f64>,
    times: ArrayView1<f64>,
    config: &PriorConfig,
) -> Result<Array2<f64>, KernelError> {
    if coords.ncols() != 2 {
        return Err(KernelError::BadCoordinateShape(coords.ncols()));
    }
    if coords.nrows() != times.len() {
        return Err(KernelError::MismatchedRows {
            coords: coords.nrows(),
            times: times.len(),
        });
    }
    if let Some(&t) = times.iter().find(|t| !t.is_finite()) {
        return Err(KernelError::NonFiniteTime(t));
    }
    let grouping = PeriodGrouping::new(times);
    let blocks = grouping.coord_blocks(coords);
    let grouped = build_spatiotemporal_kernel(&blocks, &grouping.times, config)?;

    let order: Vec<usize> = grouping.rows.into_iter().flatten().collect();
    if order.iter().enumerate().all(|(pos, &row)| pos == row) {
        return Ok(grouped);
    }
    let n = order.len();
    let mut kernel = Array2::zeros((n, n));
    for (a, &ra) in order.iter().enumerate() {
        for (b, &rb) in order.iter().enumerate() {
            kernel[[ra, rb]] = grouped[[a, b]];
        }
    }
    Ok(kernel)
}

/// Unnormalized NEW→OLD geometric affinity under fixed bandwidths.
pub fn cross_affinity(
    new_coords: ArrayView2<f64>,
    new_times: ArrayView1<f64>,
    old_coords: ArrayView2<f64>,
    old_times: ArrayView1<f64>,
    bandwidths: &Bandwidths,
) -> Array2<f64> {
    let distances = pairwise_distances(new_coords, old_coords);
    let mut out = Array2::zeros(distances.raw_dim());
    Zip::indexed(&mut out)
        .and(&distances)
        .for_each(|(i, j), v, &d| {
            *v = bandwidths.affinity(d, (new_times[i] - old_times[j]).abs());
        });
    out
}

/// Per-row time stamps for blocks stacked time-major.
pub fn stacked_times(blocks: &[Array2<f64>], times: &[f64]) -> Array1<f64> {
    blocks
        .iter()
        .zip(times)
        .flat_map(|(b, &t)| std::iter::repeat_n(t, b.nrows()))
        .collect()
}
