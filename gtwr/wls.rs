//! # Local Weighted Least Squares
//!
//! For every target row `i`, solves
//!
//! ```text
//! min_β  Σ_j W[i, j] · (y_j − x_j·β)²  +  λ ‖β‖²
//! ```
//!
//! over ALL rows `j` (zero weights simply drop out). Rows are independent, so the
//! solves are dispatched in parallel and collected back in row order.
//!
//! Two modes are supported: a closed-form ridge solve, and a Huber-robust
//! IRLS that down-weights observations whose residual exceeds `delta`.
//! Singular normal equations fall back to an SVD least-squares solve for the
//! affected row only.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::{LeastSquaresSvd, Solve};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Added to every observation weight before solving.
pub const WEIGHT_FLOOR: f64 = 1e-12;

/// Residual magnitudes are floored here before forming `delta / |r|`.
const RESIDUAL_FLOOR: f64 = 1e-12;

pub const DEFAULT_HUBER_DELTA: f64 = 1.0;
pub const DEFAULT_HUBER_ITERS: usize = 3;

#[derive(Error, Debug)]
pub enum WlsError {
    #[error("Unknown WLS kind '{0}'. Expected one of: ridge, huber.")]
    UnknownKind(String),
    #[error("The ridge penalty must be finite and non-negative, but {0} was given.")]
    InvalidRidge(f64),
    #[error("The Huber threshold must be positive, but {0} was given.")]
    InvalidHuberDelta(f64),
    #[error("Huber mode needs at least one reweighting iteration.")]
    ZeroHuberIterations,
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Which local solver to run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum WlsKind {
    #[default]
    Ridge,
    /// Iteratively re-weighted Huber regression; `delta` is the residual threshold.
    Huber { delta: f64, iters: usize },
}

impl FromStr for WlsKind {
    type Err = WlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ridge" => Ok(Self::Ridge),
            "huber" => Ok(Self::Huber {
                delta: DEFAULT_HUBER_DELTA,
                iters: DEFAULT_HUBER_ITERS,
            }),
            _ => Err(WlsError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for WlsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ridge => write!(f, "ridge"),
            Self::Huber { delta, iters } => write!(f, "huber(delta={delta}, iters={iters})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WlsConfig {
    pub kind: WlsKind,
    pub ridge_lambda: f64,
}

impl Default for WlsConfig {
    fn default() -> Self {
        Self {
            kind: WlsKind::Ridge,
            ridge_lambda: 5.0,
        }
    }
}

impl WlsConfig {
    pub fn ridge(ridge_lambda: f64) -> Self {
        Self {
            kind: WlsKind::Ridge,
            ridge_lambda,
        }
    }

    pub fn huber(ridge_lambda: f64, delta: f64, iters: usize) -> Self {
        Self {
            kind: WlsKind::Huber { delta, iters },
            ridge_lambda,
        }
    }

    pub fn validate(&self) -> Result<(), WlsError> {
        if !self.ridge_lambda.is_finite() || self.ridge_lambda < 0.0 {
            return Err(WlsError::InvalidRidge(self.ridge_lambda));
        }
        if let WlsKind::Huber { delta, iters } = self.kind {
            if delta.is_nan() || delta <= 0.0 {
                return Err(WlsError::InvalidHuberDelta(delta));
            }
            if iters == 0 {
                return Err(WlsError::ZeroHuberIterations);
            }
        }
        Ok(())
    }
}

/// Output of a batch of local solves. Row `k` of `betas` and entry `k` of
/// `fitted` belong to the `k`-th requested row.
#[derive(Debug, Clone)]
pub struct WlsFit {
    pub fitted: Array1<f64>,
    pub betas: Array2<f64>,
}

/// Everything needed to differentiate one local solve with respect to its
/// weight row.
pub(crate) struct RowSolve {
    pub beta: Array1<f64>,
    /// `XᵀDX + λI` of the final solve.
    hessian: Array2<f64>,
    /// Huber multipliers applied in the final solve; `None` in ridge mode.
    multipliers: Option<Array1<f64>>,
}

impl RowSolve {
    /// Gradient of the loss with respect to row `i` of the weight matrix, given
    /// `grad_beta = ∂L/∂β_i`:
    ///
    /// `∂L/∂W[i, j] = h_j · (x_j · H⁻¹ grad_beta) · (y_j − x_j · β_i)`.
    ///
    /// Huber multipliers `h` are held fixed at their final values.
    pub(crate) fn weight_gradient(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        grad_beta: ArrayView1<f64>,
    ) -> Array1<f64> {
        let v = solve_normal_equations(&self.hessian, &grad_beta.to_owned());
        let residuals = &y - &x.dot(&self.beta);
        let mut grad = x.dot(&v) * &residuals;
        if let Some(h) = &self.multipliers {
            grad *= h;
        }
        grad
    }
}

fn normal_equations(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    ridge: f64,
) -> (Array2<f64>, Array1<f64>) {
    let w_eff = weights.mapv(|w| w + WEIGHT_FLOOR);
    let xw = &x * &w_eff.insert_axis(Axis(1));
    let mut a = xw.t().dot(&x);
    a.diag_mut().mapv_inplace(|d| d + ridge);
    let b = xw.t().dot(&y);
    (a, b)
}

/// Solves `a β = b`, falling back to least squares when `a` is singular.
fn solve_normal_equations(a: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    match a.solve(b) {
        Ok(beta) if beta.iter().all(|v| v.is_finite()) => beta,
        _ => match a.least_squares(b) {
            Ok(result) if result.solution.iter().all(|v| v.is_finite()) => result.solution,
            Ok(_) => {
                log::warn!("Least-squares fallback produced non-finite coefficients; using zeros.");
                Array1::zeros(b.len())
            }
            Err(e) => {
                log::warn!("Least-squares fallback failed ({e}); using zero coefficients.");
                Array1::zeros(b.len())
            }
        },
    }
}

fn huber_multipliers(residuals: &Array1<f64>, delta: f64) -> Array1<f64> {
    residuals.mapv(|r| {
        let abs = r.abs() + RESIDUAL_FLOOR;
        if abs <= delta { 1.0 } else { delta / abs }
    })
}

fn solve_row(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    config: &WlsConfig,
) -> RowSolve {
    match config.kind {
        WlsKind::Ridge => {
            let (a, b) = normal_equations(x, y, weights, config.ridge_lambda);
            let beta = solve_normal_equations(&a, &b);
            RowSolve {
                beta,
                hessian: a,
                multipliers: None,
            }
        }
        WlsKind::Huber { delta, iters } => {
            // First pass uses the unmodified row weights.
            let mut applied = Array1::ones(weights.len());
            let (mut hessian, b) = normal_equations(x, y, weights, config.ridge_lambda);
            let mut beta = solve_normal_equations(&hessian, &b);
            for _ in 1..iters {
                let residuals = &y - &x.dot(&beta);
                applied = huber_multipliers(&residuals, delta);
                let w = &weights * &applied;
                let (a, b) = normal_equations(x, y, w.view(), config.ridge_lambda);
                beta = solve_normal_equations(&a, &b);
                hessian = a;
            }
            RowSolve {
                beta,
                hessian,
                multipliers: Some(applied),
            }
        }
    }
}

fn check_dimensions(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    w: ArrayView2<f64>,
) -> Result<(), WlsError> {
    if x.nrows() != y.len() {
        return Err(WlsError::DimensionMismatch(format!(
            "X has {} rows but y has {} entries",
            x.nrows(),
            y.len()
        )));
    }
    if w.ncols() != x.nrows() {
        return Err(WlsError::DimensionMismatch(format!(
            "weight matrix has {} columns but there are {} observations",
            w.ncols(),
            x.nrows()
        )));
    }
    Ok(())
}

fn solve_selected(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    w: ArrayView2<f64>,
    rows: &[usize],
    config: &WlsConfig,
) -> Result<Vec<RowSolve>, WlsError> {
    config.validate()?;
    check_dimensions(x, y, w)?;
    if let Some(&bad) = rows.iter().find(|&&r| r >= w.nrows() || r >= x.nrows()) {
        return Err(WlsError::DimensionMismatch(format!(
            "row {bad} requested but the weight matrix has {} rows",
            w.nrows()
        )));
    }
    Ok(rows
        .par_iter()
        .map(|&i| solve_row(x, y, w.row(i), config))
        .collect())
}

fn assemble(x: ArrayView2<f64>, rows: &[usize], solves: &[RowSolve]) -> WlsFit {
    let p = x.ncols();
    let mut betas = Array2::zeros((rows.len(), p));
    let mut fitted = Array1::zeros(rows.len());
    Zip::from(betas.rows_mut())
        .and(&mut fitted)
        .and(rows)
        .and(solves)
        .for_each(|mut beta_row, fit, &i, solve| {
            beta_row.assign(&solve.beta);
            *fit = x.row(i).dot(&solve.beta);
        });
    WlsFit { fitted, betas }
}

/// Solves one local regression per row of `w` (which must be N×N).
pub fn solve_local_wls(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    w: ArrayView2<f64>,
    config: &WlsConfig,
) -> Result<WlsFit, WlsError> {
    if w.nrows() != x.nrows() {
        return Err(WlsError::DimensionMismatch(format!(
            "weight matrix has {} rows but there are {} observations",
            w.nrows(),
            x.nrows()
        )));
    }
    let rows: Vec<usize> = (0..x.nrows()).collect();
    let solves = solve_selected(x, y, w, &rows, config)?;
    Ok(assemble(x, &rows, &solves))
}

/// Solves only the listed rows. Output entry `k` corresponds to `rows[k]`, and
/// equals what [`solve_local_wls`] would produce for that row.
pub fn solve_local_wls_rows(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    w: ArrayView2<f64>,
    rows: &[usize],
    config: &WlsConfig,
) -> Result<WlsFit, WlsError> {
    let solves = solve_selected(x, y, w, rows, config)?;
    Ok(assemble(x, rows, &solves))
}

/// Full solve that also returns the per-row state needed for backpropagation.
pub(crate) fn solve_local_wls_traced(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    w: ArrayView2<f64>,
    config: &WlsConfig,
) -> Result<(WlsFit, Vec<RowSolve>), WlsError> {
    if w.nrows() != x.nrows() {
        return Err(WlsError::DimensionMismatch(format!(
            "weight matrix has {} rows but there are {} observations",
            w.nrows(),
            x.nrows()
        )));
    }
    let rows: Vec<usize> = (0..x.nrows()).collect();
    let solves = solve_selected(x, y, w, &rows, config)?;
    let fit = assemble(x, &rows, &solves);
    Ok((fit, solves))
}
