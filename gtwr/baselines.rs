//! # Reference Models
//!
//! Global linear fits (one coefficient vector for every row) and the fixed
//! prior-kernel GTWR. They share the training rows and the feature matrix with
//! the learned model so the numbers are directly comparable.
//!
//! Every global fit has an unpenalized intercept, obtained by centering.

use crate::wls::{WlsConfig, WlsError, WlsFit, solve_local_wls};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{LeastSquaresSvd, Solve};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_RIDGE_ALPHA: f64 = 2.0;
pub const DEFAULT_HUBER_EPSILON: f64 = 1.35;
pub const DEFAULT_LASSO_ALPHA: f64 = 0.01;
pub const DEFAULT_PRIOR_RIDGE: f64 = 5.0;

const MAX_HUBER_ITERATIONS: usize = 100;
const MAX_LASSO_SWEEPS: usize = 1000;
const TOLERANCE: f64 = 1e-8;
/// Consistency constant turning the median absolute residual into a normal
/// scale estimate.
const MAD_TO_SIGMA: f64 = 0.6745;

#[derive(Error, Debug)]
pub enum BaselineError {
    #[error("Unknown baseline '{0}'. Expected one of: ols, ridge, huber, lasso.")]
    UnknownKind(String),
    #[error("Linear algebra failure while fitting a baseline: {0}")]
    Linalg(#[from] LinalgError),
    #[error("Local WLS solve failed: {0}")]
    Wls(#[from] WlsError),
    #[error("Cannot fit a baseline on zero rows.")]
    NoRows,
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Global estimators with their penalty parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BaselineKind {
    Ols,
    Ridge { alpha: f64 },
    Huber { epsilon: f64 },
    Lasso { alpha: f64 },
}

impl BaselineKind {
    pub const ALL: [BaselineKind; 4] = [
        BaselineKind::Ols,
        BaselineKind::Ridge {
            alpha: DEFAULT_RIDGE_ALPHA,
        },
        BaselineKind::Huber {
            epsilon: DEFAULT_HUBER_EPSILON,
        },
        BaselineKind::Lasso {
            alpha: DEFAULT_LASSO_ALPHA,
        },
    ];
}

impl FromStr for BaselineKind {
    type Err = BaselineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ols" => Ok(Self::Ols),
            "ridge" => Ok(Self::Ridge {
                alpha: DEFAULT_RIDGE_ALPHA,
            }),
            "huber" => Ok(Self::Huber {
                epsilon: DEFAULT_HUBER_EPSILON,
            }),
            "lasso" => Ok(Self::Lasso {
                alpha: DEFAULT_LASSO_ALPHA,
            }),
            _ => Err(BaselineError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for BaselineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ols => write!(f, "ols"),
            Self::Ridge { alpha } => write!(f, "ridge(alpha={alpha})"),
            Self::Huber { epsilon } => write!(f, "huber(epsilon={epsilon})"),
            Self::Lasso { alpha } => write!(f, "lasso(alpha={alpha})"),
        }
    }
}

/// One global linear model.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalFit {
    pub intercept: f64,
    pub coefficients: Array1<f64>,
}

impl GlobalFit {
    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients) + self.intercept
    }
}

/// Column means of `x` and the mean of `y`, optionally weighted.
fn centering(x: ArrayView2<f64>, y: ArrayView1<f64>, weights: Option<&Array1<f64>>) -> (Array1<f64>, f64) {
    match weights {
        None => (
            x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols())),
            y.mean().unwrap_or(0.0),
        ),
        Some(w) => {
            let total = w.sum().max(f64::MIN_POSITIVE);
            (x.t().dot(w) / total, y.dot(w) / total)
        }
    }
}

fn centered(x: ArrayView2<f64>, y: ArrayView1<f64>, x_mean: &Array1<f64>, y_mean: f64) -> (Array2<f64>, Array1<f64>) {
    (&x - &x_mean.view().insert_axis(Axis(0)), &y - y_mean)
}

fn ols(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<GlobalFit, BaselineError> {
    let (x_mean, y_mean) = centering(x, y, None);
    let (xc, yc) = centered(x, y, &x_mean, y_mean);
    let coefficients = xc.least_squares(&yc)?.solution;
    let intercept = y_mean - x_mean.dot(&coefficients);
    Ok(GlobalFit {
        intercept,
        coefficients,
    })
}

fn ridge(x: ArrayView2<f64>, y: ArrayView1<f64>, alpha: f64) -> Result<GlobalFit, BaselineError> {
    let (x_mean, y_mean) = centering(x, y, None);
    let (xc, yc) = centered(x, y, &x_mean, y_mean);
    let mut gram = xc.t().dot(&xc);
    gram.diag_mut().mapv_inplace(|v| v + alpha);
    let coefficients = gram.solve_into(xc.t().dot(&yc))?;
    let intercept = y_mean - x_mean.dot(&coefficients);
    Ok(GlobalFit {
        intercept,
        coefficients,
    })
}

/// Weighted least squares with an intercept, by centering on the weighted means
/// and solving the scaled system by SVD.
fn weighted_ols(x: ArrayView2<f64>, y: ArrayView1<f64>, weights: &Array1<f64>) -> Result<GlobalFit, BaselineError> {
    let (x_mean, y_mean) = centering(x, y, Some(weights));
    let (mut xc, mut yc) = centered(x, y, &x_mean, y_mean);
    let sqrt_w = weights.mapv(f64::sqrt);
    xc *= &sqrt_w.view().insert_axis(Axis(1));
    yc *= &sqrt_w;
    let coefficients = xc.least_squares(&yc)?.solution;
    let intercept = y_mean - x_mean.dot(&coefficients);
    Ok(GlobalFit {
        intercept,
        coefficients,
    })
}

fn median_abs(values: &Array1<f64>) -> f64 {
    let mut abs: Vec<f64> = values.iter().map(|v| v.abs()).collect();
    abs.sort_by(f64::total_cmp);
    let n = abs.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        abs[n / 2]
    } else {
        0.5 * (abs[n / 2 - 1] + abs[n / 2])
    }
}

/// Huber regression by iteratively reweighted least squares, re-estimating the
/// residual scale from the median absolute residual on every pass.
fn huber(x: ArrayView2<f64>, y: ArrayView1<f64>, epsilon: f64) -> Result<GlobalFit, BaselineError> {
    let mut fit = ols(x, y)?;
    for iteration in 0..MAX_HUBER_ITERATIONS {
        let residuals = &y - &fit.predict(x);
        let scale = median_abs(&residuals) / MAD_TO_SIGMA;
        if scale <= TOLERANCE {
            break;
        }
        let threshold = epsilon * scale;
        let weights = residuals.mapv(|r| {
            let r = r.abs();
            if r <= threshold { 1.0 } else { threshold / r }
        });
        let next = weighted_ols(x, y, &weights)?;
        let change = (&next.coefficients - &fit.coefficients)
            .iter()
            .chain(std::iter::once(&(next.intercept - fit.intercept)))
            .fold(0.0f64, |acc, d| acc.max(d.abs()));
        fit = next;
        if change < TOLERANCE {
            log::debug!("Huber baseline converged after {} iterations", iteration + 1);
            break;
        }
    }
    Ok(fit)
}

fn soft_threshold(z: f64, gamma: f64) -> f64 {
    if z > gamma {
        z - gamma
    } else if z < -gamma {
        z + gamma
    } else {
        0.0
    }
}

/// Lasso by cyclic coordinate descent on
/// `(1 / 2n)·‖y − Xβ‖² + α·‖β‖₁`.
fn lasso(x: ArrayView2<f64>, y: ArrayView1<f64>, alpha: f64) -> GlobalFit {
    let (x_mean, y_mean) = centering(x, y, None);
    let (xc, yc) = centered(x, y, &x_mean, y_mean);
    let n = xc.nrows() as f64;
    let p = xc.ncols();
    let col_sq: Vec<f64> = xc.axis_iter(Axis(1)).map(|c| c.dot(&c)).collect();
    let l1 = alpha * n;

    let mut coefficients = Array1::<f64>::zeros(p);
    let mut residuals = yc;
    for _ in 0..MAX_LASSO_SWEEPS {
        let mut max_change = 0.0f64;
        for j in 0..p {
            if col_sq[j] < 1e-14 {
                continue;
            }
            let column = xc.column(j);
            let old = coefficients[j];
            let rho = column.dot(&residuals) + col_sq[j] * old;
            let new = soft_threshold(rho, l1) / col_sq[j];
            let delta = new - old;
            if delta != 0.0 {
                residuals.scaled_add(-delta, &column);
            }
            coefficients[j] = new;
            max_change = max_change.max(delta.abs());
        }
        if max_change < TOLERANCE {
            break;
        }
    }
    let intercept = y_mean - x_mean.dot(&coefficients);
    GlobalFit {
        intercept,
        coefficients,
    }
}

/// Fits one global baseline on the given rows.
pub fn fit_global(kind: BaselineKind, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<GlobalFit, BaselineError> {
    if x.nrows() == 0 {
        return Err(BaselineError::NoRows);
    }
    if x.nrows() != y.len() {
        return Err(BaselineError::DimensionMismatch(format!(
            "X has {} rows but y has {}",
            x.nrows(),
            y.len()
        )));
    }
    match kind {
        BaselineKind::Ols => ols(x, y),
        BaselineKind::Ridge { alpha } => ridge(x, y, alpha),
        BaselineKind::Huber { epsilon } => huber(x, y, epsilon),
        BaselineKind::Lasso { alpha } => Ok(lasso(x, y, alpha)),
    }
}

/// Fits on `train_rows` and predicts every row of `x`.
pub fn baseline_predictions(
    kind: BaselineKind,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    train_rows: &[usize],
) -> Result<Array1<f64>, BaselineError> {
    let fit = fit_global(kind, x.select(Axis(0), train_rows).view(), y.select(Axis(0), train_rows).view())?;
    Ok(fit.predict(x))
}

/// GTWR with the fixed geometric prior as its weight matrix.
pub fn gtwr_prior_baseline(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior: ArrayView2<f64>,
    ridge_lambda: f64,
) -> Result<WlsFit, BaselineError> {
    Ok(solve_local_wls(x, y, prior, &WlsConfig::ridge(ridge_lambda))?)
}
