//! # Out-of-Sample Prediction
//!
//! Three policies for predicting rows the network was never trained on. None
//! of them update network parameters, and all of them solve the local WLS
//! only for the new rows: an old row's coefficients never feed a new row's
//! fitted value, so the result equals a full solve sliced to the new rows.
//!
//! - [`predict_full_graph`]: rebuild the prior over old ∪ new, run the network
//!   once over the union. New-row features can shift old rows' weights.
//! - [`predict_oos_transductive`]: freeze old rows; new rows attend to old rows
//!   through a blend of the geometric cross-affinity and embedding similarity.
//! - [`predict_prior_only`]: new rows attend to old rows by geometry alone.
//!
//! Targets of new rows are stubbed with zero. With the default zero NEW→NEW
//! block they carry no weight in any new row's solve.

use crate::graph::{GraphOptions, row_normalize, topk_mask};
use crate::kernel::{self, KernelError, PeriodGrouping, PriorConfig};
use crate::network::{NetworkError, WeightNet};
use crate::wls::{WlsConfig, WlsError, solve_local_wls_rows};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate, s};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Local WLS solve failed: {0}")]
    Wls(#[from] WlsError),
    #[error("Weight network failed: {0}")]
    Network(#[from] NetworkError),
    #[error("Prior kernel construction failed: {0}")]
    Kernel(#[from] KernelError),
    #[error("The reference panel is empty; there is nothing to borrow strength from.")]
    EmptyReference,
    #[error("The {what} has {found} rows, but {expected} were expected.")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("New rows have {found} feature columns, but the reference panel has {expected}.")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("Blend weight must lie in [0, 1]; got {0}.")]
    InvalidBlend(f64),
    #[error("NEW→NEW self weight must be finite and non-negative; got {0}.")]
    InvalidSelfWeight(f64),
    #[error("Unknown prediction mode '{0}'. Expected 'full-graph', 'transductive' or 'prior-only'.")]
    UnknownStrategy(String),
}

/// The observed rows a trained model was fitted on.
#[derive(Debug, Clone, Copy)]
pub struct ReferencePanel<'a> {
    pub x: ArrayView2<'a, f64>,
    pub y: ArrayView1<'a, f64>,
    pub coords: ArrayView2<'a, f64>,
    pub times: ArrayView1<'a, f64>,
}

/// Rows to predict. Feature columns must match the reference panel.
#[derive(Debug, Clone, Copy)]
pub struct NewRows<'a> {
    pub x: ArrayView2<'a, f64>,
    pub coords: ArrayView2<'a, f64>,
    pub times: ArrayView1<'a, f64>,
}

/// Settings shared with training: the prior, the solver, post-processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub prior: PriorConfig,
    pub wls: WlsConfig,
    pub graph: GraphOptions,
}

/// Knobs of the NEW→OLD construction in the transductive and prior-only modes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossOptions {
    /// `1.0` keeps the learned NEW→OLD weights, `0.0` the raw prior affinity.
    /// Ignored by prior-only prediction.
    pub lambda_blend: f64,
    /// Keep only this many old neighbours per new row before blending.
    pub cross_topk: Option<usize>,
    /// Diagonal of the NEW→NEW block. Zero keeps new rows from seeing each
    /// other's stub targets.
    pub new_self_weight: f64,
}

impl Default for CrossOptions {
    fn default() -> Self {
        Self {
            lambda_blend: 0.8,
            cross_topk: None,
            new_self_weight: 0.0,
        }
    }
}

impl CrossOptions {
    fn validate(&self) -> Result<(), InferenceError> {
        if !(0.0..=1.0).contains(&self.lambda_blend) {
            return Err(InferenceError::InvalidBlend(self.lambda_blend));
        }
        if !self.new_self_weight.is_finite() || self.new_self_weight < 0.0 {
            return Err(InferenceError::InvalidSelfWeight(self.new_self_weight));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OosStrategy {
    FullGraph,
    Transductive,
    PriorOnly,
}

impl FromStr for OosStrategy {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "full-graph" | "fullgraph" => Ok(Self::FullGraph),
            "transductive" | "oos-transductive" => Ok(Self::Transductive),
            "prior-only" | "prior" => Ok(Self::PriorOnly),
            _ => Err(InferenceError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for OosStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FullGraph => "full-graph",
            Self::Transductive => "transductive",
            Self::PriorOnly => "prior-only",
        };
        f.write_str(name)
    }
}

/// Predictions for the new rows, in the order they were supplied.
#[derive(Debug, Clone)]
pub struct OosPrediction {
    pub fitted: Array1<f64>,
    /// `[n_new, P]` local coefficients.
    pub betas: Array2<f64>,
    /// Combined `[n_old + n_new]²` weight matrix, old rows first.
    pub weights: Array2<f64>,
}

fn check_inputs(reference: &ReferencePanel<'_>, new: &NewRows<'_>) -> Result<(), InferenceError> {
    let n_old = reference.x.nrows();
    if n_old == 0 {
        return Err(InferenceError::EmptyReference);
    }
    let n_new = new.x.nrows();
    for (what, expected, found) in [
        ("reference target vector", n_old, reference.y.len()),
        ("reference coordinate matrix", n_old, reference.coords.nrows()),
        ("reference time vector", n_old, reference.times.len()),
        ("new coordinate matrix", n_new, new.coords.nrows()),
        ("new time vector", n_new, new.times.len()),
    ] {
        if found != expected {
            return Err(InferenceError::LengthMismatch {
                what,
                expected,
                found,
            });
        }
    }
    for coords in [reference.coords.view(), new.coords.view()] {
        if coords.ncols() != 2 {
            return Err(KernelError::BadCoordinateShape(coords.ncols()).into());
        }
    }
    if new.x.ncols() != reference.x.ncols() {
        return Err(InferenceError::FeatureMismatch {
            expected: reference.x.ncols(),
            found: new.x.ncols(),
        });
    }
    Ok(())
}

/// Stacks old and new rows: features and targets (new targets stubbed at zero).
fn stacked_design(reference: &ReferencePanel<'_>, new: &NewRows<'_>) -> (Array2<f64>, Array1<f64>) {
    let x = concatenate![Axis(0), reference.x, new.x];
    let stub = Array1::<f64>::zeros(new.x.nrows());
    let y = concatenate![Axis(0), reference.y, stub];
    (x, y)
}

fn new_row_indices(reference: &ReferencePanel<'_>, new: &NewRows<'_>) -> Vec<usize> {
    let n_old = reference.x.nrows();
    (n_old..n_old + new.x.nrows()).collect()
}

fn solve_new_rows(
    reference: &ReferencePanel<'_>,
    new: &NewRows<'_>,
    weights: Array2<f64>,
    wls: &WlsConfig,
) -> Result<OosPrediction, InferenceError> {
    let (x, y) = stacked_design(reference, new);
    let rows = new_row_indices(reference, new);
    let fit = solve_local_wls_rows(x.view(), y.view(), weights.view(), &rows, wls)?;
    Ok(OosPrediction {
        fitted: fit.fitted,
        betas: fit.betas,
        weights,
    })
}

/// Row-normalized NEW→OLD geometric affinity with bandwidths estimated from
/// the reference panel alone.
pub fn prior_cross_block(
    reference: &ReferencePanel<'_>,
    new: &NewRows<'_>,
    prior: &PriorConfig,
    cross_topk: Option<usize>,
) -> Array2<f64> {
    let grouping = PeriodGrouping::new(reference.times);
    let bandwidths = kernel::estimate_bandwidths(
        &grouping.coord_blocks(reference.coords),
        &grouping.times,
        prior,
    );
    let mut affinity = kernel::cross_affinity(
        new.coords,
        new.times,
        reference.coords,
        reference.times,
        &bandwidths,
    );
    if let Some(k) = cross_topk.filter(|&k| k > 0) {
        let n_old = reference.x.nrows();
        let k = k.min(n_old.saturating_sub(1).max(1));
        let mask = topk_mask(affinity.view(), k);
        affinity *= &mask;
    }
    row_normalize(affinity.view())
}

/// Writes `old_block` into the top-left corner and the row-normalized
/// `[new_to_old | self·I]` into the new rows.
fn assemble_weights(old_block: ArrayView2<f64>, new_to_old: ArrayView2<f64>, new_self_weight: f64) -> Array2<f64> {
    let n_old = old_block.nrows();
    let n_new = new_to_old.nrows();
    let mut full = Array2::zeros((n_old + n_new, n_old + n_new));
    full.slice_mut(s![..n_old, ..n_old]).assign(&old_block);

    let mut new_rows = Array2::zeros((n_new, n_old + n_new));
    new_rows.slice_mut(s![.., ..n_old]).assign(&new_to_old);
    if new_self_weight > 0.0 {
        new_rows
            .slice_mut(s![.., n_old..])
            .diag_mut()
            .fill(new_self_weight);
    }
    full.slice_mut(s![n_old.., ..]).assign(&row_normalize(new_rows.view()));
    full
}

/// Rebuilds the prior over old ∪ new and runs the trained network once over
/// the union.
pub fn predict_full_graph(
    net: &WeightNet,
    reference: &ReferencePanel<'_>,
    new: &NewRows<'_>,
    config: &InferenceConfig,
) -> Result<OosPrediction, InferenceError> {
    check_inputs(reference, new)?;
    let coords = concatenate![Axis(0), reference.coords, new.coords];
    let times = concatenate![Axis(0), reference.times, new.times];
    let prior = kernel::kernel_for_rows(coords.view(), times.view(), &config.prior)?;

    let (x, _) = stacked_design(reference, new);
    let (raw, _) = net.forward(x.view(), prior.view())?;
    let weights = config.graph.apply(&raw);
    log::info!(
        "Full-graph prediction: {} reference rows, {} new rows",
        reference.x.nrows(),
        new.x.nrows()
    );
    solve_new_rows(reference, new, weights, &config.wls)
}

/// Freezes the reference rows' learned weights and derives NEW→OLD weights by
/// blending the geometric cross-affinity with embedding similarity, using the
/// network's own `α` and `τ`.
pub fn predict_oos_transductive(
    net: &WeightNet,
    reference: &ReferencePanel<'_>,
    new: &NewRows<'_>,
    config: &InferenceConfig,
    options: &CrossOptions,
) -> Result<OosPrediction, InferenceError> {
    check_inputs(reference, new)?;
    options.validate()?;

    let old_prior = kernel::kernel_for_rows(reference.coords, reference.times, &config.prior)?;
    let (old_raw, old_embeddings) = net.forward(reference.x, old_prior.view())?;
    let old_weights = config.graph.apply(&old_raw);

    let prior_cross = prior_cross_block(reference, new, &config.prior, options.cross_topk);
    let new_embeddings = net.embed(new.x)?;
    let learned = net.cross_weights(
        new_embeddings.view(),
        old_embeddings.view(),
        prior_cross.view(),
    )?;
    let lambda = options.lambda_blend;
    let new_to_old = learned * lambda + &prior_cross * (1.0 - lambda);

    log::info!(
        "Transductive prediction: {} reference rows frozen, {} new rows, λ = {:.2}",
        reference.x.nrows(),
        new.x.nrows(),
        lambda
    );
    let weights = assemble_weights(old_weights.view(), new_to_old.view(), options.new_self_weight);
    solve_new_rows(reference, new, weights, &config.wls)
}

/// NEW→OLD weights from geometry alone; no network involvement. Old rows keep
/// identity weights, which no new-row prediction depends on.
pub fn predict_prior_only(
    reference: &ReferencePanel<'_>,
    new: &NewRows<'_>,
    config: &InferenceConfig,
    options: &CrossOptions,
) -> Result<OosPrediction, InferenceError> {
    check_inputs(reference, new)?;
    options.validate()?;
    let prior_cross = prior_cross_block(reference, new, &config.prior, options.cross_topk);
    let identity = Array2::<f64>::eye(reference.x.nrows());
    let weights = assemble_weights(identity.view(), prior_cross.view(), options.new_self_weight);
    solve_new_rows(reference, new, weights, &config.wls)
}

/// Dispatches to the requested prediction policy.
pub fn predict_new_rows(
    strategy: OosStrategy,
    net: &WeightNet,
    reference: &ReferencePanel<'_>,
    new: &NewRows<'_>,
    config: &InferenceConfig,
    options: &CrossOptions,
) -> Result<OosPrediction, InferenceError> {
    match strategy {
        OosStrategy::FullGraph => predict_full_graph(net, reference, new, config),
        OosStrategy::Transductive => predict_oos_transductive(net, reference, new, config, options),
        OosStrategy::PriorOnly => predict_prior_only(reference, new, config, options),
    }
}
