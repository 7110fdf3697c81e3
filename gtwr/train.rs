//! # End-to-End Training
//!
//! Optimizes the weight-generating network through the local WLS solution:
//!
//! 1.  **Forward:** encoder → learned weights → optional graph post-processing
//!     → one local WLS solve per row.
//! 2.  **Loss:** training-row MSE, minus a scaled mean row entropy of the
//!     weights (rewarding diffuse rows), plus a within-period smoothness
//!     penalty on neighbouring coefficient vectors.
//! 3.  **Backward:** the WLS adjoint gives `∂L/∂W`, which flows back through the
//!     post-processing and the network by hand-derived gradients.
//! 4.  **Step:** global-norm clipping to 1.0, then Adam.
//! 5.  **Evaluate / checkpoint / early stop**, and finally restore the best
//!     snapshot and run one more forward pass for reporting.

use crate::graph::{GraphOptions, normalize_backward, normalize_with_denominators};
use crate::kernel::{KernelError, PriorConfig};
use crate::network::{NetParams, NetworkError, WeightNet};
use crate::optim::{Adam, clip_grad_norm};
use crate::panel::{Panel, PeriodLayout};
use crate::wls::{WlsConfig, WlsError, WlsFit, solve_local_wls, solve_local_wls_traced};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every optimizer step is preceded by clipping the global gradient norm to this.
pub const MAX_GRAD_NORM: f64 = 1.0;

/// A score must beat the best by more than this to count as an improvement.
const IMPROVEMENT_EPS: f64 = 1e-6;

const ENTROPY_EPS: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Local WLS solve failed: {0}")]
    Wls(#[from] WlsError),
    #[error("Weight network failed: {0}")]
    Network(#[from] NetworkError),
    #[error("Prior kernel construction failed: {0}")]
    Kernel(#[from] KernelError),
    #[error("No training rows were supplied; the supervised loss would be undefined.")]
    NoTrainingRows,
    #[error("Row index {index} is out of range for a panel of {rows} rows.")]
    RowOutOfRange { index: usize, rows: usize },
    #[error(
        "Period layout of {periods} periods × {rows_per_period} rows does not match the {rows} observations."
    )]
    LayoutMismatch {
        periods: usize,
        rows_per_period: usize,
        rows: usize,
    },
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Hyperparameters of the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Coupled L2 penalty applied by the optimizer.
    pub weight_decay: f64,
    /// Scale of the entropy reward on weight rows.
    pub entropy_weight: f64,
    /// Scale of the within-period coefficient smoothness penalty.
    pub smooth_weight: f64,
    pub early_stopping: bool,
    /// Consecutive non-improving epochs tolerated before stopping.
    pub patience: usize,
    /// Log progress every this many epochs (and on the first).
    pub log_every: usize,
    pub wls: WlsConfig,
    pub graph: GraphOptions,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 200,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            entropy_weight: 5e-3,
            smooth_weight: 1e-3,
            early_stopping: true,
            patience: 80,
            log_every: 25,
            wls: WlsConfig::default(),
            graph: GraphOptions::default(),
        }
    }
}

impl TrainConfig {
    /// Gentler defaults for warm-started fine-tuning.
    pub fn finetune() -> Self {
        Self {
            epochs: 150,
            learning_rate: 1e-4,
            patience: 40,
            ..Self::default()
        }
    }
}

/// Disjoint row subsets. Only `train` feeds the loss.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowSplits {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

/// Read-only inputs of one training run.
#[derive(Clone, Copy)]
pub struct TrainingProblem<'a> {
    pub x: ArrayView2<'a, f64>,
    pub y: ArrayView1<'a, f64>,
    pub prior: ArrayView2<'a, f64>,
    pub splits: &'a RowSplits,
    /// Period structure for the smoothness penalty; `None` skips the penalty.
    pub layout: Option<PeriodLayout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub rmse_train: f64,
    pub rmse_validation: Option<f64>,
    pub rmse_test: Option<f64>,
    pub alpha: f64,
    pub temperature: f64,
}

/// Everything produced by a training run, computed with the restored best
/// parameters.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub weights: Array2<f64>,
    pub fitted: Array1<f64>,
    pub betas: Array2<f64>,
    pub history: Vec<EpochRecord>,
    pub best: Option<NetParams>,
    pub best_score: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct LossBreakdown {
    supervised: f64,
    entropy: f64,
    smoothness: f64,
}

impl LossBreakdown {
    fn total(&self) -> f64 {
        self.supervised + self.entropy + self.smoothness
    }
}

fn rmse(fitted: ArrayView1<f64>, y: ArrayView1<f64>, rows: &[usize]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let sse: f64 = rows
        .iter()
        .map(|&i| {
            let r = fitted[i] - y[i];
            r * r
        })
        .sum();
    Some((sse / rows.len() as f64).sqrt())
}

/// `−w_ent · mean_i H(row_i)` and its gradient with respect to `w`.
fn entropy_term(w: &Array2<f64>, entropy_weight: f64) -> (f64, Array2<f64>) {
    let n = w.nrows().max(1) as f64;
    let (wn, denom) = normalize_with_denominators(w.view());
    let entropy_sum: f64 = wn.iter().map(|&v| -v * (v + ENTROPY_EPS).ln()).sum();
    let loss = -entropy_weight * entropy_sum / n;
    let grad_wn = wn.mapv(|v| entropy_weight / n * ((v + ENTROPY_EPS).ln() + v / (v + ENTROPY_EPS)));
    (loss, normalize_backward(&wn, &denom, &grad_wn))
}

/// Within-period `Σ_ij A[i,j]·‖β_i − β_j‖²`, scaled, accumulating its gradient
/// into `grad_beta`.
fn smoothness_term(
    betas: &Array2<f64>,
    prior: ArrayView2<f64>,
    layout: &PeriodLayout,
    smooth_weight: f64,
    grad_beta: &mut Array2<f64>,
) -> f64 {
    let mut penalty = 0.0;
    for period in 0..layout.periods {
        let range = layout.period_range(period);
        for i in range.clone() {
            for j in range.clone() {
                let (a_ij, a_ji) = (prior[[i, j]], prior[[j, i]]);
                if i == j || (a_ij == 0.0 && a_ji == 0.0) {
                    continue;
                }
                let diff = &betas.row(i) - &betas.row(j);
                penalty += a_ij * diff.dot(&diff);
                grad_beta
                    .row_mut(i)
                    .scaled_add(2.0 * smooth_weight * (a_ij + a_ji), &diff);
            }
        }
    }
    smooth_weight * penalty
}

fn validate(problem: &TrainingProblem<'_>, config: &TrainConfig) -> Result<(), TrainingError> {
    let n = problem.x.nrows();
    config.wls.validate()?;
    if problem.y.len() != n {
        return Err(TrainingError::DimensionMismatch(format!(
            "X has {n} rows but y has {}",
            problem.y.len()
        )));
    }
    if problem.prior.dim() != (n, n) {
        return Err(TrainingError::DimensionMismatch(format!(
            "prior has shape {:?}, expected ({n}, {n})",
            problem.prior.dim()
        )));
    }
    if problem.splits.train.is_empty() {
        return Err(TrainingError::NoTrainingRows);
    }
    let splits = problem.splits;
    if let Some(&index) = splits
        .train
        .iter()
        .chain(&splits.validation)
        .chain(&splits.test)
        .find(|&&i| i >= n)
    {
        return Err(TrainingError::RowOutOfRange { index, rows: n });
    }
    if let Some(layout) = problem.layout {
        if layout.total_rows() != n {
            return Err(TrainingError::LayoutMismatch {
                periods: layout.periods,
                rows_per_period: layout.rows_per_period,
                rows: n,
            });
        }
    }
    Ok(())
}

/// Composite loss and its gradient with respect to every network parameter.
fn loss_and_gradient(
    net: &WeightNet,
    problem: &TrainingProblem<'_>,
    config: &TrainConfig,
) -> Result<(LossBreakdown, NetParams), TrainingError> {
    let (x, y) = (problem.x, problem.y);
    let trace = net.forward_traced(x, problem.prior)?;
    let (weights, graph_trace) = config.graph.apply_traced(&trace.weights);
    let (fit, solves) = solve_local_wls_traced(x, y, weights.view(), &config.wls)?;

    let mut grad_beta = Array2::<f64>::zeros(fit.betas.raw_dim());
    let train = &problem.splits.train;
    let n_train = train.len() as f64;
    let mut supervised = 0.0;
    for &i in train {
        let r = fit.fitted[i] - y[i];
        supervised += r * r;
        grad_beta.row_mut(i).scaled_add(2.0 * r / n_train, &x.row(i));
    }
    supervised /= n_train;

    let (entropy, mut grad_weights) = entropy_term(&weights, config.entropy_weight);

    let smoothness = match problem.layout {
        Some(layout) => smoothness_term(
            &fit.betas,
            problem.prior,
            &layout,
            config.smooth_weight,
            &mut grad_beta,
        ),
        None => 0.0,
    };

    // Adjoint of each local solve.
    let row_grads: Vec<Option<Array1<f64>>> = solves
        .par_iter()
        .enumerate()
        .map(|(i, solve)| {
            let g = grad_beta.row(i);
            if g.iter().all(|&v| v == 0.0) {
                None
            } else {
                Some(solve.weight_gradient(x, y, g))
            }
        })
        .collect();
    for (mut row, grad) in grad_weights.rows_mut().into_iter().zip(row_grads) {
        if let Some(grad) = grad {
            row += &grad;
        }
    }

    let grad_raw = graph_trace.backward(grad_weights);
    let grads = net.backward(&trace, &grad_raw);
    Ok((
        LossBreakdown {
            supervised,
            entropy,
            smoothness,
        },
        grads,
    ))
}

/// One no-gradient pass: learned weights (post-processed) and the local fits.
pub fn evaluate(
    net: &WeightNet,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior: ArrayView2<f64>,
    wls: &WlsConfig,
    graph: &GraphOptions,
) -> Result<(Array2<f64>, WlsFit), TrainingError> {
    let (raw, _) = net.forward(x, prior)?;
    let weights = graph.apply(&raw);
    let fit = solve_local_wls(x, y, weights.view(), wls)?;
    Ok((weights, fit))
}

/// Trains `net` in place and leaves it holding the best-scoring parameters.
///
/// The score is validation RMSE when validation rows exist, training RMSE
/// otherwise.
pub fn train_model(
    net: &mut WeightNet,
    problem: &TrainingProblem<'_>,
    config: &TrainConfig,
) -> Result<TrainingOutcome, TrainingError> {
    validate(problem, config)?;
    log::info!(
        "Starting training: {} rows, {} features, {} train / {} validation / {} test rows, WLS {}",
        problem.x.nrows(),
        problem.x.ncols(),
        problem.splits.train.len(),
        problem.splits.validation.len(),
        problem.splits.test.len(),
        config.wls.kind
    );

    let mut optimizer = Adam::new(net.params().len(), config.learning_rate, config.weight_decay);
    let mut best_score = f64::INFINITY;
    let mut best: Option<NetParams> = None;
    let mut stale_epochs = 0;
    let mut history = Vec::with_capacity(config.epochs);
    let log_every = config.log_every.max(1);

    for epoch in 1..=config.epochs {
        let (loss, grads) = loss_and_gradient(net, problem, config)?;
        let mut flat_grads = grads.to_flat();
        clip_grad_norm(&mut flat_grads, MAX_GRAD_NORM);
        let mut flat_params = net.params().to_flat();
        optimizer.step(&mut flat_params, &flat_grads);
        net.params_mut().assign_flat(flat_params.view())?;

        let (_, fit) = evaluate(
            net,
            problem.x,
            problem.y,
            problem.prior,
            &config.wls,
            &config.graph,
        )?;
        let splits = problem.splits;
        let rmse_train = rmse(fit.fitted.view(), problem.y, &splits.train).unwrap_or(f64::NAN);
        let rmse_validation = rmse(fit.fitted.view(), problem.y, &splits.validation);
        let rmse_test = rmse(fit.fitted.view(), problem.y, &splits.test);

        let record = EpochRecord {
            epoch,
            loss: loss.total(),
            rmse_train,
            rmse_validation,
            rmse_test,
            alpha: net.alpha(),
            temperature: net.temperature(),
        };
        if epoch % log_every == 0 || epoch == 1 {
            log::info!(
                "Epoch {:>4} | Loss {:.4} (sup {:.4}, ent {:.4}, smooth {:.4}) | RMSE train {:.4} | val {} | test {} | α {:.3} | τ {:.3}",
                epoch,
                record.loss,
                loss.supervised,
                loss.entropy,
                loss.smoothness,
                rmse_train,
                format_metric(rmse_validation),
                format_metric(rmse_test),
                record.alpha,
                record.temperature
            );
        }
        history.push(record);

        let score = rmse_validation.unwrap_or(rmse_train);
        if score < best_score - IMPROVEMENT_EPS {
            best_score = score;
            best = Some(net.snapshot());
            stale_epochs = 0;
        } else {
            stale_epochs += 1;
            if config.early_stopping && stale_epochs >= config.patience {
                log::info!("Early stopping at epoch {epoch}");
                break;
            }
        }
    }

    if let Some(snapshot) = &best {
        net.restore(snapshot);
    }

    let (weights, fit) = evaluate(
        net,
        problem.x,
        problem.y,
        problem.prior,
        &config.wls,
        &config.graph,
    )?;
    log::info!(
        "Training finished after {} epochs; best score {:.6}",
        history.len(),
        best_score
    );

    Ok(TrainingOutcome {
        weights,
        fitted: fit.fitted,
        betas: fit.betas,
        history,
        best,
        best_score,
    })
}

fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}

/// Result of [`finetune_with_future`]: the training outcome plus the prior
/// built over the extended panel.
#[derive(Debug, Clone)]
pub struct FinetuneOutcome {
    pub outcome: TrainingOutcome,
    pub prior: Array2<f64>,
}

/// Warm-started transductive fine-tuning on a panel that already contains the
/// future period(s).
///
/// The prior is rebuilt over the whole panel, the loss only sees `train_rows`,
/// the score uses `validation_rows`, and `future_rows` are reported in the test
/// slot of the history. Targets of future rows are used as given in the local
/// solves; callers without future labels should pass placeholders.
pub fn finetune_with_future(
    net: &mut WeightNet,
    panel: &Panel,
    prior_config: &PriorConfig,
    train_rows: &[usize],
    validation_rows: &[usize],
    future_rows: &[usize],
    config: &TrainConfig,
) -> Result<FinetuneOutcome, TrainingError> {
    let prior = panel.prior_kernel(prior_config)?;
    let splits = RowSplits {
        train: train_rows.to_vec(),
        validation: validation_rows.to_vec(),
        test: future_rows.to_vec(),
    };
    let problem = TrainingProblem {
        x: panel.x.view(),
        y: panel.y.view(),
        prior: prior.view(),
        splits: &splits,
        layout: Some(panel.layout()),
    };
    let outcome = train_model(net, &problem, config)?;
    Ok(FinetuneOutcome { outcome, prior })
}
