//! # Graph Post-Processing
//!
//! Row-wise transforms shared by the prior kernel, the weight-generating network,
//! training, and out-of-sample inference. Every transform here maps a nonnegative
//! N×M matrix to a row-stochastic one (rows with no positive mass stay zero).
//!
//! The traced variants record what the forward transform did so the training
//! loop can push gradients back through the same operations.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Added to every row-sum denominator so normalization never divides by a
/// vanishing quantity.
pub const ROW_EPS: f64 = 1e-12;

/// Optional post-processing of a learned weight matrix.
///
/// Applied after the network forward pass, never inside it. Top-k pruning runs
/// first, symmetrization second; each is followed by re-normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphOptions {
    /// Keep only the `k` largest entries per row.
    pub topk: Option<usize>,
    /// Average with the transpose before re-normalizing.
    pub symmetrize: bool,
}

impl GraphOptions {
    pub fn apply(&self, w: &Array2<f64>) -> Array2<f64> {
        let mut out = match self.topk {
            Some(k) => topk_rows(w.view(), k),
            None => w.clone(),
        };
        if self.symmetrize {
            out = symmetrize_rows(out.view());
        }
        out
    }

    /// Same as [`GraphOptions::apply`] but keeps the intermediate state needed by
    /// [`GraphTrace::backward`].
    pub(crate) fn apply_traced(&self, w: &Array2<f64>) -> (Array2<f64>, GraphTrace) {
        let mut stages = Vec::new();
        let mut out = w.clone();
        if let Some(k) = self.topk {
            let mask = topk_mask(out.view(), k);
            let pruned = &out * &mask;
            let (normalized, denom) = normalize_with_denominators(pruned.view());
            out = normalized.clone();
            stages.push(Stage::TopK {
                mask,
                normalized,
                denom,
            });
        }
        if self.symmetrize {
            let sym = symmetric_part(out.view());
            let (normalized, denom) = normalize_with_denominators(sym.view());
            out = normalized.clone();
            stages.push(Stage::Symmetrize { normalized, denom });
        }
        (out, GraphTrace { stages })
    }
}

enum Stage {
    TopK {
        mask: Array2<f64>,
        normalized: Array2<f64>,
        denom: Array1<f64>,
    },
    Symmetrize {
        normalized: Array2<f64>,
        denom: Array1<f64>,
    },
}

/// Record of the post-processing stages applied during a traced forward pass.
pub(crate) struct GraphTrace {
    stages: Vec<Stage>,
}

impl GraphTrace {
    /// Maps a gradient with respect to the post-processed matrix back to a
    /// gradient with respect to the raw network output.
    pub(crate) fn backward(&self, grad: Array2<f64>) -> Array2<f64> {
        let mut grad = grad;
        for stage in self.stages.iter().rev() {
            grad = match stage {
                Stage::TopK {
                    mask,
                    normalized,
                    denom,
                } => normalize_backward(normalized, denom, &grad) * mask,
                Stage::Symmetrize { normalized, denom } => {
                    let g = normalize_backward(normalized, denom, &grad);
                    (&g + &g.t()) * 0.5
                }
            };
        }
        grad
    }
}

fn row_denominator(sum: f64) -> f64 {
    if sum == 0.0 { 1.0 } else { sum + ROW_EPS }
}

pub(crate) fn normalize_with_denominators(w: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
    let denom = w.sum_axis(Axis(1)).mapv(row_denominator);
    let normalized = &w / &denom.view().insert_axis(Axis(1));
    (normalized, denom)
}

/// Divides each row by its sum. Rows summing to exactly zero are left untouched.
pub fn row_normalize(w: ArrayView2<f64>) -> Array2<f64> {
    normalize_with_denominators(w).0
}

/// Numerically stable softmax along each row.
pub fn row_softmax(logits: ArrayView2<f64>) -> Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        if !max.is_finite() {
            row.fill(0.0);
            continue;
        }
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

/// Gradient of a loss with respect to softmax logits, given the softmax output
/// and the gradient with respect to that output.
pub(crate) fn softmax_backward(w: &Array2<f64>, grad_w: &Array2<f64>) -> Array2<f64> {
    let inner = (w * grad_w).sum_axis(Axis(1));
    let mut out = grad_w - &inner.insert_axis(Axis(1));
    out *= w;
    out
}

/// Gradient through `x / (rowsum(x) + eps)`, given the normalized output.
pub(crate) fn normalize_backward(
    normalized: &Array2<f64>,
    denom: &Array1<f64>,
    grad: &Array2<f64>,
) -> Array2<f64> {
    let inner = (normalized * grad).sum_axis(Axis(1));
    let mut out = grad - &inner.insert_axis(Axis(1));
    Zip::from(out.rows_mut())
        .and(denom)
        .for_each(|mut row, &d| row /= d);
    out
}

/// 0/1 mask selecting the `k` largest entries in every row. Ties keep the
/// lower column index.
pub(crate) fn topk_mask(w: ArrayView2<f64>, k: usize) -> Array2<f64> {
    let ncols = w.ncols();
    let k_eff = k.clamp(1, ncols.max(1));
    let mut mask = Array2::zeros(w.raw_dim());
    let mut order: Vec<usize> = Vec::with_capacity(ncols);
    for (row, mut mask_row) in w.rows().into_iter().zip(mask.rows_mut()) {
        order.clear();
        order.extend(0..ncols);
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
        for &j in order.iter().take(k_eff) {
            mask_row[j] = 1.0;
        }
    }
    mask
}

/// Keeps the `k` largest entries of each row, zeroes the rest, re-normalizes.
///
/// `k` is clamped to `[1, ncols]`.
pub fn topk_rows(w: ArrayView2<f64>, k: usize) -> Array2<f64> {
    let pruned = &w * &topk_mask(w, k);
    row_normalize(pruned.view())
}

fn symmetric_part(w: ArrayView2<f64>) -> Array2<f64> {
    let mut sym = (&w + &w.t()) * 0.5;
    sym.mapv_inplace(|v| v.max(0.0));
    sym
}

/// Averages a square matrix with its transpose, clamps negative artifacts to
/// zero, and re-normalizes the rows.
pub fn symmetrize_rows(w: ArrayView2<f64>) -> Array2<f64> {
    row_normalize(symmetric_part(w).view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn assert_row_stochastic(w: &Array2<f64>) {
        for row in w.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
            assert!(row.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn softmax_rows_sum_to_one_even_for_extreme_logits() {
        let logits = array![[1000.0, 1001.0, 999.0], [-27.6, 0.0, -27.6], [0.0, 0.0, 0.0]];
        let w = row_softmax(logits.view());
        assert_row_stochastic(&w);
        assert_abs_diff_eq!(w[[2, 0]], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn topk_keeps_at_most_k_entries() {
        let w = array![
            [0.1, 0.4, 0.2, 0.3],
            [0.25, 0.25, 0.25, 0.25],
            [0.7, 0.1, 0.1, 0.1]
        ];
        let pruned = topk_rows(w.view(), 2);
        assert_row_stochastic(&pruned);
        for row in pruned.rows() {
            assert!(row.iter().filter(|&&v| v > 0.0).count() <= 2);
        }
        assert_abs_diff_eq!(pruned[[0, 1]], 0.4 / 0.7, epsilon = 1e-9);
        assert_eq!(pruned[[0, 0]], 0.0);
    }

    #[test]
    fn topk_larger_than_width_is_plain_normalization() {
        let w = array![[1.0, 2.0, 1.0], [0.0, 3.0, 1.0], [2.0, 2.0, 0.0]];
        assert_eq!(topk_rows(w.view(), 10), row_normalize(w.view()));
    }

    #[test]
    fn symmetrize_is_nonnegative_and_row_stochastic() {
        let w = array![[0.5, 0.5, 0.0], [0.1, 0.8, 0.1], [0.0, 0.9, 0.1]];
        let sym_part = symmetric_part(w.view());
        assert_eq!(sym_part, sym_part.t());
        let out = symmetrize_rows(w.view());
        assert_row_stochastic(&out);
    }

    #[test]
    fn renormalizing_a_stochastic_matrix_is_a_no_op() {
        let w = array![[0.2, 0.3, 0.5], [1.0, 0.0, 0.0], [0.25, 0.25, 0.5]];
        let again = row_normalize(w.view());
        for (a, b) in again.iter().zip(w.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn zero_rows_stay_zero() {
        let w = array![[0.0, 0.0], [1.0, 3.0]];
        let out = row_normalize(w.view());
        assert_eq!(out.row(0).to_vec(), vec![0.0, 0.0]);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn traced_post_processing_matches_untraced() {
        let w = array![[0.2, 0.5, 0.3], [0.6, 0.3, 0.1], [0.1, 0.1, 0.8]];
        let options = GraphOptions {
            topk: Some(2),
            symmetrize: true,
        };
        let (traced, _) = options.apply_traced(&w);
        assert_eq!(traced, options.apply(&w));
    }

    #[test]
    fn post_processing_backward_matches_finite_differences() {
        let w = array![[0.2, 0.5, 0.3], [0.6, 0.3, 0.1], [0.15, 0.05, 0.8]];
        let direction = array![[0.3, -1.0, 2.0], [0.7, 0.1, -0.4], [1.5, -0.2, 0.9]];
        let options = GraphOptions {
            topk: Some(2),
            symmetrize: true,
        };
        let objective = |m: &Array2<f64>| (&options.apply(m) * &direction).sum();
        let (_, trace) = options.apply_traced(&w);
        let analytic = trace.backward(direction.clone());

        let h = 1e-6;
        for i in 0..3 {
            for j in 0..3 {
                let mut plus = w.clone();
                plus[[i, j]] += h;
                let mut minus = w.clone();
                minus[[i, j]] -= h;
                let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
                assert_abs_diff_eq!(analytic[[i, j]], numeric, epsilon = 1e-5);
            }
        }
    }
}
