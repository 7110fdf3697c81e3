//! # Weight-Generating Network
//!
//! Turns features and a geometric prior into a row-stochastic weighting matrix:
//!
//! ```text
//! H      = Linear(ReLU(Linear(X)))
//! S      = normalize(H) · normalize(H)ᵀ                 (cosine similarity)
//! logits = α · ln(A_prior + ε) + (1 − α) · S / τ
//! W      = row_softmax(logits)
//! ```
//!
//! `τ = clamp(exp(log_temperature), 0.1, 10)` and `α = sigmoid(raw_alpha)` are
//! learned together with the encoder. Gradients are derived by hand; see
//! [`WeightNet::backward`].

use crate::graph::{row_softmax, softmax_backward};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_TEMPERATURE: f64 = 0.1;
pub const MAX_TEMPERATURE: f64 = 10.0;

/// Lower bound on embedding norms during L2 normalization.
const NORM_EPS: f64 = 1e-12;
/// Added to the prior before taking logs.
const LOG_EPS: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Feature matrix has {found} columns, but the network was built for {expected}.")]
    FeatureMismatch { found: usize, expected: usize },
    #[error("Prior matrix has shape {found:?}, expected {expected:?}.")]
    PriorShape {
        found: (usize, usize),
        expected: (usize, usize),
    },
    #[error("Invalid network configuration: {0}")]
    InvalidConfig(String),
    #[error("Flat parameter vector has {found} entries, expected {expected}.")]
    ParameterLength { found: usize, expected: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub hidden_dim: usize,
    pub embedding_dim: usize,
    pub initial_temperature: f64,
    /// Starting blend weight on the prior, in (0, 1).
    pub initial_alpha: f64,
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 32,
            embedding_dim: 16,
            initial_temperature: 1.2,
            initial_alpha: 0.30,
            seed: 42,
        }
    }
}

/// The complete trainable state. Also used as the gradient container, and as
/// the checkpoint snapshot (always an independent deep copy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetParams {
    /// Input → hidden, shape `[p, hidden]`.
    pub w1: Array2<f64>,
    pub b1: Array1<f64>,
    /// Hidden → embedding, shape `[hidden, embedding]`.
    pub w2: Array2<f64>,
    pub b2: Array1<f64>,
    pub log_temperature: f64,
    pub raw_alpha: f64,
}

impl NetParams {
    pub fn initialize(input_dim: usize, config: &NetworkConfig) -> Result<Self, NetworkError> {
        if input_dim == 0 || config.hidden_dim == 0 || config.embedding_dim == 0 {
            return Err(NetworkError::InvalidConfig(format!(
                "dimensions must be positive (input {input_dim}, hidden {}, embedding {})",
                config.hidden_dim, config.embedding_dim
            )));
        }
        if !(config.initial_temperature > 0.0 && config.initial_temperature.is_finite()) {
            return Err(NetworkError::InvalidConfig(format!(
                "initial temperature must be positive, got {}",
                config.initial_temperature
            )));
        }
        if !(config.initial_alpha > 0.0 && config.initial_alpha < 1.0) {
            return Err(NetworkError::InvalidConfig(format!(
                "initial alpha must lie strictly between 0 and 1, got {}",
                config.initial_alpha
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        // Kaiming-uniform with a = √5 reduces to ±1/√fan_in.
        let bound1 = 1.0 / (input_dim as f64).sqrt();
        let w1 = Array2::from_shape_fn((input_dim, config.hidden_dim), |_| {
            rng.gen_range(-bound1..bound1)
        });
        // Xavier-uniform.
        let bound2 = (6.0 / (config.hidden_dim + config.embedding_dim) as f64).sqrt();
        let w2 = Array2::from_shape_fn((config.hidden_dim, config.embedding_dim), |_| {
            rng.gen_range(-bound2..bound2)
        });
        let alpha = config.initial_alpha;
        Ok(Self {
            w1,
            b1: Array1::zeros(config.hidden_dim),
            w2,
            b2: Array1::zeros(config.embedding_dim),
            log_temperature: config.initial_temperature.ln(),
            raw_alpha: (alpha / (1.0 - alpha)).ln(),
        })
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            w1: Array2::zeros(self.w1.raw_dim()),
            b1: Array1::zeros(self.b1.len()),
            w2: Array2::zeros(self.w2.raw_dim()),
            b2: Array1::zeros(self.b2.len()),
            log_temperature: 0.0,
            raw_alpha: 0.0,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.w1.nrows()
    }

    pub fn temperature(&self) -> f64 {
        self.log_temperature
            .exp()
            .clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
    }

    pub fn alpha(&self) -> f64 {
        1.0 / (1.0 + (-self.raw_alpha).exp())
    }

    /// Number of scalar parameters.
    pub fn len(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len() + self.b2.len() + 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens in the fixed order `w1, b1, w2, b2, log_temperature, raw_alpha`.
    pub fn to_flat(&self) -> Array1<f64> {
        self.w1
            .iter()
            .chain(self.b1.iter())
            .chain(self.w2.iter())
            .chain(self.b2.iter())
            .copied()
            .chain([self.log_temperature, self.raw_alpha])
            .collect()
    }

    /// Inverse of [`NetParams::to_flat`].
    pub fn assign_flat(&mut self, flat: ArrayView1<f64>) -> Result<(), NetworkError> {
        if flat.len() != self.len() {
            return Err(NetworkError::ParameterLength {
                found: flat.len(),
                expected: self.len(),
            });
        }
        let n = flat.len();
        for (dst, &value) in self
            .w1
            .iter_mut()
            .chain(self.b1.iter_mut())
            .chain(self.w2.iter_mut())
            .chain(self.b2.iter_mut())
            .zip(flat.iter())
        {
            *dst = value;
        }
        self.log_temperature = flat[n - 2];
        self.raw_alpha = flat[n - 1];
        Ok(())
    }
}

/// Divides each row by `max(‖row‖, NORM_EPS)`. Returns the normalized rows and
/// the raw norms.
pub fn l2_normalize_rows(h: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
    let norms = h.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    let denom = norms.mapv(|n| n.max(NORM_EPS));
    let normalized = &h / &denom.insert_axis(Axis(1));
    (normalized, norms)
}

/// `α · ln(prior + ε) + (1 − α) · similarity / τ`, element-wise.
pub fn blend_logits(
    prior: ArrayView2<f64>,
    similarity: ArrayView2<f64>,
    alpha: f64,
    temperature: f64,
) -> Array2<f64> {
    let mut out = Array2::zeros(prior.raw_dim());
    Zip::from(&mut out)
        .and(prior)
        .and(similarity)
        .for_each(|o, &p, &s| *o = alpha * (p + LOG_EPS).ln() + (1.0 - alpha) * s / temperature);
    out
}

/// Intermediate values of one forward pass, kept for [`WeightNet::backward`].
pub(crate) struct ForwardTrace {
    x: Array2<f64>,
    z1: Array2<f64>,
    a1: Array2<f64>,
    norms: Array1<f64>,
    hn: Array2<f64>,
    similarity: Array2<f64>,
    log_prior: Array2<f64>,
    pub weights: Array2<f64>,
    pub embeddings: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct WeightNet {
    params: NetParams,
}

impl WeightNet {
    pub fn new(input_dim: usize, config: &NetworkConfig) -> Result<Self, NetworkError> {
        Ok(Self {
            params: NetParams::initialize(input_dim, config)?,
        })
    }

    pub fn from_params(params: NetParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NetParams {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut NetParams {
        &mut self.params
    }

    /// An independent copy of the current parameters.
    pub fn snapshot(&self) -> NetParams {
        self.params.clone()
    }

    /// Replaces the live parameters with a copy of `snapshot`.
    pub fn restore(&mut self, snapshot: &NetParams) {
        self.params.clone_from(snapshot);
    }

    pub fn alpha(&self) -> f64 {
        self.params.alpha()
    }

    pub fn temperature(&self) -> f64 {
        self.params.temperature()
    }

    fn check_features(&self, x: ArrayView2<f64>) -> Result<(), NetworkError> {
        if x.ncols() != self.params.input_dim() {
            return Err(NetworkError::FeatureMismatch {
                found: x.ncols(),
                expected: self.params.input_dim(),
            });
        }
        Ok(())
    }

    fn encode(&self, x: ArrayView2<f64>) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let z1 = x.dot(&self.params.w1) + &self.params.b1;
        let a1 = z1.mapv(|v| v.max(0.0));
        let h = a1.dot(&self.params.w2) + &self.params.b2;
        (z1, a1, h)
    }

    /// Encoder output `H` for each row of `x`.
    pub fn embed(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, NetworkError> {
        self.check_features(x)?;
        Ok(self.encode(x).2)
    }

    /// Returns the row-stochastic weight matrix and the embeddings.
    pub fn forward(
        &self,
        x: ArrayView2<f64>,
        prior: ArrayView2<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>), NetworkError> {
        let trace = self.forward_traced(x, prior)?;
        Ok((trace.weights, trace.embeddings))
    }

    pub(crate) fn forward_traced(
        &self,
        x: ArrayView2<f64>,
        prior: ArrayView2<f64>,
    ) -> Result<ForwardTrace, NetworkError> {
        self.check_features(x)?;
        let n = x.nrows();
        if prior.dim() != (n, n) {
            return Err(NetworkError::PriorShape {
                found: prior.dim(),
                expected: (n, n),
            });
        }
        let (z1, a1, h) = self.encode(x);
        let (hn, norms) = l2_normalize_rows(h.view());
        let similarity = hn.dot(&hn.t());
        let log_prior = prior.mapv(|p| (p + LOG_EPS).ln());

        let alpha = self.alpha();
        let temperature = self.temperature();
        let mut logits = &log_prior * alpha;
        logits.scaled_add((1.0 - alpha) / temperature, &similarity);
        let weights = row_softmax(logits.view());

        Ok(ForwardTrace {
            x: x.to_owned(),
            z1,
            a1,
            norms,
            hn,
            similarity,
            log_prior,
            weights,
            embeddings: h,
        })
    }

    /// Pulls `∂L/∂W` back to every parameter.
    ///
    /// The temperature gradient is zero while the clamp is active, matching the
    /// flat region of `clamp`.
    pub(crate) fn backward(&self, trace: &ForwardTrace, grad_weights: &Array2<f64>) -> NetParams {
        let alpha = self.alpha();
        let temperature = self.temperature();
        let grad_logits = softmax_backward(&trace.weights, grad_weights);

        // Blend parameters.
        let mut d_alpha = 0.0;
        let mut d_temperature = 0.0;
        Zip::from(&grad_logits)
            .and(&trace.log_prior)
            .and(&trace.similarity)
            .for_each(|&g, &lp, &s| {
                d_alpha += g * (lp - s / temperature);
                d_temperature -= g * (1.0 - alpha) * s / (temperature * temperature);
            });
        let raw_temperature = self.params.log_temperature.exp();
        let grad_log_temperature =
            if raw_temperature > MIN_TEMPERATURE && raw_temperature < MAX_TEMPERATURE {
                d_temperature * raw_temperature
            } else {
                0.0
            };
        let grad_raw_alpha = d_alpha * alpha * (1.0 - alpha);

        // Cosine similarity and L2 normalization.
        let grad_similarity = grad_logits * ((1.0 - alpha) / temperature);
        let grad_hn = (&grad_similarity + &grad_similarity.t()).dot(&trace.hn);
        let mut grad_h = grad_hn;
        Zip::from(grad_h.rows_mut())
            .and(trace.hn.rows())
            .and(&trace.norms)
            .for_each(|mut g, hn_row, &norm| {
                if norm > NORM_EPS {
                    let radial = hn_row.dot(&g);
                    g.scaled_add(-radial, &hn_row);
                    g /= norm;
                } else {
                    g /= NORM_EPS;
                }
            });

        // Encoder.
        let grad_w2 = trace.a1.t().dot(&grad_h);
        let grad_b2 = grad_h.sum_axis(Axis(0));
        let mut grad_z1 = grad_h.dot(&self.params.w2.t());
        Zip::from(&mut grad_z1)
            .and(&trace.z1)
            .for_each(|g, &z| {
                if z <= 0.0 {
                    *g = 0.0;
                }
            });
        let grad_w1 = trace.x.t().dot(&grad_z1);
        let grad_b1 = grad_z1.sum_axis(Axis(0));

        NetParams {
            w1: grad_w1,
            b1: grad_b1,
            w2: grad_w2,
            b2: grad_b2,
            log_temperature: grad_log_temperature,
            raw_alpha: grad_raw_alpha,
        }
    }

    /// Weights from one set of rows onto another, blending a (rectangular)
    /// prior with embedding similarity exactly as [`WeightNet::forward`] does.
    pub fn cross_weights(
        &self,
        row_embeddings: ArrayView2<f64>,
        col_embeddings: ArrayView2<f64>,
        prior: ArrayView2<f64>,
    ) -> Result<Array2<f64>, NetworkError> {
        let expected = (row_embeddings.nrows(), col_embeddings.nrows());
        if prior.dim() != expected {
            return Err(NetworkError::PriorShape {
                found: prior.dim(),
                expected,
            });
        }
        let (rows_n, _) = l2_normalize_rows(row_embeddings);
        let (cols_n, _) = l2_normalize_rows(col_embeddings);
        let similarity = rows_n.dot(&cols_n.t());
        let logits = blend_logits(prior, similarity.view(), self.alpha(), self.temperature());
        Ok(row_softmax(logits.view()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::row_normalize;
    use approx::assert_abs_diff_eq;

    fn toy_inputs(n: usize, p: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, p), |_| rng.gen_range(-1.0..1.0));
        let mut prior = Array2::from_shape_fn((n, n), |_| {
            if rng.gen_bool(0.4) { 0.0 } else { rng.gen_range(0.0..1.0) }
        });
        prior.diag_mut().fill(1.0);
        (x, row_normalize(prior.view()))
    }

    fn small_config() -> NetworkConfig {
        NetworkConfig {
            hidden_dim: 5,
            embedding_dim: 3,
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn output_is_row_stochastic_for_any_blend() {
        let (x, prior) = toy_inputs(7, 3, 1);
        let mut net = WeightNet::new(3, &small_config()).unwrap();
        for (log_t, raw_a) in [(-5.0, -8.0), (0.0, 0.0), (4.0, 8.0), (0.18, -0.85)] {
            net.params_mut().log_temperature = log_t;
            net.params_mut().raw_alpha = raw_a;
            let (w, h) = net.forward(x.view(), prior.view()).unwrap();
            assert_eq!(h.dim(), (7, 3));
            for row in w.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
                assert!(row.iter().all(|&v| v >= 0.0));
            }
        }
    }

    #[test]
    fn temperature_and_alpha_respect_their_ranges() {
        let mut params = NetParams::initialize(2, &small_config()).unwrap();
        assert_abs_diff_eq!(params.temperature(), 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(params.alpha(), 0.3, epsilon = 1e-12);
        params.log_temperature = 50.0;
        assert_eq!(params.temperature(), MAX_TEMPERATURE);
        params.log_temperature = -50.0;
        assert_eq!(params.temperature(), MIN_TEMPERATURE);
    }

    #[test]
    fn flat_round_trip_preserves_parameters() {
        let params = NetParams::initialize(4, &small_config()).unwrap();
        let mut other = params.zeros_like();
        other.assign_flat(params.to_flat().view()).unwrap();
        assert_eq!(other, params);
        assert_eq!(params.to_flat().len(), params.len());
    }

    #[test]
    fn flat_vector_of_wrong_length_is_rejected() {
        let params = NetParams::initialize(4, &small_config()).unwrap();
        let mut other = params.clone();
        let short = params.to_flat().slice(ndarray::s![..params.len() - 1]).to_owned();
        assert!(matches!(
            other.assign_flat(short.view()),
            Err(NetworkError::ParameterLength { found, expected }) if found + 1 == expected
        ));
        assert_eq!(other, params);
    }

    #[test]
    fn snapshot_is_not_aliased_to_live_parameters() {
        let mut net = WeightNet::new(2, &small_config()).unwrap();
        let snapshot = net.snapshot();
        net.params_mut().w1.fill(7.0);
        net.params_mut().raw_alpha = 3.0;
        assert_ne!(net.params(), &snapshot);
        net.restore(&snapshot);
        assert_eq!(net.params(), &snapshot);
    }

    #[test]
    fn dimension_errors_are_reported() {
        let net = WeightNet::new(3, &small_config()).unwrap();
        let (x, prior) = toy_inputs(4, 2, 0);
        assert!(matches!(
            net.forward(x.view(), prior.view()),
            Err(NetworkError::FeatureMismatch { .. })
        ));
        let (x, _) = toy_inputs(4, 3, 0);
        let bad_prior = Array2::zeros((4, 5));
        assert!(matches!(
            net.forward(x.view(), bad_prior.view()),
            Err(NetworkError::PriorShape { .. })
        ));
        assert!(WeightNet::new(0, &small_config()).is_err());
    }

    #[test]
    fn backward_matches_finite_differences() {
        let (x, prior) = toy_inputs(5, 3, 9);
        let mut net = WeightNet::new(3, &small_config()).unwrap();
        // Move off zero biases so every ReLU has a definite side.
        net.params_mut().b1.fill(0.05);
        let mut rng = StdRng::seed_from_u64(4);
        let direction = Array2::from_shape_fn((5, 5), |_| rng.gen_range(-1.0..1.0));

        let objective = |params: &NetParams| {
            let net = WeightNet::from_params(params.clone());
            let (w, _) = net.forward(x.view(), prior.view()).unwrap();
            (&w * &direction).sum()
        };

        let trace = net.forward_traced(x.view(), prior.view()).unwrap();
        let analytic = net.backward(&trace, &direction).to_flat();

        let base = net.params().to_flat();
        let h = 1e-6;
        for k in 0..base.len() {
            let mut plus = net.params().clone();
            let mut shifted = base.clone();
            shifted[k] += h;
            plus.assign_flat(shifted.view()).unwrap();
            let mut minus = net.params().clone();
            shifted[k] -= 2.0 * h;
            minus.assign_flat(shifted.view()).unwrap();
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(analytic[k], numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn cross_weights_reduce_to_forward_on_the_same_rows() {
        let (x, prior) = toy_inputs(6, 2, 12);
        let net = WeightNet::new(2, &small_config()).unwrap();
        let (w, h) = net.forward(x.view(), prior.view()).unwrap();
        let cross = net.cross_weights(h.view(), h.view(), prior.view()).unwrap();
        for (a, b) in w.iter().zip(cross.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }
}
