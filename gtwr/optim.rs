use ndarray::{Array1, Zip};

/// Adam over a flat parameter vector, with L2 weight decay folded into the
/// gradient before the moment updates.
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    m: Array1<f64>,
    v: Array1<f64>,
    step_count: i32,
}

impl Adam {
    pub fn new(num_params: usize, lr: f64, weight_decay: f64) -> Self {
        Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            m: Array1::zeros(num_params),
            v: Array1::zeros(num_params),
            step_count: 0,
        }
    }

    pub fn step(&mut self, params: &mut Array1<f64>, grads: &Array1<f64>) {
        self.step_count += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step_count);
        let bc2 = 1.0 - self.beta2.powi(self.step_count);
        let step_lr = self.lr / bc1;
        let (beta1, beta2, eps, wd) = (self.beta1, self.beta2, self.eps, self.weight_decay);

        Zip::from(params)
            .and(grads)
            .and(&mut self.m)
            .and(&mut self.v)
            .for_each(|p, &g, m, v| {
                let g = g + wd * *p;
                // m = beta1 * m + (1 - beta1) * grad
                *m = beta1 * *m + (1.0 - beta1) * g;
                // v = beta2 * v + (1 - beta2) * grad^2
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                // p -= step_lr * m / (sqrt(v / bc2) + eps)
                *p -= step_lr * *m / ((*v / bc2).sqrt() + eps);
            });
    }
}

/// Rescales `grads` in place so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut Array1<f64>, max_norm: f64) -> f64 {
    let total_norm = grads.dot(grads).sqrt();
    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        grads.mapv_inplace(|g| g * scale);
    }
    total_norm
}
