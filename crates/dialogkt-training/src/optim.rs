//! Optimizers and gradient clipping.
//!
//! Both optimizers apply weight decay decoupled from the gradient
//! (`param -= lr * wd * param`) and consume an already accumulated and clipped
//! gradient.

use crate::config::OptimizerKind;
use crate::error::{TrainingError, TrainingResult};
use dialogkt_abstraction::ParamSet;
use ndarray::{Array2, Axis, Zip};

pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    /// Applies one update of `params` from `grads` (same layout).
    fn step(&mut self, params: &mut ParamSet, grads: &ParamSet) -> TrainingResult<()>;

    /// Number of updates applied so far.
    fn steps(&self) -> u64;
}

#[must_use]
pub fn build_optimizer(kind: OptimizerKind, lr: f64, wd: f64) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Adamw => Box::new(AdamW::new(lr, wd)),
        OptimizerKind::Adafactor => Box::new(Adafactor::new(lr, wd)),
    }
}

/// Rescales `grads` so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut ParamSet, max_norm: f64) -> f64 {
    let norm = grads.global_norm();
    if norm.is_finite() && norm > max_norm && norm > 0.0 {
        grads.scale(max_norm / norm);
    }
    norm
}

fn check_layout(params: &ParamSet, grads: &ParamSet) -> TrainingResult<()> {
    if params.same_layout(grads) {
        Ok(())
    } else {
        Err(TrainingError::Other(anyhow::anyhow!("gradient layout does not match parameters")))
    }
}

#[derive(Debug)]
pub struct AdamW {
    lr: f64,
    wd: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: u64,
    m: Option<ParamSet>,
    v: Option<ParamSet>,
}

impl AdamW {
    #[must_use]
    pub const fn new(lr: f64, wd: f64) -> Self {
        Self { lr, wd, beta1: 0.9, beta2: 0.999, eps: 1e-8, t: 0, m: None, v: None }
    }
}

impl Optimizer for AdamW {
    fn name(&self) -> &'static str {
        "adamw"
    }

    fn step(&mut self, params: &mut ParamSet, grads: &ParamSet) -> TrainingResult<()> {
        check_layout(params, grads)?;
        let m = self.m.get_or_insert_with(|| params.zeros_like());
        let v = self.v.get_or_insert_with(|| params.zeros_like());
        self.t += 1;
        let t = i32::try_from(self.t).unwrap_or(i32::MAX);
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        let (lr, wd, beta1, beta2, eps) = (self.lr, self.wd, self.beta1, self.beta2, self.eps);

        for (((p, g), m), v) in params.iter_mut().zip(grads.iter()).zip(m.iter_mut()).zip(v.iter_mut()) {
            Zip::from(&mut p.value).and(&g.value).and(&mut m.value).and(&mut v.value).for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * wd * *p;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }
        Ok(())
    }

    fn steps(&self) -> u64 {
        self.t
    }
}

/// Second-moment state of one tensor.
#[derive(Debug)]
enum FactorState {
    /// Row and column running means of the squared gradient.
    Factored { row: Array2<f64>, col: Array2<f64> },
    Full(Array2<f64>),
}

/// Adafactor with factored second moments for matrices, no momentum and
/// relative update clipping.
#[derive(Debug)]
pub struct Adafactor {
    lr: f64,
    wd: f64,
    decay_rate: f64,
    eps: f64,
    clip_threshold: f64,
    t: u64,
    state: Vec<FactorState>,
}

impl Adafactor {
    #[must_use]
    pub const fn new(lr: f64, wd: f64) -> Self {
        Self { lr, wd, decay_rate: -0.8, eps: 1e-30, clip_threshold: 1.0, t: 0, state: Vec::new() }
    }

    fn init_state(params: &ParamSet) -> Vec<FactorState> {
        params
            .iter()
            .map(|p| {
                let (rows, cols) = p.value.dim();
                if rows > 1 && cols > 1 {
                    FactorState::Factored { row: Array2::zeros((rows, 1)), col: Array2::zeros((1, cols)) }
                } else {
                    FactorState::Full(Array2::zeros((rows, cols)))
                }
            })
            .collect()
    }
}

impl Optimizer for Adafactor {
    fn name(&self) -> &'static str {
        "adafactor"
    }

    fn step(&mut self, params: &mut ParamSet, grads: &ParamSet) -> TrainingResult<()> {
        check_layout(params, grads)?;
        if self.state.is_empty() {
            self.state = Self::init_state(params);
        }
        self.t += 1;
        let beta2 = 1.0 - (self.t as f64).powf(self.decay_rate);

        for ((p, g), state) in params.iter_mut().zip(grads.iter()).zip(self.state.iter_mut()) {
            let sq = g.value.mapv(|x| x * x + self.eps);
            let second_moment = match state {
                FactorState::Factored { row, col } => {
                    let row_mean = sq.mean_axis(Axis(1)).unwrap_or_default().insert_axis(Axis(1));
                    let col_mean = sq.mean_axis(Axis(0)).unwrap_or_default().insert_axis(Axis(0));
                    *row = &*row * beta2 + &(row_mean * (1.0 - beta2));
                    *col = &*col * beta2 + &(col_mean * (1.0 - beta2));
                    let row_norm = row.mean().unwrap_or(1.0).max(self.eps);
                    row.dot(&*col) / row_norm
                }
                FactorState::Full(v) => {
                    *v = &*v * beta2 + &(sq * (1.0 - beta2));
                    v.clone()
                }
            };

            let mut update = &g.value / &second_moment.mapv(f64::sqrt);
            let rms = (update.mapv(|u| u * u).mean().unwrap_or(0.0)).sqrt();
            update /= (rms / self.clip_threshold).max(1.0);

            let decay = self.lr * self.wd;
            p.value.mapv_inplace(|x| x - decay * x);
            p.value.scaled_add(-self.lr, &update);
        }
        Ok(())
    }

    fn steps(&self) -> u64 {
        self.t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    /// Loss `0.5 * ||w - target||^2` and its gradient.
    fn quadratic(params: &ParamSet, target: &Array2<f64>) -> (f64, ParamSet) {
        let w = params.get("w").unwrap();
        let diff = w - target;
        let mut grads = ParamSet::new();
        grads.push("w", diff.clone());
        (0.5 * diff.mapv(|d| d * d).sum(), grads)
    }

    fn descend(mut optimizer: Box<dyn Optimizer>, steps: usize) -> (f64, f64) {
        let target = array![[1.0, -2.0, 0.5], [3.0, 0.0, -1.0]];
        let mut params = ParamSet::new();
        params.push("w", Array2::zeros((2, 3)));
        let (initial, _) = quadratic(&params, &target);
        for _ in 0..steps {
            let (_, grads) = quadratic(&params, &target);
            optimizer.step(&mut params, &grads).unwrap();
        }
        (initial, quadratic(&params, &target).0)
    }

    #[test]
    fn test_adamw_decreases_convex_loss() {
        let (initial, last) = descend(build_optimizer(OptimizerKind::Adamw, 0.05, 0.0), 300);
        assert!(last < initial * 0.01, "{initial} -> {last}");
    }

    #[test]
    fn test_adafactor_decreases_convex_loss() {
        let (initial, last) = descend(build_optimizer(OptimizerKind::Adafactor, 0.05, 0.0), 300);
        assert!(last < initial * 0.1, "{initial} -> {last}");
    }

    #[test]
    fn test_clip_grad_norm_bounds_norm() {
        let mut grads = ParamSet::new();
        grads.push("a", array![[3.0, 4.0]]);
        grads.push("b", array![[12.0]]);
        let before = clip_grad_norm(&mut grads, 1.0);
        assert_relative_eq!(before, 13.0);
        assert_relative_eq!(grads.global_norm(), 1.0, epsilon = 1e-12);

        let mut small = ParamSet::new();
        small.push("a", array![[0.3, 0.4]]);
        clip_grad_norm(&mut small, 1.0);
        assert_relative_eq!(small.global_norm(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_weight_decay_shrinks_weights_without_gradient() {
        let mut params = ParamSet::new();
        params.push("w", array![[2.0, -2.0]]);
        let grads = params.zeros_like();
        let mut opt = AdamW::new(0.1, 0.5);
        opt.step(&mut params, &grads).unwrap();
        assert_relative_eq!(params.get("w").unwrap()[(0, 0)], 2.0 * (1.0 - 0.05));
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_layout_mismatch_is_an_error() {
        let mut params = ParamSet::new();
        params.push("w", Array2::zeros((2, 2)));
        let mut grads = ParamSet::new();
        grads.push("w", Array2::zeros((1, 2)));
        assert!(AdamW::new(0.1, 0.0).step(&mut params, &grads).is_err());
    }
}
