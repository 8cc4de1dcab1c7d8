//! Parameter update rules for the flat parameter vector θ.

use crate::config::{OptimizerKind, TrainingConfig};
use lyap_core::{LyapError, Result};
use ndarray::{Array1, ArrayView1};
use tracing::{trace, warn};

/// Updates θ from a gradient of the training loss.
pub trait Optimizer {
    fn kind(&self) -> OptimizerKind;

    /// One update of `params` along `-gradient`.
    fn step(&mut self, params: &mut Array1<f64>, gradient: ArrayView1<f64>) -> Result<()>;

    /// One update that may evaluate the loss at trial parameters.
    ///
    /// `loss_at` evaluates the full loss at a trial point. The last call to
    /// `loss_at` is always made at the parameters left in `params`, and its
    /// result is returned.
    fn step_with_search(
        &mut self,
        params: &mut Array1<f64>,
        gradient: ArrayView1<f64>,
        _current_loss: f64,
        loss_at: &mut dyn FnMut(ArrayView1<f64>) -> Result<f64>,
    ) -> Result<f64> {
        self.step(params, gradient)?;
        loss_at(params.view())
    }
}

fn check_len(params: &Array1<f64>, gradient: ArrayView1<f64>) -> Result<()> {
    if params.len() != gradient.len() {
        return Err(LyapError::shape_mismatch(vec![params.len()], vec![gradient.len()]));
    }
    Ok(())
}

/// Gradient descent with heavy-ball momentum: `b = μb + g`, `θ -= lr·b`.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f64,
    momentum: f64,
    buffer: Option<Array1<f64>>,
}

impl Sgd {
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            buffer: None,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn direction(&mut self, gradient: ArrayView1<f64>) -> Array1<f64> {
        if self.momentum == 0.0 {
            return gradient.to_owned();
        }
        let buffer = match self.buffer.take() {
            Some(mut b) => {
                b *= self.momentum;
                b += &gradient;
                b
            }
            None => gradient.to_owned(),
        };
        self.buffer = Some(buffer.clone());
        buffer
    }
}

impl Optimizer for Sgd {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn step(&mut self, params: &mut Array1<f64>, gradient: ArrayView1<f64>) -> Result<()> {
        check_len(params, gradient)?;
        let direction = self.direction(gradient);
        params.scaled_add(-self.learning_rate, &direction);
        Ok(())
    }
}

/// Adam hyperparameters (β₁=0.9, β₂=0.999, ε=1e-8 by default).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamParams {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Adam with bias-corrected moments.
#[derive(Debug, Clone)]
pub struct Adam {
    params: AdamParams,
    t: usize,
    m: Array1<f64>,
    v: Array1<f64>,
}

impl Adam {
    pub fn new(learning_rate: f64, num_parameters: usize) -> Self {
        Self::with_params(AdamParams::new(learning_rate), num_parameters)
    }

    pub fn with_params(params: AdamParams, num_parameters: usize) -> Self {
        Self {
            params,
            t: 0,
            m: Array1::zeros(num_parameters),
            v: Array1::zeros(num_parameters),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.learning_rate
    }

    /// Advance the moments and return `m̂ / (√v̂ + ε)`.
    ///
    /// - m = β₁ m + (1 - β₁) g
    /// - v = β₂ v + (1 - β₂) g²
    /// - m̂ = m / (1 - β₁ᵗ), v̂ = v / (1 - β₂ᵗ)
    fn direction(&mut self, gradient: ArrayView1<f64>) -> Result<Array1<f64>> {
        if gradient.len() != self.m.len() {
            return Err(LyapError::shape_mismatch(vec![self.m.len()], vec![gradient.len()]));
        }
        self.t += 1;
        let p = self.params;
        let bias_correction1 = 1.0 - p.beta1.powi(self.t as i32);
        let bias_correction2 = 1.0 - p.beta2.powi(self.t as i32);
        let mut direction = Array1::zeros(gradient.len());
        for i in 0..gradient.len() {
            let g = gradient[i];
            self.m[i] = p.beta1 * self.m[i] + (1.0 - p.beta1) * g;
            self.v[i] = p.beta2 * self.v[i] + (1.0 - p.beta2) * g * g;
            let m_hat = self.m[i] / bias_correction1;
            let v_hat = self.v[i] / bias_correction2;
            direction[i] = m_hat / (v_hat.sqrt() + p.epsilon);
        }
        Ok(direction)
    }
}

impl Optimizer for Adam {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Adam
    }

    fn step(&mut self, params: &mut Array1<f64>, gradient: ArrayView1<f64>) -> Result<()> {
        check_len(params, gradient)?;
        let direction = self.direction(gradient)?;
        params.scaled_add(-self.params.learning_rate, &direction);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum SearchDirection {
    Momentum(Sgd),
    Adam(Adam),
}

/// Backtracking line search along a gradient-descent or Adam direction.
///
/// Starting from the configured learning rate, the step is shrunk by
/// `step_size_reduction` until the loss drops by more than
/// `loss_minimal_decrement`. Once the step falls below
/// `min_step_ratio` times the initial one, the last trial is kept.
#[derive(Debug, Clone)]
pub struct LineSearch {
    direction: SearchDirection,
    learning_rate: f64,
    loss_minimal_decrement: f64,
    pub step_size_reduction: f64,
    pub min_step_ratio: f64,
}

impl LineSearch {
    pub fn gradient_descent(learning_rate: f64, momentum: f64, loss_minimal_decrement: f64) -> Self {
        Self::with_direction(
            SearchDirection::Momentum(Sgd::new(learning_rate, momentum)),
            learning_rate,
            loss_minimal_decrement,
        )
    }

    pub fn adam(learning_rate: f64, num_parameters: usize, loss_minimal_decrement: f64) -> Self {
        Self::with_direction(
            SearchDirection::Adam(Adam::new(learning_rate, num_parameters)),
            learning_rate,
            loss_minimal_decrement,
        )
    }

    fn with_direction(
        direction: SearchDirection,
        learning_rate: f64,
        loss_minimal_decrement: f64,
    ) -> Self {
        Self {
            direction,
            learning_rate,
            loss_minimal_decrement,
            step_size_reduction: 0.2,
            min_step_ratio: 1e-4,
        }
    }

    fn next_direction(&mut self, gradient: ArrayView1<f64>) -> Result<Array1<f64>> {
        match &mut self.direction {
            SearchDirection::Momentum(sgd) => Ok(sgd.direction(gradient)),
            SearchDirection::Adam(adam) => adam.direction(gradient),
        }
    }
}

impl Optimizer for LineSearch {
    fn kind(&self) -> OptimizerKind {
        match self.direction {
            SearchDirection::Momentum(_) => OptimizerKind::LineSearchGd,
            SearchDirection::Adam(_) => OptimizerKind::LineSearchAdam,
        }
    }

    /// Full step without a loss check.
    fn step(&mut self, params: &mut Array1<f64>, gradient: ArrayView1<f64>) -> Result<()> {
        check_len(params, gradient)?;
        let direction = self.next_direction(gradient)?;
        params.scaled_add(-self.learning_rate, &direction);
        Ok(())
    }

    fn step_with_search(
        &mut self,
        params: &mut Array1<f64>,
        gradient: ArrayView1<f64>,
        current_loss: f64,
        loss_at: &mut dyn FnMut(ArrayView1<f64>) -> Result<f64>,
    ) -> Result<f64> {
        check_len(params, gradient)?;
        let direction = self.next_direction(gradient)?;
        let min_step = self.learning_rate * self.min_step_ratio;
        let mut step = self.learning_rate;
        loop {
            let mut trial = params.clone();
            trial.scaled_add(-step, &direction);
            let loss = loss_at(trial.view())?;
            trace!("line search: step {:.3e}, loss {:.6e}", step, loss);
            if loss < current_loss - self.loss_minimal_decrement {
                *params = trial;
                return Ok(loss);
            }
            step *= self.step_size_reduction;
            if step < min_step {
                warn!(
                    "line search found no decrease below {:.6e}; keeping step {:.3e}",
                    current_loss,
                    step / self.step_size_reduction
                );
                *params = trial;
                return Ok(loss);
            }
        }
    }
}

/// Optimizer for [`crate::LyapunovTrainer::train`]; line-search kinds are
/// rejected.
pub fn build_optimizer(
    config: &TrainingConfig,
    num_parameters: usize,
) -> Result<Box<dyn Optimizer>> {
    match config.optimizer {
        OptimizerKind::Sgd => Ok(Box::new(Sgd::new(config.learning_rate, config.momentum))),
        OptimizerKind::Adam => Ok(Box::new(Adam::new(config.learning_rate, num_parameters))),
        kind => Err(LyapError::InvalidConfig(format!(
            "optimizer {kind} needs train_with_line_search"
        ))),
    }
}

/// Optimizer for [`crate::LyapunovTrainer::train_with_line_search`]; only
/// line-search kinds are accepted.
pub fn build_line_search_optimizer(
    config: &TrainingConfig,
    num_parameters: usize,
) -> Result<Box<dyn Optimizer>> {
    match config.optimizer {
        OptimizerKind::LineSearchGd => Ok(Box::new(LineSearch::gradient_descent(
            config.learning_rate,
            config.momentum,
            config.loss_minimal_decrement,
        ))),
        OptimizerKind::LineSearchAdam => Ok(Box::new(LineSearch::adam(
            config.learning_rate,
            num_parameters,
            config.loss_minimal_decrement,
        ))),
        kind => Err(LyapError::InvalidConfig(format!(
            "line search requires line-search-gd or line-search-adam, got {kind}"
        ))),
    }
}
