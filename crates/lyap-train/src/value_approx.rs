//! Warm start: regress `V(x) = N(x) - N(x*) + λ‖x - x*‖₁` onto sampled
//! cost-to-go values before certificate training.

use crate::optimizer::{Adam, Optimizer};
use lyap_core::{check_state_dim, ensure_finite, LyapError, Result};
use lyap_hybrid::HybridLinearSystem;
use lyap_network::{ConditionValue, LyapunovFunction, ReluNetwork};
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueApproximatorConfig {
    pub max_epochs: usize,
    /// Fitting stops once the mean-squared error is at most this.
    pub convergence_tolerance: f64,
    pub learning_rate: f64,
}

impl Default for ValueApproximatorConfig {
    fn default() -> Self {
        Self {
            max_epochs: 100,
            convergence_tolerance: 1e-3,
            learning_rate: 0.02,
        }
    }
}

/// A state and the cost accumulated along its rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostToGoSample {
    pub state: Array1<f64>,
    pub value: f64,
}

/// Roll every state out for `steps` steps and sum `cost` along the way.
///
/// Rollouts run in parallel; the output keeps the order of `states`.
pub fn generate_cost_to_go_samples<F>(
    system: &HybridLinearSystem,
    states: &[Array1<f64>],
    steps: usize,
    dt: f64,
    cost: F,
    x_goal: Option<(ArrayView1<f64>, f64)>,
) -> Result<Vec<CostToGoSample>>
where
    F: Fn(ArrayView1<f64>) -> f64 + Sync,
{
    let samples = states
        .par_iter()
        .map(|x0| -> Result<CostToGoSample> {
            let value = system.cost_to_go(x0.view(), steps, dt, &cost, x_goal)?;
            Ok(CostToGoSample {
                state: x0.clone(),
                value: ensure_finite(value, "cost-to-go")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    debug!("generated {} cost-to-go samples", samples.len());
    Ok(samples)
}

/// Fits a candidate to cost-to-go samples by mean-squared error with Adam.
#[derive(Debug, Clone, Default)]
pub struct ValueApproximator {
    config: ValueApproximatorConfig,
}

impl ValueApproximator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ValueApproximatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValueApproximatorConfig {
        &self.config
    }

    /// Mean-squared error of `V` on `samples` and its θ-gradient.
    pub fn loss(
        network: &ReluNetwork,
        samples: &[CostToGoSample],
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
    ) -> Result<ConditionValue> {
        let v = LyapunovFunction::new(network, x_equilibrium, lambda)?;
        let mut loss = ConditionValue::zero(v.num_parameters());
        if samples.is_empty() {
            return Ok(loss);
        }
        for sample in samples {
            let mut residual = v.value_and_gradient(sample.state.view(), None)?;
            residual.value -= sample.value;
            loss.add_scaled(2.0 * residual.value, &residual);
            loss.value -= residual.value * residual.value;
        }
        Ok(loss.scaled(1.0 / samples.len() as f64))
    }

    /// Fit `network` in place. Returns whether the error reached the
    /// tolerance and the last error.
    pub fn fit(
        &self,
        network: &mut ReluNetwork,
        samples: &[CostToGoSample],
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
    ) -> Result<(bool, f64)> {
        if samples.is_empty() {
            return Err(LyapError::InvalidConfig(
                "value fitting needs at least one sample".to_string(),
            ));
        }
        for sample in samples {
            check_state_dim(sample.state.view(), network.input_dim())?;
        }
        let mut optimizer = Adam::new(self.config.learning_rate, network.num_parameters());
        let mut mse = f64::INFINITY;
        for epoch in 0..self.config.max_epochs {
            let loss = Self::loss(network, samples, x_equilibrium, lambda)?;
            mse = ensure_finite(loss.value, "value fitting loss")?;
            debug!("epoch {}: mse {:.6e}", epoch, mse);
            if mse <= self.config.convergence_tolerance {
                info!("value fit converged at epoch {} with mse {:.6e}", epoch, mse);
                return Ok((true, mse));
            }
            let mut params = network.parameters();
            optimizer.step(&mut params, loss.gradient.view())?;
            network.set_parameters(params.view())?;
        }
        info!(
            "value fit stopped after {} epochs with mse {:.6e}",
            self.config.max_epochs, mse
        );
        Ok((false, mse))
    }

    /// Generate cost-to-go samples from `states` and fit `network` to them.
    ///
    /// Rollouts stop accumulating cost once they come within the tolerance of
    /// `x_goal`, when one is given.
    #[allow(clippy::too_many_arguments)]
    pub fn train<F>(
        &self,
        network: &mut ReluNetwork,
        system: &HybridLinearSystem,
        states: &[Array1<f64>],
        steps: usize,
        dt: f64,
        cost: F,
        x_goal: Option<(ArrayView1<f64>, f64)>,
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
    ) -> Result<(bool, f64)>
    where
        F: Fn(ArrayView1<f64>) -> f64 + Sync,
    {
        let samples = generate_cost_to_go_samples(system, states, steps, dt, cost, x_goal)?;
        self.fit(network, &samples, x_equilibrium, lambda)
    }
}
