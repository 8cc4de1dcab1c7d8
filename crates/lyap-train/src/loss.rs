//! Hinge losses of the Lyapunov conditions over sampled states.

use crate::config::TrainingConfig;
use lyap_core::{LyapError, Result, TimeDomain};
use lyap_network::{ConditionValue, LyapunovFunction};
use ndarray::Array1;

/// `max(z + margin, 0)`.
#[inline]
pub fn hinge(z: f64, margin: f64) -> f64 {
    (z + margin).max(0.0)
}

/// Evaluates the weighted sample losses
///
/// - `w_pos · mean hinge(-V(x) + ε₂‖x - x*‖₁, m_pos)`
/// - `w_der · mean hinge(dV(x) + εV(x), m_der)`
///
/// together with their parameter gradients. The hinge passes the gradient of
/// its argument where it is active and zero elsewhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleLossEvaluator {
    pub positivity_epsilon: f64,
    pub positivity_margin: f64,
    pub derivative_epsilon: f64,
    pub derivative_margin: f64,
    pub time_domain: TimeDomain,
}

impl SampleLossEvaluator {
    pub fn from_config(config: &TrainingConfig, time_domain: TimeDomain) -> Self {
        Self {
            positivity_epsilon: config.positivity_epsilon,
            positivity_margin: config.positivity_sample_margin,
            derivative_epsilon: config.derivative_epsilon,
            derivative_margin: config.derivative_sample_margin,
            time_domain,
        }
    }

    /// Positivity sample loss. Zero weight or no samples gives exactly zero
    /// without touching the network.
    pub fn positivity_loss(
        &self,
        v: &LyapunovFunction,
        samples: &[Array1<f64>],
        weight: f64,
    ) -> Result<ConditionValue> {
        let mut loss = ConditionValue::zero(v.num_parameters());
        if weight == 0.0 || samples.is_empty() {
            return Ok(loss);
        }
        for x in samples {
            // hinge argument is the negated condition
            let cond = v.positivity_condition(x.view(), self.positivity_epsilon, None)?;
            if -cond.value + self.positivity_margin > 0.0 {
                loss.add_scaled(-1.0, &cond);
                loss.value += self.positivity_margin;
            }
        }
        Ok(loss.scaled(weight / samples.len() as f64))
    }

    /// Derivative sample loss over paired states and successors.
    pub fn derivative_loss(
        &self,
        v: &LyapunovFunction,
        samples: &[Array1<f64>],
        next: &[Array1<f64>],
        weight: f64,
    ) -> Result<ConditionValue> {
        let mut loss = ConditionValue::zero(v.num_parameters());
        if weight == 0.0 || samples.is_empty() {
            return Ok(loss);
        }
        if samples.len() != next.len() {
            return Err(LyapError::shape_mismatch(vec![samples.len()], vec![next.len()]));
        }
        for (x, x_next) in samples.iter().zip(next) {
            let cond = v.derivative_condition(
                x.view(),
                x_next.view(),
                self.time_domain,
                self.derivative_epsilon,
                None,
                None,
            )?;
            if cond.value + self.derivative_margin > 0.0 {
                loss.add_scaled(1.0, &cond);
                loss.value += self.derivative_margin;
            }
        }
        Ok(loss.scaled(weight / samples.len() as f64))
    }
}
