//! Lyapunov candidate `V(x) = N(x) - N(x*) + λ‖x - x*‖₁` built on a network.

use crate::network::{ActivationPattern, ReluNetwork};
use lyap_core::{LyapError, Result, TimeDomain};
use ndarray::{Array1, ArrayView1};

/// A scalar together with its gradient with respect to the network parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionValue {
    pub value: f64,
    pub gradient: Array1<f64>,
}

impl ConditionValue {
    pub fn zero(num_parameters: usize) -> Self {
        Self {
            value: 0.0,
            gradient: Array1::zeros(num_parameters),
        }
    }

    /// `self + scale · other`, in place.
    pub fn add_scaled(&mut self, scale: f64, other: &ConditionValue) {
        self.value += scale * other.value;
        self.gradient.scaled_add(scale, &other.gradient);
    }

    pub fn scaled(mut self, scale: f64) -> Self {
        self.value *= scale;
        self.gradient *= scale;
        self
    }
}

/// `V(x) = N(x) - N(x*) + λ‖x - x*‖₁`.
///
/// `N(x*)` and its parameter gradient are computed once on construction.
/// The network and the equilibrium are borrowed independently.
pub struct LyapunovFunction<'n, 'x> {
    network: &'n ReluNetwork,
    x_equilibrium: ArrayView1<'x, f64>,
    lambda: f64,
    network_at_equilibrium: f64,
    equilibrium_gradient: Array1<f64>,
}

impl<'n, 'x> LyapunovFunction<'n, 'x> {
    pub fn new(
        network: &'n ReluNetwork,
        x_equilibrium: ArrayView1<'x, f64>,
        lambda: f64,
    ) -> Result<Self> {
        if x_equilibrium.len() != network.input_dim() {
            return Err(LyapError::shape_mismatch(
                vec![network.input_dim()],
                vec![x_equilibrium.len()],
            ));
        }
        let (network_at_equilibrium, equilibrium_gradient) =
            network.gradient(x_equilibrium, None)?;
        Ok(Self {
            network,
            x_equilibrium,
            lambda,
            network_at_equilibrium,
            equilibrium_gradient,
        })
    }

    pub fn network(&self) -> &ReluNetwork {
        self.network
    }

    pub fn x_equilibrium(&self) -> ArrayView1<'x, f64> {
        self.x_equilibrium
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn num_parameters(&self) -> usize {
        self.equilibrium_gradient.len()
    }

    /// `‖x - x*‖₁`.
    pub fn l1_offset(&self, x: ArrayView1<f64>) -> f64 {
        x.iter()
            .zip(self.x_equilibrium.iter())
            .map(|(a, b)| (a - b).abs())
            .sum()
    }

    pub fn value(&self, x: ArrayView1<f64>) -> Result<f64> {
        Ok(self.network.forward(x)? - self.network_at_equilibrium + self.lambda * self.l1_offset(x))
    }

    /// `V(x)` and `∂V/∂θ`, optionally on a fixed linear piece of the network.
    pub fn value_and_gradient(
        &self,
        x: ArrayView1<f64>,
        pattern: Option<&ActivationPattern>,
    ) -> Result<ConditionValue> {
        let (n, g) = self.network.gradient(x, pattern)?;
        Ok(ConditionValue {
            value: n - self.network_at_equilibrium + self.lambda * self.l1_offset(x),
            gradient: g - &self.equilibrium_gradient,
        })
    }

    /// `∂V/∂x`, using sign 0 on coordinates where `x = x*`.
    pub fn state_gradient(
        &self,
        x: ArrayView1<f64>,
        pattern: Option<&ActivationPattern>,
    ) -> Result<Array1<f64>> {
        let mut g = self.network.input_gradient(x, pattern)?;
        for ((gi, &xi), &ei) in g.iter_mut().zip(x.iter()).zip(self.x_equilibrium.iter()) {
            *gi += self.lambda * sign(xi - ei);
        }
        Ok(g)
    }

    /// `dV(x)`: `V(next) - V(x)` in discrete time, `∇ₓV(x)·ẋ` in continuous
    /// time where `next` holds `ẋ`.
    pub fn lyapunov_derivative(
        &self,
        x: ArrayView1<f64>,
        next: ArrayView1<f64>,
        domain: TimeDomain,
        pattern: Option<&ActivationPattern>,
        next_pattern: Option<&ActivationPattern>,
    ) -> Result<ConditionValue> {
        match domain {
            TimeDomain::Discrete => {
                let mut out = self.value_and_gradient(next, next_pattern)?;
                out.add_scaled(-1.0, &self.value_and_gradient(x, pattern)?);
                Ok(out)
            }
            TimeDomain::Continuous => {
                let (tangent, gradient) = self.network.tangent_gradient(x, next, pattern)?;
                let l1_rate: f64 = x
                    .iter()
                    .zip(self.x_equilibrium.iter())
                    .zip(next.iter())
                    .map(|((&xi, &ei), &vi)| sign(xi - ei) * vi)
                    .sum();
                Ok(ConditionValue {
                    value: tangent + self.lambda * l1_rate,
                    gradient,
                })
            }
        }
    }

    /// Positivity condition `V(x) - ε₂‖x - x*‖₁` (non-negative when satisfied).
    pub fn positivity_condition(
        &self,
        x: ArrayView1<f64>,
        epsilon: f64,
        pattern: Option<&ActivationPattern>,
    ) -> Result<ConditionValue> {
        let mut out = self.value_and_gradient(x, pattern)?;
        out.value -= epsilon * self.l1_offset(x);
        Ok(out)
    }

    /// Derivative condition `dV(x) + εV(x)` (non-positive when satisfied).
    pub fn derivative_condition(
        &self,
        x: ArrayView1<f64>,
        next: ArrayView1<f64>,
        domain: TimeDomain,
        epsilon: f64,
        pattern: Option<&ActivationPattern>,
        next_pattern: Option<&ActivationPattern>,
    ) -> Result<ConditionValue> {
        let mut out = self.lyapunov_derivative(x, next, domain, pattern, next_pattern)?;
        out.add_scaled(epsilon, &self.value_and_gradient(x, pattern)?);
        Ok(out)
    }
}

#[inline]
fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}
