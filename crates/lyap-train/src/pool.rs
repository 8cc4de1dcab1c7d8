//! Sample pools for the sample losses.

use lyap_core::{check_state_dim, LyapError, Result, System};
use ndarray::Array1;

/// States on which the sample losses are evaluated.
///
/// Positivity samples are single states. Derivative samples are pairs of a
/// state and its successor (or its state derivative `ẋ` in continuous time);
/// the pair is always appended together, so both sequences have equal length.
/// Pools only grow; losses read the most recent entries through
/// [`SamplePool::positivity_window`] and [`SamplePool::derivative_window`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplePool {
    positivity: Vec<Array1<f64>>,
    derivative: Vec<Array1<f64>>,
    derivative_next: Vec<Array1<f64>>,
}

impl SamplePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use every sample for both conditions, stepping each one through the
    /// system once for its successor.
    pub fn from_samples<S: System + ?Sized>(system: &S, samples: &[Array1<f64>]) -> Result<Self> {
        let mut pool = Self::new();
        for x in samples {
            check_state_dim(x.view(), system.x_dim())?;
            let next = system.step_forward(x.view(), None)?;
            pool.positivity.push(x.clone());
            pool.push_derivative(x.clone(), next)?;
        }
        Ok(pool)
    }

    pub fn push_positivity(&mut self, state: Array1<f64>) {
        self.positivity.push(state);
    }

    /// Append a derivative sample and its successor.
    pub fn push_derivative(&mut self, state: Array1<f64>, next: Array1<f64>) -> Result<()> {
        if state.len() != next.len() {
            return Err(LyapError::shape_mismatch(vec![state.len()], vec![next.len()]));
        }
        self.derivative.push(state);
        self.derivative_next.push(next);
        Ok(())
    }

    pub fn positivity(&self) -> &[Array1<f64>] {
        &self.positivity
    }

    pub fn derivative(&self) -> &[Array1<f64>] {
        &self.derivative
    }

    pub fn derivative_next(&self) -> &[Array1<f64>] {
        &self.derivative_next
    }

    /// The most recent `window` positivity samples.
    pub fn positivity_window(&self, window: usize) -> &[Array1<f64>] {
        tail(&self.positivity, window)
    }

    /// The most recent `window` derivative samples and their successors.
    pub fn derivative_window(&self, window: usize) -> (&[Array1<f64>], &[Array1<f64>]) {
        (tail(&self.derivative, window), tail(&self.derivative_next, window))
    }

    /// Whether every stored state has dimension `x_dim`.
    pub fn check_dim(&self, x_dim: usize) -> Result<()> {
        self.positivity
            .iter()
            .chain(&self.derivative)
            .chain(&self.derivative_next)
            .try_for_each(|x| check_state_dim(x.view(), x_dim))
    }

    pub fn is_empty(&self) -> bool {
        self.positivity.is_empty() && self.derivative.is_empty()
    }
}

fn tail(samples: &[Array1<f64>], window: usize) -> &[Array1<f64>] {
    &samples[samples.len().saturating_sub(window)..]
}
