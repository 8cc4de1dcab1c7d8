//! Certificate-guided training loops.

use crate::config::TrainingConfig;
use crate::gradient::{GradientPolicy, Projection};
use crate::loss::SampleLossEvaluator;
use crate::optimizer::{build_line_search_optimizer, build_optimizer, Adam, Optimizer};
use crate::oracle::{CertificateOracle, CertificateSettings};
use crate::pool::SamplePool;
use lyap_core::{check_state_dim, ensure_finite, CertificateKind, LyapError, Result, System};
use lyap_network::{ConditionValue, LyapunovFunction, NetworkSnapshot, ReluNetwork};
use lyap_verify::Verifier;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Per-call replacements for the configured loss weights.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeightOverrides {
    pub positivity_sample: Option<f64>,
    pub derivative_sample: Option<f64>,
    pub positivity_certificate: Option<f64>,
    pub derivative_certificate: Option<f64>,
}

impl WeightOverrides {
    /// Both certificate weights forced to zero.
    pub fn sample_only() -> Self {
        Self {
            positivity_certificate: Some(0.0),
            derivative_certificate: Some(0.0),
            ..Self::default()
        }
    }
}

/// Everything one loss evaluation produces.
#[derive(Debug, Clone)]
pub struct LossEvaluation {
    /// Sum of the four weighted terms.
    pub total: f64,
    /// `min_x V(x) - ε₂‖x - x*‖₁`.
    pub positivity_objective: f64,
    /// `max_x dV(x) + εV(x)`.
    pub derivative_objective: f64,
    pub positivity_sample: ConditionValue,
    pub derivative_sample: ConditionValue,
    pub positivity_certificate: ConditionValue,
    pub derivative_certificate: ConditionValue,
    /// The input pool, plus any adversarial states found by this evaluation.
    pub pool: SamplePool,
}

impl LossEvaluation {
    /// Gradient of the positivity terms.
    pub fn positivity_gradient(&self) -> Array1<f64> {
        &self.positivity_sample.gradient + &self.positivity_certificate.gradient
    }

    /// Gradient of the derivative terms.
    pub fn derivative_gradient(&self) -> Array1<f64> {
        &self.derivative_sample.gradient + &self.derivative_certificate.gradient
    }

    pub fn gradient(&self) -> Array1<f64> {
        self.positivity_gradient() + self.derivative_gradient()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingState {
    Running,
    Converged,
    Exhausted,
}

/// Per-iteration loss and certificate objectives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub losses: Vec<f64>,
    pub positivity_objectives: Vec<f64>,
    pub derivative_objectives: Vec<f64>,
    /// Gradient projection applied by each optimizer step.
    #[serde(default)]
    pub projections: Vec<Option<Projection>>,
}

impl TrainingHistory {
    pub fn record(&mut self, eval: &LossEvaluation) {
        self.losses.push(eval.total);
        self.positivity_objectives.push(eval.positivity_objective);
        self.derivative_objectives.push(eval.derivative_objective);
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub converged: bool,
    pub state: TrainingState,
    pub history: TrainingHistory,
    /// Sample pool after the last evaluation.
    pub pool: SamplePool,
}

#[derive(Debug, Clone)]
pub struct PlateauOutcome {
    /// Parameters with the lowest certificate violation seen.
    pub best: NetworkSnapshot,
    pub best_mip_loss: f64,
    /// Last iteration evaluated.
    pub stopped_at_iteration: usize,
    /// Whether the plateau guard ended training.
    pub stopped_early: bool,
}

/// Trains a ReLU network so that
/// `V(x) = N(x) - N(x*) + λ‖x - x*‖₁` becomes a Lyapunov function of `system`.
///
/// The network is borrowed mutably and updated in place; only its parameters
/// persist after training.
pub struct LyapunovTrainer<'a, S: ?Sized, V> {
    system: &'a S,
    verifier: &'a V,
    network: &'a mut ReluNetwork,
    x_equilibrium: Array1<f64>,
    lambda: f64,
    config: TrainingConfig,
}

impl<'a, S: System + ?Sized, V: Verifier> LyapunovTrainer<'a, S, V> {
    pub fn new(
        system: &'a S,
        verifier: &'a V,
        network: &'a mut ReluNetwork,
        x_equilibrium: Array1<f64>,
        lambda: f64,
        config: TrainingConfig,
    ) -> Result<Self> {
        config.validate()?;
        check_state_dim(x_equilibrium.view(), system.x_dim())?;
        if network.input_dim() != system.x_dim() {
            return Err(LyapError::shape_mismatch(
                vec![system.x_dim()],
                vec![network.input_dim()],
            ));
        }
        if !(lambda.is_finite() && lambda >= 0.0) {
            return Err(LyapError::InvalidConfig(format!(
                "l1 weight must be non-negative, got {lambda}"
            )));
        }
        Ok(Self {
            system,
            verifier,
            network,
            x_equilibrium,
            lambda,
            config,
        })
    }

    pub fn network(&self) -> &ReluNetwork {
        &*self.network
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn x_equilibrium(&self) -> ArrayView1<'_, f64> {
        self.x_equilibrium.view()
    }

    /// Evaluate the total loss and both certificate objectives on `pool`.
    ///
    /// With `add_adversarial_states` set, the returned pool also holds the
    /// worst states of both certificate problems.
    pub fn evaluate_loss(&self, pool: SamplePool, overrides: WeightOverrides) -> Result<LossEvaluation> {
        pool.check_dim(self.system.x_dim())?;
        self.evaluate(pool, overrides, self.config.add_adversarial_states)
    }

    pub fn is_converged(&self, eval: &LossEvaluation) -> bool {
        eval.positivity_objective >= -self.config.positivity_convergence_tol
            && eval.derivative_objective <= self.config.derivative_convergence_tol
    }

    fn evaluate(
        &self,
        mut pool: SamplePool,
        overrides: WeightOverrides,
        augment: bool,
    ) -> Result<LossEvaluation> {
        let config = &self.config;
        let v = LyapunovFunction::new(&*self.network, self.x_equilibrium.view(), self.lambda)?;
        let samples = SampleLossEvaluator::from_config(config, self.system.time_domain());
        let window = config.max_sample_pool_size;

        let positivity_sample = samples.positivity_loss(
            &v,
            pool.positivity_window(window),
            overrides.positivity_sample.unwrap_or(config.positivity_sample_weight),
        )?;
        let (der_x, der_next) = pool.derivative_window(window);
        let derivative_sample = samples.derivative_loss(
            &v,
            der_x,
            der_next,
            overrides.derivative_sample.unwrap_or(config.derivative_sample_weight),
        )?;

        let oracle =
            CertificateOracle::new(self.system, self.verifier).with_output(config.output_flag);
        let positivity = oracle.certify(
            CertificateKind::Positivity,
            &v,
            CertificateSettings {
                epsilon: config.positivity_epsilon,
                pool_solutions: config.positivity_pool_solutions,
                decay_rate: config.positivity_decay_rate,
            },
            overrides
                .positivity_certificate
                .unwrap_or(config.positivity_certificate_weight),
            augment,
        )?;
        let derivative = oracle.certify(
            CertificateKind::Derivative,
            &v,
            CertificateSettings {
                epsilon: config.derivative_epsilon,
                pool_solutions: config.derivative_pool_solutions,
                decay_rate: config.derivative_decay_rate,
            },
            overrides
                .derivative_certificate
                .unwrap_or(config.derivative_certificate_weight),
            augment,
        )?;

        if let Some(worst) = positivity.adversarial {
            pool.push_positivity(worst.state);
        }
        if let Some(worst) = derivative.adversarial {
            let next = self.system.step_forward(worst.state.view(), worst.mode)?;
            pool.push_derivative(worst.state, next)?;
        }

        let total = ensure_finite(
            positivity_sample.value
                + derivative_sample.value
                + positivity.loss.value
                + derivative.loss.value,
            "training loss",
        )?;
        Ok(LossEvaluation {
            total,
            positivity_objective: positivity.objective,
            derivative_objective: derivative.objective,
            positivity_sample,
            derivative_sample,
            positivity_certificate: positivity.loss,
            derivative_certificate: derivative.loss,
            pool,
        })
    }

    fn log_iteration(&self, iteration: usize, eval: &LossEvaluation) {
        info!(
            "iter {}: loss {:.6e}, positivity {:.6e}, derivative {:.6e}, samples {}/{}",
            iteration,
            eval.total,
            eval.positivity_objective,
            eval.derivative_objective,
            eval.pool.positivity().len(),
            eval.pool.derivative().len()
        );
    }

    /// Train with a plain optimizer ([`crate::OptimizerKind::Sgd`] or
    /// [`crate::OptimizerKind::Adam`]) until both certificates hold or the
    /// iteration budget runs out.
    pub fn train(&mut self, samples: &[Array1<f64>]) -> Result<TrainingOutcome> {
        let mut optimizer = build_optimizer(&self.config, self.network.num_parameters())?;
        let mut pool = SamplePool::from_samples(self.system, samples)?;
        let mut policy = GradientPolicy::from(self.config.project_gradient_method);
        let mut history = TrainingHistory::default();
        let augment = self.config.add_adversarial_states;

        for iteration in 0..self.config.max_iterations {
            let eval = self.evaluate(pool, WeightOverrides::default(), augment)?;
            history.record(&eval);
            self.log_iteration(iteration, &eval);
            if self.is_converged(&eval) {
                info!("converged after {} iterations", iteration);
                return Ok(TrainingOutcome {
                    converged: true,
                    state: TrainingState::Converged,
                    history,
                    pool: eval.pool,
                });
            }

            let resolved = policy.resolve(
                eval.positivity_gradient().view(),
                eval.derivative_gradient().view(),
            );
            history.projections.push(resolved.projection);
            let mut params = self.network.parameters();
            optimizer.step(&mut params, resolved.gradient.view())?;
            self.network.set_parameters(params.view())?;
            pool = eval.pool;
        }

        info!(
            "stopped after {} iterations without converging",
            self.config.max_iterations
        );
        Ok(TrainingOutcome {
            converged: false,
            state: TrainingState::Exhausted,
            history,
            pool,
        })
    }

    /// Train with a backtracking line search.
    ///
    /// Each trial step re-evaluates the full loss, certificates included. The
    /// accepted step is always the last trial, so the last trial's evaluation
    /// is the next iteration's evaluation.
    pub fn train_with_line_search(&mut self, samples: &[Array1<f64>]) -> Result<TrainingOutcome> {
        let mut optimizer =
            build_line_search_optimizer(&self.config, self.network.num_parameters())?;
        let pool = SamplePool::from_samples(self.system, samples)?;
        let mut policy = GradientPolicy::from(self.config.project_gradient_method);
        let mut history = TrainingHistory::default();
        let augment = self.config.add_adversarial_states;
        let overrides = WeightOverrides::default();

        let mut eval = self.evaluate(pool, overrides, augment)?;
        for iteration in 0..self.config.max_iterations {
            history.record(&eval);
            self.log_iteration(iteration, &eval);
            if self.is_converged(&eval) {
                info!("converged after {} iterations", iteration);
                return Ok(TrainingOutcome {
                    converged: true,
                    state: TrainingState::Converged,
                    history,
                    pool: eval.pool,
                });
            }

            let resolved = policy.resolve(
                eval.positivity_gradient().view(),
                eval.derivative_gradient().view(),
            );
            history.projections.push(resolved.projection);
            let current_loss = eval.total;
            let base_pool = eval.pool.clone();
            let mut params = self.network.parameters();
            optimizer.step_with_search(
                &mut params,
                resolved.gradient.view(),
                current_loss,
                &mut |trial| {
                    self.network.set_parameters(trial)?;
                    eval = self.evaluate(base_pool.clone(), overrides, augment)?;
                    Ok(eval.total)
                },
            )?;
            self.network.set_parameters(params.view())?;
            debug!("line search accepted loss {:.6e}", eval.total);
        }

        info!(
            "stopped after {} iterations without converging",
            self.config.max_iterations
        );
        Ok(TrainingOutcome {
            converged: false,
            state: TrainingState::Exhausted,
            history,
            pool: eval.pool,
        })
    }

    /// Train on a fixed sample set with both certificate weights forced to
    /// zero, keeping the parameters with the lowest certificate violation
    ///
    /// `mip_loss = w_pos·max(0, -positivity) + w_der·max(0, derivative)`.
    ///
    /// Stops early once `mip_loss` has risen `max_plateau_iterations` times
    /// in a row. The best snapshot is written back into the network on return.
    pub fn train_bounded(
        &mut self,
        samples: &[Array1<f64>],
        max_iterations: usize,
        max_plateau_iterations: usize,
    ) -> Result<PlateauOutcome> {
        if max_iterations == 0 || max_plateau_iterations == 0 {
            return Err(LyapError::InvalidConfig(format!(
                "bounded training needs positive budgets, got {max_iterations} iterations and plateau {max_plateau_iterations}"
            )));
        }
        let pool = SamplePool::from_samples(self.system, samples)?;
        let mut optimizer = Adam::new(self.config.learning_rate, self.network.num_parameters());
        let w_pos = self.config.positivity_certificate_weight;
        let w_der = self.config.derivative_certificate_weight;

        let mut best = self.network.snapshot();
        let mut best_mip_loss = f64::INFINITY;
        let mut previous = f64::INFINITY;
        let mut plateau = 0;
        let mut stopped_at_iteration = max_iterations - 1;
        let mut stopped_early = false;

        for iteration in 0..max_iterations {
            let eval = self.evaluate(pool.clone(), WeightOverrides::sample_only(), false)?;
            let mip_loss = ensure_finite(
                w_pos * (-eval.positivity_objective).max(0.0)
                    + w_der * eval.derivative_objective.max(0.0),
                "certificate violation",
            )?;
            info!(
                "iter {}: sample loss {:.6e}, certificate violation {:.6e}",
                iteration, eval.total, mip_loss
            );
            if mip_loss < best_mip_loss {
                best_mip_loss = mip_loss;
                best = self.network.snapshot();
            }
            if mip_loss > previous {
                plateau += 1;
            } else {
                plateau = 0;
            }
            previous = mip_loss;
            if plateau >= max_plateau_iterations {
                warn!(
                    "certificate violation rose {} times in a row; stopping at iteration {}",
                    plateau, iteration
                );
                stopped_at_iteration = iteration;
                stopped_early = true;
                break;
            }

            let mut params = self.network.parameters();
            optimizer.step(&mut params, eval.gradient().view())?;
            self.network.set_parameters(params.view())?;
        }

        self.network.restore(&best)?;
        info!("restored parameters with certificate violation {:.6e}", best_mip_loss);
        Ok(PlateauOutcome {
            best,
            best_mip_loss,
            stopped_at_iteration,
            stopped_early,
        })
    }
}
