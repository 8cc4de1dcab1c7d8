//! Certificate objectives and their differentiable losses.
//!
//! The verifier returns a ranked pool of worst-case states. Each of them is
//! replayed through the candidate on the linear region the verifier reported,
//! which makes the objective at that state a function of θ with a gradient.

use lyap_core::{ensure_finite, CertificateKind, Result, System};
use lyap_network::{ConditionValue, LyapunovFunction};
use lyap_verify::{CandidateSolution, CertificateProblem, SolverOptions, Verifier};
use tracing::debug;

/// Per-condition settings of a certificate solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CertificateSettings {
    /// ε₂ for positivity, ε for the derivative.
    pub epsilon: f64,
    pub pool_solutions: usize,
    /// Solution `j` enters the loss with weight `decay_rate^j`.
    pub decay_rate: f64,
}

/// Result of one certificate solve.
#[derive(Debug, Clone)]
pub struct CertificateOutcome {
    pub kind: CertificateKind,
    /// Optimal objective of the solve.
    pub objective: f64,
    /// `Σⱼ w·rʲ·(-objⱼ)` for positivity, `Σⱼ w·rʲ·objⱼ` for the derivative.
    pub loss: ConditionValue,
    pub solutions_used: usize,
    /// Best-ranked solution, when requested.
    pub adversarial: Option<CandidateSolution>,
}

/// Solves both certificate problems for a candidate.
pub struct CertificateOracle<'a, S: ?Sized, V> {
    system: &'a S,
    verifier: &'a V,
    output_flag: bool,
}

impl<'a, S: System + ?Sized, V: Verifier> CertificateOracle<'a, S, V> {
    pub fn new(system: &'a S, verifier: &'a V) -> Self {
        Self {
            system,
            verifier,
            output_flag: false,
        }
    }

    pub fn with_output(mut self, output_flag: bool) -> Self {
        self.output_flag = output_flag;
        self
    }

    /// Solve one certificate problem to optimality.
    ///
    /// With `weight == 0` no solution is read back from the problem; the solve
    /// still runs because its objective decides convergence.
    pub fn certify(
        &self,
        kind: CertificateKind,
        v: &LyapunovFunction,
        settings: CertificateSettings,
        weight: f64,
        want_adversarial: bool,
    ) -> Result<CertificateOutcome> {
        let network = v.network();
        let mut problem = match kind {
            CertificateKind::Positivity => self.verifier.positivity_problem(
                network,
                v.x_equilibrium(),
                v.lambda(),
                settings.epsilon,
            )?,
            CertificateKind::Derivative => self.verifier.derivative_problem(
                network,
                v.x_equilibrium(),
                v.lambda(),
                settings.epsilon,
            )?,
        };
        problem.set_options(SolverOptions {
            output_flag: self.output_flag,
            pool_solutions: settings.pool_solutions.max(1),
        });
        let status = problem.optimize()?;
        let objective = ensure_finite(problem.objective_value()?, &format!("{kind} objective"))?;
        debug!(
            "{} certificate: status {}, objective {:.6e}, {} solutions",
            kind,
            status,
            objective,
            problem.solution_count()
        );

        let mut loss = ConditionValue::zero(v.num_parameters());
        let mut solutions_used = 0;
        if weight != 0.0 {
            let sign = match kind {
                CertificateKind::Positivity => -1.0,
                CertificateKind::Derivative => 1.0,
            };
            let count = settings.pool_solutions.min(problem.solution_count());
            let mut rank_weight = weight;
            for rank in 0..count {
                let Some(solution) = problem.solution(rank) else {
                    break;
                };
                let replayed = self.replay(kind, v, solution, settings.epsilon)?;
                loss.add_scaled(sign * rank_weight, &replayed);
                rank_weight *= settings.decay_rate;
                solutions_used += 1;
            }
            ensure_finite(loss.value, &format!("{kind} certificate loss"))?;
        }

        let adversarial = if want_adversarial {
            problem.solution(0).cloned()
        } else {
            None
        };
        Ok(CertificateOutcome {
            kind,
            objective,
            loss,
            solutions_used,
            adversarial,
        })
    }

    /// Objective at a solution as a function of θ.
    fn replay(
        &self,
        kind: CertificateKind,
        v: &LyapunovFunction,
        solution: &CandidateSolution,
        epsilon: f64,
    ) -> Result<ConditionValue> {
        let x = solution.state.view();
        match kind {
            CertificateKind::Positivity => {
                v.positivity_condition(x, epsilon, Some(&solution.activation))
            }
            CertificateKind::Derivative => {
                let next = self.system.step_forward(x, solution.mode)?;
                v.derivative_condition(
                    x,
                    next.view(),
                    self.system.time_domain(),
                    epsilon,
                    Some(&solution.activation),
                    solution.next_activation.as_ref(),
                )
            }
        }
    }
}
