//! Exact certificate search for scalar systems.
//!
//! On a line the network is affine between consecutive neuron switching
//! points, and so is every piece of the Lyapunov conditions once the
//! successor map is fixed by a mode. Optimal values of piecewise-affine
//! functions on closed intervals are attained at piece ends, so the search
//! enumerates those ends and evaluates each one.

use crate::{
    check_network_dim, CandidateSolution, CertificateProblem, ProblemState, Sense, SolutionPool,
    SolveStatus, SolverOptions, Verifier,
};
use lyap_core::{check_state_dim, Bound, CertificateKind, LyapError, Result, System, TimeDomain};
use lyap_hybrid::HybridLinearSystem;
use lyap_network::{LyapunovFunction, ReluNetwork};
use ndarray::{arr1, Array1, ArrayView1};
use tracing::{debug, trace};

/// Points closer than this are merged.
const BREAKPOINT_TOLERANCE: f64 = 1e-12;

/// Every point of `interval` where some hidden neuron changes sign, plus the
/// interval ends, sorted.
///
/// Found layer by layer: between two consecutive switching points of the
/// first `l` layers, the pre-activations of layer `l` are affine, so each
/// sign change between the piece ends is a single crossing.
pub fn network_breakpoints(network: &ReluNetwork, interval: Bound) -> Result<Vec<f64>> {
    if network.input_dim() != 1 {
        return Err(LyapError::shape_mismatch(vec![1], vec![network.input_dim()]));
    }
    let mut points = vec![interval.lower, interval.upper];
    dedup_sorted(&mut points);
    for layer in 0..network.num_hidden_layers() {
        let mut crossings = Vec::new();
        for pair in points.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            let z_lo = network.pre_activations(arr1(&[lo]).view())?.swap_remove(layer);
            let z_hi = network.pre_activations(arr1(&[hi]).view())?.swap_remove(layer);
            for (&a, &b) in z_lo.iter().zip(z_hi.iter()) {
                if (a < 0.0 && b > 0.0) || (a > 0.0 && b < 0.0) {
                    crossings.push(lo + (hi - lo) * a / (a - b));
                }
            }
        }
        points.extend(crossings);
        dedup_sorted(&mut points);
    }
    Ok(points)
}

fn dedup_sorted(points: &mut Vec<f64>) {
    points.sort_by(f64::total_cmp);
    points.dedup_by(|a, b| (*a - *b).abs() <= BREAKPOINT_TOLERANCE);
}

/// Midpoint of the neighbouring piece of `points[i]` with the better value,
/// or `points[i]` itself when it has no neighbour.
fn best_adjacent_piece<F>(points: &[f64], i: usize, sense: Sense, mut eval: F) -> Result<f64>
where
    F: FnMut(f64) -> Result<f64>,
{
    let neighbours = [i.checked_sub(1).map(|j| points[j]), points.get(i + 1).copied()];
    let mut best: Option<(f64, f64)> = None;
    for n in neighbours.into_iter().flatten() {
        let mid = 0.5 * (points[i] + n);
        let value = eval(mid)?;
        if best.map_or(true, |(_, b)| sense.is_better(value, b)) {
            best = Some((mid, value));
        }
    }
    Ok(best.map_or(points[i], |(mid, _)| mid))
}

/// Exact verifier for systems with a one-dimensional state.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointVerifier<'a> {
    system: &'a HybridLinearSystem,
}

impl<'a> BreakpointVerifier<'a> {
    pub fn new(system: &'a HybridLinearSystem) -> Result<Self> {
        if system.x_dim() != 1 {
            return Err(LyapError::SolverUnavailable(format!(
                "breakpoint enumeration needs a scalar system, state dimension is {}",
                system.x_dim()
            )));
        }
        Ok(Self { system })
    }

    fn problem(
        &self,
        kind: CertificateKind,
        network: &ReluNetwork,
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
        epsilon: f64,
    ) -> Result<BreakpointProblem<'a>> {
        check_network_dim(network, 1)?;
        check_state_dim(x_equilibrium, 1)?;
        Ok(BreakpointProblem {
            system: self.system,
            network: network.clone(),
            x_equilibrium: x_equilibrium.to_owned(),
            lambda,
            epsilon,
            state: ProblemState::new(kind),
        })
    }
}

impl<'a> Verifier for BreakpointVerifier<'a> {
    type Problem = BreakpointProblem<'a>;

    fn positivity_problem(
        &self,
        network: &ReluNetwork,
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
        epsilon: f64,
    ) -> Result<Self::Problem> {
        self.problem(CertificateKind::Positivity, network, x_equilibrium, lambda, epsilon)
    }

    fn derivative_problem(
        &self,
        network: &ReluNetwork,
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
        epsilon: f64,
    ) -> Result<Self::Problem> {
        self.problem(CertificateKind::Derivative, network, x_equilibrium, lambda, epsilon)
    }
}

/// A certificate problem solved by piece enumeration.
#[derive(Debug, Clone)]
pub struct BreakpointProblem<'a> {
    system: &'a HybridLinearSystem,
    network: ReluNetwork,
    x_equilibrium: Array1<f64>,
    lambda: f64,
    epsilon: f64,
    state: ProblemState,
}

impl BreakpointProblem<'_> {
    fn equilibrium(&self) -> f64 {
        self.x_equilibrium[0]
    }

    /// Switching points of `V` (network kinks and `x*`) inside `interval`.
    fn lyapunov_breakpoints(&self, interval: Bound) -> Result<Vec<f64>> {
        let mut points = network_breakpoints(&self.network, interval)?;
        if interval.contains(self.equilibrium()) {
            points.push(self.equilibrium());
            dedup_sorted(&mut points);
        }
        Ok(points)
    }

    fn solve_positivity(&self, v: &LyapunovFunction) -> Result<SolutionPool> {
        let sense = self.state.sense();
        let mut pool = self.state.new_pool();
        let domain = self.system.domain().bounds[0];
        let points = self.lyapunov_breakpoints(domain)?;
        let objective = |p: f64| -> Result<f64> {
            let x = arr1(&[p]);
            Ok(v.value(x.view())? - self.epsilon * v.l1_offset(x.view()))
        };
        for (i, &p) in points.iter().enumerate() {
            let value = objective(p)?;
            let piece = best_adjacent_piece(&points, i, sense, &objective)?;
            let candidate = CandidateSolution {
                state: arr1(&[p]),
                mode: None,
                activation: self.network.activation_pattern(arr1(&[piece]).view())?,
                next_activation: None,
                objective: value,
            };
            self.trace_candidate(&candidate);
            pool.offer(candidate);
        }
        Ok(pool)
    }

    fn solve_discrete_derivative(&self, v: &LyapunovFunction) -> Result<SolutionPool> {
        let sense = self.state.sense();
        let mut pool = self.state.new_pool();
        for (mode, m) in self.system.modes().iter().enumerate() {
            let Some(interval) = self.system.scalar_mode_interval(mode)? else {
                continue;
            };
            let (a, c) = (m.a[[0, 0]], m.c[0]);
            let (img_lo, img_hi) = (a * interval.lower + c, a * interval.upper + c);
            let image = Bound::new(img_lo.min(img_hi), img_lo.max(img_hi));

            let mut points = self.lyapunov_breakpoints(interval)?;
            if a != 0.0 {
                for k in self.lyapunov_breakpoints(image)? {
                    let pre = (k - c) / a;
                    if interval.contains(pre) {
                        points.push(pre);
                    }
                }
            }
            dedup_sorted(&mut points);

            let objective = |p: f64| -> Result<f64> {
                let x = arr1(&[p]);
                let next = arr1(&[a * p + c]);
                Ok(v.value(next.view())? - (1.0 - self.epsilon) * v.value(x.view())?)
            };
            for (i, &p) in points.iter().enumerate() {
                let value = objective(p)?;
                let piece = best_adjacent_piece(&points, i, sense, &objective)?;
                let candidate = CandidateSolution {
                    state: arr1(&[p]),
                    mode: Some(mode),
                    activation: self.network.activation_pattern(arr1(&[piece]).view())?,
                    next_activation: Some(
                        self.network.activation_pattern(arr1(&[a * piece + c]).view())?,
                    ),
                    objective: value,
                };
                self.trace_candidate(&candidate);
                pool.offer(candidate);
            }
        }
        Ok(pool)
    }

    /// Continuous time: on each piece `∇V` is constant, so
    /// `∇V·(a x + c) + εV(x)` is affine and its extremes sit at piece ends,
    /// evaluated with that piece's slope.
    fn solve_continuous_derivative(&self, v: &LyapunovFunction) -> Result<SolutionPool> {
        let mut pool = self.state.new_pool();
        for (mode, m) in self.system.modes().iter().enumerate() {
            let Some(interval) = self.system.scalar_mode_interval(mode)? else {
                continue;
            };
            let (a, c) = (m.a[[0, 0]], m.c[0]);
            let points = self.lyapunov_breakpoints(interval)?;
            let pieces: Vec<(f64, f64)> = if points.len() == 1 {
                vec![(points[0], points[0])]
            } else {
                points.windows(2).map(|w| (w[0], w[1])).collect()
            };
            for (lo, hi) in pieces {
                let mid = arr1(&[0.5 * (lo + hi)]);
                let pattern = self.network.activation_pattern(mid.view())?;
                let slope = v.state_gradient(mid.view(), Some(&pattern))?[0];
                for p in [lo, hi] {
                    let x = arr1(&[p]);
                    let value = slope * (a * p + c) + self.epsilon * v.value(x.view())?;
                    let candidate = CandidateSolution {
                        state: x,
                        mode: Some(mode),
                        activation: pattern.clone(),
                        next_activation: None,
                        objective: value,
                    };
                    self.trace_candidate(&candidate);
                    pool.offer(candidate);
                }
            }
        }
        Ok(pool)
    }

    fn trace_candidate(&self, candidate: &CandidateSolution) {
        if self.state.options.output_flag {
            trace!(
                "{} candidate x = {}, mode {:?}: {:.6e}",
                self.state.kind,
                candidate.state,
                candidate.mode,
                candidate.objective
            );
        }
    }
}

impl CertificateProblem for BreakpointProblem<'_> {
    fn kind(&self) -> CertificateKind {
        self.state.kind
    }

    fn set_options(&mut self, options: SolverOptions) {
        self.state.options = options;
    }

    fn optimize(&mut self) -> Result<SolveStatus> {
        let v = LyapunovFunction::new(&self.network, self.x_equilibrium.view(), self.lambda)?;
        let pool = match (self.state.kind, self.system.time_domain()) {
            (CertificateKind::Positivity, _) => self.solve_positivity(&v)?,
            (CertificateKind::Derivative, TimeDomain::Discrete) => {
                self.solve_discrete_derivative(&v)?
            }
            (CertificateKind::Derivative, TimeDomain::Continuous) => {
                self.solve_continuous_derivative(&v)?
            }
        };
        let status = self.state.finish(SolveStatus::Optimal, pool);
        debug!(
            "{} problem: {} with {} solution(s), objective {:.6e}",
            self.state.kind,
            status,
            self.state.solutions.len(),
            self.state.objective
        );
        Ok(status)
    }

    fn status(&self) -> SolveStatus {
        self.state.status
    }

    fn objective_value(&self) -> Result<f64> {
        self.state.objective_value()
    }

    fn solution(&self, rank: usize) -> Option<&CandidateSolution> {
        self.state.solutions.get(rank)
    }

    fn solution_count(&self) -> usize {
        self.state.solutions.len()
    }
}
