//! Worst-case search for the two Lyapunov conditions.
//!
//! For a candidate `V(x) = N(x) - N(x*) + λ‖x - x*‖₁` over a hybrid linear
//! system, a [`Verifier`] builds two [`CertificateProblem`]s:
//!
//! - positivity: `min_x V(x) - ε₂‖x - x*‖₁` over the system's state box,
//! - derivative: `max_x dV(x) + εV(x)` over every mode region.
//!
//! Solving a problem yields the optimal objective and a ranked pool of
//! near-optimal states, each tagged with its mode and the network linear
//! region it lies on, so that callers can replay the objective as a function
//! of the network parameters.
//!
//! Two verifiers are provided:
//! - [`BreakpointVerifier`] enumerates every linear piece of a scalar
//!   system exactly,
//! - [`BranchAndBoundVerifier`] runs best-first branch and bound with
//!   interval bounds in any dimension (discrete time).

pub mod branch_and_bound;
pub mod breakpoint;

pub use branch_and_bound::{BranchAndBoundConfig, BranchAndBoundProblem, BranchAndBoundVerifier};
pub use breakpoint::{network_breakpoints, BreakpointProblem, BreakpointVerifier};

use lyap_core::{CertificateKind, LyapError, Result};
use lyap_network::{ActivationPattern, ReluNetwork};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Two states closer than this (∞-norm) in the same mode are one solution.
pub const DUPLICATE_TOLERANCE: f64 = 1e-9;

/// Options applied to a problem before solving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Emit per-candidate solver output.
    pub output_flag: bool,
    /// Number of ranked solutions to keep (at least one is always kept).
    pub pool_solutions: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            output_flag: false,
            pool_solutions: 1,
        }
    }
}

/// Outcome of [`CertificateProblem::optimize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    NotSolved,
    Optimal,
    /// No feasible state exists (e.g. every mode misses the state box).
    Infeasible,
    /// The search stopped at its node budget with an open gap.
    NodeLimit,
    /// Boxes at the minimum width were left with an open gap.
    GapNotClosed,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::NotSolved => write!(f, "not solved"),
            SolveStatus::Optimal => write!(f, "optimal"),
            SolveStatus::Infeasible => write!(f, "infeasible"),
            SolveStatus::NodeLimit => write!(f, "node limit"),
            SolveStatus::GapNotClosed => write!(f, "gap not closed"),
        }
    }
}

/// One state from a problem's ranked solution pool.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSolution {
    pub state: Array1<f64>,
    /// Mode whose dynamics produced the objective (derivative problems only).
    pub mode: Option<usize>,
    /// Linear region of the network at `state`.
    pub activation: ActivationPattern,
    /// Linear region at the successor state (discrete-time derivative only).
    pub next_activation: Option<ActivationPattern>,
    pub objective: f64,
}

/// Direction of optimization for a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Minimize,
    Maximize,
}

impl Sense {
    pub fn for_kind(kind: CertificateKind) -> Self {
        match kind {
            CertificateKind::Positivity => Sense::Minimize,
            CertificateKind::Derivative => Sense::Maximize,
        }
    }

    /// Whether `a` is strictly better than `b`.
    #[inline]
    pub fn is_better(self, a: f64, b: f64) -> bool {
        match self {
            Sense::Minimize => a < b,
            Sense::Maximize => a > b,
        }
    }

    /// Whether an optimistic bound can still beat `incumbent` by more than `gap`.
    #[inline]
    pub fn can_improve(self, bound: f64, incumbent: f64, gap: f64) -> bool {
        match self {
            Sense::Minimize => bound < incumbent - gap,
            Sense::Maximize => bound > incumbent + gap,
        }
    }
}

/// A certificate optimization problem with a ranked solution pool.
pub trait CertificateProblem {
    fn kind(&self) -> CertificateKind;

    fn set_options(&mut self, options: SolverOptions);

    /// Solve to optimality (or until the solver gives up).
    fn optimize(&mut self) -> Result<SolveStatus>;

    fn status(&self) -> SolveStatus;

    /// Optimal objective; fails with [`LyapError::SolverNotOptimal`] unless
    /// the last solve reached optimality.
    fn objective_value(&self) -> Result<f64>;

    /// Solution at `rank` (0 is the best).
    fn solution(&self, rank: usize) -> Option<&CandidateSolution>;

    fn solution_count(&self) -> usize;
}

/// Builds certificate problems for a network candidate.
pub trait Verifier {
    type Problem: CertificateProblem;

    /// `min_x V(x) - ε₂‖x - x*‖₁`.
    fn positivity_problem(
        &self,
        network: &ReluNetwork,
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
        epsilon: f64,
    ) -> Result<Self::Problem>;

    /// `max_x dV(x) + εV(x)`.
    fn derivative_problem(
        &self,
        network: &ReluNetwork,
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
        epsilon: f64,
    ) -> Result<Self::Problem>;
}

/// Best-first list of distinct solutions, truncated to a capacity.
#[derive(Debug, Clone)]
pub struct SolutionPool {
    sense: Sense,
    capacity: usize,
    entries: Vec<CandidateSolution>,
}

impl SolutionPool {
    pub fn new(sense: Sense, capacity: usize) -> Self {
        Self {
            sense,
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    /// Insert a candidate in rank order. A duplicate of an existing entry
    /// replaces it only when strictly better. Returns whether the pool changed.
    pub fn offer(&mut self, candidate: CandidateSolution) -> bool {
        if let Some(i) = self.entries.iter().position(|e| same_solution(e, &candidate)) {
            if !self.sense.is_better(candidate.objective, self.entries[i].objective) {
                return false;
            }
            self.entries.remove(i);
        }
        let at = self
            .entries
            .iter()
            .position(|e| self.sense.is_better(candidate.objective, e.objective))
            .unwrap_or(self.entries.len());
        if at >= self.capacity {
            return false;
        }
        self.entries.insert(at, candidate);
        self.entries.truncate(self.capacity);
        true
    }

    pub fn best(&self) -> Option<&CandidateSolution> {
        self.entries.first()
    }

    pub fn get(&self, rank: usize) -> Option<&CandidateSolution> {
        self.entries.get(rank)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn same_solution(a: &CandidateSolution, b: &CandidateSolution) -> bool {
    a.mode == b.mode
        && a.state.len() == b.state.len()
        && a
            .state
            .iter()
            .zip(b.state.iter())
            .all(|(x, y)| (x - y).abs() <= DUPLICATE_TOLERANCE)
}

/// Solve bookkeeping shared by the problem implementations.
#[derive(Debug, Clone)]
pub(crate) struct ProblemState {
    kind: CertificateKind,
    options: SolverOptions,
    status: SolveStatus,
    objective: f64,
    solutions: Vec<CandidateSolution>,
}

impl ProblemState {
    pub(crate) fn new(kind: CertificateKind) -> Self {
        Self {
            kind,
            options: SolverOptions::default(),
            status: SolveStatus::NotSolved,
            objective: f64::NAN,
            solutions: Vec::new(),
        }
    }

    pub(crate) fn sense(&self) -> Sense {
        Sense::for_kind(self.kind)
    }

    pub(crate) fn new_pool(&self) -> SolutionPool {
        SolutionPool::new(self.sense(), self.options.pool_solutions)
    }

    /// Record a finished search. An empty pool means nothing was feasible.
    pub(crate) fn finish(&mut self, status: SolveStatus, pool: SolutionPool) -> SolveStatus {
        self.solutions = pool.entries;
        self.status = match self.solutions.first() {
            Some(best) => {
                self.objective = best.objective;
                status
            }
            None => SolveStatus::Infeasible,
        };
        self.status
    }

    pub(crate) fn objective_value(&self) -> Result<f64> {
        if self.status != SolveStatus::Optimal {
            return Err(LyapError::SolverNotOptimal {
                problem: self.kind,
                status: self.status.to_string(),
            });
        }
        Ok(self.objective)
    }
}

pub(crate) fn check_network_dim(network: &ReluNetwork, x_dim: usize) -> Result<()> {
    if network.input_dim() != x_dim {
        return Err(LyapError::shape_mismatch(vec![x_dim], vec![network.input_dim()]));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
