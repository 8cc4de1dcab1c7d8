//! Best-first branch and bound over the state box.
//!
//! Each node is a sub-box (and, for the derivative problem, a mode). Its
//! optimistic bound comes from interval propagation through the network:
//! a lower bound of `V(x) - ε₂‖x - x*‖₁` for positivity and an upper bound of
//! `V(A x + c) - (1 - ε)V(x)` for the discrete-time derivative. Box centers
//! supply incumbents. Nodes are split along their widest axis until no open
//! node can beat the incumbent by more than the gap tolerance.

use crate::{
    check_network_dim, CandidateSolution, CertificateProblem, ProblemState, Sense, SolutionPool,
    SolveStatus, SolverOptions, Verifier,
};
use lyap_core::{check_state_dim, Bound, CertificateKind, LyapError, Result, StateBox, System, TimeDomain};
use lyap_hybrid::HybridLinearSystem;
use lyap_network::{LyapunovFunction, ReluNetwork};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::{debug, info, trace};

/// Configuration for the branch-and-bound search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchAndBoundConfig {
    /// Absolute optimality gap at which the search stops.
    pub gap_tolerance: f64,
    /// Maximum number of boxes to expand before giving up.
    pub max_nodes: usize,
    /// Boxes narrower than this are evaluated but not split. A search that
    /// leaves such a box able to beat the incumbent reports
    /// [`SolveStatus::GapNotClosed`].
    pub min_box_width: f64,
}

impl Default for BranchAndBoundConfig {
    fn default() -> Self {
        Self {
            gap_tolerance: 1e-6,
            max_nodes: 200_000,
            min_box_width: 1e-9,
        }
    }
}

/// Branch-and-bound verifier for discrete-time systems of any dimension.
#[derive(Debug, Clone)]
pub struct BranchAndBoundVerifier<'a> {
    system: &'a HybridLinearSystem,
    config: BranchAndBoundConfig,
}

impl<'a> BranchAndBoundVerifier<'a> {
    pub fn new(system: &'a HybridLinearSystem) -> Self {
        Self::with_config(system, BranchAndBoundConfig::default())
    }

    pub fn with_config(system: &'a HybridLinearSystem, config: BranchAndBoundConfig) -> Self {
        Self { system, config }
    }

    pub fn config(&self) -> &BranchAndBoundConfig {
        &self.config
    }

    fn problem(
        &self,
        kind: CertificateKind,
        network: &ReluNetwork,
        x_equilibrium: ArrayView1<f64>,
        lambda: f64,
        epsilon: f64,
    ) -> Result<BranchAndBoundProblem<'a>> {
        check_network_dim(network, self.system.x_dim())?;
        check_state_dim(x_equilibrium, self.system.x_dim())?;
        Ok(BranchAndBoundProblem {
            system: self.system,
            config: self.config.clone(),
            network: network.clone(),
            x_equilibrium: x_equilibrium.to_owned(),
            lambda,
            epsilon,
            state: ProblemState::new(kind),
            nodes_explored: 0,
        })
    }
}

impl<'a> Verifier for BranchAndBoundVerifier<'a> {
    type Problem = BranchAndBoundProblem<'a>;

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
        if self.system.time_domain() == TimeDomain::Continuous {
            return Err(LyapError::SolverUnavailable(
                "branch and bound handles discrete-time derivatives only".to_string(),
            ));
        }
        self.problem(CertificateKind::Derivative, network, x_equilibrium, lambda, epsilon)
    }
}

/// Open node of the search tree.
#[derive(Debug, Clone)]
struct SearchNode {
    region: StateBox,
    mode: Option<usize>,
    /// Optimistic objective bound over the region.
    bound: f64,
    /// Larger is expanded first.
    priority: f64,
}

impl SearchNode {
    fn new(region: StateBox, mode: Option<usize>, bound: f64, sense: Sense) -> Self {
        let priority = match sense {
            Sense::Minimize => -bound,
            Sense::Maximize => bound,
        };
        Self {
            region,
            mode,
            bound,
            priority,
        }
    }
}

// For BinaryHeap: the most promising bound is popped first
impl PartialEq for SearchNode {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for SearchNode {}

impl PartialOrd for SearchNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.total_cmp(&other.priority)
    }
}

/// A certificate problem solved by interval branch and bound.
#[derive(Debug, Clone)]
pub struct BranchAndBoundProblem<'a> {
    system: &'a HybridLinearSystem,
    config: BranchAndBoundConfig,
    network: ReluNetwork,
    x_equilibrium: Array1<f64>,
    lambda: f64,
    epsilon: f64,
    state: ProblemState,
    nodes_explored: usize,
}

impl BranchAndBoundProblem<'_> {
    /// Boxes expanded by the last [`CertificateProblem::optimize`] call.
    pub fn nodes_explored(&self) -> usize {
        self.nodes_explored
    }

    /// Interval of `V` over a box.
    fn lyapunov_bounds(&self, region: &StateBox, network_at_equilibrium: f64) -> Result<Bound> {
        let n = self.network.interval_bounds(region)?;
        let r = region.l1_offset_range(self.x_equilibrium.view());
        let (a, b) = (self.lambda * r.lower, self.lambda * r.upper);
        Ok(Bound::new(
            n.lower - network_at_equilibrium + a.min(b),
            n.upper - network_at_equilibrium + a.max(b),
        ))
    }

    /// Lower bound of the positivity objective over `region`.
    fn positivity_bound(&self, region: &StateBox, network_at_equilibrium: f64) -> Result<f64> {
        let n = self.network.interval_bounds(region)?;
        let r = region.l1_offset_range(self.x_equilibrium.view());
        let coef = self.lambda - self.epsilon;
        Ok(n.lower - network_at_equilibrium + (coef * r.lower).min(coef * r.upper))
    }

    /// Upper bound of the derivative objective over `region` in `mode`.
    fn derivative_bound(
        &self,
        region: &StateBox,
        mode: usize,
        network_at_equilibrium: f64,
    ) -> Result<f64> {
        let m = &self.system.modes()[mode];
        let center = region.center();
        let radius = (region.upper() - region.lower()) * 0.5;
        let mid = m.a.dot(&center) + &m.c;
        let rad = m.a.mapv(f64::abs).dot(&radius);
        let image = StateBox::from_corners((&mid - &rad).view(), (&mid + &rad).view())?;
        let next = self.lyapunov_bounds(&image, network_at_equilibrium)?;
        let current = self.lyapunov_bounds(region, network_at_equilibrium)?;
        let coef = 1.0 - self.epsilon;
        Ok(next.upper - (coef * current.lower).min(coef * current.upper))
    }

    fn node_bound(
        &self,
        region: &StateBox,
        mode: Option<usize>,
        network_at_equilibrium: f64,
    ) -> Result<f64> {
        match mode {
            None => self.positivity_bound(region, network_at_equilibrium),
            Some(m) => self.derivative_bound(region, m, network_at_equilibrium),
        }
    }

    /// Exact objective at `x`, or `None` when `x` is outside `mode`.
    fn evaluate(
        &self,
        v: &LyapunovFunction,
        x: Array1<f64>,
        mode: Option<usize>,
    ) -> Result<Option<CandidateSolution>> {
        let activation = self.network.activation_pattern(x.view())?;
        let candidate = match mode {
            None => {
                let objective = v.value(x.view())? - self.epsilon * v.l1_offset(x.view());
                CandidateSolution {
                    state: x,
                    mode: None,
                    activation,
                    next_activation: None,
                    objective,
                }
            }
            Some(m) => {
                let dynamics = &self.system.modes()[m];
                if !dynamics.contains(x.view()) {
                    return Ok(None);
                }
                let next = dynamics.apply(x.view());
                let objective =
                    v.value(next.view())? - (1.0 - self.epsilon) * v.value(x.view())?;
                CandidateSolution {
                    next_activation: Some(self.network.activation_pattern(next.view())?),
                    state: x,
                    mode: Some(m),
                    activation,
                    objective,
                }
            }
        };
        if self.state.options.output_flag {
            trace!(
                "{} candidate x = {}, mode {:?}: {:.6e}",
                self.state.kind,
                candidate.state,
                candidate.mode,
                candidate.objective
            );
        }
        Ok(Some(candidate))
    }

    /// Modes a search over `region` has to consider.
    fn modes_for(&self, region: &StateBox) -> Vec<Option<usize>> {
        match self.state.kind {
            CertificateKind::Positivity => vec![None],
            CertificateKind::Derivative => self
                .system
                .modes()
                .iter()
                .enumerate()
                .filter(|(_, m)| m.may_intersect(region))
                .map(|(i, _)| Some(i))
                .collect(),
        }
    }

    /// Equilibrium and box corners, evaluated before branching.
    fn seed_states(&self) -> Vec<Array1<f64>> {
        let domain = self.system.domain();
        let mut seeds = Vec::new();
        if domain.contains(self.x_equilibrium.view()) {
            seeds.push(self.x_equilibrium.clone());
        }
        let dim = domain.dim();
        // Corner count grows as 2^dim; beyond a handful of axes only the two
        // extreme corners are used.
        let corners: Vec<usize> = if dim <= 10 {
            (0..1usize << dim).collect()
        } else {
            vec![0, usize::MAX]
        };
        for mask in corners {
            seeds.push(
                domain
                    .bounds
                    .iter()
                    .enumerate()
                    .map(|(i, b)| if mask >> i.min(63) & 1 == 1 { b.upper } else { b.lower })
                    .collect(),
            );
        }
        seeds
    }

    fn search(&mut self) -> Result<(SolveStatus, SolutionPool)> {
        let v = LyapunovFunction::new(&self.network, self.x_equilibrium.view(), self.lambda)?;
        let network_at_equilibrium = self.network.forward(self.x_equilibrium.view())?;
        let sense = self.state.sense();
        let gap = self.config.gap_tolerance;
        let mut pool = self.state.new_pool();

        for seed in self.seed_states() {
            let modes = match self.state.kind {
                CertificateKind::Positivity => vec![None],
                CertificateKind::Derivative => {
                    self.system.active_modes(seed.view()).into_iter().map(Some).collect()
                }
            };
            for mode in modes {
                if let Some(c) = self.evaluate(&v, seed.clone(), mode)? {
                    pool.offer(c);
                }
            }
        }

        let domain = self.system.domain().clone();
        let mut queue: BinaryHeap<SearchNode> = BinaryHeap::new();
        for mode in self.modes_for(&domain) {
            let bound = self.node_bound(&domain, mode, network_at_equilibrium)?;
            queue.push(SearchNode::new(domain.clone(), mode, bound, sense));
        }

        let mut explored = 0usize;
        // Best bound among boxes too narrow to split.
        let mut unresolved: Option<f64> = None;
        let status = loop {
            let Some(node) = queue.pop() else {
                break SolveStatus::Optimal;
            };
            if let Some(best) = pool.best() {
                if !sense.can_improve(node.bound, best.objective, gap) {
                    break SolveStatus::Optimal;
                }
            }
            if explored >= self.config.max_nodes {
                info!(
                    "{} search hit node limit {} with {} open boxes",
                    self.state.kind,
                    self.config.max_nodes,
                    queue.len() + 1
                );
                break SolveStatus::NodeLimit;
            }
            explored += 1;

            if let Some(c) = self.evaluate(&v, node.region.center(), node.mode)? {
                pool.offer(c);
            }
            if node.region.max_width() < self.config.min_box_width {
                if unresolved.map_or(true, |b| sense.is_better(node.bound, b)) {
                    unresolved = Some(node.bound);
                }
                continue;
            }
            let (left, right) = node.region.bisect();
            for child in [left, right] {
                if let Some(m) = node.mode {
                    if !self.system.modes()[m].may_intersect(&child) {
                        continue;
                    }
                }
                let bound = self.node_bound(&child, node.mode, network_at_equilibrium)?;
                let promising = pool
                    .best()
                    .map_or(true, |best| sense.can_improve(bound, best.objective, gap));
                if promising {
                    queue.push(SearchNode::new(child, node.mode, bound, sense));
                }
            }
        };
        let status = match (status, unresolved) {
            (SolveStatus::Optimal, Some(bound))
                if pool
                    .best()
                    .map_or(true, |best| sense.can_improve(bound, best.objective, gap)) =>
            {
                info!(
                    "{} search left a box at width {} with bound {:.6e}",
                    self.state.kind, self.config.min_box_width, bound
                );
                SolveStatus::GapNotClosed
            }
            (status, _) => status,
        };
        self.nodes_explored = explored;
        Ok((status, pool))
    }
}

impl CertificateProblem for BranchAndBoundProblem<'_> {
    fn kind(&self) -> CertificateKind {
        self.state.kind
    }

    fn set_options(&mut self, options: SolverOptions) {
        self.state.options = options;
    }

    fn optimize(&mut self) -> Result<SolveStatus> {
        let (status, pool) = self.search()?;
        let status = self.state.finish(status, pool);
        debug!(
            "{} problem: {} after {} boxes, objective {:.6e}",
            self.state.kind, status, self.nodes_explored, self.state.objective
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
