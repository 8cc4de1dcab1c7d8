//! Training test suites.
//!
//! Most tests run against [`ScriptedVerifier`], whose objectives follow a
//! script and which records every call it receives.


use lyap_core::{CertificateKind, LyapError, Result, System, TimeDomain};
use lyap_network::{LinearLayer, ReluNetwork};
use lyap_verify::{CandidateSolution, CertificateProblem, SolveStatus, SolverOptions, Verifier};
use ndarray::{arr1, arr2, Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// `x⁺ = 0.5 x` in one dimension.
pub(crate) struct Halving;

impl System for Halving {
    fn x_dim(&self) -> usize {
        1
    }

    fn time_domain(&self) -> TimeDomain {
        TimeDomain::Discrete
    }

    fn step_forward(&self, state: ArrayView1<f64>, _mode: Option<usize>) -> Result<Array1<f64>> {
        if state.len() != 1 {
            return Err(LyapError::shape_mismatch(vec![1], vec![state.len()]));
        }
        Ok(&state * 0.5)
    }
}

/// Verifier whose objectives come from per-condition scripts. Call `k`
/// returns entry `k` of the script, or the last entry once it runs out.
pub(crate) struct ScriptedVerifier {
    positivity: Vec<f64>,
    derivative: Vec<f64>,
    positivity_calls: Cell<usize>,
    derivative_calls: Cell<usize>,
    /// States reported as the ranked solutions of every problem.
    pub solution_states: Vec<Array1<f64>>,
    /// Replaces `solution_states` for derivative problems.
    pub derivative_solution_states: Option<Vec<Array1<f64>>>,
    /// Status returned by `optimize` instead of `Optimal`.
    pub failure: Option<SolveStatus>,
    /// Number of `solution()` calls over all problems.
    pub solution_calls: Rc<Cell<usize>>,
    /// Network parameters at every positivity problem build.
    pub recorded: RefCell<Vec<Array1<f64>>>,
}

impl ScriptedVerifier {
    pub(crate) fn new(positivity: &[f64], derivative: &[f64]) -> Self {
        Self {
            positivity: positivity.to_vec(),
            derivative: derivative.to_vec(),
            positivity_calls: Cell::new(0),
            derivative_calls: Cell::new(0),
            solution_states: vec![arr1(&[0.5]), arr1(&[-0.25]), arr1(&[0.75])],
            derivative_solution_states: None,
            failure: None,
            solution_calls: Rc::new(Cell::new(0)),
            recorded: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn builds(&self) -> usize {
        self.positivity_calls.get()
    }

    fn next(script: &[f64], calls: &Cell<usize>) -> f64 {
        let k = calls.get();
        calls.set(k + 1);
        script[k.min(script.len() - 1)]
    }

    fn problem(
        &self,
        kind: CertificateKind,
        network: &ReluNetwork,
        objective: f64,
    ) -> Result<ScriptedProblem> {
        let states = match (kind, &self.derivative_solution_states) {
            (CertificateKind::Derivative, Some(states)) => states,
            _ => &self.solution_states,
        };
        let solutions = states
            .iter()
            .map(|state| -> Result<CandidateSolution> {
                Ok(CandidateSolution {
                    state: state.clone(),
                    mode: (kind == CertificateKind::Derivative).then_some(0),
                    activation: network.activation_pattern(state.view())?,
                    next_activation: None,
                    objective,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ScriptedProblem {
            kind,
            objective,
            solutions,
            failure: self.failure,
            status: SolveStatus::NotSolved,
            pool_solutions: 1,
            solution_calls: Rc::clone(&self.solution_calls),
        })
    }
}

impl Verifier for ScriptedVerifier {
    type Problem = ScriptedProblem;

    fn positivity_problem(
        &self,
        network: &ReluNetwork,
        _x_equilibrium: ArrayView1<f64>,
        _lambda: f64,
        _epsilon: f64,
    ) -> Result<ScriptedProblem> {
        self.recorded.borrow_mut().push(network.parameters());
        let objective = Self::next(&self.positivity, &self.positivity_calls);
        self.problem(CertificateKind::Positivity, network, objective)
    }

    fn derivative_problem(
        &self,
        network: &ReluNetwork,
        _x_equilibrium: ArrayView1<f64>,
        _lambda: f64,
        _epsilon: f64,
    ) -> Result<ScriptedProblem> {
        let objective = Self::next(&self.derivative, &self.derivative_calls);
        self.problem(CertificateKind::Derivative, network, objective)
    }
}

pub(crate) struct ScriptedProblem {
    kind: CertificateKind,
    objective: f64,
    solutions: Vec<CandidateSolution>,
    failure: Option<SolveStatus>,
    status: SolveStatus,
    pool_solutions: usize,
    solution_calls: Rc<Cell<usize>>,
}

impl CertificateProblem for ScriptedProblem {
    fn kind(&self) -> CertificateKind {
        self.kind
    }

    fn set_options(&mut self, options: SolverOptions) {
        self.pool_solutions = options.pool_solutions;
    }

    fn optimize(&mut self) -> Result<SolveStatus> {
        self.status = self.failure.unwrap_or(SolveStatus::Optimal);
        Ok(self.status)
    }

    fn status(&self) -> SolveStatus {
        self.status
    }

    fn objective_value(&self) -> Result<f64> {
        if self.status != SolveStatus::Optimal {
            return Err(LyapError::SolverNotOptimal {
                problem: self.kind,
                status: self.status.to_string(),
            });
        }
        Ok(self.objective)
    }

    fn solution(&self, rank: usize) -> Option<&CandidateSolution> {
        self.solution_calls.set(self.solution_calls.get() + 1);
        self.solutions[..self.solution_count()].get(rank)
    }

    fn solution_count(&self) -> usize {
        self.solutions.len().min(self.pool_solutions)
    }
}

pub(crate) fn random_network(dims: &[usize], seed: u64) -> ReluNetwork {
    let mut rng = StdRng::seed_from_u64(seed);
    ReluNetwork::random(dims, &mut rng).unwrap()
}

/// One hidden layer of four neurons on which `V` violates both conditions.
pub(crate) fn toy_network() -> ReluNetwork {
    let l1 = LinearLayer::new(
        arr2(&[[1.0], [-1.0], [0.5], [-0.3]]),
        arr1(&[0.0, 0.0, 0.1, 0.2]),
    )
    .unwrap();
    let l2 = LinearLayer::new(arr2(&[[-1.0, -1.0, 0.2, 0.1]]), arr1(&[0.0])).unwrap();
    ReluNetwork::new(vec![l1, l2], 0.0).unwrap()
}

/// `N(x) = relu(x + 2)`, linear on [-1, 1].
pub(crate) fn affine_network() -> ReluNetwork {
    let l1 = LinearLayer::new(arr2(&[[1.0]]), arr1(&[2.0])).unwrap();
    let l2 = LinearLayer::new(arr2(&[[1.0]]), arr1(&[0.0])).unwrap();
    ReluNetwork::new(vec![l1, l2], 0.0).unwrap()
}

pub(crate) fn linspace(lo: f64, hi: f64, n: usize) -> Vec<Array1<f64>> {
    (0..n)
        .map(|i| arr1(&[lo + (hi - lo) * i as f64 / (n - 1) as f64]))
        .collect()
}
