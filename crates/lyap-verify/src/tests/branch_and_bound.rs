//! Branch-and-bound verifier tests

use super::{
    asymmetric_system, clipped_network, derivative_at, halving_system, linspace, planar_system,
    random_network,
};
use crate::{
    BranchAndBoundConfig, BranchAndBoundVerifier, BreakpointVerifier, CertificateProblem,
    SolveStatus, Verifier,
};
use lyap_core::{CertificateKind, LyapError, TimeDomain};
use lyap_network::LyapunovFunction;
use ndarray::arr1;

const LAMBDA: f64 = 0.1;
const EPSILON: f64 = 0.01;

#[test]
fn test_agrees_with_breakpoint_on_scalar_systems() {
    let eq = arr1(&[0.0]);
    for sys in [halving_system(TimeDomain::Discrete), asymmetric_system()] {
        for seed in 0..4 {
            let net = random_network(&[1, 8, 1], 100 + seed);
            let exact = BreakpointVerifier::new(&sys).unwrap();
            let bab = BranchAndBoundVerifier::new(&sys);

            let mut p_exact = exact.positivity_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
            let mut p_bab = bab.positivity_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
            p_exact.optimize().unwrap();
            assert_eq!(p_bab.optimize().unwrap(), SolveStatus::Optimal);
            let (a, b) = (p_exact.objective_value().unwrap(), p_bab.objective_value().unwrap());
            assert!((a - b).abs() < 1e-5, "positivity seed {seed}: {a} vs {b}");
            assert!(b >= a - 1e-12);

            let mut d_exact = exact.derivative_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
            let mut d_bab = bab.derivative_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
            d_exact.optimize().unwrap();
            assert_eq!(d_bab.optimize().unwrap(), SolveStatus::Optimal);
            let (a, b) = (d_exact.objective_value().unwrap(), d_bab.objective_value().unwrap());
            assert!((a - b).abs() < 1e-5, "derivative seed {seed}: {a} vs {b}");
            assert!(b <= a + 1e-12);
        }
    }
}

#[test]
fn test_planar_derivative_bounds_grid() {
    let sys = planar_system();
    let eq = arr1(&[0.0, 0.0]);
    let net = random_network(&[2, 6, 1], 5);
    let verifier = BranchAndBoundVerifier::with_config(
        &sys,
        BranchAndBoundConfig {
            gap_tolerance: 1e-4,
            ..BranchAndBoundConfig::default()
        },
    );
    let mut problem = verifier.derivative_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
    assert_eq!(problem.optimize().unwrap(), SolveStatus::Optimal);
    assert!(problem.nodes_explored() > 0);
    let objective = problem.objective_value().unwrap();

    let v = LyapunovFunction::new(&net, eq.view(), LAMBDA).unwrap();
    for x0 in linspace(-1.0, 1.0, 81) {
        for x1 in linspace(-1.0, 1.0, 81) {
            for g in derivative_at(&sys, &v, &arr1(&[x0, x1]), EPSILON) {
                assert!(g <= objective + 1e-4 + 1e-9, "{g} exceeds {objective} at ({x0}, {x1})");
            }
        }
    }

    let best = problem.solution(0).unwrap();
    let mode = best.mode.unwrap();
    assert!(sys.modes()[mode].contains(best.state.view()));
    let attained = derivative_at(&sys, &v, &best.state, EPSILON);
    assert!(attained.iter().any(|g| (g - objective).abs() < 1e-12));
}

#[test]
fn test_planar_positivity_bounds_grid() {
    let sys = planar_system();
    let eq = arr1(&[0.0, 0.0]);
    let net = random_network(&[2, 6, 1], 6);
    let verifier = BranchAndBoundVerifier::with_config(
        &sys,
        BranchAndBoundConfig {
            gap_tolerance: 1e-4,
            ..BranchAndBoundConfig::default()
        },
    );
    let mut problem = verifier.positivity_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
    problem.optimize().unwrap();
    let objective = problem.objective_value().unwrap();
    // x* itself is feasible with objective 0.
    assert!(objective <= 0.0);

    let v = LyapunovFunction::new(&net, eq.view(), LAMBDA).unwrap();
    for x0 in linspace(-1.0, 1.0, 41) {
        for x1 in linspace(-1.0, 1.0, 41) {
            let x = arr1(&[x0, x1]);
            let h = v.value(x.view()).unwrap() - EPSILON * v.l1_offset(x.view());
            assert!(h >= objective - 1e-4 - 1e-9);
        }
    }
}

#[test]
fn test_node_limit_is_not_optimal() {
    let sys = halving_system(TimeDomain::Discrete);
    let eq = arr1(&[0.0]);
    let net = clipped_network();
    let verifier = BranchAndBoundVerifier::with_config(
        &sys,
        BranchAndBoundConfig {
            max_nodes: 0,
            ..BranchAndBoundConfig::default()
        },
    );
    let mut problem = verifier.positivity_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
    assert_eq!(problem.optimize().unwrap(), SolveStatus::NodeLimit);
    assert!(problem.solution_count() > 0);
    match problem.objective_value() {
        Err(LyapError::SolverNotOptimal { problem, status }) => {
            assert_eq!(problem, CertificateKind::Positivity);
            assert_eq!(status, "node limit");
        }
        other => panic!("expected SolverNotOptimal, got {other:?}"),
    }
}

#[test]
fn test_unsplit_narrow_box_leaves_gap_open() {
    let sys = halving_system(TimeDomain::Discrete);
    let eq = arr1(&[0.0]);
    let net = clipped_network();
    let coarse = BranchAndBoundVerifier::with_config(
        &sys,
        BranchAndBoundConfig {
            min_box_width: 10.0,
            ..BranchAndBoundConfig::default()
        },
    );
    let mut problem = coarse.positivity_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
    assert_eq!(problem.optimize().unwrap(), SolveStatus::GapNotClosed);
    assert!(problem.solution_count() > 0);
    match problem.objective_value() {
        Err(LyapError::SolverNotOptimal { status, .. }) => assert_eq!(status, "gap not closed"),
        other => panic!("expected SolverNotOptimal, got {other:?}"),
    }

    let mut problem = BranchAndBoundVerifier::new(&sys)
        .positivity_problem(&net, eq.view(), LAMBDA, EPSILON)
        .unwrap();
    assert_eq!(problem.optimize().unwrap(), SolveStatus::Optimal);
}

#[test]
fn test_continuous_derivative_unavailable() {
    let sys = halving_system(TimeDomain::Continuous);
    let net = random_network(&[1, 4, 1], 2);
    let eq = arr1(&[0.0]);
    let verifier = BranchAndBoundVerifier::new(&sys);
    assert!(matches!(
        verifier.derivative_problem(&net, eq.view(), LAMBDA, EPSILON),
        Err(LyapError::SolverUnavailable(_))
    ));
    // Positivity does not involve the dynamics.
    let mut problem = verifier.positivity_problem(&net, eq.view(), LAMBDA, EPSILON).unwrap();
    assert_eq!(problem.optimize().unwrap(), SolveStatus::Optimal);
}

#[test]
fn test_config_serde() {
    let config = BranchAndBoundConfig::default();
    let json = serde_json::to_string(&config).unwrap();
    let parsed: BranchAndBoundConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);
}
