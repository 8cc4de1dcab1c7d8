//! Solution pool tests

use crate::{CandidateSolution, Sense, SolutionPool, SolveStatus, SolverOptions};
use lyap_network::ActivationPattern;
use ndarray::arr1;
use proptest::prelude::*;

fn candidate(x: f64, mode: Option<usize>, objective: f64) -> CandidateSolution {
    CandidateSolution {
        state: arr1(&[x]),
        mode,
        activation: ActivationPattern { active: vec![vec![true]] },
        next_activation: None,
        objective,
    }
}

#[test]
fn test_pool_keeps_best_in_rank_order() {
    let mut pool = SolutionPool::new(Sense::Maximize, 3);
    assert!(pool.is_empty());
    for (i, obj) in [0.1, 0.5, -0.2, 0.3, 0.4].into_iter().enumerate() {
        pool.offer(candidate(i as f64, None, obj));
    }
    let objectives: Vec<f64> = (0..pool.len()).map(|r| pool.get(r).unwrap().objective).collect();
    assert_eq!(objectives, vec![0.5, 0.4, 0.3]);
    assert_eq!(pool.best().unwrap().state, arr1(&[1.0]));
}

#[test]
fn test_pool_merges_duplicates() {
    let mut pool = SolutionPool::new(Sense::Minimize, 4);
    assert!(pool.offer(candidate(0.5, Some(0), 1.0)));
    assert!(!pool.offer(candidate(0.5, Some(0), 2.0)));
    assert!(pool.offer(candidate(0.5, Some(0), 0.5)));
    assert_eq!(pool.len(), 1);
    // Same state under another mode is a different solution.
    assert!(pool.offer(candidate(0.5, Some(1), 0.7)));
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.best().unwrap().objective, 0.5);
}

#[test]
fn test_zero_capacity_keeps_one() {
    let mut pool = SolutionPool::new(Sense::Minimize, 0);
    pool.offer(candidate(0.0, None, 3.0));
    pool.offer(candidate(1.0, None, 2.0));
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.best().unwrap().objective, 2.0);
}

#[test]
fn test_defaults_and_display() {
    let options = SolverOptions::default();
    assert!(!options.output_flag);
    assert_eq!(options.pool_solutions, 1);
    assert_eq!(SolveStatus::NodeLimit.to_string(), "node limit");
    assert_eq!(SolveStatus::GapNotClosed.to_string(), "gap not closed");
    assert!(Sense::Minimize.can_improve(-1.0, 0.0, 1e-6));
    assert!(!Sense::Maximize.can_improve(1e-7, 0.0, 1e-6));
}

proptest! {
    #[test]
    fn pool_is_sorted_and_holds_the_optimum(
        objectives in prop::collection::vec(-10.0f64..10.0, 1..40),
        capacity in 1usize..8,
    ) {
        let mut pool = SolutionPool::new(Sense::Maximize, capacity);
        for (i, &obj) in objectives.iter().enumerate() {
            pool.offer(candidate(i as f64, None, obj));
        }
        prop_assert!(pool.len() <= capacity);
        prop_assert_eq!(pool.len(), objectives.len().min(capacity));
        let best = objectives.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        prop_assert_eq!(pool.best().unwrap().objective, best);
        for r in 1..pool.len() {
            prop_assert!(pool.get(r - 1).unwrap().objective >= pool.get(r).unwrap().objective);
        }
    }
}
