//! Example: synthesize a ReLU Lyapunov function for a scalar piecewise-linear system.
//!
//! Usage: cargo run -p lyap-train --example toy_1d -- [config.json] [history.json]

use lyap_core::{Bound, StateBox, TimeDomain};
use lyap_hybrid::HybridLinearSystem;
use lyap_network::ReluNetwork;
use lyap_train::{LyapunovTrainer, TrainingConfig, ValueApproximator};
use lyap_verify::BreakpointVerifier;
use ndarray::{arr1, arr2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::env;
use std::path::Path;

fn main() -> lyap_core::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) => TrainingConfig::from_json_file(Path::new(path))?,
        None => TrainingConfig {
            max_iterations: 300,
            ..TrainingConfig::default()
        },
    };

    // x⁺ = 0.5 x for x ≥ 0 and x⁺ = 0.8 x for x ≤ 0 on [-1, 1].
    let domain = StateBox::new(vec![Bound::new(-1.0, 1.0)]);
    let mut system = HybridLinearSystem::new(domain, TimeDomain::Discrete)?;
    system.add_mode(arr2(&[[0.5]]), arr1(&[0.0]), arr2(&[[-1.0]]), arr1(&[0.0]))?;
    system.add_mode(arr2(&[[0.8]]), arr1(&[0.0]), arr2(&[[1.0]]), arr1(&[0.0]))?;

    let mut rng = StdRng::seed_from_u64(0);
    let mut network = ReluNetwork::random(&[1, 8, 8, 1], &mut rng)?;
    let x_equilibrium = arr1(&[0.0]);
    let lambda = 0.1;
    let samples = system.grid(41);

    println!("=== Warm start ===");
    let (fitted, mse) = ValueApproximator::new().train(
        &mut network,
        &system,
        &samples,
        30,
        1.0,
        |x: ArrayView1<f64>| x.dot(&x),
        Some((x_equilibrium.view(), 1e-3)),
        x_equilibrium.view(),
        lambda,
    )?;
    println!("Cost-to-go fit: converged {}, mse {:.3e}", fitted, mse);

    println!("\n=== Certificate training ===");
    let verifier = BreakpointVerifier::new(&system)?;
    let mut trainer = LyapunovTrainer::new(
        &system,
        &verifier,
        &mut network,
        x_equilibrium.clone(),
        lambda,
        config,
    )?;
    let outcome = trainer.train(&samples)?;
    println!("State: {:?}", outcome.state);
    println!("Iterations: {}", outcome.history.len());
    if let (Some(pos), Some(der)) = (
        outcome.history.positivity_objectives.last(),
        outcome.history.derivative_objectives.last(),
    ) {
        println!("Positivity objective: {:.6e}", pos);
        println!("Derivative objective: {:.6e}", der);
    }

    if let Some(path) = args.get(2) {
        outcome.history.write_json(Path::new(path))?;
        println!("History written to {}", path);
    }
    Ok(())
}
