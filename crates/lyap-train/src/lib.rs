//! Certificate-guided training of ReLU Lyapunov functions.
//!
//! A [`LyapunovTrainer`] searches for network parameters θ such that
//! `V(x) = N(x) - N(x*) + λ‖x - x*‖₁` satisfies, over the whole state box,
//!
//! - positivity: `V(x) ≥ ε₂‖x - x*‖₁`,
//! - decrease: `dV(x) ≤ -εV(x)`.
//!
//! Each iteration combines hinge losses on sampled states with certificate
//! losses built from the verifier's worst-case states, resolves conflicts
//! between the positivity and derivative gradients, and takes one optimizer
//! step. Training stops as soon as both certificate objectives are within
//! tolerance.
//!
//! ```ignore
//! let mut trainer = LyapunovTrainer::new(&system, &verifier, &mut net, x_eq, 0.1, config)?;
//! let outcome = trainer.train(&samples)?;
//! assert!(outcome.converged);
//! ```

pub mod config;
pub mod gradient;
pub mod loss;
pub mod optimizer;
pub mod oracle;
pub mod pool;
pub mod trainer;
pub mod value_approx;

pub use config::{OptimizerKind, ProjectGradientMethod, TrainingConfig};
pub use gradient::{project_off, GradientPolicy, Projection, ResolvedGradient};
pub use loss::{hinge, SampleLossEvaluator};
pub use optimizer::{
    build_line_search_optimizer, build_optimizer, Adam, AdamParams, LineSearch, Optimizer, Sgd,
};
pub use oracle::{CertificateOracle, CertificateOutcome, CertificateSettings};
pub use pool::SamplePool;
pub use trainer::{
    LossEvaluation, LyapunovTrainer, PlateauOutcome, TrainingHistory, TrainingOutcome,
    TrainingState, WeightOverrides,
};
pub use value_approx::{
    generate_cost_to_go_samples, CostToGoSample, ValueApproximator, ValueApproximatorConfig,
};

#[cfg(test)]
mod tests;
