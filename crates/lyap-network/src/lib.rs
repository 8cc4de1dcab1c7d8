//! Piecewise-linear networks used as Lyapunov candidates.
//!
//! [`ReluNetwork`] is a feed-forward network with (leaky) ReLU hidden
//! activations and a scalar output. Besides evaluation it exposes:
//! - the gradient of the output with respect to the flattened parameter
//!   vector θ, optionally under a fixed [`ActivationPattern`] (the linear
//!   region a verifier reported),
//! - input gradients and tangent (directional-derivative) gradients for
//!   continuous-time systems,
//! - interval bounds over a state box,
//! - parameter snapshots that serialize to JSON.
//!
//! [`LyapunovFunction`] wraps a network into
//! `V(x) = N(x) - N(x*) + λ‖x - x*‖₁` and evaluates both Lyapunov conditions
//! together with their θ-gradients.

pub mod lyapunov;
pub mod network;

pub use lyapunov::{ConditionValue, LyapunovFunction};
pub use network::{ActivationPattern, LinearLayer, NetworkSnapshot, ReluNetwork};
