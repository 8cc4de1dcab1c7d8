//! Verifier test suites.

mod branch_and_bound;
mod pool;

use lyap_core::{Bound, StateBox, TimeDomain};
use lyap_hybrid::HybridLinearSystem;
use lyap_network::{LinearLayer, LyapunovFunction, ReluNetwork};
use ndarray::{arr1, arr2, Array1};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// `x' = 0.5 x` on both halves of [-1, 1].
pub(crate) fn halving_system(time_domain: TimeDomain) -> HybridLinearSystem {
    let domain = StateBox::new(vec![Bound::new(-1.0, 1.0)]);
    let mut sys = HybridLinearSystem::new(domain, time_domain).unwrap();
    sys.add_mode(arr2(&[[0.5]]), arr1(&[0.0]), arr2(&[[-1.0]]), arr1(&[0.0]))
        .unwrap();
    sys.add_mode(arr2(&[[0.5]]), arr1(&[0.0]), arr2(&[[1.0]]), arr1(&[0.0]))
        .unwrap();
    sys
}

/// Piecewise system with different gains and an offset on each side.
pub(crate) fn asymmetric_system() -> HybridLinearSystem {
    let domain = StateBox::new(vec![Bound::new(-1.0, 1.0)]);
    let mut sys = HybridLinearSystem::new(domain, TimeDomain::Discrete).unwrap();
    sys.add_mode(arr2(&[[0.7]]), arr1(&[-0.05]), arr2(&[[-1.0]]), arr1(&[0.0]))
        .unwrap();
    sys.add_mode(arr2(&[[-0.4]]), arr1(&[0.0]), arr2(&[[1.0]]), arr1(&[0.0]))
        .unwrap();
    sys
}

/// Rotation-like contraction split along `x0 = 0`.
pub(crate) fn planar_system() -> HybridLinearSystem {
    let domain = StateBox::new(vec![Bound::new(-1.0, 1.0), Bound::new(-1.0, 1.0)]);
    let mut sys = HybridLinearSystem::new(domain, TimeDomain::Discrete).unwrap();
    sys.add_mode(
        arr2(&[[0.6, 0.2], [-0.2, 0.6]]),
        arr1(&[0.0, 0.0]),
        arr2(&[[-1.0, 0.0]]),
        arr1(&[0.0]),
    )
    .unwrap();
    sys.add_mode(
        arr2(&[[0.5, -0.3], [0.3, 0.5]]),
        arr1(&[0.0, 0.0]),
        arr2(&[[1.0, 0.0]]),
        arr1(&[0.0]),
    )
    .unwrap();
    sys
}

pub(crate) fn random_network(dims: &[usize], seed: u64) -> ReluNetwork {
    let mut rng = StdRng::seed_from_u64(seed);
    ReluNetwork::random(dims, &mut rng).unwrap()
}

/// `N(x) = relu(x) - relu(x - 0.5)`, on which interval bounds are loose.
pub(crate) fn clipped_network() -> ReluNetwork {
    let l1 = LinearLayer::new(arr2(&[[1.0], [1.0]]), arr1(&[0.0, -0.5])).unwrap();
    let l2 = LinearLayer::new(arr2(&[[1.0, -1.0]]), arr1(&[0.0])).unwrap();
    ReluNetwork::new(vec![l1, l2], 0.0).unwrap()
}

pub(crate) fn linspace(lo: f64, hi: f64, n: usize) -> impl Iterator<Item = f64> {
    (0..n).map(move |i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
}

/// Exact discrete-time derivative objective `V(x⁺) - (1 - ε)V(x)` over every
/// mode containing `x`.
pub(crate) fn derivative_at(
    sys: &HybridLinearSystem,
    v: &LyapunovFunction,
    x: &Array1<f64>,
    epsilon: f64,
) -> Vec<f64> {
    sys.active_modes(x.view())
        .into_iter()
        .map(|m| {
            let next = sys.step(x.view(), Some(m)).unwrap();
            v.value(next.view()).unwrap() - (1.0 - epsilon) * v.value(x.view()).unwrap()
        })
        .collect()
}
