//! Core types and traits for ReLU Lyapunov synthesis.
//!
//! This crate provides the foundational abstractions shared by the network,
//! hybrid-system, verifier and training crates: the error type, interval
//! bounds over the state space, and the [`System`] interface the training
//! loop uses to step states forward.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    /// Create a new bound.
    #[inline]
    pub fn new(lower: f64, upper: f64) -> Self {
        debug_assert!(lower <= upper, "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// Create a concrete (point) bound.
    #[inline]
    pub fn concrete(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    /// Check if this bound contains a value.
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Width of the bound interval.
    #[inline]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    #[inline]
    pub fn midpoint(&self) -> f64 {
        0.5 * (self.lower + self.upper)
    }

    /// Check if bounds have exploded to infinity.
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_infinite() || self.upper.is_infinite()
    }

    /// Intersect two bounds.
    #[inline]
    pub fn intersect(&self, other: &Bound) -> Option<Bound> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        if lower <= upper {
            Some(Bound { lower, upper })
        } else {
            None
        }
    }

    /// Union of two bounds (convex hull).
    #[inline]
    pub fn union(&self, other: &Bound) -> Bound {
        Bound {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Tight bounds on `|v - center|` for `v` in this interval.
    pub fn abs_offset(&self, center: f64) -> Bound {
        let lo = self.lower - center;
        let hi = self.upper - center;
        if lo >= 0.0 {
            Bound::new(lo, hi)
        } else if hi <= 0.0 {
            Bound::new(-hi, -lo)
        } else {
            Bound::new(0.0, (-lo).max(hi))
        }
    }
}

impl From<RangeInclusive<f64>> for Bound {
    fn from(range: RangeInclusive<f64>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

/// Axis-aligned box in state space, one [`Bound`] per coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBox {
    pub bounds: Vec<Bound>,
}

impl StateBox {
    pub fn new(bounds: Vec<Bound>) -> Self {
        Self { bounds }
    }

    /// Build a box from per-coordinate lower and upper corners.
    pub fn from_corners(lower: ArrayView1<f64>, upper: ArrayView1<f64>) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(LyapError::shape_mismatch(vec![lower.len()], vec![upper.len()]));
        }
        let mut bounds = Vec::with_capacity(lower.len());
        for (i, (&lo, &up)) in lower.iter().zip(upper.iter()).enumerate() {
            if !(lo <= up) {
                return Err(LyapError::InvalidConfig(format!(
                    "box coordinate {i}: lower {lo} exceeds upper {up}"
                )));
            }
            bounds.push(Bound::new(lo, up));
        }
        Ok(Self { bounds })
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.bounds.len()
    }

    pub fn lower(&self) -> Array1<f64> {
        self.bounds.iter().map(|b| b.lower).collect()
    }

    pub fn upper(&self) -> Array1<f64> {
        self.bounds.iter().map(|b| b.upper).collect()
    }

    pub fn center(&self) -> Array1<f64> {
        self.bounds.iter().map(Bound::midpoint).collect()
    }

    pub fn contains(&self, x: ArrayView1<f64>) -> bool {
        x.len() == self.dim() && self.bounds.iter().zip(x.iter()).all(|(b, &v)| b.contains(v))
    }

    /// Largest coordinate width.
    pub fn max_width(&self) -> f64 {
        self.bounds.iter().map(Bound::width).fold(0.0, f64::max)
    }

    /// Bisect along the widest coordinate.
    pub fn bisect(&self) -> (StateBox, StateBox) {
        let axis = self
            .bounds
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(best, w), (i, b)| {
                if b.width() > w {
                    (i, b.width())
                } else {
                    (best, w)
                }
            })
            .0;
        let mid = self.bounds[axis].midpoint();
        let mut left = self.clone();
        let mut right = self.clone();
        left.bounds[axis].upper = mid;
        right.bounds[axis].lower = mid;
        (left, right)
    }

    /// Exact range of `‖x - center‖₁` over the box.
    pub fn l1_offset_range(&self, center: ArrayView1<f64>) -> Bound {
        self.bounds
            .iter()
            .zip(center.iter())
            .fold(Bound::concrete(0.0), |acc, (b, &c)| {
                let r = b.abs_offset(c);
                Bound::new(acc.lower + r.lower, acc.upper + r.upper)
            })
    }
}

/// Whether dynamics are a discrete update or a vector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeDomain {
    /// `x[n+1] = f(x[n])`; the Lyapunov derivative is `V(x[n+1]) - V(x[n])`.
    #[default]
    Discrete,
    /// `ẋ = f(x)`; the Lyapunov derivative is `∇V(x)·ẋ`.
    Continuous,
}

/// The two Lyapunov conditions that are certified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateKind {
    /// `min_x V(x) - ε₂‖x - x*‖₁ ≥ 0`.
    Positivity,
    /// `max_x dV(x) + εV(x) ≤ 0`.
    Derivative,
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateKind::Positivity => write!(f, "positivity"),
            CertificateKind::Derivative => write!(f, "derivative"),
        }
    }
}

/// Dynamical system interface consumed by the training loop.
///
/// `step_forward` returns the successor state for discrete-time systems and
/// the state derivative `ẋ` for continuous-time systems. When `mode` is
/// `None` the implementation locates the active mode itself.
pub trait System {
    fn x_dim(&self) -> usize;

    fn time_domain(&self) -> TimeDomain;

    fn step_forward(&self, state: ArrayView1<f64>, mode: Option<usize>) -> Result<Array1<f64>>;
}

/// Error types for Lyapunov synthesis.
#[derive(Debug, thiserror::Error)]
pub enum LyapError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{problem} problem did not reach optimality (status: {status})")]
    SolverNotOptimal {
        problem: CertificateKind,
        status: String,
    },

    #[error("Solver unavailable: {0}")]
    SolverUnavailable(String),

    #[error("State {state:?} is not covered by any mode")]
    StateOutsideModes { state: Vec<f64> },

    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LyapError {
    /// Create a ShapeMismatch error, panicking if shapes are identical (bug indicator).
    #[track_caller]
    pub fn shape_mismatch(expected: Vec<usize>, got: Vec<usize>) -> Self {
        if expected == got {
            let loc = std::panic::Location::caller();
            panic!(
                "BUG at {}:{}:{}: ShapeMismatch created with identical shapes: {:?}.",
                loc.file(),
                loc.line(),
                loc.column(),
                expected
            );
        }
        LyapError::ShapeMismatch { expected, got }
    }

    /// Whether the error happened before any training could run.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            LyapError::ShapeMismatch { .. } | LyapError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LyapError>;

/// Check that a state vector has the expected dimension.
#[inline]
pub fn check_state_dim(state: ArrayView1<f64>, x_dim: usize) -> Result<()> {
    if state.len() != x_dim {
        return Err(LyapError::shape_mismatch(vec![x_dim], vec![state.len()]));
    }
    Ok(())
}

/// Reject NaN and infinite values produced by a loss or objective.
#[inline]
pub fn ensure_finite(value: f64, what: &str) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(LyapError::NumericalInstability(format!("{what} is {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use proptest::prelude::*;

    #[test]
    fn test_bound_operations() {
        let a = Bound::new(0.0, 1.0);
        let b = Bound::new(0.5, 1.5);

        assert!(a.contains(0.5));
        assert!(!a.contains(1.5));

        let intersection = a.intersect(&b).unwrap();
        assert_eq!(intersection.lower, 0.5);
        assert_eq!(intersection.upper, 1.0);

        let union = a.union(&b);
        assert_eq!(union.lower, 0.0);
        assert_eq!(union.upper, 1.5);
        assert!(Bound::new(2.0, 3.0).intersect(&a).is_none());
    }

    #[test]
    fn test_abs_offset_straddling_center() {
        let b = Bound::new(-2.0, 1.0);
        assert_eq!(b.abs_offset(0.0), Bound::new(0.0, 2.0));
        assert_eq!(b.abs_offset(3.0), Bound::new(2.0, 5.0));
        assert_eq!(b.abs_offset(-5.0), Bound::new(3.0, 6.0));
    }

    #[test]
    fn test_state_box_bisect_widest_axis() {
        let bx = StateBox::new(vec![Bound::new(0.0, 1.0), Bound::new(-4.0, 4.0)]);
        let (left, right) = bx.bisect();
        assert_eq!(left.bounds[1], Bound::new(-4.0, 0.0));
        assert_eq!(right.bounds[1], Bound::new(0.0, 4.0));
        assert_eq!(left.bounds[0], bx.bounds[0]);
        assert_eq!(bx.max_width(), 8.0);
    }

    #[test]
    fn test_state_box_from_corners_rejects_inverted() {
        let err = StateBox::from_corners(arr1(&[1.0]).view(), arr1(&[0.0]).view()).unwrap_err();
        assert!(err.is_configuration_error());
        let err = StateBox::from_corners(arr1(&[1.0]).view(), arr1(&[2.0, 3.0]).view())
            .unwrap_err();
        assert!(matches!(err, LyapError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = LyapError::SolverNotOptimal {
            problem: CertificateKind::Derivative,
            status: "node limit".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("derivative"));
        assert!(msg.contains("node limit"));

        let err = LyapError::shape_mismatch(vec![2], vec![3]);
        assert!(err.to_string().contains("[2]"));
    }

    #[test]
    #[should_panic(expected = "identical shapes")]
    fn test_shape_mismatch_identical_panics() {
        let _ = LyapError::shape_mismatch(vec![1, 2], vec![1, 2]);
    }

    #[test]
    fn test_ensure_finite() {
        assert_eq!(ensure_finite(1.5, "loss").unwrap(), 1.5);
        assert!(matches!(
            ensure_finite(f64::NAN, "loss"),
            Err(LyapError::NumericalInstability(_))
        ));
    }

    proptest! {
        #[test]
        fn l1_offset_range_contains_samples(
            lo in -5.0f64..0.0, hi in 0.0f64..5.0, c in -6.0f64..6.0, t in 0.0f64..=1.0
        ) {
            let bx = StateBox::new(vec![Bound::new(lo, hi)]);
            let range = bx.l1_offset_range(arr1(&[c]).view());
            let v = lo + (hi - lo) * t;
            let d = (v - c).abs();
            prop_assert!(range.lower - 1e-12 <= d && d <= range.upper + 1e-12);
        }
    }
}
