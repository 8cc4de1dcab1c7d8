//! Autonomous hybrid linear systems.
//!
//! The state space is partitioned into polyhedral modes `{x : P x ≤ q}`. In
//! mode `i` the dynamics are affine:
//! - discrete time: `x[n+1] = Aᵢ x[n] + cᵢ`
//! - continuous time: `ẋ = Aᵢ x + cᵢ`
//!
//! The system also carries a bounding box of states of interest, which the
//! verifiers optimize over.

use lyap_core::{check_state_dim, Bound, LyapError, Result, StateBox, System, TimeDomain};
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Slack used when testing `P x ≤ q`.
pub const MODE_TOLERANCE: f64 = 1e-10;

/// One affine mode: dynamics `A x + c` on the polyhedron `P x ≤ q`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineMode {
    pub a: Array2<f64>,
    pub c: Array1<f64>,
    pub p: Array2<f64>,
    pub q: Array1<f64>,
}

impl AffineMode {
    /// Whether `x` satisfies `P x ≤ q` up to [`MODE_TOLERANCE`].
    pub fn contains(&self, x: ArrayView1<f64>) -> bool {
        self.p
            .dot(&x)
            .iter()
            .zip(self.q.iter())
            .all(|(lhs, rhs)| *lhs <= rhs + MODE_TOLERANCE)
    }

    /// `A x + c`.
    pub fn apply(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.a.dot(&x) + &self.c
    }

    /// Whether the polyhedron may intersect `domain`, judged row by row with
    /// the exact minimum of each `pᵀx` over the box.
    pub fn may_intersect(&self, domain: &StateBox) -> bool {
        self.p.outer_iter().zip(self.q.iter()).all(|(row, &rhs)| {
            let min: f64 = row
                .iter()
                .zip(domain.bounds.iter())
                .map(|(&w, b)| if w >= 0.0 { w * b.lower } else { w * b.upper })
                .sum();
            min <= rhs + MODE_TOLERANCE
        })
    }
}

/// Piecewise-affine autonomous system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridLinearSystem {
    x_dim: usize,
    time_domain: TimeDomain,
    domain: StateBox,
    modes: Vec<AffineMode>,
}

impl HybridLinearSystem {
    /// Create a system with no modes over the given state box.
    pub fn new(domain: StateBox, time_domain: TimeDomain) -> Result<Self> {
        if domain.dim() == 0 {
            return Err(LyapError::InvalidConfig(
                "state dimension must be positive".to_string(),
            ));
        }
        Ok(Self {
            x_dim: domain.dim(),
            time_domain,
            domain,
            modes: Vec::new(),
        })
    }

    /// Add a mode and return its index.
    pub fn add_mode(
        &mut self,
        a: Array2<f64>,
        c: Array1<f64>,
        p: Array2<f64>,
        q: Array1<f64>,
    ) -> Result<usize> {
        let n = self.x_dim;
        if a.dim() != (n, n) {
            return Err(LyapError::shape_mismatch(vec![n, n], vec![a.nrows(), a.ncols()]));
        }
        if c.len() != n {
            return Err(LyapError::shape_mismatch(vec![n], vec![c.len()]));
        }
        if p.ncols() != n {
            return Err(LyapError::shape_mismatch(vec![p.nrows(), n], vec![p.nrows(), p.ncols()]));
        }
        if p.nrows() != q.len() {
            return Err(LyapError::shape_mismatch(vec![p.nrows()], vec![q.len()]));
        }
        self.modes.push(AffineMode { a, c, p, q });
        Ok(self.modes.len() - 1)
    }

    pub fn domain(&self) -> &StateBox {
        &self.domain
    }

    pub fn modes(&self) -> &[AffineMode] {
        &self.modes
    }

    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    /// First mode containing `x`.
    pub fn mode_of(&self, x: ArrayView1<f64>) -> Option<usize> {
        self.modes.iter().position(|m| m.contains(x))
    }

    /// Every mode containing `x` (more than one on shared boundaries).
    pub fn active_modes(&self, x: ArrayView1<f64>) -> Vec<usize> {
        self.modes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.contains(x))
            .map(|(i, _)| i)
            .collect()
    }

    /// For scalar systems, the interval of mode `mode` inside the domain box,
    /// or `None` when it is empty.
    pub fn scalar_mode_interval(&self, mode: usize) -> Result<Option<Bound>> {
        if self.x_dim != 1 {
            return Err(LyapError::SolverUnavailable(format!(
                "mode intervals need a scalar system, state dimension is {}",
                self.x_dim
            )));
        }
        let m = self.modes.get(mode).ok_or_else(|| {
            LyapError::InvalidConfig(format!("mode {mode} out of range ({})", self.modes.len()))
        })?;
        let mut interval = self.domain.bounds[0];
        for (row, &rhs) in m.p.outer_iter().zip(m.q.iter()) {
            let w = row[0];
            if w > 0.0 {
                interval.upper = interval.upper.min(rhs / w);
            } else if w < 0.0 {
                interval.lower = interval.lower.max(rhs / w);
            } else if rhs < -MODE_TOLERANCE {
                return Ok(None);
            }
        }
        if interval.lower > interval.upper {
            return Ok(None);
        }
        Ok(Some(interval))
    }

    /// Successor (or state derivative) of `x` under the given or located mode.
    pub fn step(&self, x: ArrayView1<f64>, mode: Option<usize>) -> Result<Array1<f64>> {
        check_state_dim(x, self.x_dim)?;
        let mode = match mode {
            Some(m) if m < self.modes.len() => m,
            Some(m) => {
                return Err(LyapError::InvalidConfig(format!(
                    "mode {m} out of range ({})",
                    self.modes.len()
                )))
            }
            None => self.mode_of(x).ok_or_else(|| LyapError::StateOutsideModes {
                state: x.to_vec(),
            })?,
        };
        Ok(self.modes[mode].apply(x))
    }

    /// Simulate from `x0` for up to `steps` steps; continuous-time systems use
    /// forward Euler with step `dt`. The trajectory ends early when a state
    /// leaves every mode.
    pub fn rollout(&self, x0: ArrayView1<f64>, steps: usize, dt: f64) -> Result<Vec<Array1<f64>>> {
        check_state_dim(x0, self.x_dim)?;
        let mut trajectory = Vec::with_capacity(steps + 1);
        trajectory.push(x0.to_owned());
        for _ in 0..steps {
            let Some(x) = trajectory.last() else { break };
            let Some(mode) = self.mode_of(x.view()) else {
                debug!("rollout left all modes at {:?}", x);
                break;
            };
            let f = self.modes[mode].apply(x.view());
            let next = match self.time_domain {
                TimeDomain::Discrete => f,
                TimeDomain::Continuous => x + &(f * dt),
            };
            trajectory.push(next);
        }
        Ok(trajectory)
    }

    /// Accumulated instantaneous cost along a rollout from `x0`.
    ///
    /// Stops once the state is within `goal_tolerance` (∞-norm) of `x_goal`.
    /// Continuous-time costs are integrated with step `dt`.
    pub fn cost_to_go<F>(
        &self,
        x0: ArrayView1<f64>,
        steps: usize,
        dt: f64,
        instantaneous_cost: F,
        x_goal: Option<(ArrayView1<f64>, f64)>,
    ) -> Result<f64>
    where
        F: Fn(ArrayView1<f64>) -> f64,
    {
        let trajectory = self.rollout(x0, steps, dt)?;
        let scale = match self.time_domain {
            TimeDomain::Discrete => 1.0,
            TimeDomain::Continuous => dt,
        };
        let mut cost = 0.0;
        for x in &trajectory {
            if let Some((goal, tol)) = x_goal {
                let dist = x
                    .iter()
                    .zip(goal.iter())
                    .fold(0.0f64, |acc, (a, b)| acc.max((a - b).abs()));
                if dist <= tol {
                    break;
                }
            }
            cost += scale * instantaneous_cost(x.view());
        }
        Ok(cost)
    }

    /// Uniform random states in the domain box.
    pub fn sample_uniform<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<Array1<f64>> {
        (0..count)
            .map(|_| {
                self.domain
                    .bounds
                    .iter()
                    .map(|b| {
                        if b.width() > 0.0 {
                            rng.random_range(b.lower..=b.upper)
                        } else {
                            b.lower
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Regular grid over the domain box with `points_per_dim` points per axis.
    pub fn grid(&self, points_per_dim: usize) -> Vec<Array1<f64>> {
        let axes: Vec<Vec<f64>> = self
            .domain
            .bounds
            .iter()
            .map(|b| {
                if points_per_dim <= 1 {
                    vec![b.midpoint()]
                } else {
                    (0..points_per_dim)
                        .map(|i| b.lower + b.width() * i as f64 / (points_per_dim - 1) as f64)
                        .collect()
                }
            })
            .collect();
        let mut points: Vec<Vec<f64>> = vec![Vec::new()];
        for axis in &axes {
            points = points
                .into_iter()
                .flat_map(|prefix| {
                    axis.iter().map(move |&v| {
                        let mut p = prefix.clone();
                        p.push(v);
                        p
                    })
                })
                .collect();
        }
        points.into_iter().map(Array1::from).collect()
    }
}

impl System for HybridLinearSystem {
    fn x_dim(&self) -> usize {
        self.x_dim
    }

    fn time_domain(&self) -> TimeDomain {
        self.time_domain
    }

    fn step_forward(&self, state: ArrayView1<f64>, mode: Option<usize>) -> Result<Array1<f64>> {
        self.step(state, mode)
    }
}
