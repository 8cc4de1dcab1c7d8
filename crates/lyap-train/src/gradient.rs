//! Combining the positivity and derivative gradients.

use crate::config::ProjectGradientMethod;
use lyap_core::CertificateKind;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Runtime form of [`ProjectGradientMethod`].
///
/// Two gradients conflict when their inner product is negative. Projecting
/// `g` off `u` removes its component along `u`, so a step along the result
/// does not increase the loss that `u` belongs to (to first order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientPolicy {
    None,
    Sum,
    /// Follows `primary` projected off the other gradient. `primary` flips
    /// on every call.
    Alternate { primary: CertificateKind },
    EmphasizePositivity,
}

impl From<ProjectGradientMethod> for GradientPolicy {
    fn from(method: ProjectGradientMethod) -> Self {
        match method {
            ProjectGradientMethod::None => GradientPolicy::None,
            ProjectGradientMethod::Sum => GradientPolicy::Sum,
            ProjectGradientMethod::Alternate => GradientPolicy::Alternate {
                primary: CertificateKind::Derivative,
            },
            ProjectGradientMethod::EmphasizePositivity => GradientPolicy::EmphasizePositivity,
        }
    }
}

/// Which gradient had its conflicting component removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    /// The positivity gradient, projected off the derivative gradient.
    Positivity,
    /// The derivative gradient, projected off the positivity gradient.
    Derivative,
    Both,
}

/// Gradient handed to the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedGradient {
    pub gradient: Array1<f64>,
    /// `None` when the gradients were simply added.
    pub projection: Option<Projection>,
}

impl ResolvedGradient {
    pub fn projected(&self) -> bool {
        self.projection.is_some()
    }
}

impl GradientPolicy {
    /// Combine `g_pos` and `g_der`. Never touches the parameters.
    pub fn resolve(&mut self, g_pos: ArrayView1<f64>, g_der: ArrayView1<f64>) -> ResolvedGradient {
        let resolved = self.combine(g_pos, g_der);
        if let Some(projection) = resolved.projection {
            debug!("gradient conflict: {:?} projected under {:?}", projection, self);
        }
        if let GradientPolicy::Alternate { primary } = self {
            *primary = match *primary {
                CertificateKind::Positivity => CertificateKind::Derivative,
                CertificateKind::Derivative => CertificateKind::Positivity,
            };
        }
        resolved
    }

    fn combine(&self, g_pos: ArrayView1<f64>, g_der: ArrayView1<f64>) -> ResolvedGradient {
        let plain = |gradient: Array1<f64>| ResolvedGradient {
            gradient,
            projection: None,
        };
        if is_zero(g_pos) {
            return plain(g_der.to_owned());
        }
        if is_zero(g_der) {
            return plain(g_pos.to_owned());
        }
        let conflict = g_pos.dot(&g_der) < 0.0;
        let (gradient, projection) = match (self, conflict) {
            (GradientPolicy::None, _) | (_, false) => return plain(&g_pos + &g_der),
            (GradientPolicy::Sum, true) => (
                project_off(g_pos, g_der) + project_off(g_der, g_pos),
                Projection::Both,
            ),
            (GradientPolicy::Alternate { primary }, true) => match primary {
                CertificateKind::Derivative => (project_off(g_der, g_pos), Projection::Derivative),
                CertificateKind::Positivity => (project_off(g_pos, g_der), Projection::Positivity),
            },
            (GradientPolicy::EmphasizePositivity, true) => {
                (&g_pos + &project_off(g_der, g_pos), Projection::Derivative)
            }
        };
        ResolvedGradient {
            gradient,
            projection: Some(projection),
        }
    }
}

/// `g - (g·u / u·u) u`; `g` itself when `u` is zero.
pub fn project_off(g: ArrayView1<f64>, u: ArrayView1<f64>) -> Array1<f64> {
    let uu = u.dot(&u);
    if uu == 0.0 {
        return g.to_owned();
    }
    let mut out = g.to_owned();
    out.scaled_add(-g.dot(&u) / uu, &u);
    out
}

fn is_zero(g: ArrayView1<f64>) -> bool {
    g.iter().all(|&v| v == 0.0)
}
