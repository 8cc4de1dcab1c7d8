//! Training configuration.

use lyap_core::{LyapError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Parameter update rule used by the training loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerKind {
    /// Gradient descent, with heavy-ball momentum when `momentum > 0`.
    Sgd,
    #[default]
    Adam,
    /// Backtracking line search along the (momentum) gradient direction.
    LineSearchGd,
    /// Backtracking line search along the Adam direction.
    LineSearchAdam,
}

impl OptimizerKind {
    pub fn is_line_search(self) -> bool {
        matches!(self, OptimizerKind::LineSearchGd | OptimizerKind::LineSearchAdam)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adam => "adam",
            OptimizerKind::LineSearchGd => "line-search-gd",
            OptimizerKind::LineSearchAdam => "line-search-adam",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = LyapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "gd" | "line-search-gd" => Ok(OptimizerKind::LineSearchGd),
            "line-search-adam" => Ok(OptimizerKind::LineSearchAdam),
            other => Err(LyapError::InvalidConfig(format!(
                "unknown optimizer '{other}', expected sgd, adam, line-search-gd or line-search-adam"
            ))),
        }
    }
}

/// How the positivity and derivative gradients are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectGradientMethod {
    /// Plain sum of both gradients.
    #[default]
    None,
    /// On conflict, sum each gradient projected off the other.
    Sum,
    /// On conflict, follow one projected gradient, switching every iteration.
    Alternate,
    /// On conflict, positivity gradient plus the derivative gradient
    /// projected off it.
    EmphasizePositivity,
}

impl ProjectGradientMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectGradientMethod::None => "none",
            ProjectGradientMethod::Sum => "sum",
            ProjectGradientMethod::Alternate => "alternate",
            ProjectGradientMethod::EmphasizePositivity => "emphasize-positivity",
        }
    }
}

impl fmt::Display for ProjectGradientMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectGradientMethod {
    type Err = LyapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "none" => Ok(ProjectGradientMethod::None),
            "sum" => Ok(ProjectGradientMethod::Sum),
            "alternate" => Ok(ProjectGradientMethod::Alternate),
            "emphasize-positivity" => Ok(ProjectGradientMethod::EmphasizePositivity),
            other => Err(LyapError::InvalidConfig(format!(
                "unknown gradient projection method '{other}'"
            ))),
        }
    }
}

/// Configuration for [`crate::LyapunovTrainer`].
///
/// Every field has a default, so a JSON file only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub max_iterations: usize,
    /// Weight of `mean hinge(-V(x) + ε₂‖x - x*‖₁)` over positivity samples.
    pub positivity_sample_weight: f64,
    pub positivity_sample_margin: f64,
    /// Weight of `mean hinge(dV(x) + εV(x))` over derivative samples.
    pub derivative_sample_weight: f64,
    pub derivative_sample_margin: f64,
    /// Weight of `-min_x V(x) - ε₂‖x - x*‖₁`.
    pub positivity_certificate_weight: f64,
    /// Weight of `max_x dV(x) + εV(x)`.
    pub derivative_certificate_weight: f64,
    /// Ranked verifier solutions that enter the positivity certificate loss.
    pub positivity_pool_solutions: usize,
    pub derivative_pool_solutions: usize,
    /// Solution `j` of the pool is weighted by `rate^j`.
    pub positivity_decay_rate: f64,
    pub derivative_decay_rate: f64,
    /// ε₂ in `V(x) ≥ ε₂‖x - x*‖₁`.
    pub positivity_epsilon: f64,
    /// ε in `dV(x) ≤ -εV(x)`.
    pub derivative_epsilon: f64,
    /// Converged once the positivity objective is at least `-tol`.
    pub positivity_convergence_tol: f64,
    /// Converged once the derivative objective is at most `tol`.
    pub derivative_convergence_tol: f64,
    pub optimizer: OptimizerKind,
    /// Momentum for [`OptimizerKind::Sgd`] and [`OptimizerKind::LineSearchGd`].
    pub momentum: f64,
    /// A line-search trial is accepted when it lowers the loss by more than this.
    pub loss_minimal_decrement: f64,
    pub project_gradient_method: ProjectGradientMethod,
    /// Append each iteration's worst-case states to the sample pool.
    pub add_adversarial_states: bool,
    /// Sample losses use only the most recent entries of the pool.
    pub max_sample_pool_size: usize,
    /// Pass solver output through to the verifier.
    pub output_flag: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.003,
            max_iterations: 1000,
            positivity_sample_weight: 1.0,
            positivity_sample_margin: 0.0,
            derivative_sample_weight: 1.0,
            derivative_sample_margin: 0.0,
            positivity_certificate_weight: 10.0,
            derivative_certificate_weight: 10.0,
            positivity_pool_solutions: 10,
            derivative_pool_solutions: 10,
            positivity_decay_rate: 0.9,
            derivative_decay_rate: 0.9,
            positivity_epsilon: 0.01,
            derivative_epsilon: 0.01,
            positivity_convergence_tol: 1e-6,
            derivative_convergence_tol: 3e-5,
            optimizer: OptimizerKind::Adam,
            momentum: 0.0,
            loss_minimal_decrement: 0.0,
            project_gradient_method: ProjectGradientMethod::None,
            add_adversarial_states: false,
            max_sample_pool_size: 500,
            output_flag: false,
        }
    }
}

impl TrainingConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings no training run can use.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(LyapError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.max_sample_pool_size == 0 {
            return Err(LyapError::InvalidConfig(
                "sample window must hold at least one sample".to_string(),
            ));
        }
        for (name, rate) in [
            ("positivity", self.positivity_decay_rate),
            ("derivative", self.derivative_decay_rate),
        ] {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(LyapError::InvalidConfig(format!(
                    "{name} decay rate must be in (0, 1], got {rate}"
                )));
            }
        }
        for (name, count) in [
            ("positivity", self.positivity_pool_solutions),
            ("derivative", self.derivative_pool_solutions),
        ] {
            if count == 0 {
                return Err(LyapError::InvalidConfig(format!(
                    "{name} solution pool must hold at least one solution"
                )));
            }
        }
        for (name, weight) in [
            ("positivity sample", self.positivity_sample_weight),
            ("derivative sample", self.derivative_sample_weight),
            ("positivity certificate", self.positivity_certificate_weight),
            ("derivative certificate", self.derivative_certificate_weight),
        ] {
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(LyapError::InvalidConfig(format!(
                    "{name} weight must be non-negative, got {weight}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(LyapError::InvalidConfig(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if self.positivity_convergence_tol < 0.0 || self.derivative_convergence_tol < 0.0 {
            return Err(LyapError::InvalidConfig(
                "convergence tolerances must be non-negative".to_string(),
            ));
        }
        if self.loss_minimal_decrement < 0.0 {
            return Err(LyapError::InvalidConfig(format!(
                "loss minimal decrement must be non-negative, got {}",
                self.loss_minimal_decrement
            )));
        }
        Ok(())
    }
}
