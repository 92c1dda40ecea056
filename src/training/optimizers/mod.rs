//! Optimizers and learning rate schedulers
//!
//! Three optimisation strategies are supported:
//!
//! - `sgd`: momentum SGD with L2 weight decay, cosine annealed per epoch
//! - `sgdp`: SGD with projection-aware decoupled weight decay, cosine annealed
//! - `adamp`: AdamP, no external schedule
//!
//! [`build_optimizer`] turns a strategy into an [`OptimizerSet`], which gives the
//! training loop a uniform `step` / `advance_schedule` surface.

pub mod adamp;
pub mod projection;
pub mod schedulers;
pub mod sgd;
pub mod sgdp;

pub use adamp::AdamPOptimizer;
pub use projection::ProjectionParams;
pub use schedulers::CosineAnnealingScheduler;
pub use sgd::SGDOptimizer;
pub use sgdp::SGDPOptimizer;

use std::fmt;
use std::str::FromStr;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Perform optimization step
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Get parameter count
    fn parameter_count(&self) -> usize;

    /// Get current step count
    fn step_count(&self) -> usize;
}

/// Trait for learning rate schedulers
pub trait Scheduler: Send {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance one epoch and return the new learning rate
    fn step(&mut self) -> f64;

    /// Get current learning rate
    fn get_lr(&self) -> f64;

    /// Number of steps taken so far
    fn last_epoch(&self) -> usize;
}

/// Optimisation strategy selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationStrategy {
    /// Momentum SGD with L2 weight decay
    #[serde(rename = "sgd")]
    PlainMomentum,
    /// SGDP
    #[serde(rename = "sgdp")]
    DecoupledMomentum,
    /// AdamP
    #[serde(rename = "adamp")]
    DecoupledAdaptive,
}

impl OptimizationStrategy {
    /// Name used on the command line and in checkpoint file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainMomentum => "sgd",
            Self::DecoupledMomentum => "sgdp",
            Self::DecoupledAdaptive => "adamp",
        }
    }

    /// Whether the strategy is paired with an epoch schedule
    pub fn uses_schedule(&self) -> bool {
        !matches!(self, Self::DecoupledAdaptive)
    }
}

impl FromStr for OptimizationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sgd" => Ok(Self::PlainMomentum),
            "sgdp" => Ok(Self::DecoupledMomentum),
            "adamp" => Ok(Self::DecoupledAdaptive),
            other => Err(Error::InvalidOptimizer(other.to_string())),
        }
    }
}

impl fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hyperparameters shared by all strategies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerParams {
    /// Initial learning rate
    pub learning_rate: f64,
    /// Momentum coefficient (first moment decay for AdamP is fixed)
    pub momentum: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

/// Snapshot of the trainable variables, sorted by name
pub(crate) fn trainable_vars(var_map: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("variable map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Build the optimizer (and its schedule, if any) for a strategy
///
/// Scheduled strategies start their curve at `max(resume_epoch - 1, 0)` so
/// that the first epoch boundary of a resumed run lands where a continuous
/// run would be.
pub fn build_optimizer(
    strategy: OptimizationStrategy,
    var_map: &VarMap,
    params: &OptimizerParams,
    epoch_count: usize,
    resume_epoch: usize,
) -> Result<(Box<dyn Optimizer>, Option<Box<dyn Scheduler>>)> {
    if !(params.learning_rate.is_finite() && params.learning_rate > 0.0) {
        return Err(Error::config("Learning rate must be positive"));
    }
    if !(0.0..1.0).contains(&params.momentum) {
        return Err(Error::config("Momentum must be in [0, 1)"));
    }
    if params.weight_decay < 0.0 {
        return Err(Error::config("Weight decay must be non-negative"));
    }

    let lr = params.learning_rate;
    let mut optimizer: Box<dyn Optimizer> = match strategy {
        OptimizationStrategy::PlainMomentum => Box::new(SGDOptimizer::new(
            var_map,
            lr,
            params.momentum,
            params.weight_decay,
        )),
        OptimizationStrategy::DecoupledMomentum => Box::new(SGDPOptimizer::new(
            var_map,
            lr,
            params.momentum,
            params.weight_decay,
        )),
        OptimizationStrategy::DecoupledAdaptive => {
            Box::new(AdamPOptimizer::with_defaults(var_map, lr, params.weight_decay))
        }
    };

    let scheduler: Option<Box<dyn Scheduler>> = if strategy.uses_schedule() {
        let start = resume_epoch.saturating_sub(1);
        let scheduler = CosineAnnealingScheduler::new(lr, 0.0, epoch_count, start);
        optimizer.set_learning_rate(scheduler.get_lr());
        Some(Box::new(scheduler))
    } else {
        None
    };

    tracing::debug!(
        "Built {} optimizer over {} parameters (lr {:.8})",
        strategy,
        optimizer.parameter_count(),
        optimizer.learning_rate()
    );

    Ok((optimizer, scheduler))
}

/// Optimizer paired with its optional epoch schedule
pub struct OptimizerSet {
    strategy: OptimizationStrategy,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn Scheduler>>,
}

impl OptimizerSet {
    /// Build the set for a strategy, see [`build_optimizer`]
    pub fn new(
        strategy: OptimizationStrategy,
        var_map: &VarMap,
        params: &OptimizerParams,
        epoch_count: usize,
        resume_epoch: usize,
    ) -> Result<Self> {
        let (optimizer, scheduler) =
            build_optimizer(strategy, var_map, params, epoch_count, resume_epoch)?;
        Ok(Self {
            strategy,
            optimizer,
            scheduler,
        })
    }

    /// Strategy in use
    pub fn strategy(&self) -> OptimizationStrategy {
        self.strategy
    }

    /// Apply one update from the gradients of a batch
    pub fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.optimizer.step(gradients)
    }

    /// Advance the epoch schedule, returning the new learning rate
    ///
    /// Strategies without a schedule return `None` and keep their rate.
    pub fn advance_schedule(&mut self) -> Option<f64> {
        let scheduler = self.scheduler.as_mut()?;
        let lr = scheduler.step();
        self.optimizer.set_learning_rate(lr);
        Some(lr)
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Number of optimizer steps taken
    pub fn step_count(&self) -> usize {
        self.optimizer.step_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_case::test_case;

    #[test_case("sgd", OptimizationStrategy::PlainMomentum)]
    #[test_case("sgdp", OptimizationStrategy::DecoupledMomentum)]
    #[test_case("adamp", OptimizationStrategy::DecoupledAdaptive)]
    fn test_strategy_names(name: &str, expected: OptimizationStrategy) {
        let strategy: OptimizationStrategy = name.parse().unwrap();
        assert_eq!(strategy, expected);
        assert_eq!(strategy.as_str(), name);
    }

    #[test_case("admap"; "misspelled adamp")]
    #[test_case("adam")]
    #[test_case("SGD")]
    fn test_invalid_optimizer(name: &str) {
        let err = name.parse::<OptimizationStrategy>().unwrap_err();
        assert!(matches!(err, Error::InvalidOptimizer(ref n) if n == name));
    }

    #[test]
    fn test_adamp_has_no_schedule() {
        let var_map = VarMap::new();
        let mut set = OptimizerSet::new(
            OptimizationStrategy::DecoupledAdaptive,
            &var_map,
            &OptimizerParams::default(),
            10,
            0,
        )
        .unwrap();
        assert_eq!(set.advance_schedule(), None);
        assert_relative_eq!(set.learning_rate(), 1e-3);
    }

    #[test]
    fn test_schedule_pushes_rate_into_optimizer() {
        let var_map = VarMap::new();
        let mut set = OptimizerSet::new(
            OptimizationStrategy::PlainMomentum,
            &var_map,
            &OptimizerParams::default(),
            2,
            0,
        )
        .unwrap();
        assert_relative_eq!(set.learning_rate(), 1e-3);

        let lr = set.advance_schedule().unwrap();
        assert_relative_eq!(lr, 5e-4, epsilon = 1e-12);
        assert_relative_eq!(set.learning_rate(), lr);
    }

    #[test]
    fn test_resume_positions_schedule() {
        let var_map = VarMap::new();
        let params = OptimizerParams::default();
        let set = OptimizerSet::new(OptimizationStrategy::DecoupledMomentum, &var_map, &params, 10, 6)
            .unwrap();
        let expected = CosineAnnealingScheduler::new(params.learning_rate, 0.0, 10, 5).get_lr();
        assert_relative_eq!(set.learning_rate(), expected);
    }

    #[test]
    fn test_rejects_bad_hyperparameters() {
        let var_map = VarMap::new();
        let params = OptimizerParams {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(build_optimizer(OptimizationStrategy::PlainMomentum, &var_map, &params, 10, 0).is_err());
    }
}
