//! Run options of a training invocation

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::optimizers::{OptimizationStrategy, OptimizerParams};
use crate::error::{Error, Result};

/// Everything a training run is started with besides the variant record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOptions {
    /// WIDER FACE `label.txt`
    pub training_dataset: PathBuf,

    /// Registry name of the network variant
    pub network: String,

    /// Batches decoded concurrently
    pub num_workers: usize,

    /// Optimisation strategy
    pub optimizer: OptimizationStrategy,

    /// Learning rate, momentum and weight decay
    pub optimizer_params: OptimizerParams,

    /// Step-decay factor, accepted but not used by any strategy
    pub gamma: f64,

    /// Resume from a saved checkpoint
    pub resume_net: bool,

    /// Completed epochs of the checkpoint to resume from
    pub resume_epoch: usize,

    /// Directory checkpoints are written to
    pub save_folder: PathBuf,

    /// Shuffle seed
    pub seed: u64,

    /// Extra variant definitions merged over the builtin registry
    pub registry: Option<PathBuf>,

    /// Draw the in-place progress line
    pub show_progress: bool,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            training_dataset: PathBuf::from("./data/widerface/train/label.txt"),
            network: "efficientb2".to_string(),
            num_workers: 4,
            optimizer: OptimizationStrategy::PlainMomentum,
            optimizer_params: OptimizerParams::default(),
            gamma: 0.1,
            resume_net: false,
            resume_epoch: 0,
            save_folder: PathBuf::from("./weights/"),
            seed: 0,
            registry: None,
            show_progress: true,
        }
    }
}

impl TrainingOptions {
    /// Reject inconsistent option combinations
    pub fn validate(&self) -> Result<()> {
        if self.resume_epoch > 0 && !self.resume_net {
            return Err(Error::config(format!(
                "Resume epoch {} given without --resume-net",
                self.resume_epoch
            )));
        }

        if !(self.optimizer_params.learning_rate.is_finite()
            && self.optimizer_params.learning_rate > 0.0)
        {
            return Err(Error::config("Learning rate must be positive"));
        }

        if self.optimizer_params.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }

        if self.network.is_empty() {
            return Err(Error::config("Network name must not be empty"));
        }

        Ok(())
    }

    /// Epoch the run starts from
    pub fn start_epoch(&self) -> usize {
        if self.resume_net {
            self.resume_epoch
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = TrainingOptions::default();
        options.validate().unwrap();
        assert_eq!(options.start_epoch(), 0);
        assert_eq!(options.network, "efficientb2");
    }

    #[test]
    fn test_resume_epoch_requires_resume_flag() {
        let options = TrainingOptions {
            resume_epoch: 10,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(Error::Config(_))));

        let options = TrainingOptions {
            resume_net: true,
            ..options
        };
        options.validate().unwrap();
        assert_eq!(options.start_epoch(), 10);
    }

    #[test]
    fn test_rejects_negative_weight_decay() {
        let mut options = TrainingOptions::default();
        options.optimizer_params.weight_decay = -1.0;
        assert!(options.validate().is_err());
    }
}
