//! Training infrastructure for anchor-based face detectors
//!
//! # Main Components
//!
//! - **Options**: run options of one training invocation
//! - **Trainer**: the explicit [`TrainingLoop`] state machine
//! - **Data**: WIDER FACE parsing, collation and prefetching loader
//! - **Checkpoints**: safetensors persistence with parallel-prefix normalisation
//! - **Optimizers**: SGD, SGDP and AdamP with cosine annealing
//! - **Loss**: MultiBox task losses and their weighted aggregation
//! - **Progress**: observers for the progress line and structured logs
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use retina_train::config::ConfigRegistry;
//! use retina_train::training::{run_training, TrainingOptions};
//!
//! let options = TrainingOptions {
//!     network: "mobile0.25".to_string(),
//!     ..Default::default()
//! };
//! let summary = run_training(&options, &ConfigRegistry::builtin()).await?;
//! ```

pub mod checkpoints;
pub mod data;
pub mod loss;
pub mod optimizers;
pub mod options;
pub mod progress;
pub mod trainer;

#[cfg(test)]
mod tests;

pub use checkpoints::{
    add_parallel_prefix, checkpoint_file_name, should_checkpoint, strip_parallel_prefix,
    CheckpointLabel, CheckpointManager,
};
pub use data::{
    collate, DataLoader, Dataset, DetectionBatch, DetectionSample, Preprocessor,
    WiderFaceDataset,
};
pub use loss::{LossAggregator, MultiBoxCriterion, MultiBoxLoss, TaskLosses};
pub use optimizers::{
    build_optimizer, OptimizationStrategy, Optimizer, OptimizerParams, OptimizerSet, Scheduler,
};
pub use options::TrainingOptions;
pub use progress::{IterationStats, ProgressLine, TracingObserver, TrainingObserver};
pub use trainer::{
    run_training, EpochPlan, RunningLosses, TrainingLoop, TrainingState, TrainingStatus,
    TrainingSummary,
};
