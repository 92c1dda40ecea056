//! retina-train - training orchestration for multi-task face detectors
//!
//! This crate drives the training of RetinaFace-style detectors: a registry of
//! network variants, anchor generation, device placement, three optimisation
//! strategies, checkpointing and the explicit training loop that ties them
//! together over the WIDER FACE dataset.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod detector;
pub mod device;
pub mod error;
pub mod logging;
pub mod priors;
pub mod training;
pub mod utils;

// Re-exports
pub use config::{ConfigRegistry, DevicePolicy, VariantConfig};
pub use detector::{AnchorHeadDetector, Detector, DetectorOutput};
pub use device::DevicePlacement;
pub use error::{Error, Result};
pub use priors::{PriorGenerator, PriorSet};
pub use training::{run_training, TrainingLoop, TrainingOptions, TrainingSummary};
