//! Data loading for detector training
//!
//! A [`Dataset`] yields decoded, normalised samples; [`collate`] stacks them into
//! a [`DetectionBatch`] and the [`DataLoader`] streams shuffled batches for each
//! epoch with background prefetching.

pub mod batching;
pub mod loaders;
pub mod widerface;

pub use batching::{collate, DetectionBatch};
pub use loaders::{DataLoader, DataLoaderStream};
pub use widerface::{Preprocessor, WiderFaceDataset};

use crate::error::Result;
use crate::training::loss::box_utils::TARGET_COLUMNS;

/// One ground-truth row: `x1, y1, x2, y2`, ten landmark coordinates, label
pub type TargetRow = [f32; TARGET_COLUMNS];

/// Common trait for all detection datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a decoded sample by index
    fn get(&self, index: usize) -> Result<DetectionSample>;
}

/// A single decoded training image with its faces
#[derive(Debug, Clone)]
pub struct DetectionSample {
    /// Pixel data in `CHW` order
    pub image: Vec<f32>,
    /// Image height after preprocessing
    pub height: usize,
    /// Image width after preprocessing
    pub width: usize,
    /// Normalised ground-truth rows
    pub targets: Vec<TargetRow>,
}

impl DetectionSample {
    /// Number of annotated faces
    pub fn num_faces(&self) -> usize {
        self.targets.len()
    }
}
