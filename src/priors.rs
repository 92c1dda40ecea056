//! Anchor (prior box) generation
//!
//! Anchors are `[cx, cy, w, h]` rows normalised to the image size, ordered
//! level by level, then row-major over the level's feature map cells, then by
//! anchor size within a cell. Detector outputs use the same ordering.

use candle_core::{Device, Tensor};

use crate::config::VariantConfig;
use crate::error::{Error, Result};

/// Generates the anchor set for one input resolution
#[derive(Debug, Clone)]
pub struct PriorGenerator {
    min_sizes: Vec<Vec<usize>>,
    steps: Vec<usize>,
    clip: bool,
    image_size: (usize, usize),
}

impl PriorGenerator {
    /// Create a generator for an image of `(height, width)` pixels
    pub fn new(config: &VariantConfig, image_size: (usize, usize)) -> Self {
        Self {
            min_sizes: config.min_sizes.clone(),
            steps: config.steps.clone(),
            clip: config.clip,
            image_size,
        }
    }

    /// Feature map shape `(rows, cols)` of every level
    pub fn feature_maps(&self) -> Vec<(usize, usize)> {
        let (height, width) = self.image_size;
        self.steps
            .iter()
            .map(|&step| (height.div_ceil(step), width.div_ceil(step)))
            .collect()
    }

    /// Total number of anchors without materialising them
    pub fn count(&self) -> usize {
        self.feature_maps()
            .iter()
            .zip(&self.min_sizes)
            .map(|((rows, cols), sizes)| rows * cols * sizes.len())
            .sum()
    }

    /// Build the ordered anchor set
    pub fn generate(&self) -> Result<PriorSet> {
        let (height, width) = self.image_size;
        if height == 0 || width == 0 {
            return Err(Error::config("Prior image size must be positive"));
        }
        let (h, w) = (height as f32, width as f32);

        let mut anchors = Vec::with_capacity(self.count());
        for ((rows, cols), (&step, sizes)) in self
            .feature_maps()
            .into_iter()
            .zip(self.steps.iter().zip(&self.min_sizes))
        {
            let step = step as f32;
            for i in 0..rows {
                for j in 0..cols {
                    let cx = (j as f32 + 0.5) * step / w;
                    let cy = (i as f32 + 0.5) * step / h;
                    for &size in sizes {
                        let mut anchor = [cx, cy, size as f32 / w, size as f32 / h];
                        if self.clip {
                            for value in anchor.iter_mut() {
                                *value = value.clamp(0.0, 1.0);
                            }
                        }
                        anchors.push(anchor);
                    }
                }
            }
        }

        Ok(PriorSet { anchors })
    }
}

/// Ordered anchor boxes shared read-only for the whole run
#[derive(Debug, Clone, PartialEq)]
pub struct PriorSet {
    anchors: Vec<[f32; 4]>,
}

impl PriorSet {
    /// Number of anchors
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Anchors as `[cx, cy, w, h]` rows
    pub fn anchors(&self) -> &[[f32; 4]] {
        &self.anchors
    }

    /// `[P, 4]` f32 tensor on `device`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = self.anchors.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (self.anchors.len(), 4), device)?)
    }
}
