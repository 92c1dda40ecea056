//! Batch collation

use candle_core::{Device, Tensor};
use rayon::prelude::*;
use tracing::instrument;

use super::{Dataset, DetectionSample};
use crate::error::{Error, Result};
use crate::training::loss::box_utils::TARGET_COLUMNS;

/// Images and per-image ground truth of one batch
#[derive(Debug, Clone)]
pub struct DetectionBatch {
    /// Images `[B, 3, H, W]`
    pub images: Tensor,
    /// One `[N_i, 15]` tensor per image; `N_i` may be zero
    pub targets: Vec<Tensor>,
}

impl DetectionBatch {
    /// Number of images
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the batch holds no image
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Move every tensor to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            images: self.images.to_device(device)?,
            targets: self
                .targets
                .iter()
                .map(|t| t.to_device(device))
                .collect::<candle_core::Result<Vec<_>>>()?,
        })
    }
}

/// Stack decoded samples into a host batch
///
/// All samples must share the same image size.
pub fn collate(samples: Vec<DetectionSample>) -> Result<DetectionBatch> {
    let first = samples
        .first()
        .ok_or_else(|| Error::malformed_batch("cannot collate an empty batch"))?;
    let (height, width) = (first.height, first.width);
    let plane = 3 * height * width;

    let batch = samples.len();
    let mut pixels = Vec::with_capacity(batch * plane);
    let mut targets = Vec::with_capacity(batch);
    for (i, sample) in samples.into_iter().enumerate() {
        if (sample.height, sample.width) != (height, width) || sample.image.len() != plane {
            return Err(Error::malformed_batch(format!(
                "sample {} is {}x{} ({} values), expected {}x{}",
                i,
                sample.height,
                sample.width,
                sample.image.len(),
                height,
                width
            )));
        }
        pixels.extend_from_slice(&sample.image);

        let rows = sample.targets.len();
        let flat: Vec<f32> = sample.targets.into_iter().flatten().collect();
        targets.push(Tensor::from_vec(flat, (rows, TARGET_COLUMNS), &Device::Cpu)?);
    }

    let images = Tensor::from_vec(pixels, (batch, 3, height, width), &Device::Cpu)?;
    Ok(DetectionBatch { images, targets })
}

/// Decode `indices` in parallel and collate them, keeping index order
#[instrument(level = "trace", skip(dataset), fields(size = indices.len()))]
pub fn load_batch<D: Dataset + ?Sized>(dataset: &D, indices: &[usize]) -> Result<DetectionBatch> {
    let samples = indices
        .par_iter()
        .map(|&index| dataset.get(index))
        .collect::<Result<Vec<_>>>()?;
    collate(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::loss::box_utils::LABEL_COLUMN;

    fn sample(side: usize, value: f32, faces: usize) -> DetectionSample {
        let mut row = [0.0; TARGET_COLUMNS];
        row[2] = 0.5;
        row[3] = 0.5;
        row[LABEL_COLUMN] = 1.0;
        DetectionSample {
            image: vec![value; 3 * side * side],
            height: side,
            width: side,
            targets: vec![row; faces],
        }
    }

    #[test]
    fn test_collate_shapes() {
        let batch = collate(vec![sample(4, 1.0, 2), sample(4, 2.0, 0)]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.dims(), &[2, 3, 4, 4]);
        assert_eq!(batch.targets[0].dims(), &[2, TARGET_COLUMNS]);
        assert_eq!(batch.targets[1].dims(), &[0, TARGET_COLUMNS]);

        let second = batch.images.get(1).unwrap().sum_all().unwrap();
        assert_eq!(second.to_scalar::<f32>().unwrap(), 2.0 * 48.0);
    }

    #[test]
    fn test_collate_rejects_mixed_sizes() {
        let err = collate(vec![sample(4, 0.0, 1), sample(8, 0.0, 1)]).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch(_)));
    }

    #[test]
    fn test_collate_rejects_empty() {
        assert!(collate(Vec::new()).is_err());
    }

    #[test]
    fn test_to_device_keeps_targets() {
        let batch = collate(vec![sample(2, 0.0, 3)]).unwrap();
        let moved = batch.to_device(&Device::Cpu).unwrap();
        assert_eq!(moved.targets[0].dims(), &[3, TARGET_COLUMNS]);
    }
}
