//! Detection losses
//!
//! A [`MultiBoxCriterion`] turns detector output, priors and ground truth into
//! the three per-task losses; the [`LossAggregator`] folds them into the single
//! scalar that is back-propagated:
//!
//! ```text
//! total = loc_weight * loc + cls + landm
//! ```

pub mod box_utils;
pub mod multibox;

pub use multibox::{MultiBoxConfig, MultiBoxLoss};

use candle_core::{DType, Tensor};

use crate::detector::DetectorOutput;
use crate::error::Result;

/// Scalar loss of each detection task
#[derive(Debug, Clone)]
pub struct TaskLosses {
    /// Box regression
    pub loc: Tensor,
    /// Face / background classification
    pub cls: Tensor,
    /// Landmark regression
    pub landm: Tensor,
}

impl TaskLosses {
    /// Host values `(loc, cls, landm)`
    pub fn to_scalars(&self) -> Result<(f64, f64, f64)> {
        Ok((
            scalar_value(&self.loc)?,
            scalar_value(&self.cls)?,
            scalar_value(&self.landm)?,
        ))
    }
}

fn scalar_value(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Computes the per-task losses of a batch
pub trait MultiBoxCriterion: Send {
    /// Losses for `output` against per-image target rows
    ///
    /// `priors` is the `[P, 4]` anchor tensor and `targets` holds one `[N, 15]`
    /// tensor per image of the batch.
    fn compute(
        &self,
        output: &DetectorOutput,
        priors: &Tensor,
        targets: &[Tensor],
    ) -> Result<TaskLosses>;
}

/// Linear combination of the task losses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossAggregator {
    loc_weight: f64,
}

impl LossAggregator {
    /// Create an aggregator with the variant's localisation weight
    pub fn new(loc_weight: f64) -> Self {
        Self { loc_weight }
    }

    /// Localisation weight in use
    pub fn loc_weight(&self) -> f64 {
        self.loc_weight
    }

    /// `loc_weight * loc + cls + landm` on plain numbers
    pub fn aggregate(loc: f64, cls: f64, landm: f64, loc_weight: f64) -> f64 {
        loc_weight * loc + cls + landm
    }

    /// Same combination on tensors, keeping the graph for back-propagation
    pub fn combine(&self, losses: &TaskLosses) -> Result<Tensor> {
        let weighted = (&losses.loc * self.loc_weight)?;
        Ok(((weighted + &losses.cls)? + &losses.landm)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use test_case::test_case;

    #[test_case(2.0, 3.0, 1.0, 2.0, 8.0)]
    #[test_case(0.0, 0.0, 0.0, 2.0, 0.0)]
    #[test_case(1.5, 0.25, 0.75, 1.0, 2.5)]
    fn test_aggregate(loc: f64, cls: f64, landm: f64, weight: f64, expected: f64) {
        assert_relative_eq!(LossAggregator::aggregate(loc, cls, landm, weight), expected);
    }

    #[test]
    fn test_combine_matches_aggregate() {
        let device = Device::Cpu;
        let losses = TaskLosses {
            loc: Tensor::new(2f32, &device).unwrap(),
            cls: Tensor::new(3f32, &device).unwrap(),
            landm: Tensor::new(1f32, &device).unwrap(),
        };
        let aggregator = LossAggregator::new(2.0);
        let total = aggregator.combine(&losses).unwrap();

        let (loc, cls, landm) = losses.to_scalars().unwrap();
        assert_relative_eq!(
            total.to_scalar::<f32>().unwrap() as f64,
            LossAggregator::aggregate(loc, cls, landm, aggregator.loc_weight())
        );
    }
}
