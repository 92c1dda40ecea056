//! Lightweight anchor-head baseline detector
//!
//! Each pyramid level average-pools the input down to its prior stride, runs a
//! 3x3 stem convolution and three 1x1 heads. The cell grid of every level
//! matches the prior generator's feature map exactly, so outputs line up with
//! the prior set anchor for anchor.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, VarMap};

use super::{Detector, DetectorOutput};
use crate::config::VariantConfig;
use crate::error::{Error, Result};

const NUM_CLASSES: usize = 2;
const BOX_DIMS: usize = 4;
const LANDMARK_DIMS: usize = 10;

struct LevelHead {
    step: usize,
    stem: Conv2d,
    bbox: Conv2d,
    class: Conv2d,
    landmark: Conv2d,
}

impl LevelHead {
    fn new(step: usize, channels: usize, anchors: usize, vb: VarBuilder) -> Result<Self> {
        let stem_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        Ok(Self {
            step,
            stem: candle_nn::conv2d(3, channels, 3, stem_config, vb.pp("stem"))?,
            bbox: candle_nn::conv2d(
                channels,
                anchors * BOX_DIMS,
                1,
                Conv2dConfig::default(),
                vb.pp("bbox_head"),
            )?,
            class: candle_nn::conv2d(
                channels,
                anchors * NUM_CLASSES,
                1,
                Conv2dConfig::default(),
                vb.pp("class_head"),
            )?,
            landmark: candle_nn::conv2d(
                channels,
                anchors * LANDMARK_DIMS,
                1,
                Conv2dConfig::default(),
                vb.pp("landmark_head"),
            )?,
        })
    }

    /// Zero-pad to a multiple of the stride, then pool one cell per stride
    fn features(&self, images: &Tensor) -> Result<Tensor> {
        let (_, _, height, width) = images.dims4()?;
        let pad_h = height.div_ceil(self.step) * self.step - height;
        let pad_w = width.div_ceil(self.step) * self.step - width;

        let padded = images
            .pad_with_zeros(2, 0, pad_h)?
            .pad_with_zeros(3, 0, pad_w)?;
        let pooled = padded.avg_pool2d(self.step)?;
        Ok(self.stem.forward(&pooled)?.relu()?)
    }
}

/// `[B, A*D, h, w]` head output to `[B, h*w*A, D]`
fn flatten_head(output: &Tensor, dims: usize) -> Result<Tensor> {
    let (batch, channels, rows, cols) = output.dims4()?;
    let anchors = channels / dims;
    Ok(output
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((batch, rows * cols * anchors, dims))?)
}

/// Baseline detector with one pooled stem and three heads per level
pub struct AnchorHeadDetector {
    name: String,
    var_map: VarMap,
    levels: Vec<LevelHead>,
}

impl AnchorHeadDetector {
    /// Build the detector with freshly initialised parameters on `device`
    pub fn new(config: &VariantConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let anchors = config.anchors_per_cell();
        if anchors == 0 {
            return Err(Error::config("Detector needs at least one anchor per cell"));
        }

        let levels = config
            .steps
            .iter()
            .enumerate()
            .map(|(k, &step)| {
                LevelHead::new(step, config.out_channel, anchors, vb.pp(format!("level{k}")))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "Built anchor-head detector for {} with {} levels",
            config.name,
            levels.len()
        );

        Ok(Self {
            name: config.name.clone(),
            var_map,
            levels,
        })
    }
}

impl Detector for AnchorHeadDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, images: &Tensor) -> Result<DetectorOutput> {
        let mut locs = Vec::with_capacity(self.levels.len());
        let mut confs = Vec::with_capacity(self.levels.len());
        let mut landms = Vec::with_capacity(self.levels.len());

        for level in &self.levels {
            let features = level.features(images)?;
            locs.push(flatten_head(&level.bbox.forward(&features)?, BOX_DIMS)?);
            confs.push(flatten_head(&level.class.forward(&features)?, NUM_CLASSES)?);
            landms.push(flatten_head(&level.landmark.forward(&features)?, LANDMARK_DIMS)?);
        }

        Ok(DetectorOutput {
            loc: Tensor::cat(&locs, 1)?,
            conf: Tensor::cat(&confs, 1)?,
            landm: Tensor::cat(&landms, 1)?,
        })
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigRegistry;
    use crate::priors::PriorGenerator;
    use std::collections::HashMap;

    fn tiny_config() -> VariantConfig {
        let mut config = ConfigRegistry::builtin().resolve("mobile0.25").unwrap();
        config.image_size = 32;
        config.out_channel = 4;
        config
    }

    #[test]
    fn test_output_matches_priors() {
        let config = tiny_config();
        let detector = AnchorHeadDetector::new(&config, &Device::Cpu).unwrap();
        let images = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();

        let output = detector.forward(&images).unwrap();
        let priors = PriorGenerator::new(&config, (32, 32)).count();

        assert_eq!(output.loc.dims(), &[2, priors, 4]);
        assert_eq!(output.conf.dims(), &[2, priors, 2]);
        assert_eq!(output.landm.dims(), &[2, priors, 10]);
        assert_eq!(output.num_priors().unwrap(), priors);
    }

    #[test]
    fn test_odd_image_size() {
        let config = tiny_config();
        let detector = AnchorHeadDetector::new(&config, &Device::Cpu).unwrap();
        let images = Tensor::zeros((1, 3, 20, 20), DType::F32, &Device::Cpu).unwrap();

        let output = detector.forward(&images).unwrap();
        assert_eq!(output.loc.dim(1).unwrap(), PriorGenerator::new(&config, (20, 20)).count());
    }

    #[test]
    fn test_state_dict_round_trip() {
        let config = tiny_config();
        let source = AnchorHeadDetector::new(&config, &Device::Cpu).unwrap();
        let mut target = AnchorHeadDetector::new(&config, &Device::Cpu).unwrap();

        let state = source.state_dict().unwrap();
        assert_eq!(state.len(), 3 * 4 * 2);
        target.load_state_dict(&state).unwrap();

        let reloaded = target.state_dict().unwrap();
        for (name, tensor) in &state {
            let a = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = reloaded[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(a, b, "parameter {name} differs");
        }
        assert!(target.parameter_count() > 0);
    }

    #[test]
    fn test_load_rejects_mismatched_keys() {
        let config = tiny_config();
        let mut detector = AnchorHeadDetector::new(&config, &Device::Cpu).unwrap();

        let mut state: HashMap<String, Tensor> = detector.state_dict().unwrap();
        let removed = "level0.stem.weight".to_string();
        state.remove(&removed);
        state.insert(
            "extra.weight".to_string(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        );

        match detector.load_state_dict(&state) {
            Err(Error::StateMismatch {
                missing,
                unexpected,
            }) => {
                assert_eq!(missing, vec![removed]);
                assert_eq!(unexpected, vec!["extra.weight".to_string()]);
            }
            other => panic!("expected a state mismatch, got {other:?}"),
        }
    }
}
