//! MultiBox loss with hard negative mining
//!
//! Positives are priors matched to a face. Box regression and classification
//! are normalised by the number of positives; landmark regression only covers
//! positives whose face carries landmarks and is normalised by their count.
//! Negatives for the classification term are the highest-loss background
//! priors, `negpos_ratio` per positive.

use candle_core::{DType, Device, Tensor};

use super::box_utils::{match_priors, MatchedTargets, TARGET_COLUMNS};
use super::{MultiBoxCriterion, TaskLosses};
use crate::detector::DetectorOutput;
use crate::error::{Error, Result};

/// Matching and mining parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiBoxConfig {
    /// Number of classes (background + face)
    pub num_classes: usize,
    /// IoU a prior needs with a truth to be positive
    pub overlap_threshold: f32,
    /// Negatives kept per positive
    pub negpos_ratio: usize,
    /// Box encoding variances
    pub variances: [f32; 2],
}

impl Default for MultiBoxConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            overlap_threshold: 0.35,
            negpos_ratio: 7,
            variances: [0.1, 0.2],
        }
    }
}

/// Loss for the three detection tasks
#[derive(Debug, Clone)]
pub struct MultiBoxLoss {
    config: MultiBoxConfig,
}

/// Flat selections over the `B * P` prior rows of a batch
#[derive(Debug, Default)]
struct Selection {
    loc_rows: Vec<u32>,
    loc_targets: Vec<f32>,
    landm_rows: Vec<u32>,
    landm_targets: Vec<f32>,
    conf_rows: Vec<u32>,
    conf_labels: Vec<u32>,
    num_pos: usize,
    num_pos_landm: usize,
}

impl MultiBoxLoss {
    /// Create the loss
    pub fn new(config: MultiBoxConfig) -> Self {
        Self { config }
    }

    /// Loss with the standard settings and the given variances
    pub fn with_variances(variances: [f64; 2]) -> Self {
        Self::new(MultiBoxConfig {
            variances: [variances[0] as f32, variances[1] as f32],
            ..Default::default()
        })
    }

    /// Parameters in use
    pub fn config(&self) -> &MultiBoxConfig {
        &self.config
    }

    fn select(
        &self,
        priors: &[[f32; 4]],
        targets: &[Vec<[f32; TARGET_COLUMNS]>],
        background_loss: &[Vec<f32>],
    ) -> Selection {
        let num_priors = priors.len();
        let mut selection = Selection::default();

        for (b, (truths, mining_loss)) in targets.iter().zip(background_loss).enumerate() {
            let MatchedTargets { labels, loc, landm } =
                match_priors(self.config.overlap_threshold, truths, priors, self.config.variances);
            let offset = b * num_priors;

            let mut positive = vec![false; num_priors];
            for p in 0..num_priors {
                let row = (offset + p) as u32;
                if labels[p] != 0.0 {
                    positive[p] = true;
                    selection.num_pos += 1;
                    selection.loc_rows.push(row);
                    selection.loc_targets.extend_from_slice(&loc[p]);
                }
                if labels[p] > 0.0 {
                    selection.num_pos_landm += 1;
                    selection.landm_rows.push(row);
                    selection.landm_targets.extend_from_slice(&landm[p]);
                }
            }

            // hard negatives: highest background loss among non-positives
            let image_pos = positive.iter().filter(|&&p| p).count();
            let num_neg = (self.config.negpos_ratio * image_pos).min(num_priors.saturating_sub(1));
            let mut ranked: Vec<usize> = (0..num_priors).collect();
            ranked.sort_by(|&a, &b| {
                let la = if positive[a] { 0.0 } else { mining_loss[a] };
                let lb = if positive[b] { 0.0 } else { mining_loss[b] };
                lb.total_cmp(&la)
            });
            let mut negative = vec![false; num_priors];
            for &p in ranked.iter().take(num_neg) {
                negative[p] = true;
            }

            for p in 0..num_priors {
                if positive[p] || negative[p] {
                    selection.conf_rows.push((offset + p) as u32);
                    selection.conf_labels.push(u32::from(positive[p]));
                }
            }
        }

        selection
    }
}

/// Sum of smooth L1 (beta 1) over all elements
fn smooth_l1_sum(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = (pred - target)?.abs()?;
    let quad = diff.minimum(1.0)?;
    let loss = ((quad.sqr()? * 0.5)? + (diff - quad)?)?;
    Ok(loss.sum_all()?)
}

fn gather_rows(data: &Tensor, rows: &[u32], width: usize, device: &Device) -> Result<Tensor> {
    let index = Tensor::from_slice(rows, rows.len(), device)?;
    Ok(data.reshape(((), width))?.index_select(&index, 0)?)
}

fn zero(device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((), DType::F32, device)?)
}

/// Background loss `logsumexp(c) - c[0]` for every prior, on the host
fn background_loss(conf: &Tensor) -> Result<Vec<Vec<f32>>> {
    let conf = conf.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    Ok(conf
        .into_iter()
        .map(|image| {
            image
                .into_iter()
                .map(|logits| {
                    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let lse = max + logits.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                    lse - logits[0]
                })
                .collect()
        })
        .collect())
}

impl MultiBoxCriterion for MultiBoxLoss {
    fn compute(
        &self,
        output: &DetectorOutput,
        priors: &Tensor,
        targets: &[Tensor],
    ) -> Result<TaskLosses> {
        let device = output.loc.device().clone();
        let (batch, num_priors, _) = output.loc.dims3()?;
        if targets.len() != batch {
            return Err(Error::malformed_batch(format!(
                "{} target sets for a batch of {}",
                targets.len(),
                batch
            )));
        }

        let prior_rows: Vec<[f32; 4]> = priors
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?
            .into_iter()
            .map(|row| [row[0], row[1], row[2], row[3]])
            .collect();
        if prior_rows.len() != num_priors {
            return Err(Error::malformed_batch(format!(
                "detector produced {} anchors, prior set has {}",
                num_priors,
                prior_rows.len()
            )));
        }

        let mut truths = Vec::with_capacity(batch);
        for target in targets {
            let rows = target.to_dtype(DType::F32)?.to_vec2::<f32>()?;
            let mut image = Vec::with_capacity(rows.len());
            for row in rows {
                let row: [f32; TARGET_COLUMNS] = row.try_into().map_err(|r: Vec<f32>| {
                    Error::malformed_batch(format!(
                        "target rows need {TARGET_COLUMNS} columns, got {}",
                        r.len()
                    ))
                })?;
                image.push(row);
            }
            truths.push(image);
        }

        let mining = background_loss(&output.conf)?;
        let selection = self.select(&prior_rows, &truths, &mining);

        let pos_norm = selection.num_pos.max(1) as f64;
        let landm_norm = selection.num_pos_landm.max(1) as f64;

        let loc = if selection.loc_rows.is_empty() {
            zero(&device)?
        } else {
            let pred = gather_rows(&output.loc, &selection.loc_rows, 4, &device)?;
            let target = Tensor::from_vec(
                selection.loc_targets,
                (selection.loc_rows.len(), 4),
                &device,
            )?;
            (smooth_l1_sum(&pred, &target)? / pos_norm)?
        };

        let landm = if selection.landm_rows.is_empty() {
            zero(&device)?
        } else {
            let pred = gather_rows(&output.landm, &selection.landm_rows, 10, &device)?;
            let target = Tensor::from_vec(
                selection.landm_targets,
                (selection.landm_rows.len(), 10),
                &device,
            )?;
            (smooth_l1_sum(&pred, &target)? / landm_norm)?
        };

        let cls = if selection.conf_rows.is_empty() {
            zero(&device)?
        } else {
            let logits = gather_rows(
                &output.conf,
                &selection.conf_rows,
                self.config.num_classes,
                &device,
            )?;
            let labels = Tensor::from_vec(
                selection.conf_labels,
                (selection.conf_rows.len(), 1),
                &device,
            )?;
            let log_probs = candle_nn::ops::log_softmax(&logits, 1)?;
            (log_probs.gather(&labels, 1)?.sum_all()?.neg()? / pos_norm)?
        };

        Ok(TaskLosses { loc, cls, landm })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn single_prior_output(loc: [f32; 4], conf: [f32; 2]) -> DetectorOutput {
        let device = Device::Cpu;
        DetectorOutput {
            loc: Tensor::from_slice(&loc[..], (1, 1, 4), &device).unwrap(),
            conf: Tensor::from_slice(&conf[..], (1, 1, 2), &device).unwrap(),
            landm: Tensor::zeros((1, 1, 10), DType::F32, &device).unwrap(),
        }
    }

    fn face_row(label: f32) -> Tensor {
        // truth equal to the prior box, landmarks on the prior centre
        let mut row = vec![0.25f32, 0.25, 0.75, 0.75];
        row.extend(std::iter::repeat(0.5).take(10));
        row.push(label);
        Tensor::from_vec(row, (1, TARGET_COLUMNS), &Device::Cpu).unwrap()
    }

    fn prior() -> Tensor {
        Tensor::new(&[[0.5f32, 0.5, 0.5, 0.5]], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_perfect_regression_has_zero_loc_loss() {
        let loss = MultiBoxLoss::new(MultiBoxConfig::default());
        let output = single_prior_output([0.0; 4], [0.0, 0.0]);

        let losses = loss.compute(&output, &prior(), &[face_row(1.0)]).unwrap();
        assert_relative_eq!(scalar(&losses.loc), 0.0, epsilon = 1e-6);
        assert_relative_eq!(scalar(&losses.landm), 0.0, epsilon = 1e-6);
        // uniform logits: cross entropy of ln 2 over one positive
        assert_relative_eq!(scalar(&losses.cls), std::f32::consts::LN_2, epsilon = 1e-5);
    }

    #[test]
    fn test_smooth_l1_branches() {
        let loss = MultiBoxLoss::new(MultiBoxConfig::default());
        // offsets of 0.5 (quadratic) and 2.0 (linear) against zero targets
        let output = single_prior_output([0.5, 2.0, 0.0, 0.0], [0.0, 0.0]);
        let losses = loss.compute(&output, &prior(), &[face_row(1.0)]).unwrap();
        assert_relative_eq!(scalar(&losses.loc), 0.125 + 1.5, epsilon = 1e-5);
    }

    #[test]
    fn test_faces_without_landmarks_skip_landmark_loss() {
        let loss = MultiBoxLoss::new(MultiBoxConfig::default());
        let mut output = single_prior_output([0.0; 4], [0.0, 0.0]);
        output.landm = Tensor::ones((1, 1, 10), DType::F32, &Device::Cpu).unwrap();

        let losses = loss.compute(&output, &prior(), &[face_row(-1.0)]).unwrap();
        assert_eq!(scalar(&losses.landm), 0.0);

        let losses = loss.compute(&output, &prior(), &[face_row(1.0)]).unwrap();
        assert_relative_eq!(scalar(&losses.landm), 5.0, epsilon = 1e-5);
    }

    #[test]
    fn test_background_only_batch() {
        let loss = MultiBoxLoss::new(MultiBoxConfig::default());
        let output = single_prior_output([1.0; 4], [3.0, -3.0]);
        let empty = Tensor::zeros((0, TARGET_COLUMNS), DType::F32, &Device::Cpu).unwrap();

        let losses = loss.compute(&output, &prior(), &[empty]).unwrap();
        assert_eq!(scalar(&losses.loc), 0.0);
        assert_eq!(scalar(&losses.cls), 0.0);
        assert_eq!(scalar(&losses.landm), 0.0);
    }

    #[test]
    fn test_hard_negatives_limited_by_ratio() {
        let config = MultiBoxConfig {
            negpos_ratio: 1,
            ..Default::default()
        };
        let loss = MultiBoxLoss::new(config);
        let priors = [
            [0.5f32, 0.5, 0.5, 0.5],
            [0.1, 0.1, 0.1, 0.1],
            [0.9, 0.9, 0.1, 0.1],
        ];
        let truth: [f32; TARGET_COLUMNS] = face_row(1.0).to_vec2::<f32>().unwrap()[0]
            .clone()
            .try_into()
            .unwrap();
        let selection = loss.select(&priors, &[vec![truth]], &[vec![0.0, 0.3, 0.9]]);

        assert_eq!(selection.num_pos, 1);
        // the positive plus the single hardest negative
        assert_eq!(selection.conf_rows, vec![0, 2]);
        assert_eq!(selection.conf_labels, vec![1, 0]);
    }

    #[test]
    fn test_mismatched_target_count() {
        let loss = MultiBoxLoss::new(MultiBoxConfig::default());
        let output = single_prior_output([0.0; 4], [0.0, 0.0]);
        let err = loss.compute(&output, &prior(), &[]).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch(_)));
    }
}
