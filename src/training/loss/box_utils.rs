//! Host-side box geometry and prior matching
//!
//! Matching is bookkeeping over a few thousand anchors per image and runs on
//! plain `f32` arrays; only the resulting regression targets are uploaded.

/// Box as `[x1, y1, x2, y2]`
pub type Corners = [f32; 4];

/// Anchor as `[cx, cy, w, h]`
pub type CenterBox = [f32; 4];

/// Column of the class label in a target row
pub const LABEL_COLUMN: usize = 14;

/// Number of columns in a target row
pub const TARGET_COLUMNS: usize = 15;

/// Minimum best-prior overlap for a ground truth to take part in matching
pub const MIN_TRUTH_OVERLAP: f32 = 0.2;

/// Anchor in corner form
pub fn point_form(prior: &CenterBox) -> Corners {
    [
        prior[0] - prior[2] / 2.0,
        prior[1] - prior[3] / 2.0,
        prior[0] + prior[2] / 2.0,
        prior[1] + prior[3] / 2.0,
    ]
}

/// Intersection over union of two corner boxes
pub fn jaccard(a: &Corners, b: &Corners) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Encode a matched box against its prior
pub fn encode(matched: &Corners, prior: &CenterBox, variances: [f32; 2]) -> [f32; 4] {
    let cx = ((matched[0] + matched[2]) / 2.0 - prior[0]) / (variances[0] * prior[2]);
    let cy = ((matched[1] + matched[3]) / 2.0 - prior[1]) / (variances[0] * prior[3]);
    let w = ((matched[2] - matched[0]).max(f32::EPSILON) / prior[2]).ln() / variances[1];
    let h = ((matched[3] - matched[1]).max(f32::EPSILON) / prior[3]).ln() / variances[1];
    [cx, cy, w, h]
}

/// Encode five landmark points against their prior
pub fn encode_landmarks(landmarks: &[f32], prior: &CenterBox, variances: [f32; 2]) -> [f32; 10] {
    let mut encoded = [0.0; 10];
    for (k, value) in encoded.iter_mut().enumerate() {
        let axis = k % 2;
        *value = (landmarks[k] - prior[axis]) / (variances[0] * prior[2 + axis]);
    }
    encoded
}

/// Regression and class targets of every prior of one image
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedTargets {
    /// Matched label per prior: `0` background, `1` face, `-1` face without landmarks
    pub labels: Vec<f32>,
    /// Encoded box per prior
    pub loc: Vec<[f32; 4]>,
    /// Encoded landmarks per prior
    pub landm: Vec<[f32; 10]>,
}

impl MatchedTargets {
    fn background(num_priors: usize) -> Self {
        Self {
            labels: vec![0.0; num_priors],
            loc: vec![[0.0; 4]; num_priors],
            landm: vec![[0.0; 10]; num_priors],
        }
    }
}

/// Match ground truth rows to priors
///
/// Every prior takes the truth it overlaps most. Each usable truth also claims
/// its own best prior unconditionally, and priors whose best overlap stays
/// under `threshold` become background. A truth is usable when its best prior
/// overlaps it by at least [`MIN_TRUTH_OVERLAP`]; with no usable truth the whole
/// image is background.
pub fn match_priors(
    threshold: f32,
    truths: &[[f32; TARGET_COLUMNS]],
    priors: &[CenterBox],
    variances: [f32; 2],
) -> MatchedTargets {
    let num_priors = priors.len();
    if truths.is_empty() || num_priors == 0 {
        return MatchedTargets::background(num_priors);
    }

    let prior_corners: Vec<Corners> = priors.iter().map(point_form).collect();

    // best prior of each truth
    let mut best_prior = Vec::with_capacity(truths.len());
    // best truth of each prior
    let mut best_truth_overlap = vec![f32::MIN; num_priors];
    let mut best_truth_idx = vec![0usize; num_priors];

    for (t, truth) in truths.iter().enumerate() {
        let corners = [truth[0], truth[1], truth[2], truth[3]];
        let mut best = (0usize, f32::MIN);
        for (p, prior) in prior_corners.iter().enumerate() {
            let overlap = jaccard(&corners, prior);
            if overlap > best.1 {
                best = (p, overlap);
            }
            if overlap > best_truth_overlap[p] {
                best_truth_overlap[p] = overlap;
                best_truth_idx[p] = t;
            }
        }
        best_prior.push(best);
    }

    if best_prior.iter().all(|(_, overlap)| *overlap < MIN_TRUTH_OVERLAP) {
        return MatchedTargets::background(num_priors);
    }

    for &(p, overlap) in &best_prior {
        if overlap >= MIN_TRUTH_OVERLAP {
            best_truth_overlap[p] = 2.0;
        }
    }
    for (t, &(p, _)) in best_prior.iter().enumerate() {
        best_truth_idx[p] = t;
    }

    let mut targets = MatchedTargets::background(num_priors);
    for p in 0..num_priors {
        let truth = &truths[best_truth_idx[p]];
        let corners = [truth[0], truth[1], truth[2], truth[3]];
        targets.loc[p] = encode(&corners, &priors[p], variances);
        targets.landm[p] = encode_landmarks(&truth[4..LABEL_COLUMN], &priors[p], variances);
        targets.labels[p] = if best_truth_overlap[p] < threshold {
            0.0
        } else {
            truth[LABEL_COLUMN]
        };
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn row(corners: [f32; 4], label: f32) -> [f32; TARGET_COLUMNS] {
        let mut row = [0.0; TARGET_COLUMNS];
        row[..4].copy_from_slice(&corners);
        let cx = (corners[0] + corners[2]) / 2.0;
        let cy = (corners[1] + corners[3]) / 2.0;
        for k in 0..5 {
            row[4 + 2 * k] = cx;
            row[5 + 2 * k] = cy;
        }
        row[LABEL_COLUMN] = label;
        row
    }

    #[test]
    fn test_jaccard() {
        let a = [0.0, 0.0, 2.0, 2.0];
        let b = [1.0, 1.0, 3.0, 3.0];
        assert_relative_eq!(jaccard(&a, &b), 1.0 / 7.0);
        assert_relative_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&a, &[5.0, 5.0, 6.0, 6.0]), 0.0);
    }

    #[test]
    fn test_encode_exact_match_is_zero() {
        let prior = [0.5, 0.5, 0.2, 0.2];
        let encoded = encode(&point_form(&prior), &prior, [0.1, 0.2]);
        for v in encoded {
            assert_relative_eq!(v, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_encode_landmarks_offsets() {
        let prior = [0.5, 0.5, 0.2, 0.4];
        let mut landmarks = [0.5f32; 10];
        landmarks[0] = 0.52;
        landmarks[1] = 0.54;
        let encoded = encode_landmarks(&landmarks, &prior, [0.1, 0.2]);
        assert_relative_eq!(encoded[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(encoded[1], 1.0, epsilon = 1e-4);
        assert_relative_eq!(encoded[2], 0.0);
    }

    #[test]
    fn test_best_prior_is_forced_positive() {
        // two anchors, neither reaches the 0.35 threshold with the truth
        let priors = [[0.25, 0.25, 0.5, 0.5], [0.75, 0.75, 0.5, 0.5]];
        let truth = row([0.0, 0.0, 0.25, 0.25], 1.0);

        let matched = match_priors(0.35, &[truth], &priors, [0.1, 0.2]);
        assert_eq!(matched.labels, vec![1.0, 0.0]);
    }

    #[test]
    fn test_tiny_truth_leaves_image_background() {
        let priors = [[0.5, 0.5, 1.0, 1.0]];
        let truth = row([0.0, 0.0, 0.01, 0.01], 1.0);
        let matched = match_priors(0.35, &[truth], &priors, [0.1, 0.2]);
        assert_eq!(matched.labels, vec![0.0]);
    }

    #[test]
    fn test_label_carries_landmark_flag() {
        let priors = [[0.25, 0.25, 0.5, 0.5]];
        let truth = row([0.0, 0.0, 0.5, 0.5], -1.0);
        let matched = match_priors(0.35, &[truth], &priors, [0.1, 0.2]);
        assert_eq!(matched.labels, vec![-1.0]);
    }

    #[test]
    fn test_empty_truths() {
        let priors = [[0.25, 0.25, 0.5, 0.5]; 3];
        let matched = match_priors(0.35, &[], &priors, [0.1, 0.2]);
        assert_eq!(matched.labels, vec![0.0; 3]);
    }
}
