//! WIDER FACE annotations
//!
//! The label file lists images and their faces:
//!
//! ```text
//! # 0--Parade/0_Parade_marchingband_1_849.jpg
//! 449 330 122 149 488.906 373.643 0.0 542.089 376.442 0.0 ... 0.82
//! ```
//!
//! A `#` line starts an image (path relative to `<label dir>/images/`), every
//! following line is one face: `x y w h`, five `(x, y, visibility)` landmark
//! triples and a score. Faces without landmarks carry `-1` coordinates.

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use tracing::{debug, info, instrument};

use super::{Dataset, DetectionSample, TargetRow};
use crate::error::{Error, Result};
use crate::training::loss::box_utils::{LABEL_COLUMN, TARGET_COLUMNS};

/// Column of each landmark coordinate in an annotation row
const LANDMARK_COLUMNS: [usize; 10] = [4, 5, 7, 8, 10, 11, 13, 14, 16, 17];

/// Per-channel mean subtracted from `B, G, R`
pub const DEFAULT_MEAN: [f32; 3] = [104.0, 117.0, 123.0];

/// One image entry of the label file, coordinates in pixels
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAnnotation {
    /// Absolute image path
    pub path: PathBuf,
    /// Face rows in pixel coordinates
    pub faces: Vec<TargetRow>,
}

/// Parse a WIDER FACE label file body
///
/// `image_root` is prepended to every `#` path.
pub fn parse_annotations(content: &str, image_root: &Path) -> Result<Vec<ImageAnnotation>> {
    let mut images: Vec<ImageAnnotation> = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(path) = line.strip_prefix('#') {
            images.push(ImageAnnotation {
                path: image_root.join(path.trim()),
                faces: Vec::new(),
            });
            continue;
        }

        let current = images.last_mut().ok_or_else(|| {
            Error::dataset(format!("line {}: annotation before any image path", line_no + 1))
        })?;

        let values = line
            .split_whitespace()
            .map(str::parse::<f32>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::dataset(format!("line {}: {}", line_no + 1, e)))?;
        if values.len() < 4 {
            return Err(Error::dataset(format!(
                "line {}: expected at least 4 values, found {}",
                line_no + 1,
                values.len()
            )));
        }

        current.faces.push(face_row(&values));
    }

    Ok(images)
}

fn face_row(values: &[f32]) -> TargetRow {
    let at = |i: usize| values.get(i).copied().unwrap_or(-1.0);

    let mut row = [0.0; TARGET_COLUMNS];
    row[0] = values[0];
    row[1] = values[1];
    row[2] = values[0] + values[2];
    row[3] = values[1] + values[3];
    for (k, &column) in LANDMARK_COLUMNS.iter().enumerate() {
        row[4 + k] = at(column);
    }
    row[LABEL_COLUMN] = if at(4) < 0.0 { -1.0 } else { 1.0 };
    row
}

/// Resize and normalisation applied to every image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocessor {
    /// Square side the image is resized to
    pub image_dim: usize,
    /// Mean subtracted per channel, in `B, G, R` order
    pub rgb_mean: [f32; 3],
}

impl Preprocessor {
    /// Preprocessor with the standard channel means
    pub fn new(image_dim: usize) -> Self {
        Self {
            image_dim,
            rgb_mean: DEFAULT_MEAN,
        }
    }

    /// Decode, resize and normalise one image with its faces
    pub fn apply(&self, annotation: &ImageAnnotation) -> Result<DetectionSample> {
        let rgb = image::open(&annotation.path)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::dataset(format!(
                "{} has no pixels",
                annotation.path.display()
            )));
        }

        let dim = self.image_dim as u32;
        let resized = imageops::resize(&rgb, dim, dim, FilterType::Triangle);

        let plane = self.image_dim * self.image_dim;
        let mut image = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = y as usize * self.image_dim + x as usize;
            // channel 0 is blue
            for c in 0..3 {
                image[c * plane + offset] = pixel[2 - c] as f32 - self.rgb_mean[c];
            }
        }

        let (w, h) = (width as f32, height as f32);
        let targets = annotation
            .faces
            .iter()
            .map(|face| {
                let mut row = *face;
                for (i, value) in row[..LABEL_COLUMN].iter_mut().enumerate() {
                    *value /= if i % 2 == 0 { w } else { h };
                }
                row
            })
            .collect();

        Ok(DetectionSample {
            image,
            height: self.image_dim,
            width: self.image_dim,
            targets,
        })
    }
}

/// WIDER FACE training set read from a `label.txt`
#[derive(Debug, Clone)]
pub struct WiderFaceDataset {
    annotations: Vec<ImageAnnotation>,
    preprocessor: Preprocessor,
}

impl WiderFaceDataset {
    /// Open a label file; images are expected under `<label dir>/images/`
    #[instrument(skip_all, fields(image_dim = preprocessor.image_dim))]
    pub fn open(label_file: impl AsRef<Path>, preprocessor: Preprocessor) -> Result<Self> {
        let label_file = label_file.as_ref();
        let content = fs::read_to_string(label_file).map_err(|e| {
            Error::dataset(format!("cannot read {}: {}", label_file.display(), e))
        })?;

        let image_root = label_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("images");
        let annotations = parse_annotations(&content, &image_root)?;
        if annotations.is_empty() {
            return Err(Error::dataset(format!(
                "{} lists no images",
                label_file.display()
            )));
        }

        let faces: usize = annotations.iter().map(|a| a.faces.len()).sum();
        info!(
            "Loaded {} images with {} faces from {}",
            annotations.len(),
            faces,
            label_file.display()
        );

        Ok(Self {
            annotations,
            preprocessor,
        })
    }

    /// Parsed annotations
    pub fn annotations(&self) -> &[ImageAnnotation] {
        &self.annotations
    }

    /// Preprocessing in use
    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }
}

impl Dataset for WiderFaceDataset {
    fn len(&self) -> usize {
        self.annotations.len()
    }

    fn get(&self, index: usize) -> Result<DetectionSample> {
        let annotation = self.annotations.get(index).ok_or_else(|| {
            Error::dataset(format!(
                "index {} out of range for {} images",
                index,
                self.annotations.len()
            ))
        })?;
        debug!("Decoding {}", annotation.path.display());
        self.preprocessor.apply(annotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    const LABELS: &str = "\
# 0--Parade/a.png
10 20 30 40 15.0 25.0 0.0 35.0 25.0 0.0 25.0 35.0 0.0 18.0 45.0 0.0 32.0 45.0 0.0 0.9
5 5 10 10 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0 -1.0
# 0--Parade/b.png
";

    #[test]
    fn test_parse_rows() {
        let images = parse_annotations(LABELS, Path::new("/data/images")).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].path, Path::new("/data/images/0--Parade/a.png"));
        assert!(images[1].faces.is_empty());

        let face = &images[0].faces[0];
        assert_eq!(&face[..4], &[10.0, 20.0, 40.0, 60.0]);
        assert_eq!(face[4], 15.0);
        assert_eq!(face[6], 35.0);
        assert_eq!(face[13], 45.0);
        assert_eq!(face[LABEL_COLUMN], 1.0);

        assert_eq!(images[0].faces[1][LABEL_COLUMN], -1.0);
    }

    #[test]
    fn test_short_rows_have_no_landmarks() {
        let images = parse_annotations("# x.png\n1 2 3 4\n", Path::new("r")).unwrap();
        let face = &images[0].faces[0];
        assert_eq!(&face[..4], &[1.0, 2.0, 4.0, 6.0]);
        assert_eq!(face[LABEL_COLUMN], -1.0);
    }

    #[test]
    fn test_rejects_orphan_rows() {
        let err = parse_annotations("1 2 3 4\n", Path::new("r")).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_annotations("# x.png\n1 2 abc 4\n", Path::new("r")).is_err());
        assert!(parse_annotations("# x.png\n1 2\n", Path::new("r")).is_err());
    }

    #[test]
    fn test_open_and_decode() {
        let dir = TempDir::new().unwrap();
        let image_dir = dir.path().join("images/0--Parade");
        std::fs::create_dir_all(&image_dir).unwrap();
        RgbImage::from_pixel(100, 50, Rgb([123, 117, 104]))
            .save(image_dir.join("a.png"))
            .unwrap();
        RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]))
            .save(image_dir.join("b.png"))
            .unwrap();
        let label_file = dir.path().join("label.txt");
        std::fs::write(&label_file, LABELS).unwrap();

        let dataset = WiderFaceDataset::open(&label_file, Preprocessor::new(16)).unwrap();
        assert_eq!(dataset.len(), 2);

        let sample = dataset.get(0).unwrap();
        assert_eq!((sample.height, sample.width), (16, 16));
        assert_eq!(sample.image.len(), 3 * 16 * 16);
        // mean-coloured image is zero everywhere
        assert!(sample.image.iter().all(|v| v.abs() < 1e-4));

        let face = sample.targets[0];
        assert_relative_eq!(face[0], 0.1);
        assert_relative_eq!(face[1], 0.4);
        assert_relative_eq!(face[2], 0.4);
        assert_relative_eq!(face[3], 1.2);
        assert_relative_eq!(face[LABEL_COLUMN], 1.0);

        let black = dataset.get(1).unwrap();
        assert_relative_eq!(black.image[0], -104.0);
        assert_relative_eq!(black.image[16 * 16], -117.0);
        assert_relative_eq!(black.image[2 * 16 * 16], -123.0);
        assert_eq!(black.num_faces(), 0);

        assert!(dataset.get(2).is_err());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = WiderFaceDataset::open(dir.path().join("nope.txt"), Preprocessor::new(16))
            .unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }
}
