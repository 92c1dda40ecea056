//! Network variant configuration
//!
//! Every run resolves exactly one [`VariantConfig`] from a [`ConfigRegistry`]
//! before anything else is constructed. The record is immutable afterwards and
//! is handed by reference to the detector, the prior generator, the optimizer
//! factory and the training loop.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils;

/// Where the detector runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePolicy {
    /// Accelerator placement, replicated across the available units
    #[serde(rename = "gpu", alias = "accelerated")]
    Accelerated,
    /// Single CPU placement
    #[serde(rename = "cpu", alias = "non_accelerated")]
    NonAccelerated,
}

impl DevicePolicy {
    /// Whether the policy asks for an accelerator
    pub fn is_accelerated(&self) -> bool {
        matches!(self, Self::Accelerated)
    }
}

/// Immutable configuration record for one network variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    /// Model name, used in checkpoint file names
    pub name: String,

    /// Anchor sizes (in pixels) per pyramid level
    pub min_sizes: Vec<Vec<usize>>,

    /// Feature stride per pyramid level
    pub steps: Vec<usize>,

    /// Box encoding variances (center, size)
    pub variance: [f64; 2],

    /// Clip anchors to the unit square
    #[serde(default)]
    pub clip: bool,

    /// Weight of the localisation loss
    pub loc_weight: f64,

    /// Device placement policy
    pub device_policy: DevicePolicy,

    /// Batch size
    pub batch_size: usize,

    /// Number of accelerator units to replicate across
    #[serde(default = "default_ngpu")]
    pub ngpu: usize,

    /// Number of training epochs
    pub epoch: usize,

    /// First step-decay epoch (informational)
    #[serde(default)]
    pub decay1: Option<usize>,

    /// Second step-decay epoch (informational)
    #[serde(default)]
    pub decay2: Option<usize>,

    /// Square training image size
    pub image_size: usize,

    /// Whether the backbone starts from pretrained weights
    #[serde(default)]
    pub pretrain: bool,

    /// Backbone stages feeding the feature pyramid
    #[serde(default)]
    pub return_layers: BTreeMap<String, usize>,

    /// Backbone input channel width
    #[serde(default)]
    pub in_channel: Option<usize>,

    /// Feature pyramid channel width
    pub out_channel: usize,
}

fn default_ngpu() -> usize {
    1
}

impl VariantConfig {
    /// Validate the record
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("Variant name must not be empty"));
        }

        if self.image_size == 0 || self.batch_size == 0 || self.epoch == 0 {
            return Err(Error::config(format!(
                "Variant '{}': image_size, batch_size and epoch must be > 0",
                self.name
            )));
        }

        if self.steps.is_empty() || self.steps.len() != self.min_sizes.len() {
            return Err(Error::config(format!(
                "Variant '{}': steps and min_sizes must have the same non-zero length",
                self.name
            )));
        }

        if self.steps.iter().any(|&s| s == 0)
            || self.min_sizes.iter().any(|level| level.is_empty() || level.contains(&0))
        {
            return Err(Error::config(format!(
                "Variant '{}': steps and anchor sizes must be positive",
                self.name
            )));
        }

        let anchors = self.anchors_per_cell();
        if self.min_sizes.iter().any(|level| level.len() != anchors) {
            return Err(Error::config(format!(
                "Variant '{}': every level needs the same number of anchor sizes",
                self.name
            )));
        }

        if !(self.loc_weight.is_finite() && self.loc_weight > 0.0) {
            return Err(Error::config(format!(
                "Variant '{}': loc_weight must be positive",
                self.name
            )));
        }

        if self.variance.iter().any(|v| *v <= 0.0) {
            return Err(Error::config(format!(
                "Variant '{}': variances must be positive",
                self.name
            )));
        }

        if self.ngpu == 0 || self.out_channel == 0 {
            return Err(Error::config(format!(
                "Variant '{}': ngpu and out_channel must be > 0",
                self.name
            )));
        }

        Ok(())
    }

    /// Number of anchors generated for each feature map cell
    pub fn anchors_per_cell(&self) -> usize {
        self.min_sizes.first().map(Vec::len).unwrap_or(0)
    }

    fn mobilenet() -> Self {
        Self {
            name: "mobilenet0.25".to_string(),
            min_sizes: standard_min_sizes(),
            steps: vec![8, 16, 32],
            variance: [0.1, 0.2],
            clip: false,
            loc_weight: 2.0,
            device_policy: DevicePolicy::NonAccelerated,
            batch_size: 32,
            ngpu: 1,
            epoch: 250,
            decay1: Some(190),
            decay2: Some(220),
            image_size: 640,
            pretrain: false,
            return_layers: layers(&["stage1", "stage2", "stage3"]),
            in_channel: Some(32),
            out_channel: 64,
        }
    }

    fn resnet50() -> Self {
        Self {
            name: "Resnet50".to_string(),
            min_sizes: standard_min_sizes(),
            steps: vec![8, 16, 32],
            variance: [0.1, 0.2],
            clip: false,
            loc_weight: 2.0,
            device_policy: DevicePolicy::Accelerated,
            batch_size: 24,
            ngpu: 4,
            epoch: 100,
            decay1: Some(70),
            decay2: Some(90),
            image_size: 840,
            pretrain: true,
            return_layers: layers(&["layer2", "layer3", "layer4"]),
            in_channel: Some(256),
            out_channel: 256,
        }
    }

    fn efficientnet_b2() -> Self {
        Self {
            name: "efficientb2".to_string(),
            min_sizes: standard_min_sizes(),
            steps: vec![8, 16, 32],
            variance: [0.1, 0.2],
            clip: false,
            loc_weight: 2.0,
            device_policy: DevicePolicy::Accelerated,
            batch_size: 24,
            ngpu: 1,
            epoch: 100,
            decay1: None,
            decay2: None,
            image_size: 640,
            pretrain: false,
            return_layers: BTreeMap::new(),
            in_channel: None,
            out_channel: 256,
        }
    }

    fn vovnet39() -> Self {
        Self {
            name: "vovnet39b".to_string(),
            min_sizes: standard_min_sizes(),
            steps: vec![8, 16, 32],
            variance: [0.1, 0.2],
            clip: false,
            loc_weight: 2.0,
            device_policy: DevicePolicy::Accelerated,
            batch_size: 32,
            ngpu: 1,
            epoch: 100,
            decay1: None,
            decay2: None,
            image_size: 640,
            pretrain: false,
            return_layers: BTreeMap::new(),
            in_channel: None,
            out_channel: 256,
        }
    }
}

fn standard_min_sizes() -> Vec<Vec<usize>> {
    vec![vec![16, 32], vec![64, 128], vec![256, 512]]
}

fn layers(names: &[&str]) -> BTreeMap<String, usize> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), i + 1))
        .collect()
}

/// Fixed mapping from network name to configuration record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRegistry {
    variants: BTreeMap<String, VariantConfig>,
}

impl ConfigRegistry {
    /// Registry with the compiled-in variants
    pub fn builtin() -> Self {
        let variants = [
            ("mobile0.25", VariantConfig::mobilenet()),
            ("resnet50", VariantConfig::resnet50()),
            ("efficientb2", VariantConfig::efficientnet_b2()),
            ("vovnet39b", VariantConfig::vovnet39()),
        ]
        .into_iter()
        .map(|(key, config)| (key.to_string(), config))
        .collect();

        Self { variants }
    }

    /// Load additional variants from a JSON or YAML file
    ///
    /// The file holds a map from network name to a full variant record.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let variants: BTreeMap<String, VariantConfig> = utils::config::load_config(path)?;
        for config in variants.values() {
            config.validate()?;
        }
        Ok(Self { variants })
    }

    /// Overlay another registry; its entries replace ours on name clashes
    pub fn merge(mut self, other: ConfigRegistry) -> Self {
        self.variants.extend(other.variants);
        self
    }

    /// Resolve a network name to its configuration record
    pub fn resolve(&self, name: &str) -> Result<VariantConfig> {
        self.variants
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownVariant {
                name: name.to_string(),
                known: self.variant_names().join(", "),
            })
    }

    /// Registered network names, sorted
    pub fn variant_names(&self) -> Vec<&str> {
        self.variants.keys().map(String::as_str).collect()
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case("mobile0.25", "mobilenet0.25", 32, 250, 640)]
    #[test_case("resnet50", "Resnet50", 24, 100, 840)]
    #[test_case("efficientb2", "efficientb2", 24, 100, 640)]
    #[test_case("vovnet39b", "vovnet39b", 32, 100, 640)]
    fn test_builtin_variants(key: &str, name: &str, batch: usize, epochs: usize, size: usize) {
        let config = ConfigRegistry::builtin().resolve(key).unwrap();
        assert_eq!(config.name, name);
        assert_eq!(config.batch_size, batch);
        assert_eq!(config.epoch, epochs);
        assert_eq!(config.image_size, size);
        assert_eq!(config.loc_weight, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_all_variants_positive() {
        let registry = ConfigRegistry::builtin();
        for name in registry.variant_names() {
            let config = registry.resolve(name).unwrap();
            assert!(config.epoch > 0);
            assert!(config.batch_size > 0);
            assert!(config.image_size > 0);
        }
    }

    #[test_case("mobilenet0.25"; "model name is not a registry key")]
    #[test_case("resnet18")]
    #[test_case("")]
    fn test_unknown_variant(name: &str) {
        let err = ConfigRegistry::builtin().resolve(name).unwrap_err();
        assert!(matches!(err, Error::UnknownVariant { .. }));
    }

    #[test]
    fn test_device_policies() {
        let registry = ConfigRegistry::builtin();
        assert_eq!(
            registry.resolve("mobile0.25").unwrap().device_policy,
            DevicePolicy::NonAccelerated
        );
        assert!(registry.resolve("resnet50").unwrap().device_policy.is_accelerated());
    }

    #[test]
    fn test_validation_rejects_mismatched_levels() {
        let mut config = ConfigRegistry::builtin().resolve("efficientb2").unwrap();
        config.steps.push(64);
        assert!(config.validate().is_err());

        let mut config = ConfigRegistry::builtin().resolve("efficientb2").unwrap();
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_registry_from_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("variants.yaml");
        let mut tiny = ConfigRegistry::builtin().resolve("mobile0.25").unwrap();
        tiny.name = "tiny".to_string();
        tiny.image_size = 64;
        let mut extra = BTreeMap::new();
        extra.insert("tiny".to_string(), tiny);
        std::fs::write(&path, serde_yaml::to_string(&extra).unwrap()).unwrap();

        let registry = ConfigRegistry::builtin().merge(ConfigRegistry::from_file(&path).unwrap());
        assert_eq!(registry.resolve("tiny").unwrap().image_size, 64);
        assert!(registry.resolve("resnet50").is_ok());
    }
}
