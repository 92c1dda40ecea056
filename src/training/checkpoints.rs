//! Checkpoint persistence
//!
//! A checkpoint is the detector's parameter map written as safetensors under
//! `{model}_optim_{optimizer}_epoch_{N|Final}.safetensors`. Writes go to a
//! temporary sibling first and are renamed into place, so an interrupted save
//! never leaves a truncated checkpoint under the final name.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};
use crate::utils::io;

/// Key prefix added by a replicated (parallel) wrapper
pub const PARALLEL_PREFIX: &str = "module.";

/// Epochs between periodic checkpoints
pub const CHECKPOINT_INTERVAL: usize = 10;

/// Which point of training a checkpoint captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointLabel {
    /// State after the given number of completed epochs
    Epoch(usize),
    /// State at the end of training
    Final,
}

impl fmt::Display for CheckpointLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epoch(epoch) => write!(f, "{epoch}"),
            Self::Final => f.write_str("Final"),
        }
    }
}

/// File name of a checkpoint
pub fn checkpoint_file_name(model: &str, optimizer: &str, label: CheckpointLabel) -> String {
    format!("{model}_optim_{optimizer}_epoch_{label}.safetensors")
}

/// Whether a periodic checkpoint is due after `completed_epoch` epochs
pub fn should_checkpoint(completed_epoch: usize) -> bool {
    completed_epoch > 0 && completed_epoch % CHECKPOINT_INTERVAL == 0
}

/// Strip parallel-wrapper prefixes from every key
///
/// Nested wrappers are unwrapped fully, so applying it twice is the same as
/// applying it once. Values are never touched and unprefixed keys pass through.
pub fn strip_parallel_prefix<V>(state: HashMap<String, V>) -> HashMap<String, V> {
    state
        .into_iter()
        .map(|(key, value)| {
            if key.starts_with(PARALLEL_PREFIX) {
                let mut name = key.as_str();
                while let Some(rest) = name.strip_prefix(PARALLEL_PREFIX) {
                    name = rest;
                }
                (name.to_string(), value)
            } else {
                (key, value)
            }
        })
        .collect()
}

/// Name every key the way a replicated wrapper does
pub fn add_parallel_prefix<V>(state: HashMap<String, V>) -> HashMap<String, V> {
    state
        .into_iter()
        .map(|(key, value)| {
            if key.starts_with(PARALLEL_PREFIX) {
                (key, value)
            } else {
                (format!("{PARALLEL_PREFIX}{key}"), value)
            }
        })
        .collect()
}

/// Saves and loads parameter checkpoints for one model / optimizer pair
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
    model_name: String,
    optimizer_name: String,
}

impl CheckpointManager {
    /// Create a manager, creating the directory if it is absent
    pub fn new(
        directory: impl Into<PathBuf>,
        model_name: impl Into<String>,
        optimizer_name: impl Into<String>,
    ) -> Result<Self> {
        let directory = directory.into();
        io::ensure_dir_exists(&directory)?;

        Ok(Self {
            directory,
            model_name: model_name.into(),
            optimizer_name: optimizer_name.into(),
        })
    }

    /// Directory checkpoints are written to
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Full path of the checkpoint for `label`
    pub fn path_for(&self, label: CheckpointLabel) -> PathBuf {
        self.directory.join(checkpoint_file_name(
            &self.model_name,
            &self.optimizer_name,
            label,
        ))
    }

    /// Persist a parameter map, replacing any earlier checkpoint with the same label
    pub fn save(&self, state: &HashMap<String, Tensor>, label: CheckpointLabel) -> Result<PathBuf> {
        let path = self.path_for(label);
        let temp_path = path.with_extension("tmp");

        let mut host = HashMap::with_capacity(state.len());
        for (name, tensor) in state {
            host.insert(name.clone(), tensor.to_device(&Device::Cpu)?);
        }

        candle_core::safetensors::save(&host, &temp_path)?;
        io::commit_atomic(&temp_path, &path)?;

        tracing::info!("Saved checkpoint {} ({} tensors)", path.display(), host.len());
        Ok(path)
    }

    /// Load the checkpoint written after `epoch` completed epochs
    pub fn load(&self, epoch: usize, device: &Device) -> Result<HashMap<String, Tensor>> {
        self.load_path(self.path_for(CheckpointLabel::Epoch(epoch)), device)
    }

    /// Load a checkpoint file, normalising parallel-wrapper keys
    pub fn load_path(&self, path: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
        let path = path.as_ref();
        if !io::is_file_readable(path) {
            return Err(Error::CheckpointNotFound {
                path: path.to_path_buf(),
            });
        }

        let state = candle_core::safetensors::load(path, device)?;
        tracing::debug!("Loaded {} tensors from {}", state.len(), path.display());
        Ok(strip_parallel_prefix(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case(CheckpointLabel::Epoch(10), "mobilenet0.25_optim_sgd_epoch_10.safetensors")]
    #[test_case(CheckpointLabel::Final, "mobilenet0.25_optim_sgd_epoch_Final.safetensors")]
    fn test_file_names(label: CheckpointLabel, expected: &str) {
        assert_eq!(checkpoint_file_name("mobilenet0.25", "sgd", label), expected);
    }

    #[test]
    fn test_cadence() {
        let saved: Vec<usize> = (0..=25).filter(|&e| should_checkpoint(e)).collect();
        assert_eq!(saved, vec![10, 20]);
    }

    #[test]
    fn test_prefix_normalisation_is_idempotent() {
        let mut state = HashMap::new();
        state.insert("module.body.weight".to_string(), 1);
        state.insert("head.bias".to_string(), 2);
        state.insert("module.module.x".to_string(), 3);

        let once = strip_parallel_prefix(state);
        let twice = strip_parallel_prefix(once.clone());

        assert_eq!(once.get("body.weight"), Some(&1));
        assert_eq!(once.get("head.bias"), Some(&2));
        assert_eq!(once.get("x"), Some(&3));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_add_then_strip_round_trip() {
        let mut state = HashMap::new();
        state.insert("a.weight".to_string(), 1);
        let prefixed = add_parallel_prefix(state.clone());
        assert!(prefixed.contains_key("module.a.weight"));
        assert_eq!(strip_parallel_prefix(prefixed), state);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manager =
            CheckpointManager::new(dir.path().join("weights"), "tiny", "sgd").unwrap();
        assert!(manager.directory().is_dir());

        let mut state = HashMap::new();
        state.insert(
            "module.level0.stem.weight".to_string(),
            Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        let path = manager.save(&state, CheckpointLabel::Epoch(10)).unwrap();
        assert!(path.ends_with("tiny_optim_sgd_epoch_10.safetensors"));
        assert!(!path.with_extension("tmp").exists());

        let loaded = manager.load(10, &Device::Cpu).unwrap();
        let tensor = &loaded["level0.stem.weight"];
        assert_eq!(tensor.dims(), &[2, 3]);
        assert_eq!(tensor.sum_all().unwrap().to_scalar::<f32>().unwrap(), 6.0);
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), "tiny", "sgd").unwrap();
        let err = manager.load(3, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound { .. }));
    }
}
