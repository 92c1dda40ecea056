//! Error types for the training system

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug)]
pub enum Error {
    /// Network variant not present in the registry
    #[error("Unknown network variant '{name}' (known: {known})")]
    UnknownVariant {
        /// Requested variant name
        name: String,
        /// Comma separated list of registered variants
        known: String,
    },

    /// Optimizer name not recognised
    #[error("Invalid optimizer '{0}' (expected one of: sgd, sgdp, adamp)")]
    InvalidOptimizer(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint file missing
    #[error("Checkpoint not found: {}", path.display())]
    CheckpointNotFound {
        /// Path that was looked up
        path: PathBuf,
    },

    /// Resume requested but the checkpoint could not be applied
    #[error("Failed to resume from epoch {epoch}: {source}")]
    ResumeFailed {
        /// Requested resume epoch
        epoch: usize,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Parameter state does not match the detector
    #[error("Parameter state mismatch (missing: {missing:?}, unexpected: {unexpected:?})")]
    StateMismatch {
        /// Parameters the detector expects but the state lacks
        missing: Vec<String>,
        /// Keys in the state the detector does not own
        unexpected: Vec<String>,
    },

    /// Accelerated placement requested but no accelerator present
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Dataset could not be read
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Batch did not match what the loop expects
    #[error("Malformed batch: {0}")]
    MalformedBatch(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for training operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a dataset error
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a malformed batch error
    pub fn malformed_batch(msg: impl Into<String>) -> Self {
        Self::MalformedBatch(msg.into())
    }

    /// Create a device unavailable error
    pub fn device_unavailable(msg: impl Into<String>) -> Self {
        Self::DeviceUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a failure that happened while resuming
    pub fn resume_failed(epoch: usize, source: Error) -> Self {
        Self::ResumeFailed {
            epoch,
            source: Box::new(source),
        }
    }
}
