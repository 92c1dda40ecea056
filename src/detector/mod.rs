//! Detector networks
//!
//! The training loop only talks to a [`Detector`]: it feeds a batch of images,
//! receives per-anchor predictions in prior order and moves parameters through
//! the variable map. Backbone architectures plug in behind this trait.

pub mod anchor_head;

pub use anchor_head::AnchorHeadDetector;

use std::collections::{BTreeSet, HashMap};

use candle_core::Tensor;
use candle_nn::VarMap;

use crate::error::{Error, Result};

/// Per-anchor predictions for a batch
#[derive(Debug, Clone)]
pub struct DetectorOutput {
    /// Box regression `[B, P, 4]`
    pub loc: Tensor,
    /// Class logits `[B, P, 2]`
    pub conf: Tensor,
    /// Landmark regression `[B, P, 10]`
    pub landm: Tensor,
}

impl DetectorOutput {
    /// Number of anchors the output covers
    pub fn num_priors(&self) -> Result<usize> {
        Ok(self.loc.dim(1)?)
    }
}

/// Trainable multi-task face detector
pub trait Detector: Send {
    /// Architecture name
    fn name(&self) -> &str;

    /// Run the network on `[B, 3, H, W]` images
    fn forward(&self, images: &Tensor) -> Result<DetectorOutput>;

    /// Trainable variables
    fn var_map(&self) -> &VarMap;

    /// Snapshot of every parameter, keyed by its path
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let vars = self
            .var_map()
            .data()
            .lock()
            .map_err(|_| Error::internal("variable map lock poisoned"))?;

        let mut state = HashMap::with_capacity(vars.len());
        for (name, var) in vars.iter() {
            state.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(state)
    }

    /// Copy a parameter map into the detector
    ///
    /// Key sets must match exactly. Values are moved onto each parameter's own
    /// device and dtype before being written.
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let vars = self
            .var_map()
            .data()
            .lock()
            .map_err(|_| Error::internal("variable map lock poisoned"))?;

        let owned: BTreeSet<&String> = vars.keys().collect();
        let given: BTreeSet<&String> = state.keys().collect();
        if owned != given {
            return Err(Error::StateMismatch {
                missing: owned.difference(&given).map(|s| s.to_string()).collect(),
                unexpected: given.difference(&owned).map(|s| s.to_string()).collect(),
            });
        }

        for (name, var) in vars.iter() {
            if let Some(value) = state.get(name) {
                let value = value.to_device(var.device())?.to_dtype(var.dtype())?;
                var.set(&value)?;
            }
        }
        Ok(())
    }

    /// Number of scalar parameters
    fn parameter_count(&self) -> usize {
        self.var_map()
            .all_vars()
            .iter()
            .map(|var| var.elem_count())
            .sum()
    }
}
