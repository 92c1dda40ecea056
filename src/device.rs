//! Device placement

use std::collections::HashMap;
use std::fmt;

use candle_core::{Device, Tensor};

use crate::config::DevicePolicy;
use crate::error::{Error, Result};
use crate::training::checkpoints::add_parallel_prefix;

/// Where the detector and its tensors live for the whole run
#[derive(Debug, Clone)]
pub struct DevicePlacement {
    device: Device,
    policy: DevicePolicy,
    units: usize,
}

impl DevicePlacement {
    /// Resolve a placement from the variant policy
    ///
    /// An accelerated policy never falls back to the CPU.
    #[tracing::instrument(level = "debug")]
    pub fn resolve(policy: DevicePolicy, requested_units: usize) -> Result<Self> {
        match policy {
            DevicePolicy::NonAccelerated => Ok(Self::cpu()),
            DevicePolicy::Accelerated => {
                if candle_core::utils::cuda_is_available() {
                    let device = Device::new_cuda(0)?;
                    let units = 1 + (1..requested_units.max(1))
                        .filter(|&ordinal| Device::new_cuda(ordinal).is_ok())
                        .count();
                    if units < requested_units {
                        tracing::warn!(
                            "Requested {} accelerator units, only {} available",
                            requested_units,
                            units
                        );
                    }
                    Ok(Self {
                        device,
                        policy,
                        units,
                    })
                } else if candle_core::utils::metal_is_available() {
                    Ok(Self {
                        device: Device::new_metal(0)?,
                        policy,
                        units: 1,
                    })
                } else {
                    Err(Error::device_unavailable(
                        "variant requires an accelerator but neither CUDA nor Metal is available",
                    ))
                }
            }
        }
    }

    /// Single CPU placement
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            policy: DevicePolicy::NonAccelerated,
            units: 1,
        }
    }

    /// Device tensors are placed on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Policy this placement was resolved from
    pub fn policy(&self) -> DevicePolicy {
        self.policy
    }

    /// Number of compute units the detector is replicated across
    pub fn units(&self) -> usize {
        self.units
    }

    /// Whether parameters are held behind a replication wrapper
    pub fn is_replicated(&self) -> bool {
        self.policy.is_accelerated()
    }

    /// Parameter state as it is written to a checkpoint
    ///
    /// Replicated placements name parameters with the wrapper prefix.
    pub fn export_state(&self, state: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
        if self.is_replicated() {
            add_parallel_prefix(state)
        } else {
            state
        }
    }
}

impl fmt::Display for DevicePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        };
        write!(f, "{} x{}", kind, self.units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_non_accelerated_is_cpu() {
        let placement = DevicePlacement::resolve(DevicePolicy::NonAccelerated, 4).unwrap();
        assert!(placement.device().is_cpu());
        assert_eq!(placement.units(), 1);
        assert!(!placement.is_replicated());
        assert_eq!(placement.to_string(), "cpu x1");
    }

    #[test]
    fn test_accelerated_never_downgrades() {
        let accelerator_present =
            candle_core::utils::cuda_is_available() || candle_core::utils::metal_is_available();
        let result = DevicePlacement::resolve(DevicePolicy::Accelerated, 1);
        if accelerator_present {
            assert!(!result.unwrap().device().is_cpu());
        } else {
            assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
        }
    }

    #[test]
    fn test_cpu_export_keeps_names() {
        let mut state = HashMap::new();
        state.insert(
            "head.weight".to_string(),
            Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
        );
        let exported = DevicePlacement::cpu().export_state(state);
        assert!(exported.contains_key("head.weight"));
    }
}
