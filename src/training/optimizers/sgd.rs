//! SGD optimizer with momentum and L2 weight decay
//!
//! Weight decay is folded into the gradient (`d_p = g + wd * p`) and the
//! momentum buffer starts as a copy of the first `d_p`.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::VarMap;

use super::{trainable_vars, Optimizer};
use crate::error::Result;

/// SGD optimizer with momentum
pub struct SGDOptimizer {
    /// Variable map containing parameters
    var_map: VarMap,

    /// Learning rate
    learning_rate: f64,

    /// Momentum coefficient
    momentum: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// Momentum buffers
    momentum_buffers: HashMap<String, Var>,
}

impl SGDOptimizer {
    /// Create a new SGD optimizer
    pub fn new(var_map: &VarMap, learning_rate: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            var_map: var_map.clone(),
            learning_rate,
            momentum,
            weight_decay,
            step_count: 0,
            momentum_buffers: HashMap::new(),
        }
    }

    fn update_parameter(&mut self, name: &str, param: &Var, grad: &candle_core::Tensor) -> Result<()> {
        let mut d_p = if self.weight_decay != 0.0 {
            (grad + (param.as_tensor() * self.weight_decay)?)?
        } else {
            grad.clone()
        };

        if self.momentum != 0.0 {
            match self.momentum_buffers.get(name) {
                Some(buf) => {
                    let next = ((buf.as_tensor() * self.momentum)? + &d_p)?;
                    buf.set(&next)?;
                    d_p = next;
                }
                None => {
                    self.momentum_buffers
                        .insert(name.to_string(), Var::from_tensor(&d_p)?);
                }
            }
        }

        param.set(&(param.as_tensor() - (d_p * self.learning_rate)?)?)?;
        Ok(())
    }
}

impl Optimizer for SGDOptimizer {
    fn name(&self) -> &str {
        "sgd"
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;
        for (name, var) in trainable_vars(&self.var_map)? {
            if let Some(grad) = gradients.get(&var) {
                self.update_parameter(&name, &var, grad)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn parameter_count(&self) -> usize {
        self.var_map.all_vars().len()
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}
