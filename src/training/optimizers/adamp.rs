//! AdamP: Adam with projection-aware decoupled weight decay
//!
//! AdamP carries its own step size correction, so it runs without an external
//! learning rate schedule.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use super::projection::ProjectionParams;
use super::{trainable_vars, Optimizer};
use crate::error::Result;

/// First and second moment estimates of one parameter
struct Moments {
    exp_avg: Var,
    exp_avg_sq: Var,
}

/// AdamP optimizer
pub struct AdamPOptimizer {
    var_map: VarMap,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    projection: ProjectionParams,
    step_count: usize,
    moments: HashMap<String, Moments>,
}

impl AdamPOptimizer {
    /// Create a new AdamP optimizer
    pub fn new(
        var_map: &VarMap,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Self {
        Self {
            var_map: var_map.clone(),
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            projection: ProjectionParams::default(),
            step_count: 0,
            moments: HashMap::new(),
        }
    }

    /// AdamP with the usual `(0.9, 0.999)` betas and `1e-8` epsilon
    pub fn with_defaults(var_map: &VarMap, learning_rate: f64, weight_decay: f64) -> Self {
        Self::new(var_map, learning_rate, 0.9, 0.999, 1e-8, weight_decay)
    }

    fn update_parameter(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        if !self.moments.contains_key(name) {
            let moments = Moments {
                exp_avg: Var::zeros(param.dims(), param.dtype(), param.device())?,
                exp_avg_sq: Var::zeros(param.dims(), param.dtype(), param.device())?,
            };
            self.moments.insert(name.to_string(), moments);
        }
        let Some(state) = self.moments.get(name) else {
            return Ok(());
        };

        let exp_avg = ((state.exp_avg.as_tensor() * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
        let exp_avg_sq =
            ((state.exp_avg_sq.as_tensor() * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;
        state.exp_avg.set(&exp_avg)?;
        state.exp_avg_sq.set(&exp_avg_sq)?;

        let t = self.step_count as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let denom = ((exp_avg_sq.sqrt()? / bias_correction2.sqrt())? + self.epsilon)?;
        let step_size = self.learning_rate / bias_correction1;
        let perturb = exp_avg.div(&denom)?;

        let projected = self.projection.project(param.as_tensor(), grad, perturb)?;

        let mut value = param.as_tensor().clone();
        if self.weight_decay > 0.0 {
            value = (value * (1.0 - self.learning_rate * self.weight_decay * projected.wd_ratio))?;
        }
        param.set(&(value - (projected.update * step_size)?)?)?;
        Ok(())
    }
}

impl Optimizer for AdamPOptimizer {
    fn name(&self) -> &str {
        "adamp"
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(1, "bias", Init::Const(1.0)).unwrap();
        let mut opt = AdamPOptimizer::with_defaults(&var_map, 0.01, 0.0);

        let grads = w.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();

        // bias corrected m / sqrt(v) is sign(grad) on the first step
        assert_relative_eq!(w.to_vec1::<f32>().unwrap()[0], 0.99, epsilon = 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_weight_decay_is_decoupled() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(1, "bias", Init::Const(2.0)).unwrap();
        let mut opt = AdamPOptimizer::with_defaults(&var_map, 0.1, 0.5);

        let grads = w.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();

        // 2 * (1 - 0.05) - 0.1
        assert_relative_eq!(w.to_vec1::<f32>().unwrap()[0], 1.8, epsilon = 1e-5);
    }
}
