//! SGDP: momentum SGD with projection-aware decoupled weight decay

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use super::projection::ProjectionParams;
use super::{trainable_vars, Optimizer};
use crate::error::Result;

/// SGD with decoupled weight decay and radial projection
pub struct SGDPOptimizer {
    var_map: VarMap,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    projection: ProjectionParams,
    step_count: usize,
    momentum_buffers: HashMap<String, Var>,
}

impl SGDPOptimizer {
    /// Create a new SGDP optimizer with the default projection parameters
    pub fn new(var_map: &VarMap, learning_rate: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            var_map: var_map.clone(),
            learning_rate,
            momentum,
            weight_decay,
            projection: ProjectionParams::default(),
            step_count: 0,
            momentum_buffers: HashMap::new(),
        }
    }

    /// Override the projection parameters
    pub fn with_projection(mut self, projection: ProjectionParams) -> Self {
        self.projection = projection;
        self
    }

    fn update_parameter(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let buf = match self.momentum_buffers.get(name) {
            Some(buf) => buf.clone(),
            None => {
                let buf = Var::zeros(param.dims(), param.dtype(), param.device())?;
                self.momentum_buffers.insert(name.to_string(), buf.clone());
                buf
            }
        };

        let next = ((buf.as_tensor() * self.momentum)? + grad)?;
        let projected = self.projection.project(param.as_tensor(), grad, next)?;
        // the projected direction is carried into the next step
        buf.set(&projected.update)?;

        let mut value = param.as_tensor().clone();
        if self.weight_decay != 0.0 {
            let decay = 1.0
                - self.learning_rate * self.weight_decay * projected.wd_ratio / (1.0 - self.momentum);
            value = (value * decay)?;
        }
        param.set(&(value - (projected.update * self.learning_rate)?)?)?;
        Ok(())
    }
}

impl Optimizer for SGDPOptimizer {
    fn name(&self) -> &str {
        "sgdp"
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
    fn test_decoupled_decay_on_vector() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(1, "bias", Init::Const(1.0)).unwrap();
        let mut opt = SGDPOptimizer::new(&var_map, 0.1, 0.5, 0.5);

        let grads = w.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();

        // decay = 1 - 0.1 * 0.5 / 0.5 = 0.9, buf = 2, w = 0.9 - 0.2
        assert_relative_eq!(w.to_vec1::<f32>().unwrap()[0], 0.7, epsilon = 1e-6);
        assert_eq!(opt.name(), "sgdp");
    }

    #[test]
    fn test_orthogonal_gradient_step() {
        let mut var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints((1, 2), "weight", Init::Const(0.0)).unwrap();
        var_map
            .set_one("weight", Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap())
            .unwrap();

        // gradient (0, 1) is orthogonal to the weight
        let target = Tensor::new(&[[0f32, 1.0]], &Device::Cpu).unwrap();
        let grads = (&w * &target).unwrap().sum_all().unwrap().backward().unwrap();

        let mut opt = SGDPOptimizer::new(&var_map, 0.1, 0.0, 0.0);
        opt.step(&grads).unwrap();

        let values = w.to_vec2::<f32>().unwrap();
        assert_relative_eq!(values[0][0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(values[0][1], -0.1, epsilon = 1e-6);
    }
}
