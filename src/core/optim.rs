//! AdamW optimizer over named parameters

use anyhow::{bail, Result};
use candle_core::{backprop::GradStore, DType, Tensor, Var};
use std::collections::HashMap;

pub struct AdamW {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,

    exp_avg: HashMap<String, Tensor>,
    exp_avg_sq: HashMap<String, Tensor>,

    // Step counter
    step: u64,
}

impl AdamW {
    pub fn new(learning_rate: f64) -> Self {
        Self::with_params(learning_rate, 0.9, 0.999, 1e-8, 0.01)
    }

    pub fn with_params(learning_rate: f64, beta1: f64, beta2: f64, eps: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
            exp_avg: HashMap::new(),
            exp_avg_sq: HashMap::new(),
            step: 0,
        }
    }

    /// Increment step counter - should be called once per optimization step,
    /// before the per-parameter updates.
    pub fn step(&mut self) {
        self.step += 1;
    }

    pub fn get_step(&self) -> u64 {
        self.step
    }

    /// Restore the step counter when resuming a run.
    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    /// Update learning rate
    pub fn set_lr(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    pub fn lr(&self) -> f64 {
        self.learning_rate
    }

    /// Update a single parameter
    pub fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let grad_f32 = grad.to_dtype(DType::F32)?;

        // Initialize states if needed
        if !self.exp_avg.contains_key(name) {
            let zeros = Tensor::zeros_like(&grad_f32)?;
            self.exp_avg.insert(name.to_string(), zeros.clone());
            self.exp_avg_sq.insert(name.to_string(), zeros);
        }

        let m = &self.exp_avg[name];
        let v = &self.exp_avg_sq[name];

        // Update biased moment estimates
        let m_new = ((m * self.beta1)? + (grad_f32.clone() * (1.0 - self.beta1))?)?;
        let v_new = ((v * self.beta2)? + (grad_f32.sqr()? * (1.0 - self.beta2))?)?;

        // Bias correction; max(step, 1) guards a missed step() call
        let step = self.step.max(1);
        let m_hat = (&m_new / (1.0 - self.beta1.powi(step as i32)))?;
        let v_hat = (&v_new / (1.0 - self.beta2.powi(step as i32)))?;

        self.exp_avg.insert(name.to_string(), m_new);
        self.exp_avg_sq.insert(name.to_string(), v_new);

        let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;
        let update = update.to_dtype(param.dtype())?;
        let mut new_value = (param.as_tensor() - (update * self.learning_rate)?)?;

        // Decoupled weight decay, applied to the parameter directly
        if self.weight_decay > 0.0 {
            new_value =
                (new_value - (param.as_tensor() * (self.learning_rate * self.weight_decay))?)?;
        }

        param.set(&new_value)?;
        Ok(())
    }

    /// Apply gradients from a backward pass to every named parameter that
    /// received one.
    pub fn update_all(&mut self, params: &HashMap<String, Var>, grads: &GradStore) -> Result<()> {
        for (name, param) in params {
            if let Some(grad) = grads.get(param.as_tensor()) {
                self.update(name, param, grad)?;
            }
        }
        Ok(())
    }

    /// Moment tensors for checkpoint saving, flat-named as
    /// `{param}.exp_avg` / `{param}.exp_avg_sq`.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::new();
        for (name, m) in &self.exp_avg {
            out.insert(format!("{}.exp_avg", name), m.clone());
        }
        for (name, v) in &self.exp_avg_sq {
            out.insert(format!("{}.exp_avg_sq", name), v.clone());
        }
        out
    }

    /// Restore moments saved by [`Self::state_tensors`].
    pub fn load_state_tensors(&mut self, state: HashMap<String, Tensor>) -> Result<()> {
        self.exp_avg.clear();
        self.exp_avg_sq.clear();
        for (name, tensor) in state {
            if let Some(param) = name.strip_suffix(".exp_avg") {
                self.exp_avg.insert(param.to_string(), tensor);
            } else if let Some(param) = name.strip_suffix(".exp_avg_sq") {
                self.exp_avg_sq.insert(param.to_string(), tensor);
            } else {
                bail!("unrecognized optimizer state tensor '{}'", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn update_moves_parameter_against_gradient() -> Result<()> {
        let device = Device::Cpu;
        let param = Var::from_tensor(&Tensor::from_vec(vec![1.0f32, -1.0], (2,), &device)?)?;
        let grad = Tensor::from_vec(vec![0.5f32, -0.5], (2,), &device)?;
        let mut opt = AdamW::with_params(0.1, 0.9, 0.999, 1e-8, 0.0);
        opt.step();
        opt.update("w", &param, &grad)?;
        let w = param.as_tensor().to_vec1::<f32>()?;
        assert!(w[0] < 1.0, "positive gradient must lower the weight");
        assert!(w[1] > -1.0, "negative gradient must raise the weight");
        Ok(())
    }

    #[test]
    fn first_step_magnitude_is_close_to_lr() -> Result<()> {
        // with bias correction the very first Adam step is ~lr in magnitude
        let device = Device::Cpu;
        let param = Var::from_tensor(&Tensor::from_vec(vec![0.0f32], (1,), &device)?)?;
        let grad = Tensor::from_vec(vec![3.0f32], (1,), &device)?;
        let mut opt = AdamW::with_params(0.1, 0.9, 0.999, 1e-8, 0.0);
        opt.step();
        opt.update("w", &param, &grad)?;
        let w = param.as_tensor().to_vec1::<f32>()?[0];
        assert!((w + 0.1).abs() < 1e-3, "first step should be ~ -lr, got {}", w);
        Ok(())
    }

    #[test]
    fn weight_decay_shrinks_parameters_without_gradient_signal() -> Result<()> {
        let device = Device::Cpu;
        let param = Var::from_tensor(&Tensor::from_vec(vec![10.0f32], (1,), &device)?)?;
        let grad = Tensor::zeros((1,), DType::F32, &device)?;
        let mut opt = AdamW::with_params(0.1, 0.9, 0.999, 1e-8, 0.1);
        opt.step();
        opt.update("w", &param, &grad)?;
        let w = param.as_tensor().to_vec1::<f32>()?[0];
        assert!(w < 10.0 && w > 9.0, "decay should shrink the weight: {}", w);
        Ok(())
    }

    #[test]
    fn state_tensors_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let param = Var::from_tensor(&Tensor::from_vec(vec![1.0f32, 2.0], (2,), &device)?)?;
        let grad = Tensor::from_vec(vec![0.1f32, 0.2], (2,), &device)?;
        let mut opt = AdamW::new(1e-3);
        opt.step();
        opt.update("w", &param, &grad)?;

        let state = opt.state_tensors();
        assert!(state.contains_key("w.exp_avg"));
        assert!(state.contains_key("w.exp_avg_sq"));

        let mut fresh = AdamW::new(1e-3);
        fresh.load_state_tensors(state)?;
        fresh.set_step(opt.get_step());
        assert_eq!(fresh.get_step(), 1);
        assert_eq!(
            fresh.state_tensors()["w.exp_avg"].to_vec1::<f32>()?,
            opt.state_tensors()["w.exp_avg"].to_vec1::<f32>()?
        );
        Ok(())
    }
}
