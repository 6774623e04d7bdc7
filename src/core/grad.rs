//! Named gradient accumulation and global-norm clipping

use anyhow::Result;
use candle_core::{backprop::GradStore, Tensor, Var};
use std::collections::HashMap;

/// Sums gradients across micro-steps until the owning step machine decides
/// to apply them. Accumulated values are plain tensors detached from the
/// autograd graph.
#[derive(Default)]
pub struct GradientAccumulator {
    grads: HashMap<String, Tensor>,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let grad = grad.detach();
        match self.grads.get(name) {
            Some(existing) => {
                let sum = (existing + &grad)?;
                self.grads.insert(name.to_string(), sum);
            }
            None => {
                self.grads.insert(name.to_string(), grad);
            }
        }
        Ok(())
    }

    /// Pull every named parameter's gradient out of a backward pass.
    pub fn accumulate_from(
        &mut self,
        params: &HashMap<String, Var>,
        grads: &GradStore,
    ) -> Result<()> {
        for (name, param) in params {
            if let Some(grad) = grads.get(param.as_tensor()) {
                self.accumulate(name, grad)?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    pub fn grads_mut(&mut self) -> &mut HashMap<String, Tensor> {
        &mut self.grads
    }

    /// L2 norm over all accumulated gradients, as one global vector.
    pub fn global_norm(&self) -> Result<f64> {
        let mut total = 0.0f64;
        for grad in self.grads.values() {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(total.sqrt())
    }

    /// Scale every gradient so the global norm does not exceed `max_norm`.
    /// Returns the pre-clip norm.
    pub fn clip_global_norm(&mut self, max_norm: f64) -> Result<f64> {
        let norm = self.global_norm()?;
        if norm > max_norm {
            let scale = max_norm / (norm + 1e-6);
            for grad in self.grads.values_mut() {
                *grad = (&*grad * scale)?;
            }
        }
        Ok(norm)
    }

    pub fn clear(&mut self) {
        self.grads.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn accumulation_sums_micro_step_gradients() -> Result<()> {
        let device = Device::Cpu;
        let mut acc = GradientAccumulator::new();
        for _ in 0..3 {
            let g = Tensor::from_vec(vec![1.0f32, 2.0], (2,), &device)?;
            acc.accumulate("w", &g)?;
        }
        assert_eq!(acc.get("w").unwrap().to_vec1::<f32>()?, vec![3.0, 6.0]);
        acc.clear();
        assert!(acc.is_empty());
        Ok(())
    }

    #[test]
    fn clipping_caps_the_global_norm() -> Result<()> {
        let device = Device::Cpu;
        let mut acc = GradientAccumulator::new();
        acc.accumulate("a", &Tensor::from_vec(vec![3.0f32], (1,), &device)?)?;
        acc.accumulate("b", &Tensor::from_vec(vec![4.0f32], (1,), &device)?)?;
        let pre = acc.clip_global_norm(1.0)?;
        assert!((pre - 5.0).abs() < 1e-5);
        let post = acc.global_norm()?;
        assert!((post - 1.0).abs() < 1e-3, "post-clip norm = {}", post);
        Ok(())
    }

    #[test]
    fn clipping_leaves_small_gradients_alone() -> Result<()> {
        let device = Device::Cpu;
        let mut acc = GradientAccumulator::new();
        acc.accumulate("a", &Tensor::from_vec(vec![0.3f32, 0.4], (2,), &device)?)?;
        let pre = acc.clip_global_norm(1.0)?;
        assert!((pre - 0.5).abs() < 1e-5);
        assert_eq!(acc.get("a").unwrap().to_vec1::<f32>()?, vec![0.3, 0.4]);
        Ok(())
    }

    #[test]
    fn four_micro_steps_match_one_full_batch() -> Result<()> {
        // the per-micro-step loss is divided by the number of micro-steps,
        // so the accumulated gradient equals the full-batch gradient
        let device = Device::Cpu;
        let xs: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let ys: Vec<f32> = vec![2.0, 4.0, 6.0, 8.0];

        let grad_of = |batches: &[(&[f32], &[f32])]| -> Result<Vec<f32>> {
            let w = Var::from_tensor(&Tensor::from_vec(vec![0.5f32], (1,), &device)?)?;
            let mut acc = GradientAccumulator::new();
            let n = batches.len() as f64;
            for (x, y) in batches {
                let x = Tensor::from_vec(x.to_vec(), (x.len(),), &device)?;
                let y = Tensor::from_vec(y.to_vec(), (y.len(),), &device)?;
                let pred = x.broadcast_mul(w.as_tensor())?;
                let loss = ((pred - y)?.sqr()?.mean_all()? / n)?;
                let grads = loss.backward()?;
                let mut params = HashMap::new();
                params.insert("w".to_string(), w.clone());
                acc.accumulate_from(&params, &grads)?;
            }
            Ok(acc.get("w").unwrap().to_vec1::<f32>()?)
        };

        let full = grad_of(&[(xs.as_slice(), ys.as_slice())])?;
        let micro = grad_of(&[
            (&xs[0..1], &ys[0..1]),
            (&xs[1..2], &ys[1..2]),
            (&xs[2..3], &ys[2..3]),
            (&xs[3..4], &ys[3..4]),
        ])?;
        assert!(
            (full[0] - micro[0]).abs() < 1e-5,
            "full {} != accumulated {}",
            full[0],
            micro[0]
        );
        Ok(())
    }

    #[test]
    fn empty_accumulator_has_zero_norm() -> Result<()> {
        let acc = GradientAccumulator::new();
        assert_eq!(acc.global_norm()?, 0.0);
        Ok(())
    }
}
