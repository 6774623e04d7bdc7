//! Epsilon prediction target

use candle_core::{Result, Tensor};

/// The network regresses the injected noise itself. The inverse recovers a
/// clean-sample estimate from the noised input and the prediction.
#[derive(Debug, Clone, Default)]
pub struct EpsilonTarget;

/// Divisor floor for the inverse; the schedule clamp already keeps `a` well
/// above this in practice.
const A_MIN: f64 = 1e-4;

impl EpsilonTarget {
    /// Training target for one batch: the noise that was mixed in.
    pub fn target(&self, _x0: &Tensor, epsilon: &Tensor) -> Result<Tensor> {
        Ok(epsilon.clone())
    }

    /// x0 = (noised - b * pred) / a for scalar coefficients.
    pub fn undiffuse(&self, noised: &Tensor, a: f64, b: f64, pred: &Tensor) -> Result<Tensor> {
        let a = a.max(A_MIN);
        (noised - (pred * b)?)? / a
    }
}
