//! Pyramid (multi-scale) noise generator
//!
//! Augments white noise with progressively coarser noise octaves, then
//! rescales so the result keeps unit variance.

use candle_core::{Result, Tensor};

#[derive(Debug, Clone)]
pub struct PyramidNoise {
    pub levels: usize,
    /// Inclusive range of shrunk spatial sizes that contribute an octave.
    /// `None` accepts every level.
    pub size_range: Option<(usize, usize)>,
}

impl Default for PyramidNoise {
    fn default() -> Self {
        Self { levels: 10, size_range: None }
    }
}

impl PyramidNoise {
    fn level_in_range(&self, h: usize, w: usize) -> bool {
        match self.size_range {
            None => true,
            Some((lo, hi)) => (lo <= h && h <= hi) || (lo <= w && w <= hi),
        }
    }

    /// Layer coarser octaves onto `epsilon` (expected to be unit-variance
    /// noise of shape [B, C, H, W]) and renormalize.
    pub fn apply(&self, epsilon: &Tensor) -> Result<Tensor> {
        let (b, c, full_h, full_w) = epsilon.dims4()?;
        let mut out = epsilon.clone();
        let mut sum_sq = 1.0f64;
        for i in 1..self.levels {
            let m = 0.75f64.powi(i as i32);
            let h = full_h >> i;
            let w = full_w >> i;
            if h == 0 || w == 0 {
                break;
            }
            if self.level_in_range(h, w) {
                let octave = Tensor::randn(0f32, 1f32, (b, c, h, w), epsilon.device())?
                    .upsample_nearest2d(full_h, full_w)?;
                out = (out + (octave * m)?)?;
                sum_sq += m * m;
            }
            if h <= 1 || w <= 1 {
                break;
            }
        }
        out * (1.0 / sum_sq.sqrt())
    }
}
