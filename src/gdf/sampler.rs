//! Ancestral DDPM sampler with classifier-free guidance

use candle_core::{Result, Tensor};

use super::Gdf;
use crate::models::{Conditions, Denoiser};

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub timesteps: usize,
    pub cfg: f64,
    pub t_start: f64,
    pub t_end: f64,
    pub shift: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { timesteps: 20, cfg: 3.0, t_start: 1.0, t_end: 0.0, shift: 1.0 }
    }
}

/// Run the reverse process from pure noise down to a clean sample.
///
/// When `uncond` is supplied the prediction is guided:
/// pred = uncond + cfg * (cond - uncond). The final step returns the clean
/// estimate with no residual noise.
pub fn ddpm_sample(
    gdf: &Gdf,
    model: &dyn Denoiser,
    cond: &Conditions,
    uncond: Option<&Conditions>,
    shape: (usize, usize, usize, usize),
    config: &SamplingConfig,
) -> Result<Tensor> {
    let (bsz, c, h, w) = shape;
    let device = cond.semantic.device();
    let mut x = Tensor::randn(0f32, 1f32, (bsz, c, h, w), device)?;

    let steps = config.timesteps;
    let ts: Vec<f64> = (0..=steps)
        .map(|i| {
            config.t_start + (config.t_end - config.t_start) * i as f64 / steps as f64
        })
        .collect();
    let offset = if config.shift != 1.0 { 2.0 * (1.0 / config.shift).ln() } else { 0.0 };

    for i in 0..steps {
        let logsnr = gdf.schedule.logsnr(ts[i]) + offset;
        let (a, b) = gdf.input_scaler.coeffs(logsnr);
        let t_cond = gdf.noise_cond.cond(logsnr);
        let noise_cond = Tensor::full(t_cond as f32, (bsz,), device)?;

        let mut pred = model.forward(&x, &noise_cond, cond)?;
        if let Some(uncond) = uncond {
            let pred_u = model.forward(&x, &noise_cond, uncond)?;
            pred = (&pred_u + ((&pred - &pred_u)? * config.cfg)?)?;
        }
        let x0 = gdf.target.undiffuse(&x, a, b, &pred)?;

        if i == steps - 1 {
            x = x0;
        } else {
            let logsnr_next = gdf.schedule.logsnr(ts[i + 1]) + offset;
            let (a_next, b_next) = gdf.input_scaler.coeffs(logsnr_next);
            let sigma = (b_next / b) * (1.0 - a * a / (a_next * a_next)).max(0.0).sqrt();
            let fresh = x0.randn_like(0.0, 1.0)?;
            x = ((x0 * a_next)?
                + (pred * (b_next * b_next - sigma * sigma).max(0.0).sqrt())?)?;
            x = (x + (fresh * sigma)?)?;
        }
    }
    Ok(x)
}
