//! Generalized diffusion framework
//!
//! Bundles the noise schedule, input scaler, prediction target, noise
//! conditioning encoder and loss weight policy behind a single integration
//! point. Callers go through [`Gdf::diffuse`] during training and
//! [`Gdf::sample`] for generation; the pieces are never wired individually.

pub mod loss_weight;
pub mod noise_cond;
pub mod pyramid;
pub mod sampler;
pub mod scaler;
pub mod schedule;
pub mod target;

pub use loss_weight::{AdaptiveLossSnapshot, AdaptiveLossWeight, LossWeight, P2LossWeight};
pub use noise_cond::CosineTNoiseCond;
pub use pyramid::PyramidNoise;
pub use sampler::SamplingConfig;
pub use scaler::VpScaler;
pub use schedule::CosineSchedule;
pub use target::EpsilonTarget;

use candle_core::{Result, Tensor};
use rand::Rng;

use crate::models::{Conditions, Denoiser};

/// Everything the training step needs from one diffusion draw.
pub struct DiffusionSample {
    pub noised: Tensor,
    pub noise: Tensor,
    pub target: Tensor,
    /// Per-sample log-SNR, kept host-side for bucket updates.
    pub logsnr: Vec<f64>,
    /// Timestep conditioning per sample, shape [B].
    pub noise_cond: Tensor,
    /// Loss weight per sample, shape [B].
    pub loss_weight: Tensor,
}

pub struct Gdf {
    pub schedule: CosineSchedule,
    pub input_scaler: VpScaler,
    pub target: EpsilonTarget,
    pub noise_cond: CosineTNoiseCond,
    pub loss_weight: LossWeight,
}

impl Gdf {
    pub fn new(loss_weight: LossWeight) -> Self {
        Self {
            schedule: CosineSchedule::default(),
            input_scaler: VpScaler,
            target: EpsilonTarget,
            noise_cond: CosineTNoiseCond::default(),
            loss_weight,
        }
    }

    /// Progress values for a training batch: t = 1 - U[0,1) + 0.001,
    /// clamped to [0.001, 1].
    pub fn training_t<R: Rng>(&self, batch: usize, rng: &mut R) -> Vec<f64> {
        (0..batch)
            .map(|_| (1.0 - rng.gen::<f64>() + 0.001).clamp(0.001, 1.0))
            .collect()
    }

    /// Noise a clean batch for one training step.
    ///
    /// `epsilon` and `t` default to fresh draws when not supplied. `shift`
    /// moves every log-SNR by 2*ln(1/shift); `loss_shift` applies the same
    /// reparameterization to the weight lookup only.
    pub fn diffuse<R: Rng>(
        &self,
        x0: &Tensor,
        epsilon: Option<&Tensor>,
        t: Option<&[f64]>,
        shift: f64,
        loss_shift: f64,
        rng: &mut R,
    ) -> Result<DiffusionSample> {
        let (bsz, _c, _h, _w) = x0.dims4()?;
        let noise = match epsilon {
            Some(e) => e.clone(),
            None => x0.randn_like(0.0, 1.0)?,
        };
        let t = match t {
            Some(t) => t.to_vec(),
            None => self.training_t(bsz, rng),
        };
        let mut logsnr: Vec<f64> = t.iter().map(|&t| self.schedule.logsnr(t)).collect();
        if shift != 1.0 {
            let offset = 2.0 * (1.0 / shift).ln();
            for l in &mut logsnr {
                *l += offset;
            }
        }

        let mut a = Vec::with_capacity(bsz);
        let mut b = Vec::with_capacity(bsz);
        for &l in &logsnr {
            let (ai, bi) = self.input_scaler.coeffs(l);
            a.push(ai as f32);
            b.push(bi as f32);
        }
        let a_t = Tensor::from_vec(a, (bsz, 1, 1, 1), x0.device())?;
        let b_t = Tensor::from_vec(b, (bsz, 1, 1, 1), x0.device())?;
        let noised = (x0.broadcast_mul(&a_t)? + noise.broadcast_mul(&b_t)?)?;
        let target = self.target.target(x0, &noise)?;

        let cond: Vec<f32> = logsnr.iter().map(|&l| self.noise_cond.cond(l) as f32).collect();
        let noise_cond = Tensor::from_vec(cond, (bsz,), x0.device())?;
        let weights: Vec<f32> = self
            .loss_weight
            .weights(&logsnr, loss_shift)
            .into_iter()
            .map(|w| w as f32)
            .collect();
        let loss_weight = Tensor::from_vec(weights, (bsz,), x0.device())?;

        Ok(DiffusionSample { noised, noise, target, logsnr, noise_cond, loss_weight })
    }

    /// Ancestral DDPM sampling, see [`sampler::ddpm_sample`].
    pub fn sample(
        &self,
        model: &dyn Denoiser,
        cond: &Conditions,
        uncond: Option<&Conditions>,
        shape: (usize, usize, usize, usize),
        config: &SamplingConfig,
    ) -> Result<Tensor> {
        sampler::ddpm_sample(self, model, cond, uncond, shape, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gdf() -> Gdf {
        Gdf::new(LossWeight::P2(P2LossWeight::default()))
    }

    #[test]
    fn fixed_progress_scenario() -> Result<()> {
        let device = Device::Cpu;
        let gdf = gdf();
        let mut rng = StdRng::seed_from_u64(42);
        let x0 = Tensor::randn(0f32, 1f32, (5, 2, 8, 8), &device)?;
        let t = [0.0, 0.25, 0.5, 0.75, 1.0];
        let sample = gdf.diffuse(&x0, None, Some(&t), 1.0, 1.0, &mut rng)?;

        for pair in sample.logsnr.windows(2) {
            assert!(pair[0] > pair[1], "logSNR must strictly decrease over t");
        }
        for &l in &sample.logsnr {
            let (a, b) = gdf.input_scaler.coeffs(l);
            assert!(a > 0.0 && a < 1.0);
            assert!(b > 0.0 && b < 1.0);
        }
        let cond = sample.noise_cond.to_vec1::<f32>()?;
        for c in cond {
            assert!((0.0..=1.0).contains(&c));
        }
        assert_eq!(sample.noised.dims(), x0.dims());
        assert_eq!(sample.target.dims(), x0.dims());
        Ok(())
    }

    #[test]
    fn training_t_stays_in_range() {
        let gdf = gdf();
        let mut rng = StdRng::seed_from_u64(7);
        for t in gdf.training_t(1000, &mut rng) {
            assert!((0.001..=1.0).contains(&t));
        }
    }

    #[test]
    fn diffuse_mixes_with_variance_preserving_coeffs() -> Result<()> {
        let device = Device::Cpu;
        let gdf = gdf();
        let mut rng = StdRng::seed_from_u64(3);
        let x0 = Tensor::full(1.0f32, (2, 1, 4, 4), &device)?;
        let eps = Tensor::full(1.0f32, (2, 1, 4, 4), &device)?;
        let t = [0.3, 0.7];
        let sample = gdf.diffuse(&x0, Some(&eps), Some(&t), 1.0, 1.0, &mut rng)?;
        let noised = sample.noised.flatten_all()?.to_vec1::<f32>()?;
        for (i, &ti) in t.iter().enumerate() {
            let (a, b) = gdf.input_scaler.coeffs(gdf.schedule.logsnr(ti));
            let want = (a + b) as f32;
            assert!((noised[i * 16] - want).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn shift_lowers_logsnr() -> Result<()> {
        let device = Device::Cpu;
        let gdf = gdf();
        let mut rng = StdRng::seed_from_u64(11);
        let x0 = Tensor::randn(0f32, 1f32, (1, 1, 4, 4), &device)?;
        let plain = gdf.diffuse(&x0, None, Some(&[0.5]), 1.0, 1.0, &mut rng)?;
        let shifted = gdf.diffuse(&x0, None, Some(&[0.5]), 2.0, 1.0, &mut rng)?;
        let want = plain.logsnr[0] + 2.0 * (0.5f64).ln();
        assert!((shifted.logsnr[0] - want).abs() < 1e-9);
        Ok(())
    }
}
