//! Patch-based pixel/latent codec
//!
//! A weightless stand-in for a learned autoencoder: space-to-depth with a
//! fixed factor plus a [-1, 1] value mapping. Exactly invertible, which
//! makes it convenient for end-to-end tests.

use candle_core::{Result, Tensor};

use super::LatentCodec;

#[derive(Debug, Clone)]
pub struct PatchCodec {
    factor: usize,
}

impl Default for PatchCodec {
    fn default() -> Self {
        Self { factor: 2 }
    }
}

impl PatchCodec {
    pub fn new(factor: usize) -> Self {
        Self { factor }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Latent channel count for an RGB input.
    pub fn latent_channels(&self) -> usize {
        3 * self.factor * self.factor
    }
}

impl LatentCodec for PatchCodec {
    /// [B, C, H, W] in [0, 1] -> [B, C*f*f, H/f, W/f] in [-1, 1].
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let f = self.factor;
        let (b, c, h, w) = images.dims4()?;
        let x = images.affine(2.0, -1.0)?;
        let x = x.reshape((b, c, h / f, f, w / f, f))?;
        let x = x.permute((0, 1, 3, 5, 2, 4))?.contiguous()?;
        x.reshape((b, c * f * f, h / f, w / f))
    }

    /// Inverse of [`Self::encode`], clamped back into [0, 1].
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let f = self.factor;
        let (b, cf, h, w) = latents.dims4()?;
        let c = cf / (f * f);
        let x = latents.reshape((b, c, f, f, h, w))?;
        let x = x.permute((0, 1, 4, 2, 5, 3))?.contiguous()?;
        let x = x.reshape((b, c, h * f, w * f))?;
        x.affine(0.5, 0.5)?.clamp(0.0, 1.0)
    }
}
