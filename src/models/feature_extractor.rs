//! Frozen semantic feature extractor
//!
//! Stands in for a pretrained backbone: 32x spatial pooling followed by a
//! fixed random 1x1 projection into 16 channels. The projection weights are
//! derived from a fixed seed so every process and every restart sees the
//! same conditioning, or they can be loaded from a safetensors file.

use candle_core::{bail, DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::Path;

use super::FeatureExtractor;

const POOL_FACTOR: usize = 32;
const OUT_CHANNELS: usize = 16;
const WEIGHT_SEED: u64 = 0x5EED_FEA7;

pub struct SemanticEncoder {
    weight: Tensor,
    bias: Tensor,
}

impl SemanticEncoder {
    /// Build the projection from the fixed internal seed.
    pub fn new(device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(WEIGHT_SEED);
        let normal = Normal::new(0.0f32, 0.02).map_err(candle_core::Error::wrap)?;
        let weight: Vec<f32> =
            (0..OUT_CHANNELS * 3).map(|_| normal.sample(&mut rng)).collect();
        let weight = Tensor::from_vec(weight, (OUT_CHANNELS, 3, 1, 1), device)?;
        let bias = Tensor::zeros((1, OUT_CHANNELS, 1, 1), DType::F32, device)?;
        Ok(Self { weight, bias })
    }

    /// Load projection weights from a safetensors file, falling back to the
    /// seeded initialization when no path is given.
    pub fn load_or_init(path: Option<&Path>, device: &Device) -> Result<Self> {
        let Some(path) = path else {
            return Self::new(device);
        };
        let tensors = candle_core::safetensors::load(path, device)?;
        let weight = match tensors.get("weight") {
            Some(t) => t.to_dtype(DType::F32)?,
            None => bail!("missing tensor 'weight' in {}", path.display()),
        };
        let bias = match tensors.get("bias") {
            Some(t) => t.to_dtype(DType::F32)?.reshape((1, OUT_CHANNELS, 1, 1))?,
            None => bail!("missing tensor 'bias' in {}", path.display()),
        };
        let dims = weight.dims4()?;
        if dims != (OUT_CHANNELS, 3, 1, 1) {
            bail!(
                "semantic projection weight has shape {:?}, expected [{}, 3, 1, 1]",
                weight.dims(),
                OUT_CHANNELS
            );
        }
        Ok(Self { weight, bias })
    }

    pub fn out_channels(&self) -> usize {
        OUT_CHANNELS
    }
}

impl FeatureExtractor for SemanticEncoder {
    /// [B, 3, H, W] -> [B, 16, H/32, W/32]. H and W must be multiples of 32.
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = images.dims4()?;
        if h % POOL_FACTOR != 0 || w % POOL_FACTOR != 0 {
            bail!("image size {}x{} is not a multiple of {}", h, w, POOL_FACTOR);
        }
        let pooled = images.avg_pool2d(POOL_FACTOR)?;
        let projected = pooled.conv2d(&self.weight, 0, 1, 1, 1)?;
        projected.broadcast_add(&self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_has_pooled_shape() -> Result<()> {
        let device = Device::Cpu;
        let encoder = SemanticEncoder::new(&device)?;
        let images = Tensor::zeros((2, 3, 64, 96), DType::F32, &device)?;
        let features = encoder.encode(&images)?;
        assert_eq!(features.dims(), &[2, 16, 2, 3]);
        Ok(())
    }

    #[test]
    fn seeded_instances_agree() -> Result<()> {
        let device = Device::Cpu;
        let a = SemanticEncoder::new(&device)?;
        let b = SemanticEncoder::new(&device)?;
        let images = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &device)?;
        let fa = a.encode(&images)?.flatten_all()?.to_vec1::<f32>()?;
        let fb = b.encode(&images)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(fa, fb);
        Ok(())
    }

    #[test]
    fn rejects_unaligned_input() -> Result<()> {
        let device = Device::Cpu;
        let encoder = SemanticEncoder::new(&device)?;
        let images = Tensor::zeros((1, 3, 30, 30), DType::F32, &device)?;
        assert!(encoder.encode(&images).is_err());
        Ok(())
    }

    #[test]
    fn loads_weights_from_file() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().map_err(candle_core::Error::wrap)?;
        let path = dir.path().join("semantic.safetensors");
        let weight = Tensor::rand(-0.1f32, 0.1, (OUT_CHANNELS, 3, 1, 1), &device)?;
        let bias = Tensor::rand(-0.1f32, 0.1, (OUT_CHANNELS,), &device)?;
        candle_core::safetensors::save(
            &[("weight".to_string(), weight), ("bias".to_string(), bias)]
                .into_iter()
                .collect(),
            &path,
        )?;
        let encoder = SemanticEncoder::load_or_init(Some(&path), &device)?;
        let images = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &device)?;
        let features = encoder.encode(&images)?;
        assert_eq!(features.dims(), &[1, 16, 1, 1]);
        Ok(())
    }
}
