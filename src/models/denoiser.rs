//! Reference latent denoiser
//!
//! A compact residual conv net over latent patches: timestep embedding plus
//! a text projection modulate each block, semantic features are upsampled
//! and concatenated at the input. Two sizes are exposed through the config
//! selector.

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{
    conv2d, group_norm, linear, Conv2d, Conv2dConfig, GroupNorm, Linear, Module, VarBuilder, VarMap,
};
use std::collections::HashMap;

use super::{Conditions, Denoiser};
use crate::config::ModelVersion;

pub const LATENT_CHANNELS: usize = 12;
pub const SEMANTIC_CHANNELS: usize = 16;
pub const TEXT_DIM: usize = 768;

#[derive(Debug, Clone, Copy)]
pub struct DenoiserConfig {
    pub channels: usize,
    pub depth: usize,
    pub latent_channels: usize,
    pub semantic_channels: usize,
    pub text_dim: usize,
}

impl DenoiserConfig {
    pub fn base() -> Self {
        Self {
            channels: 64,
            depth: 4,
            latent_channels: LATENT_CHANNELS,
            semantic_channels: SEMANTIC_CHANNELS,
            text_dim: TEXT_DIM,
        }
    }

    pub fn large() -> Self {
        Self { channels: 128, depth: 8, ..Self::base() }
    }

    pub fn for_version(version: ModelVersion) -> Self {
        match version {
            ModelVersion::Base => Self::base(),
            ModelVersion::Large => Self::large(),
        }
    }
}

struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    emb_proj: Linear,
    norm2: GroupNorm,
    conv2: Conv2d,
}

impl ResBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig { padding: 1, ..Default::default() };
        Ok(Self {
            norm1: group_norm(8, channels, 1e-5, vb.pp("norm1"))?,
            conv1: conv2d(channels, channels, 3, conv_cfg, vb.pp("conv1"))?,
            emb_proj: linear(channels, channels, vb.pp("emb_proj"))?,
            norm2: group_norm(8, channels, 1e-5, vb.pp("norm2"))?,
            conv2: conv2d(channels, channels, 3, conv_cfg, vb.pp("conv2"))?,
        })
    }

    fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let mut h = self.conv1.forward(&self.norm1.forward(x)?.silu()?)?;
        let emb = self.emb_proj.forward(&emb.silu()?)?;
        let emb = emb.unsqueeze(2)?.unsqueeze(3)?;
        h = h.broadcast_add(&emb)?;
        h = self.conv2.forward(&self.norm2.forward(&h)?.silu()?)?;
        x + h
    }
}

pub struct LatentDenoiser {
    config: DenoiserConfig,
    varmap: VarMap,
    t_linear1: Linear,
    t_linear2: Linear,
    text_proj: Linear,
    conv_in: Conv2d,
    blocks: Vec<ResBlock>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl LatentDenoiser {
    pub fn new(config: DenoiserConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let c = config.channels;
        let conv_cfg = Conv2dConfig { padding: 1, ..Default::default() };

        let t_linear1 = linear(c, c, vb.pp("time_embed.0"))?;
        let t_linear2 = linear(c, c, vb.pp("time_embed.2"))?;
        let text_proj = linear(config.text_dim, c, vb.pp("text_proj"))?;
        let conv_in = conv2d(
            config.latent_channels + config.semantic_channels,
            c,
            3,
            conv_cfg,
            vb.pp("conv_in"),
        )?;
        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(ResBlock::new(c, vb.pp(format!("blocks.{}", i)))?);
        }
        let norm_out = group_norm(8, c, 1e-5, vb.pp("norm_out"))?;
        let conv_out = conv2d(c, config.latent_channels, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            config,
            varmap,
            t_linear1,
            t_linear2,
            text_proj,
            conv_in,
            blocks,
            norm_out,
            conv_out,
        })
    }

    pub fn config(&self) -> &DenoiserConfig {
        &self.config
    }

    /// Trainable parameters by name, as registered in the var map.
    pub fn named_vars(&self) -> HashMap<String, Var> {
        self.varmap.data().lock().unwrap().clone()
    }

    /// Weight tensors by name, for checkpoint saving.
    pub fn weights(&self) -> HashMap<String, Tensor> {
        self.varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    }

    /// Sinusoidal embedding of the noise conditioning value, scaled by 1000
    /// to spread the [0, 1] range over the frequency bands.
    fn timestep_embedding(&self, noise_cond: &Tensor) -> Result<Tensor> {
        let dim = self.config.channels;
        let half = dim / 2;
        let device = noise_cond.device();
        let t = (noise_cond.to_dtype(DType::F32)? * 1000.0)?;
        let freqs: Vec<f32> = (0..half)
            .map(|i| (-(i as f64) * (10000f64).ln() / (half as f64 - 1.0)).exp() as f32)
            .collect();
        let freqs = Tensor::from_vec(freqs, (1, half), device)?;
        let args = t.unsqueeze(1)?.broadcast_mul(&freqs)?;
        Tensor::cat(&[args.sin()?, args.cos()?], 1)
    }
}

impl Denoiser for LatentDenoiser {
    fn forward(&self, noised: &Tensor, noise_cond: &Tensor, cond: &Conditions) -> Result<Tensor> {
        let (_b, _c, h, w) = noised.dims4()?;

        let t_emb = self.timestep_embedding(noise_cond)?;
        let t_emb = self.t_linear2.forward(&self.t_linear1.forward(&t_emb)?.silu()?)?;
        let emb = (t_emb + self.text_proj.forward(&cond.text)?)?;

        let semantic = cond.semantic.upsample_nearest2d(h, w)?;
        let mut x = self.conv_in.forward(&Tensor::cat(&[noised, &semantic], 1)?)?;
        for block in &self.blocks {
            x = block.forward(&x, &emb)?;
        }
        self.conv_out.forward(&self.norm_out.forward(&x)?.silu()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(bsz: usize, hs: usize, ws: usize, device: &Device) -> Result<Conditions> {
        Ok(Conditions {
            semantic: Tensor::randn(0f32, 1f32, (bsz, SEMANTIC_CHANNELS, hs, ws), device)?,
            text: Tensor::randn(0f32, 1f32, (bsz, TEXT_DIM), device)?,
        })
    }

    #[test]
    fn forward_preserves_latent_shape() -> Result<()> {
        let device = Device::Cpu;
        let _ = device.set_seed(42);
        let model = LatentDenoiser::new(DenoiserConfig::base(), &device)?;
        let noised = Tensor::randn(0f32, 1f32, (2, LATENT_CHANNELS, 16, 16), &device)?;
        let noise_cond = Tensor::from_vec(vec![0.3f32, 0.8], (2,), &device)?;
        let cond = conditions(2, 1, 1, &device)?;
        let out = model.forward(&noised, &noise_cond, &cond)?;
        assert_eq!(out.dims(), noised.dims());
        for v in out.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.is_finite());
        }
        Ok(())
    }

    #[test]
    fn variants_differ_in_size() -> Result<()> {
        let device = Device::Cpu;
        let base = LatentDenoiser::new(DenoiserConfig::base(), &device)?;
        let large = LatentDenoiser::new(DenoiserConfig::large(), &device)?;
        let count = |m: &LatentDenoiser| {
            m.named_vars().values().map(|v| v.as_tensor().elem_count()).sum::<usize>()
        };
        assert!(count(&large) > 2 * count(&base));
        Ok(())
    }

    #[test]
    fn parameters_receive_gradients() -> Result<()> {
        let device = Device::Cpu;
        let _ = device.set_seed(7);
        let model = LatentDenoiser::new(DenoiserConfig::base(), &device)?;
        let noised = Tensor::randn(0f32, 1f32, (1, LATENT_CHANNELS, 8, 8), &device)?;
        let noise_cond = Tensor::from_vec(vec![0.5f32], (1,), &device)?;
        let cond = conditions(1, 1, 1, &device)?;
        let out = model.forward(&noised, &noise_cond, &cond)?;
        let loss = out.sqr()?.mean_all()?;
        let grads = loss.backward()?;
        let vars = model.named_vars();
        let conv_in = &vars["conv_in.weight"];
        assert!(grads.get(conv_in.as_tensor()).is_some(), "conv_in should get a gradient");
        Ok(())
    }
}
