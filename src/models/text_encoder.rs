//! Frozen caption encoder
//!
//! A hashed bag-of-words embedding: tokens hash into a fixed random table
//! and their rows are mean-pooled into one 768-dim vector per caption. The
//! table comes from a fixed seed, so all replicas produce identical
//! embeddings. An empty caption maps to the zero vector, which doubles as
//! the unconditional embedding for classifier-free guidance.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::TextEncoder;

const VOCAB_SIZE: usize = 2048;
const EMBED_DIM: usize = 768;
const TABLE_SEED: u64 = 0x5EED_7E87;

pub struct HashedTextEncoder {
    table: Vec<f32>,
    device: Device,
}

impl HashedTextEncoder {
    pub fn new(device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(TABLE_SEED);
        let normal = Normal::new(0.0f32, 1.0).map_err(candle_core::Error::wrap)?;
        let table: Vec<f32> =
            (0..VOCAB_SIZE * EMBED_DIM).map(|_| normal.sample(&mut rng)).collect();
        Ok(Self { table, device: device.clone() })
    }

    pub fn embed_dim(&self) -> usize {
        EMBED_DIM
    }

    fn token_row(&self, token: &str) -> &[f32] {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let index = (hasher.finish() as usize) % VOCAB_SIZE;
        &self.table[index * EMBED_DIM..(index + 1) * EMBED_DIM]
    }

    fn embed_caption(&self, caption: &str) -> Vec<f32> {
        let mut pooled = vec![0.0f32; EMBED_DIM];
        let mut count = 0usize;
        for token in caption.split_whitespace() {
            let token = token.to_lowercase();
            let row = self.token_row(&token);
            for (p, r) in pooled.iter_mut().zip(row) {
                *p += r;
            }
            count += 1;
        }
        if count > 1 {
            let inv = 1.0 / count as f32;
            for p in pooled.iter_mut() {
                *p *= inv;
            }
        }
        pooled
    }
}

impl TextEncoder for HashedTextEncoder {
    /// One pooled embedding per caption, shape [B, 768].
    fn encode(&self, captions: &[String]) -> Result<Tensor> {
        let mut data = Vec::with_capacity(captions.len() * EMBED_DIM);
        for caption in captions {
            data.extend_from_slice(&self.embed_caption(caption));
        }
        Tensor::from_vec(data, (captions.len(), EMBED_DIM), &self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_shape_matches_batch() -> Result<()> {
        let encoder = HashedTextEncoder::new(&Device::Cpu)?;
        let captions =
            vec!["a red house".to_string(), "blue sky over water".to_string()];
        let embeddings = encoder.encode(&captions)?;
        assert_eq!(embeddings.dims(), &[2, 768]);
        Ok(())
    }

    #[test]
    fn empty_caption_is_zero() -> Result<()> {
        let encoder = HashedTextEncoder::new(&Device::Cpu)?;
        let embeddings = encoder.encode(&[String::new()])?;
        for v in embeddings.flatten_all()?.to_vec1::<f32>()? {
            assert_eq!(v, 0.0);
        }
        Ok(())
    }

    #[test]
    fn instances_agree_and_casing_is_ignored() -> Result<()> {
        let a = HashedTextEncoder::new(&Device::Cpu)?;
        let b = HashedTextEncoder::new(&Device::Cpu)?;
        let ea = a.encode(&["A Cat".to_string()])?.to_vec2::<f32>()?;
        let eb = b.encode(&["a cat".to_string()])?.to_vec2::<f32>()?;
        assert_eq!(ea, eb);
        Ok(())
    }

    #[test]
    fn pooling_is_order_invariant() -> Result<()> {
        let encoder = HashedTextEncoder::new(&Device::Cpu)?;
        let ea = encoder.encode(&["dog park bench".to_string()])?.to_vec2::<f32>()?;
        let eb = encoder.encode(&["bench dog park".to_string()])?.to_vec2::<f32>()?;
        for (x, y) in ea[0].iter().zip(&eb[0]) {
            assert!((x - y).abs() < 1e-6);
        }
        Ok(())
    }
}
