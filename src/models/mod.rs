//! Model collaborators
//!
//! The training core only ever sees these traits. The concrete types here
//! are small reference networks: enough capacity for the binary to run
//! end-to-end and for tests to exercise real gradients, and swappable for
//! production architectures without touching the driver.

pub mod codec;
pub mod denoiser;
pub mod feature_extractor;
pub mod text_encoder;

pub use codec::PatchCodec;
pub use denoiser::{DenoiserConfig, LatentDenoiser};
pub use feature_extractor::SemanticEncoder;
pub use text_encoder::HashedTextEncoder;

use candle_core::{Result, Tensor};

/// Conditioning bundle fed to the denoiser for one batch.
pub struct Conditions {
    /// Semantic feature map, shape [B, 16, H/32, W/32].
    pub semantic: Tensor,
    /// Pooled text embedding, shape [B, 768].
    pub text: Tensor,
}

/// The trainable generator seen by the diffusion loop and the sampler.
pub trait Denoiser {
    fn forward(&self, noised: &Tensor, noise_cond: &Tensor, cond: &Conditions) -> Result<Tensor>;
}

/// Pixel <-> latent codec. Internals are unspecified; the core only relies
/// on decode(encode(x)) having the image shape back.
pub trait LatentCodec {
    fn encode(&self, images: &Tensor) -> Result<Tensor>;
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

/// Frozen image feature extractor producing the semantic conditioning map.
pub trait FeatureExtractor {
    fn encode(&self, images: &Tensor) -> Result<Tensor>;
}

/// Frozen text encoder producing pooled caption embeddings.
pub trait TextEncoder {
    fn encode(&self, captions: &[String]) -> Result<Tensor>;
}
