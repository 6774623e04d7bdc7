//! Latent cascade generator training
//!
//! The concrete run behind the trainer binary: encodes image batches into
//! latents, noises them through the diffusion framework with pyramid noise,
//! trains the generator on epsilon prediction with per-sample loss weights,
//! and periodically checkpoints and draws evaluation samples.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor, Var};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;

use crate::config::RunConfig;
use crate::context::ExecutionContext;
use crate::core::{
    AdamW, CheckpointStore, EmaTracker, ForwardOutput, GradientAccumulator, OptimizerSet, RunInfo,
    SchedulerSet, TrainRun, WarmupConstant,
};
use crate::data::{Batch, DataSource, FolderSource};
use crate::gdf::{
    AdaptiveLossWeight, Gdf, LossWeight, P2LossWeight, PyramidNoise, SamplingConfig,
};
use crate::models::{
    Conditions, Denoiser, DenoiserConfig, FeatureExtractor, HashedTextEncoder, LatentCodec,
    LatentDenoiser, PatchCodec, SemanticEncoder, TextEncoder,
};

/// Fraction of samples whose semantic conditioning is zeroed per batch, so
/// the generator also learns the unconditional distribution for guidance.
const COND_DROPOUT: f64 = 0.1;

pub struct CascadeExtras {
    pub gdf: Gdf,
    pub pyramid: PyramidNoise,
    pub sampling: SamplingConfig,
    rng: StdRng,
    /// Full-resolution, undropped conditions from the most recent batch,
    /// reused as the conditioning for evaluation sampling.
    eval_cond: Option<Conditions>,
}

pub struct CascadeModels {
    pub generator: LatentDenoiser,
    pub generator_ema: Option<LatentDenoiser>,
    pub codec: PatchCodec,
    pub semantic: SemanticEncoder,
    pub text: HashedTextEncoder,
    vars: HashMap<String, Var>,
    ema_vars: Option<HashMap<String, Var>>,
}

pub struct CascadeRun {
    config: RunConfig,
    ctx: ExecutionContext,
    info: RunInfo,
    store: CheckpointStore,
    acc: GradientAccumulator,
    ema: Option<EmaTracker>,
}

impl CascadeRun {
    pub fn new(config: RunConfig, ctx: ExecutionContext) -> Result<Self> {
        let store = CheckpointStore::new(&config.checkpoint_path, &config.experiment_id)?;
        let mut info = store.load_info()?.unwrap_or_default();
        if info.total_steps > 0 {
            info!("Resuming '{}' from update {}", config.experiment_id, info.total_steps);
        }
        // The activation step is pinned in the run info on first start so a
        // later config edit cannot shift it mid-run.
        if config.ema_start_iters.is_some() && info.ema_active_from.is_none() {
            info.ema_active_from = config.ema_start_iters;
        }
        let ema = match config.ema_start_iters {
            Some(start) => Some(EmaTracker::new(
                config.ema_beta,
                info.ema_active_from.unwrap_or(start),
            )),
            None => None,
        };
        Ok(Self { config, ctx, info, store, acc: GradientAccumulator::new(), ema })
    }

    /// Random per-batch downscale of the feature-extractor input: a factor
    /// in [0.5, 1) snapped to a multiple of 32.
    fn semantic_input_size(&self, rng: &mut StdRng) -> usize {
        let factor = rng.gen_range(0.5..1.0);
        let snapped = ((self.config.image_size as f64 * factor) / 32.0).round() as usize * 32;
        snapped.clamp(32, self.config.image_size)
    }

    fn load_external_weights(&self, path: &Path, vars: &HashMap<String, Var>) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &self.ctx.device)
            .with_context(|| format!("Failed to read generator weights from {}", path.display()))?;
        for (name, var) in vars {
            let Some(tensor) = tensors.get(name) else {
                bail!("generator weights at {} are missing tensor '{}'", path.display(), name);
            };
            var.set(tensor)
                .with_context(|| format!("generator tensor '{}' does not fit", name))?;
        }
        info!("Initialized generator from {}", path.display());
        Ok(())
    }
}

impl TrainRun for CascadeRun {
    type Extras = CascadeExtras;
    type Models = CascadeModels;

    fn config(&self) -> &RunConfig {
        &self.config
    }

    fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    fn info(&self) -> &RunInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut RunInfo {
        &mut self.info
    }

    fn setup_extras_pre(&mut self) -> Result<CascadeExtras> {
        let loss_weight = if self.config.adaptive_loss_weight {
            let mut adaptive = AdaptiveLossWeight::default();
            if let Some(snapshot) = &self.info.adaptive_loss {
                adaptive.restore(snapshot).context("Stored adaptive-loss state is invalid")?;
                info!("Restored adaptive loss buckets from checkpoint");
            }
            LossWeight::Adaptive(adaptive)
        } else {
            LossWeight::P2(P2LossWeight::default())
        };
        let sampling = SamplingConfig {
            timesteps: self.config.sample_steps,
            cfg: self.config.cfg_scale,
            shift: self.config.shift,
            ..Default::default()
        };
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(self.ctx.rank as u64)),
            None => StdRng::from_entropy(),
        };
        Ok(CascadeExtras {
            gdf: Gdf::new(loss_weight),
            pyramid: PyramidNoise::default(),
            sampling,
            rng,
            eval_cond: None,
        })
    }

    fn setup_models(&mut self, _extras: &CascadeExtras) -> Result<CascadeModels> {
        let device = self.ctx.device.clone();
        let denoiser_config = DenoiserConfig::for_version(self.config.model_version);
        info!(
            "Building {:?} generator ({} channels, depth {})",
            self.config.model_version, denoiser_config.channels, denoiser_config.depth
        );

        let generator = LatentDenoiser::new(denoiser_config, &device)?;
        let vars = generator.named_vars();
        let restored = self.store.load_into("generator", &vars, &device)?;
        if restored {
            info!("Restored generator weights from checkpoint");
        } else if let Some(path) = self.config.generator_checkpoint_path.clone() {
            self.load_external_weights(&path, &vars)?;
        }

        let (generator_ema, ema_vars) = match &self.ema {
            Some(tracker) => {
                let shadow = LatentDenoiser::new(denoiser_config, &device)?;
                let shadow_vars = shadow.named_vars();
                if self.store.load_into("generator_ema", &shadow_vars, &device)? {
                    info!("Restored EMA shadow weights from checkpoint");
                } else {
                    tracker.initialize(&vars, &shadow_vars)?;
                }
                (Some(shadow), Some(shadow_vars))
            }
            None => (None, None),
        };

        let semantic = SemanticEncoder::load_or_init(
            self.config.semantic_encoder_checkpoint_path.as_deref(),
            &device,
        )?;
        let text = HashedTextEncoder::new(&device)?;
        let codec = PatchCodec::default();
        if codec.latent_channels() != denoiser_config.latent_channels {
            bail!(
                "codec produces {} latent channels but the generator expects {}",
                codec.latent_channels(),
                denoiser_config.latent_channels
            );
        }

        Ok(CascadeModels { generator, generator_ema, codec, semantic, text, vars, ema_vars })
    }

    fn setup_optimizers(&mut self, _models: &CascadeModels) -> Result<OptimizerSet> {
        let mut optimizer = AdamW::new(self.config.lr);
        if let Some(state) = self.store.load_tensors("generator_optim", &self.ctx.device)? {
            optimizer.load_state_tensors(state)?;
            info!("Restored optimizer state from checkpoint");
        }
        optimizer.set_step(self.info.total_steps);
        let mut set = OptimizerSet::new();
        set.insert("generator", optimizer);
        Ok(set)
    }

    fn setup_schedulers(&mut self, _optimizers: &OptimizerSet) -> Result<SchedulerSet> {
        let mut set = SchedulerSet::new();
        set.insert(
            "generator",
            Box::new(WarmupConstant::new(self.config.lr, self.config.warmup_updates)),
        );
        Ok(set)
    }

    fn setup_data(&mut self, _extras: &CascadeExtras) -> Result<Box<dyn DataSource>> {
        let seed = self.config.seed.unwrap_or(0).wrapping_add(self.ctx.rank as u64);
        let source = FolderSource::new(
            &self.config.dataset_path,
            self.config.image_size,
            self.config.batch_size,
            &self.ctx.device,
            seed,
        )?;
        Ok(Box::new(source))
    }

    fn forward_pass(
        &mut self,
        batch: &Batch,
        extras: &mut CascadeExtras,
        models: &CascadeModels,
    ) -> Result<ForwardOutput> {
        let images = &batch.images;
        let (bsz, _c, _h, _w) = images.dims4()?;

        // Conditioning: features from a randomly downscaled view, with a
        // per-sample dropout mask over the semantic map.
        let size = self.semantic_input_size(&mut extras.rng);
        let view = if size == self.config.image_size {
            images.clone()
        } else {
            images.upsample_nearest2d(size, size)?
        };
        let mut semantic = models.semantic.encode(&view)?;
        let keep: Vec<f32> = (0..bsz)
            .map(|_| if extras.rng.gen::<f64>() < COND_DROPOUT { 0.0 } else { 1.0 })
            .collect();
        let keep = Tensor::from_vec(keep, (bsz, 1, 1, 1), images.device())?;
        semantic = semantic.broadcast_mul(&keep)?;
        let text = models.text.encode(&batch.captions)?;

        // Evaluation sampling reuses the latest batch's full-resolution,
        // undropped conditions.
        extras.eval_cond = Some(Conditions {
            semantic: models.semantic.encode(images)?,
            text: text.clone(),
        });
        let cond = Conditions { semantic, text };

        let latents = models.codec.encode(images)?;
        let epsilon = extras.pyramid.apply(&latents.randn_like(0.0, 1.0)?)?;
        let sample = extras.gdf.diffuse(
            &latents,
            Some(&epsilon),
            None,
            self.config.shift,
            self.config.loss_shift,
            &mut extras.rng,
        )?;

        let pred = models.generator.forward(&sample.noised, &sample.noise_cond, &cond)?;
        let per_sample = (pred - &sample.target)?.sqr()?.flatten_from(1)?.mean(1)?;
        let loss_t = (&per_sample * &sample.loss_weight)?.mean_all()?;
        let loss = loss_t.to_scalar::<f32>()? as f64;
        if !loss.is_finite() {
            bail!("loss is not finite ({}) at update {}", loss, self.info.total_steps);
        }

        let observed: Vec<f64> =
            per_sample.to_vec1::<f32>()?.into_iter().map(|v| v as f64).collect();
        extras.gdf.loss_weight.update_buckets(&sample.logsnr, &observed);

        let loss_adjusted = (loss_t / self.config.grad_accum_steps as f64)?;
        Ok(ForwardOutput { loss, loss_adjusted })
    }

    fn backward_pass(
        &mut self,
        update: bool,
        output: ForwardOutput,
        models: &CascadeModels,
        optimizers: &mut OptimizerSet,
        schedulers: &SchedulerSet,
    ) -> Result<Option<f64>> {
        let grads = output.loss_adjusted.backward()?;
        self.acc.accumulate_from(&models.vars, &grads)?;
        if !update {
            // Accumulation micro-step: keep gradients local, defer the
            // collective sync to the final micro-step of the window.
            return Ok(None);
        }

        if self.ctx.is_distributed() {
            self.ctx.collective.all_reduce_mean(self.acc.grads_mut())?;
        }
        let norm = self.acc.clip_global_norm(self.config.grad_clip)?;

        for (name, optimizer) in optimizers.iter_mut() {
            let lr = schedulers
                .get(name)
                .map(|s| s.lr_at(self.info.total_steps))
                .unwrap_or(self.config.lr);
            optimizer.set_lr(lr);
            optimizer.step();
            for (param_name, var) in &models.vars {
                if let Some(grad) = self.acc.get(param_name) {
                    optimizer.update(param_name, var, grad)?;
                }
            }
        }
        self.acc.clear();
        self.info.total_steps += 1;

        if let (Some(tracker), Some(ema_vars)) = (&self.ema, &models.ema_vars) {
            tracker.update(&models.vars, ema_vars, self.info.total_steps)?;
        }
        Ok(Some(norm))
    }

    fn checkpoint(
        &mut self,
        extras: &CascadeExtras,
        models: &CascadeModels,
        optimizers: &OptimizerSet,
    ) -> Result<()> {
        if let Some(snapshot) = extras.gdf.loss_weight.snapshot() {
            self.info.adaptive_loss = Some(snapshot);
        }
        // Saves are collective when sharded: every replica must arrive
        // before and leave after the snapshot, or restarts see a torn state.
        if self.ctx.is_distributed() {
            self.ctx.collective.barrier()?;
        }
        if self.ctx.is_main() {
            self.store.save_tensors("generator", &models.generator.weights())?;
            if let Some(ema) = &models.generator_ema {
                self.store.save_tensors("generator_ema", &ema.weights())?;
            }
            if let Some(optimizer) = optimizers.get("generator") {
                self.store.save_tensors("generator_optim", &optimizer.state_tensors())?;
            }
            self.store.save_info(&self.info)?;
        }
        if self.ctx.is_distributed() {
            self.ctx.collective.barrier()?;
        }
        Ok(())
    }

    fn sample_eval(&mut self, extras: &mut CascadeExtras, models: &CascadeModels) -> Result<()> {
        if self.ctx.is_distributed() {
            self.ctx.collective.barrier()?;
        }
        if self.ctx.is_main() {
            if let Some(cond) = &extras.eval_cond {
                let bsz = cond.semantic.dims4()?.0;
                let latent_size = self.config.image_size / models.codec.factor();
                let shape = (bsz, models.codec.latent_channels(), latent_size, latent_size);
                let uncond = Conditions {
                    semantic: cond.semantic.zeros_like()?,
                    text: cond.text.zeros_like()?,
                };
                let model: &dyn Denoiser = match (&self.ema, &models.generator_ema) {
                    (Some(tracker), Some(shadow)) if tracker.is_active(self.info.total_steps) => {
                        shadow
                    }
                    _ => &models.generator,
                };
                let latents =
                    extras.gdf.sample(model, cond, Some(&uncond), shape, &extras.sampling)?;
                let images = models.codec.decode(&latents)?;

                let dir = self.config.output_path.join("samples");
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create sample dir: {}", dir.display()))?;
                let path = dir.join(format!("update_{:07}.png", self.info.total_steps));
                save_image_row(&images, &path)?;
                info!("Wrote {} evaluation samples to {}", bsz, path.display());
            }
        }
        if self.ctx.is_distributed() {
            self.ctx.collective.barrier()?;
        }
        Ok(())
    }
}

/// Write a [B, 3, H, W] batch in [0, 1] as one horizontal PNG strip.
fn save_image_row(images: &Tensor, path: &Path) -> Result<()> {
    let (bsz, channels, height, width) = images.dims4()?;
    if channels != 3 {
        bail!("expected 3 image channels, got {}", channels);
    }
    let mut columns = Vec::with_capacity(bsz);
    for i in 0..bsz {
        columns.push(images.get(i)?);
    }
    let row = Tensor::cat(&columns, 2)?;
    let row = (row.clamp(0f32, 1f32)? * 255.0)?.to_dtype(DType::U8)?;
    let data = row.permute((1, 2, 0))?.contiguous()?.flatten_all()?.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(
        (bsz * width) as u32,
        height as u32,
        data,
    )
    .context("Failed to assemble image buffer")?;
    buffer
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
