//! Run configuration
//!
//! Configs are loaded in two phases: a raw serde struct where every field is
//! optional, then a validating builder that either produces an immutable
//! [`RunConfig`] or reports every missing required field in one error.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("unknown model_version '{0}' (expected 'base' or 'large')")]
    UnknownModelVersion(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Generator backbone size selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersion {
    Base,
    Large,
}

/// Raw YAML document, prior to validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRunConfig {
    pub experiment_id: Option<String>,
    pub checkpoint_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub dataset_path: Option<PathBuf>,
    pub model_version: Option<String>,
    pub lr: Option<f64>,
    pub warmup_updates: Option<usize>,
    pub updates: Option<u64>,
    pub batch_size: Option<usize>,
    pub image_size: Option<usize>,
    pub grad_accum_steps: Option<usize>,
    pub grad_clip: Option<f64>,
    pub shift: Option<f64>,
    pub loss_shift: Option<f64>,
    pub adaptive_loss_weight: Option<bool>,
    pub ema_start_iters: Option<u64>,
    pub ema_beta: Option<f64>,
    pub save_every: Option<u64>,
    pub sample_every: Option<u64>,
    pub sample_steps: Option<usize>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<u64>,
    pub generator_checkpoint_path: Option<PathBuf>,
    pub semantic_encoder_checkpoint_path: Option<PathBuf>,
}

/// Validated, immutable run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub experiment_id: String,
    pub checkpoint_path: PathBuf,
    pub output_path: PathBuf,
    pub dataset_path: PathBuf,
    pub model_version: ModelVersion,
    pub lr: f64,
    pub warmup_updates: usize,
    pub updates: u64,
    pub batch_size: usize,
    pub image_size: usize,
    pub grad_accum_steps: usize,
    pub grad_clip: f64,
    pub shift: f64,
    pub loss_shift: f64,
    pub adaptive_loss_weight: bool,
    pub ema_start_iters: Option<u64>,
    pub ema_beta: f64,
    pub save_every: u64,
    pub sample_every: u64,
    pub sample_steps: usize,
    pub cfg_scale: f64,
    pub seed: Option<u64>,
    pub generator_checkpoint_path: Option<PathBuf>,
    pub semantic_encoder_checkpoint_path: Option<PathBuf>,
}

impl RawRunConfig {
    pub fn validate(self) -> Result<RunConfig, ConfigError> {
        let mut missing = Vec::new();
        if self.experiment_id.is_none() {
            missing.push("experiment_id");
        }
        if self.checkpoint_path.is_none() {
            missing.push("checkpoint_path");
        }
        if self.dataset_path.is_none() {
            missing.push("dataset_path");
        }
        if self.model_version.is_none() {
            missing.push("model_version");
        }
        if self.lr.is_none() {
            missing.push("lr");
        }
        if self.warmup_updates.is_none() {
            missing.push("warmup_updates");
        }
        if self.updates.is_none() {
            missing.push("updates");
        }
        if self.batch_size.is_none() {
            missing.push("batch_size");
        }
        if self.image_size.is_none() {
            missing.push("image_size");
        }
        if self.shift.is_none() {
            missing.push("shift");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingFields(missing));
        }

        let model_version = match self.model_version.as_deref() {
            Some("base") => ModelVersion::Base,
            Some("large") => ModelVersion::Large,
            Some(other) => return Err(ConfigError::UnknownModelVersion(other.to_string())),
            None => unreachable!("checked above"),
        };

        let experiment_id = self.experiment_id.unwrap_or_default();
        let checkpoint_path = self.checkpoint_path.unwrap_or_default();
        let image_size = self.image_size.unwrap_or_default();
        if image_size == 0 || image_size % 32 != 0 {
            return Err(ConfigError::InvalidField {
                field: "image_size",
                reason: format!("{} is not a positive multiple of 32", image_size),
            });
        }
        let batch_size = self.batch_size.unwrap_or_default();
        if batch_size == 0 {
            return Err(ConfigError::InvalidField {
                field: "batch_size",
                reason: "must be at least 1".into(),
            });
        }
        let grad_accum_steps = self.grad_accum_steps.unwrap_or(1);
        if grad_accum_steps == 0 {
            return Err(ConfigError::InvalidField {
                field: "grad_accum_steps",
                reason: "must be at least 1".into(),
            });
        }
        let lr = self.lr.unwrap_or_default();
        if lr <= 0.0 {
            return Err(ConfigError::InvalidField {
                field: "lr",
                reason: format!("{} is not positive", lr),
            });
        }

        let output_path = self
            .output_path
            .unwrap_or_else(|| PathBuf::from("output").join(&experiment_id));
        let save_every = self.save_every.unwrap_or(500);

        Ok(RunConfig {
            output_path,
            dataset_path: self.dataset_path.unwrap_or_default(),
            model_version,
            lr,
            warmup_updates: self.warmup_updates.unwrap_or_default(),
            updates: self.updates.unwrap_or_default(),
            batch_size,
            image_size,
            grad_accum_steps,
            grad_clip: self.grad_clip.unwrap_or(1.0),
            shift: self.shift.unwrap_or(1.0),
            loss_shift: self.loss_shift.unwrap_or(1.0),
            adaptive_loss_weight: self.adaptive_loss_weight.unwrap_or(false),
            ema_start_iters: self.ema_start_iters,
            ema_beta: self.ema_beta.unwrap_or(0.9999),
            save_every,
            sample_every: self.sample_every.unwrap_or(save_every),
            sample_steps: self.sample_steps.unwrap_or(10),
            cfg_scale: self.cfg_scale.unwrap_or(1.5),
            seed: self.seed,
            generator_checkpoint_path: self.generator_checkpoint_path,
            semantic_encoder_checkpoint_path: self.semantic_encoder_checkpoint_path,
            experiment_id,
            checkpoint_path,
        })
    }
}

/// Read and parse a YAML config file. Validation is a separate step so
/// callers can report parse and semantic errors distinctly.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RawRunConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let raw: RawRunConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(raw)
}
