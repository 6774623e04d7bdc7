//! Keyed checkpoint store
//!
//! One safetensors file per logical key under `{checkpoint_path}/{experiment_id}/`,
//! plus an `info.json` document for the mutable run state. An absent key is
//! not an error: it means "initialize fresh". A present but malformed or
//! incomplete file is fatal, with the offending key in the error.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use log::info;
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::info::RunInfo;

pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(checkpoint_path: &Path, experiment_id: &str) -> Result<Self> {
        let root = checkpoint_path.join(experiment_id);
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create checkpoint dir: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tensor_file(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.safetensors", key))
    }

    fn info_file(&self) -> PathBuf {
        self.root.join("info.json")
    }

    /// Write one named-tensor bundle. Tensors are stored as F32.
    pub fn save_tensors(&self, key: &str, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let mut flat: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            let cpu = tensor
                .to_dtype(DType::F32)
                .and_then(|t| t.to_device(&Device::Cpu))
                .with_context(|| format!("checkpoint '{}': tensor '{}' not readable", key, name))?;
            let data = cpu
                .flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .with_context(|| format!("checkpoint '{}': tensor '{}' not readable", key, name))?;
            flat.push((name.clone(), tensor.dims().to_vec(), data));
        }
        let mut views = Vec::with_capacity(flat.len());
        for (name, dims, data) in &flat {
            let view = TensorView::new(Dtype::F32, dims.clone(), bytemuck::cast_slice(data))
                .with_context(|| format!("checkpoint '{}': tensor '{}' not serializable", key, name))?;
            views.push((name.as_str(), view));
        }
        let bytes = safetensors::serialize(views, &None)
            .with_context(|| format!("Failed to serialize checkpoint '{}'", key))?;
        let path = self.tensor_file(key);
        fs::write(&path, bytes)
            .with_context(|| format!("Failed to write checkpoint '{}' to {}", key, path.display()))?;
        info!("Saved checkpoint '{}' ({} tensors)", key, flat.len());
        Ok(())
    }

    /// Read a bundle back, or `None` when the key has never been saved.
    pub fn load_tensors(&self, key: &str, device: &Device) -> Result<Option<HashMap<String, Tensor>>> {
        let path = self.tensor_file(key);
        if !path.exists() {
            return Ok(None);
        }
        let tensors = candle_core::safetensors::load(&path, device)
            .with_context(|| format!("Failed to read checkpoint '{}' from {}", key, path.display()))?;
        Ok(Some(tensors))
    }

    /// Strict restore into existing variables. Every var must be present in
    /// the stored bundle with a matching shape. Returns false when the key
    /// is absent (fresh initialization).
    pub fn load_into(&self, key: &str, vars: &HashMap<String, Var>, device: &Device) -> Result<bool> {
        let Some(loaded) = self.load_tensors(key, device)? else {
            return Ok(false);
        };
        for (name, var) in vars {
            let Some(tensor) = loaded.get(name) else {
                bail!("checkpoint '{}' is missing tensor '{}'", key, name);
            };
            var.set(tensor)
                .with_context(|| format!("checkpoint '{}': tensor '{}' does not fit", key, name))?;
        }
        Ok(true)
    }

    pub fn save_info(&self, info: &RunInfo) -> Result<()> {
        let json = serde_json::to_string_pretty(info).context("Failed to serialize run info")?;
        let path = self.info_file();
        fs::write(&path, json)
            .with_context(|| format!("Failed to write run info to {}", path.display()))?;
        Ok(())
    }

    pub fn load_info(&self) -> Result<Option<RunInfo>> {
        let path = self.info_file();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run info from {}", path.display()))?;
        let info = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse run info at {}", path.display()))?;
        Ok(Some(info))
    }
}
