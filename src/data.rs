//! Image-folder batch source
//!
//! A background worker decodes and batches images ahead of the training
//! loop, handing batches over a bounded channel. The source cycles the
//! file list forever, reshuffling each epoch, so it never exhausts.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use log::warn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

/// One training batch: images in [0, 1], shape [B, 3, S, S], plus the
/// caption for each image (empty when no sidecar file exists).
pub struct Batch {
    pub images: Tensor,
    pub captions: Vec<String>,
}

pub trait DataSource {
    fn next_batch(&mut self) -> Result<Batch>;
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

pub struct FolderSource {
    receiver: Receiver<Result<Batch>>,
}

impl FolderSource {
    pub fn new(
        root: &Path,
        image_size: usize,
        batch_size: usize,
        device: &Device,
        seed: u64,
    ) -> Result<Self> {
        let files = collect_image_files(root)?;
        if files.is_empty() {
            bail!("no images found under {}", root.display());
        }
        log::info!("Found {} images under {}", files.len(), root.display());

        let prefetch = num_cpus::get().clamp(2, 8);
        let (sender, receiver) = sync_channel(prefetch);
        let device = device.clone();
        thread::spawn(move || {
            produce_batches(files, image_size, batch_size, device, seed, sender);
        });
        Ok(Self { receiver })
    }
}

impl DataSource for FolderSource {
    fn next_batch(&mut self) -> Result<Batch> {
        self.receiver
            .recv()
            .map_err(|_| anyhow!("data worker terminated unexpectedly"))?
    }
}

fn collect_image_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read dataset dir: {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                    files.push(path);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

fn produce_batches(
    mut files: Vec<PathBuf>,
    image_size: usize,
    batch_size: usize,
    device: Device,
    seed: u64,
    sender: SyncSender<Result<Batch>>,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    loop {
        files.shuffle(&mut rng);
        for chunk in files.chunks(batch_size) {
            let decoded: Vec<(Vec<f32>, String)> = chunk
                .par_iter()
                .filter_map(|path| match decode_image(path, image_size) {
                    Ok(pixels) => Some((pixels, read_caption(path))),
                    Err(e) => {
                        warn!("Skipping {}: {:#}", path.display(), e);
                        None
                    }
                })
                .collect();
            if decoded.is_empty() {
                continue;
            }
            let batch = build_batch(decoded, image_size, &device);
            if sender.send(batch).is_err() {
                // consumer is gone, wind down
                return;
            }
        }
    }
}

fn build_batch(decoded: Vec<(Vec<f32>, String)>, image_size: usize, device: &Device) -> Result<Batch> {
    let bsz = decoded.len();
    let mut pixels = Vec::with_capacity(bsz * 3 * image_size * image_size);
    let mut captions = Vec::with_capacity(bsz);
    for (image, caption) in decoded {
        pixels.extend_from_slice(&image);
        captions.push(caption);
    }
    let images = Tensor::from_vec(pixels, (bsz, 3, image_size, image_size), device)?;
    Ok(Batch { images, captions })
}

/// Decode, center-crop-resize and normalize one image to CHW in [0, 1].
fn decode_image(path: &Path, image_size: usize) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;
    let img = img
        .resize_to_fill(image_size as u32, image_size as u32, FilterType::Triangle)
        .to_rgb8();
    let (w, h) = (image_size, image_size);
    let raw = img.into_raw();
    let mut chw = vec![0.0f32; 3 * h * w];
    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 3;
            for c in 0..3 {
                chw[c * h * w + y * w + x] = raw[src + c] as f32 / 255.0;
            }
        }
    }
    Ok(chw)
}

/// Caption sidecar: same stem, `.txt` extension. Absence means an empty
/// caption, which downstream encoders treat as unconditional.
fn read_caption(image_path: &Path) -> String {
    let caption_path = image_path.with_extension("txt");
    match std::fs::read_to_string(&caption_path) {
        Ok(text) => text.trim().to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_test_image(dir: &Path, name: &str, color: [u8; 3]) {
        let mut img = RgbImage::new(16, 16);
        for pixel in img.pixels_mut() {
            *pixel = Rgb(color);
        }
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn batches_have_expected_shape_and_range() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_test_image(dir.path(), "a.png", [255, 0, 0]);
        write_test_image(dir.path(), "b.png", [0, 255, 0]);
        write_test_image(dir.path(), "c.png", [0, 0, 255]);

        let mut source = FolderSource::new(dir.path(), 32, 2, &Device::Cpu, 42)?;
        let batch = source.next_batch()?;
        assert_eq!(batch.images.dims()[1..], [3, 32, 32]);
        assert_eq!(batch.images.dims()[0], batch.captions.len());
        for v in batch.images.flatten_all()?.to_vec1::<f32>()? {
            assert!((0.0..=1.0).contains(&v));
        }
        Ok(())
    }

    #[test]
    fn source_cycles_forever() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_test_image(dir.path(), "only.png", [128, 128, 128]);
        let mut source = FolderSource::new(dir.path(), 32, 1, &Device::Cpu, 1)?;
        for _ in 0..5 {
            let batch = source.next_batch()?;
            assert_eq!(batch.images.dims()[0], 1);
        }
        Ok(())
    }

    #[test]
    fn captions_come_from_sidecar_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_test_image(dir.path(), "cat.png", [10, 20, 30]);
        std::fs::write(dir.path().join("cat.txt"), "a cat sitting on a mat\n")?;
        let mut source = FolderSource::new(dir.path(), 32, 1, &Device::Cpu, 7)?;
        let batch = source.next_batch()?;
        assert_eq!(batch.captions[0], "a cat sitting on a mat");
        Ok(())
    }

    #[test]
    fn empty_dataset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FolderSource::new(dir.path(), 32, 1, &Device::Cpu, 0).is_err());
    }
}
