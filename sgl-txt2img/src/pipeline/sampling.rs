//! Tensor plumbing around the library's scheduler and UNet calls.

use candle_core::{DType, Device, Result, Tensor};
use image::RgbImage;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use super::{PipelineError, PipelineResult};

/// Length of the training noise schedule SDXL checkpoints ship with.
pub const TRAIN_TIMESTEPS: usize = 1000;
/// SDXL VAE latent scaling factor.
pub const VAE_SCALE: f64 = 0.13025;
pub const LATENT_CHANNELS: usize = 4;

/// First timestep that belongs to the second stage for a hand-off at `fraction`.
pub fn discrete_cutoff(fraction: f64) -> usize {
    let total = TRAIN_TIMESTEPS as f64;
    (total - fraction * total).round().max(0.0) as usize
}

/// Number of leading (descending) timesteps the base stage runs before handing off.
pub fn handoff_index(timesteps: &[usize], fraction: f64) -> usize {
    let cutoff = discrete_cutoff(fraction);
    timesteps.iter().take_while(|&&t| t >= cutoff).count()
}

pub fn latent_shape(width: usize, height: usize) -> (usize, usize, usize, usize) {
    (1, LATENT_CHANNELS, height / 8, width / 8)
}

/// Standard-normal noise drawn on the host so a seed means the same thing on every device.
pub fn seeded_noise(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..len)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_device(device)?
        .to_dtype(dtype)
}

/// Combine an `[uncond, text]` batch of noise predictions.
///
/// With `rescale > 0` the guided prediction is pulled back towards the standard
/// deviation of the text prediction, which counters over-exposure at high guidance.
pub fn apply_guidance(noise_pred: &Tensor, guidance: f64, rescale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, text) = (&chunks[0], &chunks[1]);
    let guided = uncond.add(&text.sub(uncond)?.affine(guidance, 0.0)?)?;
    if rescale > 0.0 {
        rescale_noise_cfg(&guided, text, rescale)
    } else {
        Ok(guided)
    }
}

pub fn rescale_noise_cfg(guided: &Tensor, text: &Tensor, rescale: f64) -> Result<Tensor> {
    let ratio = per_sample_std(text)?.div(&per_sample_std(guided)?)?;
    let rescaled = guided.broadcast_mul(&ratio)?;
    rescaled
        .affine(rescale, 0.0)?
        .add(&guided.affine(1.0 - rescale, 0.0)?)
}

/// Unbiased std over every dim but the batch, shaped to broadcast back.
fn per_sample_std(xs: &Tensor) -> Result<Tensor> {
    let batch = xs.dim(0)?;
    let flat = xs.flatten_from(1)?;
    let n = flat.dim(1)?;
    let mean = flat.mean_keepdim(1)?;
    let var = flat
        .broadcast_sub(&mean)?
        .sqr()?
        .sum_keepdim(1)?
        .affine(1.0 / (n.max(2) - 1) as f64, 0.0)?;
    let mut shape = vec![1usize; xs.rank()];
    shape[0] = batch;
    var.sqrt()?.reshape(shape)
}

/// Convert a decoded `(1, 3, H, W)` VAE output in `[-1, 1]` to an RGB image.
pub fn tensor_to_image(decoded: &Tensor) -> PipelineResult<RgbImage> {
    let pixels = decoded
        .squeeze(0)?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.5, 0.5)?
        .clamp(0f32, 1f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?;
    let (channels, height, width) = pixels.dims3()?;
    if channels != 3 {
        return Err(PipelineError::Image(format!(
            "expected 3 channels, got {channels}"
        )));
    }
    let data = pixels.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| PipelineError::Image(format!("buffer does not fit {width}x{height}")))
}
