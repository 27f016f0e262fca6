//! SDXL base and refiner pipelines assembled from `candle-transformers` components.

use std::path::Path;

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    self, StableDiffusionConfig,
    clip::{ClipTextTransformer, Config as ClipConfig},
    ddim::DDIMSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    uni_pc::UniPCSchedulerConfig,
    vae::AutoEncoderKL,
};
use image::RgbImage;
use log::{info, warn};
use tokenizers::Tokenizer;

use super::layout::{self, UNET_WEIGHTS, VAE_WEIGHTS};
use super::refiner_unet::{RefinerUNet, RefinerUNetConfig};
use super::sampling::{self, LATENT_CHANNELS, VAE_SCALE};
use super::{
    BasePipeline, Latents, PipelineError, PipelineFactory, PipelineResult, RefinerPipeline,
};
use crate::device::{DeviceTarget, Precision};
use crate::io_struct::{DEFAULT_STEPS, GenerationParams};

const TOKENIZER: &str = "tokenizer/tokenizer.json";
const TOKENIZER_2: &str = "tokenizer_2/tokenizer.json";
const TEXT_ENCODER: &str = "text_encoder/model.safetensors";
const TEXT_ENCODER_2: &str = "text_encoder_2/model.safetensors";
const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";

fn build_err(component: &'static str) -> impl FnOnce(candle_core::Error) -> PipelineError {
    move |source| PipelineError::Build { component, source }
}

/// Scheduler the pipelines step with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Multistep predictor-corrector; reaches good detail in fewer steps.
    UniPc,
    /// Library default.
    Ddim,
}

impl SchedulerKind {
    /// Swap in the multistep scheduler, keeping the default if it cannot be built.
    pub fn select() -> Self {
        match SchedulerKind::UniPc.build(DEFAULT_STEPS as usize) {
            Ok(_) => SchedulerKind::UniPc,
            Err(e) => {
                warn!("Scheduler swap skipped: {}", e);
                SchedulerKind::Ddim
            }
        }
    }

    pub fn build(&self, steps: usize) -> candle_core::Result<Box<dyn Scheduler>> {
        match self {
            SchedulerKind::UniPc => UniPCSchedulerConfig::default().build(steps),
            SchedulerKind::Ddim => DDIMSchedulerConfig::default().build(steps),
        }
    }
}

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
}

impl TextEncoder {
    fn load(
        model_dir: &Path,
        tokenizer_file: &str,
        weights_file: &str,
        config: &ClipConfig,
        device: &Device,
    ) -> PipelineResult<Self> {
        let tokenizer_path = layout::resolve_file(model_dir, tokenizer_file, Precision::Float32)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        let pad_token = config.pad_with.as_deref().unwrap_or(DEFAULT_PAD_TOKEN);
        let pad_id = *tokenizer.get_vocab(true).get(pad_token).ok_or_else(|| {
            PipelineError::Tokenizer(format!("`{}` missing from {}", pad_token, tokenizer_file))
        })?;

        // Text encoders stay in f32; their output is cast to the pipeline dtype.
        let weights = layout::resolve_file(model_dir, weights_file, Precision::Float32)?;
        let model =
            stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
                .map_err(build_err("text encoder"))?;

        Ok(Self {
            tokenizer,
            model,
            max_len: config.max_position_embeddings,
            pad_id,
        })
    }

    fn encode(&self, text: &str, device: &Device) -> PipelineResult<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_len);
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

fn uses_guidance(params: &GenerationParams) -> bool {
    params.guidance > 1.0
}

/// Stacks `[negative, prompt]` for guidance. A missing negative prompt
/// becomes zeroed embeddings rather than an encoded empty string.
fn guided_batch(prompt: Tensor, negative: Option<Tensor>) -> candle_core::Result<Tensor> {
    let negative = match negative {
        Some(negative) => negative,
        None => prompt.zeros_like()?,
    };
    Tensor::cat(&[negative, prompt], 0)
}

/// Prompt embeddings from every encoder, concatenated on the hidden dim.
/// With guidance the batch is `[negative, prompt]`.
fn conditioning(
    encoders: &[TextEncoder],
    params: &GenerationParams,
    device: &Device,
    dtype: DType,
) -> PipelineResult<Tensor> {
    let embed = |text: &str| -> PipelineResult<Tensor> {
        let parts = encoders
            .iter()
            .map(|encoder| encoder.encode(text, device))
            .collect::<PipelineResult<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, D::Minus1)?)
    };
    let prompt = embed(&params.prompt)?;
    let embeddings = if uses_guidance(params) {
        let negative = params.negative_prompt.as_deref().map(embed).transpose()?;
        guided_batch(prompt, negative)?
    } else {
        prompt
    };
    Ok(embeddings.to_dtype(dtype)?)
}

/// A UNet that predicts noise for a latent batch at one timestep.
trait NoisePredictor {
    fn predict(
        &self,
        xs: &Tensor,
        timestep: f64,
        context: &Tensor,
    ) -> candle_core::Result<Tensor>;
}

impl NoisePredictor for UNet2DConditionModel {
    fn predict(
        &self,
        xs: &Tensor,
        timestep: f64,
        context: &Tensor,
    ) -> candle_core::Result<Tensor> {
        self.forward(xs, timestep, context)
    }
}

impl NoisePredictor for RefinerUNet {
    fn predict(
        &self,
        xs: &Tensor,
        timestep: f64,
        context: &Tensor,
    ) -> candle_core::Result<Tensor> {
        self.forward(xs, timestep, context)
    }
}

struct Denoiser<U> {
    unet: U,
    scheduler: SchedulerKind,
    device: Device,
    dtype: DType,
}

impl<U: NoisePredictor> Denoiser<U> {
    fn schedule(&self, steps: usize) -> PipelineResult<Box<dyn Scheduler>> {
        Ok(self.scheduler.build(steps)?)
    }

    fn denoise(
        &self,
        scheduler: &mut dyn Scheduler,
        mut latents: Tensor,
        timesteps: &[usize],
        embeddings: &Tensor,
        params: &GenerationParams,
    ) -> PipelineResult<Tensor> {
        let guided = uses_guidance(params);
        for &timestep in timesteps {
            let input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.predict(&input, timestep as f64, embeddings)?;
            let noise_pred = if guided {
                sampling::apply_guidance(&noise_pred, params.guidance, params.guidance_rescale)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }
        Ok(latents)
    }
}

fn decode(vae: &AutoEncoderKL, latents: &Tensor) -> PipelineResult<RgbImage> {
    let decoded = vae.decode(&latents.affine(1.0 / VAE_SCALE, 0.0)?)?;
    sampling::tensor_to_image(&decoded)
}

pub struct SdxlBase {
    encoders: Vec<TextEncoder>,
    denoiser: Denoiser<UNet2DConditionModel>,
    vae: AutoEncoderKL,
}

impl SdxlBase {
    pub fn load(
        model_dir: &Path,
        target: &DeviceTarget,
        scheduler: SchedulerKind,
        flash_attn: bool,
    ) -> PipelineResult<Self> {
        let device = target.device()?;
        let dtype = target.dtype();
        let sd = StableDiffusionConfig::sdxl(None, None, None);
        let clip2 = sd.clip2.clone().ok_or_else(|| PipelineError::Build {
            component: "text encoder",
            source: candle_core::Error::Msg("SDXL config carries no second CLIP".to_string()),
        })?;

        let encoders = vec![
            TextEncoder::load(model_dir, TOKENIZER, TEXT_ENCODER, &sd.clip, &device)?,
            TextEncoder::load(model_dir, TOKENIZER_2, TEXT_ENCODER_2, &clip2, &device)?,
        ];

        let unet_weights = layout::resolve_file(model_dir, UNET_WEIGHTS, target.precision)?;
        let unet = sd
            .build_unet(unet_weights, &device, LATENT_CHANNELS, flash_attn, dtype)
            .map_err(build_err("unet"))?;
        let vae_weights = layout::resolve_file(model_dir, VAE_WEIGHTS, target.precision)?;
        let vae = sd
            .build_vae(vae_weights, &device, dtype)
            .map_err(build_err("vae"))?;

        Ok(Self {
            encoders,
            denoiser: Denoiser {
                unet,
                scheduler,
                device,
                dtype,
            },
            vae,
        })
    }

    fn run(
        &self,
        params: &GenerationParams,
        denoising_end: Option<f64>,
    ) -> PipelineResult<Tensor> {
        let mut scheduler = self.denoiser.schedule(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let end = match denoising_end {
            Some(fraction) => sampling::handoff_index(&timesteps, fraction),
            None => timesteps.len(),
        };

        let embeddings = conditioning(
            &self.encoders,
            params,
            &self.denoiser.device,
            self.denoiser.dtype,
        )?;
        let latents = sampling::seeded_noise(
            params.seed,
            sampling::latent_shape(params.width, params.height),
            &self.denoiser.device,
            self.denoiser.dtype,
        )?
        .affine(scheduler.init_noise_sigma(), 0.0)?;

        self.denoiser.denoise(
            scheduler.as_mut(),
            latents,
            &timesteps[..end],
            &embeddings,
            params,
        )
    }
}

impl BasePipeline for SdxlBase {
    fn text_to_image(&self, params: &GenerationParams) -> PipelineResult<RgbImage> {
        let latents = self.run(params, None)?;
        decode(&self.vae, &latents)
    }

    fn text_to_latents(
        &self,
        params: &GenerationParams,
        denoising_end: f64,
    ) -> PipelineResult<Latents> {
        let latents = self.run(params, Some(denoising_end))?;
        Ok(Latents::new(latents, denoising_end))
    }
}

pub struct SdxlRefiner {
    encoder: TextEncoder,
    denoiser: Denoiser<RefinerUNet>,
    vae: AutoEncoderKL,
}

impl SdxlRefiner {
    pub fn load(
        model_dir: &Path,
        target: &DeviceTarget,
        scheduler: SchedulerKind,
        flash_attn: bool,
    ) -> PipelineResult<Self> {
        let device = target.device()?;
        let dtype = target.dtype();
        let sd = StableDiffusionConfig::sdxl(None, None, None);
        let clip2 = sd.clip2.clone().ok_or_else(|| PipelineError::Build {
            component: "text encoder",
            source: candle_core::Error::Msg("SDXL config carries no second CLIP".to_string()),
        })?;
        let encoder = TextEncoder::load(model_dir, TOKENIZER_2, TEXT_ENCODER_2, &clip2, &device)?;

        let unet_weights = layout::resolve_file(model_dir, UNET_WEIGHTS, target.precision)?;
        // SAFETY: the weights are memory-mapped read-only and nothing else writes them while loaded.
        let vs = unsafe { VarBuilder::from_mmaped_safetensors(&[unet_weights], dtype, &device) }
            .map_err(build_err("refiner unet"))?;
        let unet = RefinerUNet::new(
            vs,
            LATENT_CHANNELS,
            LATENT_CHANNELS,
            flash_attn,
            &RefinerUNetConfig::sdxl(),
        )
        .map_err(build_err("refiner unet"))?;

        let vae_weights = layout::resolve_file(model_dir, VAE_WEIGHTS, target.precision)?;
        let vae = sd
            .build_vae(vae_weights, &device, dtype)
            .map_err(build_err("refiner vae"))?;

        Ok(Self {
            encoder,
            denoiser: Denoiser {
                unet,
                scheduler,
                device,
                dtype,
            },
            vae,
        })
    }
}

impl RefinerPipeline for SdxlRefiner {
    fn refine(&self, params: &GenerationParams, latents: Latents) -> PipelineResult<RgbImage> {
        let mut scheduler = self.denoiser.schedule(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let start = sampling::handoff_index(&timesteps, latents.fraction());

        let embeddings = conditioning(
            std::slice::from_ref(&self.encoder),
            params,
            &self.denoiser.device,
            self.denoiser.dtype,
        )?;
        // Continue from the base latents as-is; no re-noising at the hand-off.
        let init = latents
            .into_tensor()
            .to_device(&self.denoiser.device)?
            .to_dtype(self.denoiser.dtype)?;
        let refined = self.denoiser.denoise(
            scheduler.as_mut(),
            init,
            &timesteps[start..],
            &embeddings,
            params,
        )?;
        decode(&self.vae, &refined)
    }
}

/// Builds candle SDXL pipelines.
pub struct SdxlPipelineFactory {
    flash_attn: bool,
}

impl SdxlPipelineFactory {
    pub fn new(flash_attn: bool) -> Self {
        Self { flash_attn }
    }

    /// The optimized-attention flag only applies to CUDA builds that carry the kernels.
    pub fn flash_attn_for(&self, target: &DeviceTarget) -> bool {
        if !self.flash_attn {
            return false;
        }
        if !target.kind.is_cuda() {
            info!("Flash attention skipped on {}", target);
            return false;
        }
        if !cfg!(feature = "flash-attn") {
            warn!("Flash attention disabled: built without the `flash-attn` feature");
            return false;
        }
        true
    }
}

impl PipelineFactory for SdxlPipelineFactory {
    fn build_base(
        &self,
        model_dir: &Path,
        target: &DeviceTarget,
    ) -> PipelineResult<Box<dyn BasePipeline>> {
        info!(
            "Building BASE pipeline: device={}, dtype={}",
            target.kind.name(),
            target.precision.name()
        );
        let base = SdxlBase::load(
            model_dir,
            target,
            SchedulerKind::select(),
            self.flash_attn_for(target),
        )?;
        Ok(Box::new(base))
    }

    fn build_refiner(
        &self,
        model_dir: &Path,
        target: &DeviceTarget,
    ) -> PipelineResult<Box<dyn RefinerPipeline>> {
        info!(
            "Building REFINER pipeline: device={}, dtype={}",
            target.kind.name(),
            target.precision.name()
        );
        let refiner = SdxlRefiner::load(
            model_dir,
            target,
            SchedulerKind::select(),
            self.flash_attn_for(target),
        )?;
        Ok(Box::new(refiner))
    }
}
