//! Pipeline handles for the two generation stages.
//!
//! A base pipeline turns text into either a finished image or, when a refiner
//! takes over, into latents stopped part-way through the schedule. The refiner
//! continues from those latents to pixels. Both are opaque handles built once
//! by a [`PipelineFactory`] and shared read-only between requests.

pub mod layout;
pub mod refiner_unet;
pub mod sampling;
pub mod sdxl;

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use image::RgbImage;

use crate::device::DeviceTarget;
use crate::io_struct::GenerationParams;

pub use sdxl::SdxlPipelineFactory;

/// Marker the CUDA driver uses when the build carries no kernels for the GPU.
const KERNEL_UNAVAILABLE: &str = "no kernel image is available";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Missing required files:\n{}", format_paths(.0))]
    MissingFiles(Vec<PathBuf>),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("failed to build {component}: {source}")]
    Build {
        component: &'static str,
        #[source]
        source: candle_core::Error,
    },

    #[error("invalid image buffer: {0}")]
    Image(String),
}

impl PipelineError {
    /// Whether the device lacks compiled kernels for this build.
    pub fn is_kernel_unavailable(&self) -> bool {
        self.to_string().to_lowercase().contains(KERNEL_UNAVAILABLE)
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Denoised latents handed from the base stage to the refiner. Never leaves the process.
#[derive(Debug, Clone)]
pub struct Latents {
    tensor: Tensor,
    fraction: f64,
}

impl Latents {
    pub fn new(tensor: Tensor, fraction: f64) -> Self {
        Self { tensor, fraction }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Point of the schedule the base stage stopped at.
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }
}

pub trait BasePipeline: Send + Sync {
    /// Run the full schedule and decode to pixels.
    fn text_to_image(&self, params: &GenerationParams) -> PipelineResult<RgbImage>;

    /// Run the schedule up to `denoising_end` and return the latents undecoded.
    fn text_to_latents(
        &self,
        params: &GenerationParams,
        denoising_end: f64,
    ) -> PipelineResult<Latents>;
}

pub trait RefinerPipeline: Send + Sync {
    /// Continue denoising from `latents`, starting at `latents.fraction()`.
    fn refine(&self, params: &GenerationParams, latents: Latents) -> PipelineResult<RgbImage>;
}

/// Builds pipeline handles for a given device target.
pub trait PipelineFactory: Send + Sync {
    /// Device and precision used when nothing has failed yet.
    fn preferred_target(&self) -> DeviceTarget {
        DeviceTarget::detect()
    }

    fn build_base(
        &self,
        model_dir: &Path,
        target: &DeviceTarget,
    ) -> PipelineResult<Box<dyn BasePipeline>>;

    fn build_refiner(
        &self,
        model_dir: &Path,
        target: &DeviceTarget,
    ) -> PipelineResult<Box<dyn RefinerPipeline>>;
}
