//! In-memory pipelines that paint seed-derived pixels instead of running a model.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use sgl_txt2img_rs::device::DeviceTarget;
use sgl_txt2img_rs::io_struct::GenerationParams;
use sgl_txt2img_rs::pipeline::{
    BasePipeline, Latents, PipelineError, PipelineFactory, PipelineResult, RefinerPipeline,
};

pub const KERNEL_MESSAGE: &str =
    "CUDA error: no kernel image is available for execution on the device";

/// When a fake stage fails at inference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Never,
    /// Kernel-unavailable, but only while on a CUDA target.
    KernelOnCuda,
    /// Kernel-unavailable on every target.
    KernelAlways,
    /// An unrelated runtime error.
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Image { target: DeviceTarget },
    Latents { target: DeviceTarget, fraction: f64 },
    Refine { target: DeviceTarget, fraction: f64, dims: Vec<usize> },
}

pub struct FakeFactory {
    preferred: DeviceTarget,
    failure: Failure,
    refiner_failure: Failure,
    fail_cpu_base_build: bool,
    fail_cpu_refiner_build: bool,
    base_builds: AtomicUsize,
    refiner_builds: AtomicUsize,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeFactory {
    pub fn new(preferred: DeviceTarget) -> Self {
        Self {
            preferred,
            failure: Failure::Never,
            refiner_failure: Failure::Never,
            fail_cpu_base_build: false,
            fail_cpu_refiner_build: false,
            base_builds: AtomicUsize::new(0),
            refiner_builds: AtomicUsize::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceTarget::cpu())
    }

    pub fn cuda() -> Self {
        Self::new(DeviceTarget::cuda(0))
    }

    pub fn failing(mut self, failure: Failure) -> Self {
        self.failure = failure;
        self
    }

    pub fn failing_refiner(mut self, failure: Failure) -> Self {
        self.refiner_failure = failure;
        self
    }

    pub fn failing_cpu_base_build(mut self) -> Self {
        self.fail_cpu_base_build = true;
        self
    }

    pub fn failing_cpu_refiner_build(mut self) -> Self {
        self.fail_cpu_refiner_build = true;
        self
    }

    pub fn base_builds(&self) -> usize {
        self.base_builds.load(Ordering::SeqCst)
    }

    pub fn refiner_builds(&self) -> usize {
        self.refiner_builds.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

fn build_failure(component: &'static str) -> PipelineError {
    PipelineError::Build {
        component,
        source: candle_core::Error::Msg("weights unreadable".to_string()),
    }
}

impl PipelineFactory for FakeFactory {
    fn preferred_target(&self) -> DeviceTarget {
        self.preferred
    }

    fn build_base(
        &self,
        _model_dir: &Path,
        target: &DeviceTarget,
    ) -> PipelineResult<Box<dyn BasePipeline>> {
        self.base_builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_cpu_base_build && !target.kind.is_cuda() {
            return Err(build_failure("unet"));
        }
        Ok(Box::new(FakeBase {
            target: *target,
            failure: self.failure,
            calls: self.calls.clone(),
        }))
    }

    fn build_refiner(
        &self,
        _model_dir: &Path,
        target: &DeviceTarget,
    ) -> PipelineResult<Box<dyn RefinerPipeline>> {
        self.refiner_builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_cpu_refiner_build && !target.kind.is_cuda() {
            return Err(build_failure("refiner unet"));
        }
        Ok(Box::new(FakeRefiner {
            target: *target,
            failure: self.refiner_failure,
            calls: self.calls.clone(),
        }))
    }
}

struct FakeBase {
    target: DeviceTarget,
    failure: Failure,
    calls: Arc<Mutex<Vec<Call>>>,
}

fn check(failure: Failure, target: &DeviceTarget) -> PipelineResult<()> {
    let kernel = || PipelineError::Candle(candle_core::Error::Msg(KERNEL_MESSAGE.to_string()));
    match failure {
        Failure::Never => Ok(()),
        Failure::KernelOnCuda if target.kind.is_cuda() => Err(kernel()),
        Failure::KernelOnCuda => Ok(()),
        Failure::KernelAlways => Err(kernel()),
        Failure::Other => Err(PipelineError::Candle(candle_core::Error::Msg(
            "out of memory".to_string(),
        ))),
    }
}

/// Pixels depend only on the seed, the position and the stage.
fn paint(width: usize, height: usize, seed: u64, stage: u8) -> RgbImage {
    let bytes = seed.to_le_bytes();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        Rgb([
            bytes[0].wrapping_add(x as u8),
            bytes[1].wrapping_add(y as u8),
            bytes[2] ^ stage,
        ])
    })
}

impl BasePipeline for FakeBase {
    fn text_to_image(&self, params: &GenerationParams) -> PipelineResult<RgbImage> {
        self.calls.lock().push(Call::Image {
            target: self.target,
        });
        check(self.failure, &self.target)?;
        Ok(paint(params.width, params.height, params.seed, 0))
    }

    fn text_to_latents(
        &self,
        params: &GenerationParams,
        denoising_end: f64,
    ) -> PipelineResult<Latents> {
        self.calls.lock().push(Call::Latents {
            target: self.target,
            fraction: denoising_end,
        });
        check(self.failure, &self.target)?;
        let tensor = Tensor::zeros(
            (1, 4, params.height / 8, params.width / 8),
            DType::F32,
            &Device::Cpu,
        )?;
        Ok(Latents::new(tensor, denoising_end))
    }
}

struct FakeRefiner {
    target: DeviceTarget,
    failure: Failure,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RefinerPipeline for FakeRefiner {
    fn refine(&self, params: &GenerationParams, latents: Latents) -> PipelineResult<RgbImage> {
        let dims = latents.tensor().dims().to_vec();
        self.calls.lock().push(Call::Refine {
            target: self.target,
            fraction: latents.fraction(),
            dims: dims.clone(),
        });
        check(self.failure, &self.target)?;
        Ok(paint(dims[3] * 8, dims[2] * 8, params.seed, 0xff))
    }
}
