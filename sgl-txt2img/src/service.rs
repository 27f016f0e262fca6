//! Owned pipeline service: background load, readiness gate, generation with
//! device fallback, and teardown.

use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use log::{error, info, warn};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::config::ModelConfig;
use crate::device::{self, DeviceKind, DeviceTarget};
use crate::io_struct::GenerationParams;
use crate::pipeline::{
    BasePipeline, PipelineError, PipelineFactory, PipelineResult, RefinerPipeline, layout,
};
use crate::retry::FallbackPolicy;

const PROMPT_LOG_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    NotReady,
    Ready,
    Failed(String),
    ShutDown,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("Model failed to load: {0}")]
    LoadFailed(String),

    #[error("Model is still loading; try again shortly.")]
    NotReady,

    #[error("Service is shut down")]
    ShutDown,

    #[error("{source}")]
    Pipeline {
        device: DeviceKind,
        #[source]
        source: PipelineError,
    },

    #[error("Failed to rebuild base pipeline on CPU: {0}")]
    Rebuild(#[source] PipelineError),
}

impl GenerateError {
    /// Kernel-unavailable failures on CUDA are the only ones worth a CPU rebuild.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GenerateError::Pipeline { device, source }
                if device.is_cuda() && source.is_kernel_unavailable()
        )
    }
}

/// Loaded handles plus the target they were built for. Replaced wholesale, never mutated.
pub struct PipelineSet {
    pub base: Box<dyn BasePipeline>,
    pub refiner: Option<Box<dyn RefinerPipeline>>,
    pub target: DeviceTarget,
}

/// Result of one generation.
#[derive(Debug)]
pub struct Generated {
    pub image: RgbImage,
    pub refined: bool,
    pub target: DeviceTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub ready: bool,
    pub error: Option<String>,
    pub target: DeviceTarget,
    pub has_refiner: bool,
}

pub struct DiffusionService {
    config: ModelConfig,
    factory: Arc<dyn PipelineFactory>,
    fallback: FallbackPolicy,
    pipelines: RwLock<Option<Arc<PipelineSet>>>,
    state_tx: watch::Sender<LoadState>,
}

impl DiffusionService {
    pub fn new(config: ModelConfig, factory: Arc<dyn PipelineFactory>) -> Self {
        let (state_tx, _) = watch::channel(LoadState::NotReady);
        Self {
            config,
            factory,
            fallback: FallbackPolicy::default(),
            pipelines: RwLock::new(None),
            state_tx,
        }
    }

    pub fn with_fallback_policy(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn state(&self) -> LoadState {
        self.state_tx.borrow().clone()
    }

    /// Load the pipelines on the blocking pool and publish the outcome.
    pub async fn init(self: Arc<Self>) -> LoadState {
        let loader = Arc::clone(&self);
        let outcome = tokio::task::spawn_blocking(move || loader.load()).await;
        let state = match outcome {
            Ok(Ok(set)) => {
                *self.pipelines.write() = Some(Arc::new(set));
                LoadState::Ready
            }
            Ok(Err(e)) => {
                error!("Model load failed: {}", e);
                LoadState::Failed(e.to_string())
            }
            Err(e) => {
                error!("Model loader task aborted: {}", e);
                LoadState::Failed(format!("loader task aborted: {}", e))
            }
        };

        let published = self.state_tx.send_if_modified(|current| {
            if *current == LoadState::ShutDown {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if !published {
            self.pipelines.write().take();
            return LoadState::ShutDown;
        }
        state
    }

    /// Wait until loading has finished one way or the other.
    pub async fn wait_ready(&self) -> LoadState {
        let mut rx = self.state_tx.subscribe();
        let result = rx
            .wait_for(|state| *state != LoadState::NotReady)
            .await
            .map(|state| state.clone());
        match result {
            Ok(state) => state,
            // The sender lives in `self`, so this cannot close while borrowed.
            Err(_) => self.state(),
        }
    }

    /// Drop the pipelines and refuse further work.
    pub fn teardown(&self) {
        self.state_tx.send_replace(LoadState::ShutDown);
        if self.pipelines.write().take().is_some() {
            info!("Pipelines released");
        }
    }

    pub fn ensure_ready(&self) -> Result<(), GenerateError> {
        match self.state() {
            LoadState::Ready => Ok(()),
            LoadState::NotReady => Err(GenerateError::NotReady),
            LoadState::Failed(msg) => Err(GenerateError::LoadFailed(msg)),
            LoadState::ShutDown => Err(GenerateError::ShutDown),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        let error = match self.state() {
            LoadState::Failed(msg) => Some(msg),
            _ => None,
        };
        let snapshot = self.snapshot();
        ServiceStatus {
            ready: snapshot.is_some() && error.is_none(),
            error,
            target: snapshot.as_ref().map(|s| s.target).unwrap_or_default(),
            has_refiner: snapshot.is_some_and(|s| s.refiner.is_some()),
        }
    }

    /// Run one generation, rebuilding on CPU once if CUDA lacks kernels.
    pub fn generate(&self, params: &GenerationParams) -> Result<Generated, GenerateError> {
        self.ensure_ready()?;
        let started = Instant::now();

        // TODO: a request arriving while the CPU rebuild swaps the snapshot may
        // still run on the old CUDA handles; decide whether to queue it or retry it.
        let generated = self.fallback.execute(
            |_| self.generate_once(params),
            GenerateError::is_recoverable,
            |err| {
                warn!("{}; rebuilding pipelines on cpu/float32", err);
                self.rebuild_on_cpu()
            },
        )?;

        let refiner = if generated.refined {
            format!("on@{}", params.refiner_fraction)
        } else {
            "off".to_string()
        };
        info!(
            "Generated in {:.2}s | {}x{} | steps={} | cfg={} | rescale={} | seed={} | refiner={} | device={} | prompt='{}'",
            started.elapsed().as_secs_f64(),
            params.width,
            params.height,
            params.steps,
            params.guidance,
            params.guidance_rescale,
            params.seed,
            refiner,
            generated.target,
            params.prompt.chars().take(PROMPT_LOG_CHARS).collect::<String>(),
        );
        Ok(generated)
    }

    fn snapshot(&self) -> Option<Arc<PipelineSet>> {
        self.pipelines.read().clone()
    }

    fn generate_once(&self, params: &GenerationParams) -> Result<Generated, GenerateError> {
        let set = self.snapshot().ok_or(GenerateError::NotReady)?;
        let device = set.target.kind;
        let failed = move |source: PipelineError| GenerateError::Pipeline { device, source };

        let (image, refined) = match (&set.refiner, params.use_refiner) {
            (Some(refiner), true) => {
                let latents = set
                    .base
                    .text_to_latents(params, params.refiner_fraction)
                    .map_err(failed)?;
                (refiner.refine(params, latents).map_err(failed)?, true)
            }
            _ => (set.base.text_to_image(params).map_err(failed)?, false),
        };
        Ok(Generated {
            image,
            refined,
            target: set.target,
        })
    }

    fn rebuild_on_cpu(&self) -> Result<(), GenerateError> {
        let target = DeviceTarget::cpu();
        let had_refiner = self.snapshot().is_some_and(|s| s.refiner.is_some());

        layout::check_layout(&self.config.model_dir).map_err(GenerateError::Rebuild)?;
        let base = self
            .factory
            .build_base(&self.config.model_dir, &target)
            .map_err(GenerateError::Rebuild)?;
        let refiner = if had_refiner {
            self.build_refiner(&target)
                .map_err(|e| warn!("Refiner rebuild on cpu failed, continuing base-only: {}", e))
                .ok()
        } else {
            None
        };

        *self.pipelines.write() = Some(Arc::new(PipelineSet {
            base,
            refiner,
            target,
        }));
        info!("Pipelines rebuilt on {}", target);
        Ok(())
    }

    fn load(&self) -> PipelineResult<PipelineSet> {
        let started = Instant::now();
        info!("Loading base model from {}", self.config.model_dir.display());
        layout::check_layout(&self.config.model_dir)?;

        let target = self.factory.preferred_target();
        info!(
            "cuda_available={}, device={}, dtype={}",
            device::cuda_available(),
            target.kind.name(),
            target.precision.name()
        );
        let base = self.factory.build_base(&self.config.model_dir, &target)?;
        let refiner = self.load_refiner(&target);

        info!(
            "Model load complete in {:.2}s (refiner={})",
            started.elapsed().as_secs_f64(),
            refiner.is_some()
        );
        Ok(PipelineSet {
            base,
            refiner,
            target,
        })
    }

    fn load_refiner(&self, target: &DeviceTarget) -> Option<Box<dyn RefinerPipeline>> {
        let dir = &self.config.refiner_dir;
        if !dir.is_dir() {
            info!("No refiner at {}; running base-only", dir.display());
            return None;
        }
        info!("Loading refiner from {}", dir.display());
        match self.build_refiner(target) {
            Ok(refiner) => Some(refiner),
            Err(e) => {
                warn!("Refiner load failed, continuing base-only: {}", e);
                None
            }
        }
    }

    fn build_refiner(&self, target: &DeviceTarget) -> PipelineResult<Box<dyn RefinerPipeline>> {
        layout::check_layout(&self.config.refiner_dir)?;
        self.factory.build_refiner(&self.config.refiner_dir, target)
    }
}
