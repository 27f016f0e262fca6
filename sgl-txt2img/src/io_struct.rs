use serde::{Deserialize, Serialize};

pub const MAX_WIDTH: u32 = 1024;
pub const MAX_HEIGHT: u32 = 1024;
pub const MIN_SIZE: u32 = 256;
pub const MAX_STEPS: u32 = 60;
pub const MIN_STEPS: u32 = 5;
pub const DEFAULT_STEPS: u32 = 60;
pub const DEFAULT_GUIDANCE: f64 = 9.5;
pub const MAX_GUIDANCE: f64 = 40.0;
pub const MIN_REFINER_FRACTION: f64 = 0.5;
pub const MAX_REFINER_FRACTION: f64 = 0.98;

const DEFAULT_NEGATIVE_PROMPT: &str =
    "low quality, watermark, text, extra fingers, wrong anatomy, blurry";

fn default_negative_prompt() -> Option<String> {
    Some(DEFAULT_NEGATIVE_PROMPT.to_string())
}
fn default_width() -> u32 {
    832
}
fn default_height() -> u32 {
    MAX_HEIGHT
}
fn default_steps() -> u32 {
    DEFAULT_STEPS
}
fn default_guidance() -> f64 {
    DEFAULT_GUIDANCE
}
fn default_guidance_rescale() -> f64 {
    0.75
}
fn default_seed() -> Option<u64> {
    Some(42)
}
fn default_use_refiner() -> bool {
    true
}
fn default_refiner_fraction() -> f64 {
    0.8
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Txt2ImgRequest {
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance")]
    pub guidance: f64,
    #[serde(default = "default_guidance_rescale")]
    pub guidance_rescale: f64,
    /// `null` asks for a fresh random seed.
    #[serde(default = "default_seed")]
    pub seed: Option<u64>,
    #[serde(default = "default_use_refiner")]
    pub use_refiner: bool,
    /// Fraction of the schedule the base model denoises before the refiner takes over.
    #[serde(default = "default_refiner_fraction")]
    pub refiner_fraction: f64,
}

impl Txt2ImgRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: default_negative_prompt(),
            width: default_width(),
            height: default_height(),
            steps: default_steps(),
            guidance: default_guidance(),
            guidance_rescale: default_guidance_rescale(),
            seed: default_seed(),
            use_refiner: default_use_refiner(),
            refiner_fraction: default_refiner_fraction(),
        }
    }

    /// Check the request against the fixed bounds and resolve the seed.
    pub fn validate(self) -> Result<GenerationParams, ValidationError> {
        if self.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        if self.width > MAX_WIDTH || self.height > MAX_HEIGHT {
            return Err(ValidationError::TooLarge);
        }
        if self.width < MIN_SIZE || self.height < MIN_SIZE {
            return Err(ValidationError::TooSmall);
        }
        if self.width % 8 != 0 || self.height % 8 != 0 {
            return Err(ValidationError::NotMultipleOf8 {
                width: self.width,
                height: self.height,
            });
        }
        if self.steps > MAX_STEPS {
            return Err(ValidationError::TooManySteps);
        }
        if self.steps < MIN_STEPS {
            return Err(ValidationError::TooFewSteps);
        }
        if !(0.0..=MAX_GUIDANCE).contains(&self.guidance) {
            return Err(ValidationError::Guidance(self.guidance));
        }
        if !(0.0..=1.0).contains(&self.guidance_rescale) {
            return Err(ValidationError::GuidanceRescale(self.guidance_rescale));
        }
        if !(self.refiner_fraction > 0.0 && self.refiner_fraction < 1.0) {
            return Err(ValidationError::RefinerFractionOpen);
        }
        if !(MIN_REFINER_FRACTION..=MAX_REFINER_FRACTION).contains(&self.refiner_fraction) {
            return Err(ValidationError::RefinerFractionRange(self.refiner_fraction));
        }

        let seed = self.seed.unwrap_or_else(rand::random::<u64>);
        Ok(GenerationParams {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            width: self.width as usize,
            height: self.height as usize,
            steps: self.steps as usize,
            guidance: self.guidance,
            guidance_rescale: self.guidance_rescale,
            seed,
            use_refiner: self.use_refiner,
            refiner_fraction: self.refiner_fraction,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("Max size is {}x{}", MAX_WIDTH, MAX_HEIGHT)]
    TooLarge,
    #[error("Min size is {}x{}", MIN_SIZE, MIN_SIZE)]
    TooSmall,
    #[error("width and height must be multiples of 8 (got {width}x{height})")]
    NotMultipleOf8 { width: u32, height: u32 },
    #[error("Max steps is {}", MAX_STEPS)]
    TooManySteps,
    #[error("Min steps is {}", MIN_STEPS)]
    TooFewSteps,
    #[error("guidance must be between 0 and {} (got {})", MAX_GUIDANCE, .0)]
    Guidance(f64),
    #[error("guidance_rescale must be between 0 and 1 (got {0})")]
    GuidanceRescale(f64),
    #[error("refiner_fraction must be in (0,1)")]
    RefinerFractionOpen,
    #[error(
        "refiner_fraction must be between {} and {} (got {})",
        MIN_REFINER_FRACTION,
        MAX_REFINER_FRACTION,
        .0
    )]
    RefinerFractionRange(f64),
}

/// A validated request with its seed pinned down.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    /// `None` conditions the unguided half on zeroed embeddings.
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub guidance_rescale: f64,
    pub seed: u64,
    pub use_refiner: bool,
    pub refiner_fraction: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Txt2ImgResponse {
    pub image_base64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ready: bool,
    pub error: Option<String>,
    pub cuda: bool,
    pub version: String,
    pub model_dir: String,
    pub refiner_dir: Option<String>,
    pub device: String,
    pub dtype: String,
    pub has_refiner: bool,
    pub default_steps: u32,
}
