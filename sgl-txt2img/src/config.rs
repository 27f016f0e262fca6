use std::path::PathBuf;

pub const DEFAULT_MODEL_DIR: &str = "./models/stable-diffusion-xl-base-1.0";
pub const DEFAULT_REFINER_DIR: &str = "./models/stable-diffusion-xl-refiner-1.0";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9100;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where the pretrained pipelines are read from and how they are built.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub refiner_dir: PathBuf,
    /// Opt-in fused attention kernels; only honoured on CUDA builds with `flash-attn`.
    pub flash_attn: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            refiner_dir: PathBuf::from(DEFAULT_REFINER_DIR),
            flash_attn: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_payload_size: usize,
    /// Empty means any origin.
    pub cors_allowed_origins: Vec<String>,
    pub log_level: String,
    pub model: ModelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            cors_allowed_origins: Vec::new(),
            log_level: "info".to_string(),
            model: ModelConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn log_level_filter(&self) -> ConfigResult<log::LevelFilter> {
        self.log_level
            .parse::<log::LevelFilter>()
            .map_err(|_| ConfigError::InvalidValue {
                field: "log_level".to_string(),
                value: self.log_level.clone(),
                reason: "Must be one of off, error, warn, info, debug, trace".to_string(),
            })
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &ServerConfig) -> ConfigResult<()> {
        Self::validate_server_settings(config)?;
        Self::validate_model(&config.model)?;
        config.log_level_filter()?;
        Ok(())
    }

    fn validate_server_settings(config: &ServerConfig) -> ConfigResult<()> {
        if config.host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "host".to_string(),
            });
        }

        if config.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                value: config.port.to_string(),
                reason: "Port must be > 0".to_string(),
            });
        }

        if config.max_payload_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_payload_size".to_string(),
                value: config.max_payload_size.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if config.cors_allowed_origins.iter().any(|o| o.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "cors_allowed_origins".to_string(),
                value: config.cors_allowed_origins.join(","),
                reason: "Origins must not be empty".to_string(),
            });
        }

        Ok(())
    }

    fn validate_model(model: &ModelConfig) -> ConfigResult<()> {
        if model.model_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "model_dir".to_string(),
            });
        }
        // An empty refiner dir simply never exists on disk, which means base-only mode.
        Ok(())
    }
}
