use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, builder::BoolishValueParser};
use log::{info, warn};

use sgl_txt2img_rs::config::{
    DEFAULT_HOST, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_MODEL_DIR, DEFAULT_PORT, DEFAULT_REFINER_DIR,
};
use sgl_txt2img_rs::logging::init_logging;
use sgl_txt2img_rs::pipeline::SdxlPipelineFactory;
use sgl_txt2img_rs::{ConfigValidator, DiffusionService, LoadState, ModelConfig, ServerConfig, server};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, env = "SDXL_HOST", default_value = DEFAULT_HOST, help = "Host address to bind the server to")]
    host: String,

    #[arg(long, env = "SDXL_PORT", default_value_t = DEFAULT_PORT, help = "Port number to listen on")]
    port: u16,

    #[arg(long, env = "SDXL_DIR", default_value = DEFAULT_MODEL_DIR, help = "SDXL base model directory")]
    model_dir: PathBuf,

    #[arg(
        long,
        env = "SDXL_REFINER_DIR",
        default_value = DEFAULT_REFINER_DIR,
        help = "SDXL refiner directory; the server runs base-only when it does not exist"
    )]
    refiner_dir: PathBuf,

    #[arg(
        long,
        env = "SDXL_FLASH_ATTN",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new(),
        help = "Use fused attention kernels (CUDA builds with the flash-attn feature only)"
    )]
    flash_attn: bool,

    #[arg(long, env = "SDXL_LOG_LEVEL", default_value = "info", help = "Log level: off, error, warn, info, debug, trace")]
    log_level: String,

    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_SIZE, help = "Maximum request body size in bytes")]
    max_payload_size: usize,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Comma-separated list of allowed CORS origins; any origin when empty"
    )]
    cors_allowed_origins: Vec<String>,
}

impl Args {
    fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_payload_size: self.max_payload_size,
            cors_allowed_origins: self.cors_allowed_origins.clone(),
            log_level: self.log_level.clone(),
            model: ModelConfig {
                model_dir: self.model_dir.clone(),
                refiner_dir: self.refiner_dir.clone(),
                flash_attn: self.flash_attn,
            },
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().to_server_config();
    ConfigValidator::validate(&config)?;
    init_logging(config.log_level_filter()?);

    let factory = Arc::new(SdxlPipelineFactory::new(config.model.flash_attn));
    let service = Arc::new(DiffusionService::new(config.model.clone(), factory));

    let loader = async {
        match Arc::clone(&service).init().await {
            LoadState::Ready => info!("Model ready"),
            LoadState::Failed(e) => warn!("Serving without a model: {}", e),
            state => info!("Loader finished in state {:?}", state),
        }
    };
    let (served, ()) =
        futures::future::join(server::startup(config, Arc::clone(&service)), loader).await;

    service.teardown();
    served?;
    Ok(())
}
