use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, get, http::header, middleware, post, web};
use log::info;

use crate::config::ServerConfig;
use crate::device;
use crate::encode;
use crate::error::{ApiError, json_error_handler};
use crate::io_struct::{
    DEFAULT_STEPS, HealthResponse, StatusResponse, Txt2ImgRequest, Txt2ImgResponse,
};
use crate::service::DiffusionService;

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse { ok: true })
}

#[get("/favicon.ico")]
pub async fn favicon() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("image/x-icon")
        .insert_header((header::CACHE_CONTROL, "max-age=3600"))
        .finish()
}

#[get("/status")]
pub async fn status(service: web::Data<DiffusionService>) -> HttpResponse {
    let status = service.status();
    let config = service.config();
    HttpResponse::Ok().json(StatusResponse {
        ready: status.ready,
        error: status.error,
        cuda: device::cuda_available(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_dir: config.model_dir.display().to_string(),
        refiner_dir: status
            .has_refiner
            .then(|| config.refiner_dir.display().to_string()),
        device: status.target.kind.name().to_string(),
        dtype: status.target.precision.name().to_string(),
        has_refiner: status.has_refiner,
        default_steps: DEFAULT_STEPS,
    })
}

#[post("/txt2img")]
pub async fn txt2img(
    req: web::Json<Txt2ImgRequest>,
    service: web::Data<DiffusionService>,
) -> Result<web::Json<Txt2ImgResponse>, ApiError> {
    service.ensure_ready()?;
    let params = req.into_inner().validate()?;

    // Inference holds the calling thread for its whole duration.
    let image_base64 = web::block(move || -> Result<String, ApiError> {
        let generated = service.generate(&params)?;
        Ok(encode::png_base64(&generated.image)?)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("generation worker failed: {}", e)))??;

    Ok(web::Json(Txt2ImgResponse { image_base64 }))
}

/// Register every route on an app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(favicon)
        .service(status)
        .service(txt2img);
}

pub fn json_config(max_payload_size: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(max_payload_size)
        .error_handler(json_error_handler)
}

fn cors(allowed_origins: &[String]) -> Cors {
    let cors = Cors::default().allow_any_method().allow_any_header();
    if allowed_origins.is_empty() {
        cors.allow_any_origin()
    } else {
        allowed_origins
            .iter()
            .fold(cors, |cors, origin| cors.allowed_origin(origin))
    }
}

pub async fn startup(config: ServerConfig, service: Arc<DiffusionService>) -> std::io::Result<()> {
    let app_state = web::Data::from(service);
    let max_payload_size = config.max_payload_size;
    let allowed_origins = config.cors_allowed_origins.clone();

    info!("Starting server at {}:{}", config.host, config.port);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors(&allowed_origins))
            .app_data(app_state.clone())
            .app_data(json_config(max_payload_size))
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .configure(configure)
    })
    .bind((config.host, config.port))?
    .run()
    .await
}
