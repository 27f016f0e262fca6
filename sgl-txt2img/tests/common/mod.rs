// Shared by several test binaries; each uses a different subset.
#![allow(dead_code)]

pub mod fake_pipeline;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, http::StatusCode, test, web};
use sgl_txt2img_rs::config::{DEFAULT_MAX_PAYLOAD_SIZE, ModelConfig};
use sgl_txt2img_rs::pipeline::layout::REQUIRED_FILES;
use sgl_txt2img_rs::server;
use sgl_txt2img_rs::{DiffusionService, LoadState};
use tempfile::TempDir;

use fake_pipeline::FakeFactory;

/// Model directories on disk plus a service built over them.
pub struct TestContext {
    _models: TempDir,
    pub factory: Arc<FakeFactory>,
    pub service: Arc<DiffusionService>,
}

impl TestContext {
    /// Service over a complete base layout, with a refiner directory when asked.
    pub fn new(factory: FakeFactory, with_refiner: bool) -> Self {
        let models = tempfile::tempdir().unwrap();
        let model_dir = models.path().join("base");
        let refiner_dir = models.path().join("refiner");
        write_layout(&model_dir);
        if with_refiner {
            write_layout(&refiner_dir);
        }
        Self::with_dirs(models, factory, &model_dir, &refiner_dir)
    }

    /// Service whose base directory is empty, so loading fails.
    pub fn without_models(factory: FakeFactory) -> Self {
        let models = tempfile::tempdir().unwrap();
        let model_dir = models.path().join("base");
        let refiner_dir = models.path().join("refiner");
        fs::create_dir_all(&model_dir).unwrap();
        Self::with_dirs(models, factory, &model_dir, &refiner_dir)
    }

    fn with_dirs(models: TempDir, factory: FakeFactory, model_dir: &Path, refiner_dir: &Path) -> Self {
        let factory = Arc::new(factory);
        let config = ModelConfig {
            model_dir: model_dir.to_path_buf(),
            refiner_dir: refiner_dir.to_path_buf(),
            flash_attn: false,
        };
        let service = Arc::new(DiffusionService::new(config, factory.clone()));
        Self {
            _models: models,
            factory,
            service,
        }
    }

    /// Run the loader to completion.
    pub async fn load(&self) -> LoadState {
        Arc::clone(&self.service).init().await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        self.send(test::TestRequest::get().uri(uri)).await
    }

    pub async fn txt2img(&self, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        self.send(test::TestRequest::post().uri("/txt2img").set_json(body))
            .await
    }

    pub async fn send(&self, req: test::TestRequest) -> (StatusCode, serde_json::Value) {
        self.send_with_limit(req, DEFAULT_MAX_PAYLOAD_SIZE).await
    }

    /// Send through an app whose JSON body limit is `max_payload_size` bytes.
    pub async fn send_with_limit(
        &self,
        req: test::TestRequest,
        max_payload_size: usize,
    ) -> (StatusCode, serde_json::Value) {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(self.service.clone()))
                .app_data(server::json_config(max_payload_size))
                .configure(server::configure),
        )
        .await;
        let resp = test::call_service(&app, req.to_request()).await;
        let status = resp.status();
        let body = test::read_body(resp).await;
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }
}

pub fn write_layout(dir: &Path) {
    for rel in REQUIRED_FILES {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"{}").unwrap();
    }
}

/// Decode the `image_base64` field of a `/txt2img` response.
pub fn decode_image(body: &serde_json::Value) -> image::RgbImage {
    use base64::{Engine, engine::general_purpose::STANDARD};
    let bytes = STANDARD
        .decode(body["image_base64"].as_str().unwrap())
        .unwrap();
    image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)
        .unwrap()
        .to_rgb8()
}
