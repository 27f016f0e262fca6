pub mod config;
pub mod device;
pub mod encode;
pub mod error;
pub mod io_struct;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod service;

pub use config::{ConfigValidator, ModelConfig, ServerConfig};
pub use service::{DiffusionService, LoadState};
