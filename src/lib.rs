//! Batched Asynchronous Image Classification Library

pub mod config;
pub mod engine;
pub mod error;
pub mod service;
pub mod utils;

pub use config::Config;
pub use error::{DeviceError, PipelineError, Result};
pub use service::{ClassificationPipeline, ImageClassification};
