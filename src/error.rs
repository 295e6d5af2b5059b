//! Error types for the classification pipeline

use thiserror::Error;

/// Failure reported by an accelerator backend.
///
/// Raised on the backend's completion thread and carried back to the
/// driving thread by value, so it must be `Clone + Send`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DeviceError {
    pub message: String,
    /// 1-based submission that failed, when known
    pub iteration: Option<usize>,
}

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            iteration: None,
        }
    }

    pub fn at_iteration(mut self, iteration: usize) -> Self {
        self.iteration.get_or_insert(iteration);
        self
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Shape mismatches, invalid parameters, missing configured files
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No usable input after decoding
    #[error("Input error: {0}")]
    Input(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }

    pub fn input(message: impl Into<String>) -> Self {
        PipelineError::Input(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
