//! Accelerator backend contract
//!
//! The pipeline only needs a small slice of an accelerator runtime: read a
//! model, compile it for a batch size, and drive one reusable request whose
//! completion is reported through a callback on a backend-owned thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::batch::BatchTensor;
use super::decode::OutputTensor;
use crate::error::{DeviceError, PipelineError, Result};

/// Completion handler, invoked by the backend once per finished submission
pub type CompletionCallback = Arc<dyn Fn(std::result::Result<(), DeviceError>) + Send + Sync>;

/// NCHW input geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    /// Build from NCHW dimensions as reported by a runtime.
    ///
    /// A dynamic (negative) batch dimension is reported as 0.
    pub fn from_nchw(dims: &[i64]) -> Option<Self> {
        match dims {
            [n, c, h, w] if *c >= 0 && *h >= 0 && *w >= 0 => Some(Self {
                batch: (*n).max(0) as usize,
                channels: *c as usize,
                height: *h as usize,
                width: *w as usize,
            }),
            _ => None,
        }
    }

    pub fn item_size(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Whether a batch of `batch_size` images fits the declared batch.
    ///
    /// A dynamic batch (0) takes any size; a static one must match exactly.
    pub fn check_batch(&self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(PipelineError::configuration("batch size must be at least 1"));
        }
        if self.batch != 0 && self.batch != batch_size {
            return Err(PipelineError::configuration(format!(
                "model has a static batch of {}, {} images were given",
                self.batch, batch_size
            )));
        }
        Ok(())
    }
}

/// Device setup files handed to a backend when it is created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions {
    /// Custom plugins xml file
    pub plugins: Option<PathBuf>,
    /// Architecture file, applied to FPGA devices
    pub arch_file: Option<PathBuf>,
}

/// One reusable asynchronous inference request.
///
/// `submit_async` must return without waiting for the inference and must not
/// invoke the callback on the calling thread.
pub trait AsyncInferRequest: Send + Sync {
    /// Bind the batch as the request input
    fn set_input(&self, batch: &BatchTensor) -> Result<()>;

    /// Replace the completion handler
    fn set_callback(&self, callback: CompletionCallback);

    /// Start one inference; completion is reported through the callback
    fn submit_async(&self) -> std::result::Result<(), DeviceError>;

    /// Scores of the last completed inference
    fn output(&self) -> Result<OutputTensor>;
}

/// A model compiled for a fixed batch size
pub trait CompiledModel: Send + Sync {
    fn batch_size(&self) -> usize;

    fn create_infer_request(&self) -> Result<Arc<dyn AsyncInferRequest>>;
}

/// A model read by a backend, not yet compiled for a batch
pub trait Model: Send + Sync {
    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;

    /// Input geometry; the batch dimension is whatever the model file declares
    fn input_shape(&self) -> InputShape;

    fn compile(&self, batch_size: usize) -> Result<Arc<dyn CompiledModel>>;
}

pub trait AcceleratorBackend: Send + Sync {
    fn name(&self) -> &str;

    fn read_model(&self, path: &Path) -> Result<Box<dyn Model>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_shape_from_nchw() {
        let shape = InputShape::from_nchw(&[1, 3, 224, 200]).unwrap();
        assert_eq!(shape.channels, 3);
        assert_eq!(shape.height, 224);
        assert_eq!(shape.width, 200);
        assert_eq!(shape.item_size(), 3 * 224 * 200);

        assert!(InputShape::from_nchw(&[1, 3, 224]).is_none());
        assert!(InputShape::from_nchw(&[1, -1, 224, 224]).is_none());
        assert_eq!(InputShape::from_nchw(&[-1, 3, 8, 8]).unwrap().batch, 0);
    }

    #[test]
    fn test_check_batch() {
        let dynamic = InputShape::from_nchw(&[-1, 3, 8, 8]).unwrap();
        assert!(dynamic.check_batch(1).is_ok());
        assert!(dynamic.check_batch(7).is_ok());
        assert!(matches!(
            dynamic.check_batch(0),
            Err(PipelineError::Configuration(_))
        ));

        let fixed = InputShape::from_nchw(&[4, 3, 8, 8]).unwrap();
        assert!(fixed.check_batch(4).is_ok());
        assert!(matches!(
            fixed.check_batch(3),
            Err(PipelineError::Configuration(_))
        ));
    }
}
