//! Inference engine module
//!
//! Provides the batched inference data path:
//! - HWC to CHW layout conversion and batch assembly
//! - Adaptive bulk copy on the assembly hot path
//! - Self-resubmitting asynchronous request scheduling
//! - Top-k decoding of the output scores

pub mod backend;
pub mod batch;
pub mod decode;
pub mod device;
pub mod labels;
pub mod memcpy;
pub mod preprocess;
pub mod reference;
pub mod scheduler;

pub use backend::{
    AcceleratorBackend, AsyncInferRequest, BackendOptions, CompiledModel, InputShape, Model,
};
pub use batch::BatchTensor;
pub use decode::{decode, ClassificationResult, OutputTensor};
pub use device::OpenVinoBackend;
pub use preprocess::{to_plane_major, PlaneMajorBuffer, RawImage};
pub use reference::ReferenceBackend;
pub use scheduler::InferenceScheduler;

use crate::error::Result;

/// Backend for a device name; `REFERENCE` selects the CPU loopback device
pub fn backend_for_device(
    device: &str,
    options: &BackendOptions,
) -> Result<Box<dyn AcceleratorBackend>> {
    if device.eq_ignore_ascii_case(reference::REFERENCE_DEVICE) {
        Ok(Box::new(ReferenceBackend::new()))
    } else {
        Ok(Box::new(OpenVinoBackend::new(device, options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_device_selection() {
        let backend = backend_for_device("reference", &BackendOptions::default()).unwrap();
        assert_eq!(backend.name(), "REFERENCE");
    }
}
