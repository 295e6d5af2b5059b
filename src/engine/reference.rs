//! Reference accelerator
//!
//! A CPU loopback backend with the same asynchronous contract as a device:
//! every submission runs on its own thread and reports through the
//! completion callback. Scores are a per-item histogram of byte values
//! modulo the class count, so a solid image of value `v` always ranks class
//! `v % num_classes` first. Selected with device `REFERENCE`.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::backend::{
    AcceleratorBackend, AsyncInferRequest, CompiledModel, CompletionCallback, InputShape, Model,
};
use super::batch::BatchTensor;
use super::decode::OutputTensor;
use crate::error::{DeviceError, Result};

pub const REFERENCE_DEVICE: &str = "REFERENCE";

#[derive(Debug, Clone)]
pub struct ReferenceBackend {
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
    num_classes: usize,
    num_inputs: usize,
    num_outputs: usize,
    fail_at: Option<usize>,
    latency: Duration,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self {
            batch: 0,
            channels: 3,
            height: 224,
            width: 224,
            num_classes: 1000,
            num_inputs: 1,
            num_outputs: 1,
            fail_at: None,
            latency: Duration::ZERO,
        }
    }

    pub fn with_input(mut self, channels: usize, height: usize, width: usize) -> Self {
        self.channels = channels;
        self.height = height;
        self.width = width;
        self
    }

    /// Declare a static batch; 0 (the default) accepts any batch size
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes.max(1);
        self
    }

    /// Declare a model with a different number of inputs and outputs
    pub fn with_io(mut self, num_inputs: usize, num_outputs: usize) -> Self {
        self.num_inputs = num_inputs;
        self.num_outputs = num_outputs;
        self
    }

    /// Make the `submission`-th submission (1-based) complete with a failure
    pub fn failing_at(mut self, submission: usize) -> Self {
        self.fail_at = Some(submission);
        self
    }

    /// Simulated time per inference
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn model(&self) -> ReferenceModel {
        ReferenceModel {
            config: self.clone(),
        }
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorBackend for ReferenceBackend {
    fn name(&self) -> &str {
        REFERENCE_DEVICE
    }

    fn read_model(&self, path: &Path) -> Result<Box<dyn Model>> {
        info!(
            "Reference device ignores model weights in {}, scoring {} classes",
            path.display(),
            self.num_classes
        );
        Ok(Box::new(self.model()))
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceModel {
    config: ReferenceBackend,
}

impl ReferenceModel {
    pub fn compile_reference(&self, batch_size: usize) -> ReferenceCompiledModel {
        ReferenceCompiledModel {
            config: self.config.clone(),
            batch_size,
        }
    }
}

impl Model for ReferenceModel {
    fn num_inputs(&self) -> usize {
        self.config.num_inputs
    }

    fn num_outputs(&self) -> usize {
        self.config.num_outputs
    }

    fn input_shape(&self) -> InputShape {
        InputShape {
            batch: self.config.batch,
            channels: self.config.channels,
            height: self.config.height,
            width: self.config.width,
        }
    }

    fn compile(&self, batch_size: usize) -> Result<Arc<dyn CompiledModel>> {
        self.input_shape().check_batch(batch_size)?;
        Ok(Arc::new(self.compile_reference(batch_size)))
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceCompiledModel {
    config: ReferenceBackend,
    batch_size: usize,
}

impl ReferenceCompiledModel {
    pub fn create_request(&self) -> Arc<ReferenceRequest> {
        Arc::new(ReferenceRequest {
            shared: Arc::new(RequestShared {
                batch_size: self.batch_size,
                item_size: self.config.channels * self.config.height * self.config.width,
                num_classes: self.config.num_classes,
                fail_at: self.config.fail_at,
                latency: self.config.latency,
                input: Mutex::new(None),
                output: Mutex::new(Vec::new()),
                callback: Mutex::new(None),
                submissions: AtomicUsize::new(0),
            }),
        })
    }
}

impl CompiledModel for ReferenceCompiledModel {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn create_infer_request(&self) -> Result<Arc<dyn AsyncInferRequest>> {
        Ok(self.create_request())
    }
}

struct RequestShared {
    batch_size: usize,
    item_size: usize,
    num_classes: usize,
    fail_at: Option<usize>,
    latency: Duration,
    input: Mutex<Option<Vec<u8>>>,
    output: Mutex<Vec<f32>>,
    callback: Mutex<Option<CompletionCallback>>,
    submissions: AtomicUsize,
}

impl RequestShared {
    fn infer(&self, submission: usize) -> std::result::Result<(), DeviceError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.fail_at == Some(submission) {
            return Err(DeviceError::new(format!(
                "reference device fault on submission {}",
                submission
            ))
            .at_iteration(submission));
        }

        let input = self.input.lock();
        let input = input
            .as_ref()
            .ok_or_else(|| DeviceError::new("no input tensor bound"))?;

        let mut scores = vec![0.0f32; self.batch_size * self.num_classes];
        for (item, row) in input
            .chunks(self.item_size.max(1))
            .zip(scores.chunks_mut(self.num_classes))
        {
            for &byte in item {
                row[byte as usize % self.num_classes] += 1.0;
            }
            if !item.is_empty() {
                let len = item.len() as f32;
                row.iter_mut().for_each(|s| *s /= len);
            }
        }

        *self.output.lock() = scores;
        Ok(())
    }
}

pub struct ReferenceRequest {
    shared: Arc<RequestShared>,
}

impl ReferenceRequest {
    /// Number of submissions accepted so far
    pub fn submissions(&self) -> usize {
        self.shared.submissions.load(Ordering::SeqCst)
    }
}

impl AsyncInferRequest for ReferenceRequest {
    fn set_input(&self, batch: &BatchTensor) -> Result<()> {
        let expected = self.shared.batch_size * self.shared.item_size;
        if batch.as_bytes().len() != expected {
            return Err(DeviceError::new(format!(
                "input tensor of {} bytes does not match compiled shape of {} bytes",
                batch.as_bytes().len(),
                expected
            ))
            .into());
        }
        *self.shared.input.lock() = Some(batch.as_bytes().to_vec());
        Ok(())
    }

    fn set_callback(&self, callback: CompletionCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    fn submit_async(&self) -> std::result::Result<(), DeviceError> {
        let submission = self.shared.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(&self.shared);

        thread::Builder::new()
            .name(format!("reference-infer-{}", submission))
            .spawn(move || {
                let outcome = shared.infer(submission);
                debug!("Reference submission {} finished: {:?}", submission, outcome);
                let callback = shared.callback.lock().clone();
                if let Some(callback) = callback {
                    callback(outcome);
                }
            })
            .map(|_| ())
            .map_err(|e| DeviceError::new(format!("failed to start inference thread: {}", e)))
    }

    fn output(&self) -> Result<OutputTensor> {
        let scores = self.shared.output.lock().clone();
        if scores.is_empty() {
            return Err(DeviceError::new("no completed inference to read").into());
        }
        OutputTensor::new(scores, self.shared.batch_size)
    }
}
