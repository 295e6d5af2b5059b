//! OpenVINO accelerator backend
//!
//! Wraps an OpenVINO `Core` and exposes compiled models through the
//! asynchronous request contract. Each submission runs the blocking
//! `infer()` on a dedicated worker thread and reports completion through
//! the registered callback, the way a device plugin reports completion
//! from its own execution context.
//!
//! Models are compiled per batch with a u8 NCHW input tensor and an f32
//! output, so the batch bytes go to the device as assembled.

use std::borrow::Cow;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use openvino::prepostprocess::Pipeline as PrePostProcess;
use openvino::{
    CompiledModel as OvCompiledModel, Core, DeviceType, ElementType, InferRequest, InferenceError,
    Layout, Model as OvModel, RwPropertyKey, Shape, Tensor,
};
use parking_lot::Mutex;
use tracing::info;

use super::backend::{
    AcceleratorBackend, AsyncInferRequest, BackendOptions, CompiledModel, CompletionCallback,
    InputShape, Model,
};
use super::batch::BatchTensor;
use super::decode::OutputTensor;
use super::memcpy;
use crate::error::{DeviceError, PipelineError, Result};

/// Device that takes the architecture file
const FPGA_DEVICE: &str = "FPGA";

/// FPGA plugin property naming the architecture file
const ARCH_PATH_PROPERTY: &str = "ARCH_PATH";

/// Wrapper for OpenVINO Core that implements Send + Sync
pub struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

impl Deref for SafeCore {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SafeCore {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync.
///
/// The C++ compiled model is thread-safe; the Rust bindings take `&mut self`
/// for request creation, so access goes through a mutex.
#[derive(Clone)]
pub struct SafeCompiledModel(Arc<Mutex<OvCompiledModel>>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    fn create_infer_request(&self) -> std::result::Result<InferRequest, DeviceError> {
        self.0.lock().create_infer_request().map_err(device_error)
    }
}

struct SafeInferRequest(InferRequest);
unsafe impl Send for SafeInferRequest {}

struct SafeTensor(Tensor);
unsafe impl Send for SafeTensor {}

fn device_error(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::new(format!("OpenVINO: {}", e))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        PipelineError::configuration(format!("path {} is not UTF-8", path.display()))
    })
}

/// Architecture file to apply, only for devices naming `FPGA`
pub fn arch_path_for<'a>(device: &str, arch_file: Option<&'a Path>) -> Option<&'a Path> {
    arch_file.filter(|_| device.contains(FPGA_DEVICE))
}

pub struct OpenVinoBackend {
    core: Arc<Mutex<SafeCore>>,
    device: String,
}

impl OpenVinoBackend {
    pub fn new(device: &str, options: &BackendOptions) -> Result<Self> {
        let mut core = match &options.plugins {
            Some(plugins) => {
                let xml = path_str(plugins)?;
                info!("Using custom plugins xml file - {}", xml);
                Core::new_with_config(xml).map_err(device_error)?
            }
            None => Core::new().map_err(device_error)?,
        };

        if let Some(arch) = arch_path_for(device, options.arch_file.as_deref()) {
            let arch = path_str(arch)?;
            core.set_property(
                &DeviceType::from(FPGA_DEVICE),
                &RwPropertyKey::Other(Cow::Borrowed(ARCH_PATH_PROPERTY)),
                arch,
            )
            .map_err(device_error)?;
            info!("Architecture file {} set on {}", arch, FPGA_DEVICE);
        }

        Ok(Self {
            core: Arc::new(Mutex::new(SafeCore(core))),
            device: device.to_string(),
        })
    }
}

impl AcceleratorBackend for OpenVinoBackend {
    fn name(&self) -> &str {
        &self.device
    }

    fn read_model(&self, path: &Path) -> Result<Box<dyn Model>> {
        let xml = path_str(path)?;
        info!("Loading model files: {}", xml);

        // Core methods like read_model require &mut self in the Rust bindings
        let model = self
            .core
            .lock()
            .read_model_from_file(xml, "")
            .map_err(device_error)?;

        let num_inputs = model.get_inputs_len().map_err(device_error)?;
        let num_outputs = model.get_outputs_len().map_err(device_error)?;
        let input_shape = if num_inputs > 0 {
            let dims = input_dims(&model).map_err(device_error)?;
            InputShape::from_nchw(&dims).ok_or_else(|| {
                PipelineError::configuration(format!("model input {:?} is not NCHW", dims))
            })?
        } else {
            InputShape {
                batch: 0,
                channels: 0,
                height: 0,
                width: 0,
            }
        };

        info!(
            "Model read: {} input(s), {} output(s), input {:?}",
            num_inputs, num_outputs, input_shape
        );

        Ok(Box::new(OpenVinoModel {
            core: Arc::clone(&self.core),
            model: Arc::new(model),
            device: self.device.clone(),
            input_shape,
            num_inputs,
            num_outputs,
        }))
    }
}

/// Dimensions of the first input; dynamic ones are reported as -1
fn input_dims(model: &OvModel) -> std::result::Result<Vec<i64>, InferenceError> {
    let shape = model.get_input_by_index(0)?.get_partial_shape()?;
    Ok(shape
        .get_dimensions()
        .iter()
        .map(|d| if d.is_dynamic() { -1 } else { d.get_min() })
        .collect())
}

/// Model with a u8 NCHW input of shape `dims` and an f32 output
fn with_preprocessing(
    model: &OvModel,
    dims: &[i64],
) -> std::result::Result<OvModel, InferenceError> {
    let template = Tensor::new(ElementType::U8, &Shape::new(dims)?)?;
    let ppp = PrePostProcess::new(model)?;

    let input = ppp.get_input_info_by_index(0)?;
    let mut tensor_info = input.get_tensor_info()?;
    tensor_info.set_from(&template)?;
    tensor_info.set_layout(Layout::new("NCHW")?)?;
    input.get_model_info()?.set_layout(Layout::new("NCHW")?)?;

    ppp.get_output_info_by_index(0)?
        .get_tensor_info()?
        .set_element_type(ElementType::F32)?;

    ppp.build_new_model()
}

pub struct OpenVinoModel {
    core: Arc<Mutex<SafeCore>>,
    model: Arc<OvModel>,
    device: String,
    input_shape: InputShape,
    num_inputs: usize,
    num_outputs: usize,
}

impl Model for OpenVinoModel {
    fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn compile(&self, batch_size: usize) -> Result<Arc<dyn CompiledModel>> {
        self.input_shape.check_batch(batch_size)?;

        let shape = self.input_shape;
        let dims = [
            batch_size as i64,
            shape.channels as i64,
            shape.height as i64,
            shape.width as i64,
        ];
        let prepared = with_preprocessing(&self.model, &dims).map_err(device_error)?;

        let start = Instant::now();
        let compiled = self
            .core
            .lock()
            .compile_model(&prepared, self.device.as_str().into())
            .map_err(device_error)?;
        info!(
            "Model compiled for {} in {:?} (batch {})",
            self.device,
            start.elapsed(),
            batch_size
        );

        Ok(Arc::new(OpenVinoCompiledModel {
            compiled: SafeCompiledModel(Arc::new(Mutex::new(compiled))),
            batch_size,
        }))
    }
}

pub struct OpenVinoCompiledModel {
    compiled: SafeCompiledModel,
    batch_size: usize,
}

impl CompiledModel for OpenVinoCompiledModel {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn create_infer_request(&self) -> Result<Arc<dyn AsyncInferRequest>> {
        let request = self.compiled.create_infer_request()?;
        Ok(Arc::new(OpenVinoRequest {
            shared: Arc::new(RequestShared {
                request: Mutex::new(SafeInferRequest(request)),
                input: Mutex::new(None),
                callback: Mutex::new(None),
                batch_size: self.batch_size,
            }),
        }))
    }
}

struct RequestShared {
    request: Mutex<SafeInferRequest>,
    // kept alive for as long as the request may read it
    input: Mutex<Option<SafeTensor>>,
    callback: Mutex<Option<CompletionCallback>>,
    batch_size: usize,
}

pub struct OpenVinoRequest {
    shared: Arc<RequestShared>,
}

impl AsyncInferRequest for OpenVinoRequest {
    fn set_input(&self, batch: &BatchTensor) -> Result<()> {
        let dims: Vec<i64> = batch.shape().iter().map(|&d| d as i64).collect();
        let shape = Shape::new(&dims).map_err(device_error)?;
        let mut tensor = Tensor::new(ElementType::U8, &shape).map_err(device_error)?;

        let bytes = batch.as_bytes();
        let data = tensor.get_raw_data_mut().map_err(device_error)?;
        memcpy::copy(data, bytes, bytes.len());

        let mut input = self.shared.input.lock();
        let SafeTensor(bound) = input.insert(SafeTensor(tensor));
        self.shared
            .request
            .lock()
            .0
            .set_input_tensor(bound)
            .map_err(device_error)?;
        Ok(())
    }

    fn set_callback(&self, callback: CompletionCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    fn submit_async(&self) -> std::result::Result<(), DeviceError> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("openvino-infer".to_string())
            .spawn(move || {
                let outcome = {
                    let mut request = shared.request.lock();
                    request.0.infer().map_err(device_error)
                };
                let callback = shared.callback.lock().clone();
                if let Some(callback) = callback {
                    callback(outcome);
                }
            })
            .map(|_| ())
            .map_err(|e| DeviceError::new(format!("failed to start inference thread: {}", e)))
    }

    fn output(&self) -> Result<OutputTensor> {
        let request = self.shared.request.lock();
        let output = request.0.get_output_tensor().map_err(device_error)?;

        let element_type = output.get_element_type().map_err(device_error)?;
        if element_type != ElementType::F32 {
            return Err(DeviceError::new(format!(
                "output tensor holds {}, expected f32",
                element_type
            ))
            .into());
        }

        let raw = output.get_raw_data().map_err(device_error)?;
        let scores: Vec<f32> = raw
            .chunks_exact(std::mem::size_of::<f32>())
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        OutputTensor::new(scores, self.shared.batch_size)
    }
}
