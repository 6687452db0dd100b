//! ONNX Runtime backed transformations.

use std::path::{Path, PathBuf};

use half::f16;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::{to_params, BatchTensor, Device, Geometry, Precision, Transform, TransformKind};

/// Parameters of [`OnnxTransform`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnnxConfig {
    /// Model file, relative to the checkpoint bundle directory.
    pub weights: PathBuf,
    pub scale: u32,
    pub offset: u32,
    /// The graph exchanges half-precision tensors.
    #[serde(default)]
    pub fp16: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_name: Option<String>,
}

/// A transformation evaluated by an ONNX Runtime session.
///
/// The session is created lazily for the device the instance is placed on.
pub struct OnnxTransform {
    config: OnnxConfig,
    model_path: Option<PathBuf>,
    device: Device,
    session: Option<Session>,
}

impl OnnxTransform {
    /// # Errors
    ///
    /// Returns `InvalidParams` if `scale` is zero.
    pub fn new(config: OnnxConfig) -> Result<Self> {
        if config.scale == 0 {
            return Err(Error::invalid_params(
                TransformKind::Onnx.id(),
                "scale must be at least 1",
            ));
        }
        Ok(Self {
            config,
            model_path: None,
            device: Device::Cpu,
            session: None,
        })
    }

    fn session(&mut self) -> Result<&mut Session> {
        if self.session.is_none() {
            let path = self.model_path.clone().ok_or_else(|| Error::ModelNotFound {
                name: self.config.weights.display().to_string(),
                dir: PathBuf::from("<weights not loaded>"),
            })?;
            self.session = Some(build_session(&path, self.device)?);
        }
        self.session.as_mut().ok_or_else(|| Error::DeviceUnavailable {
            device: self.device,
            reason: "session not initialized".to_string(),
        })
    }

    fn run_f32(&mut self, input: BatchTensor) -> Result<BatchTensor> {
        let device = self.device;
        let batch_size = input.dim().0;
        let configured = self.config.input_name.clone();
        let session = self.session()?;
        let input_name = resolve_input_name(session, configured)?;
        let input_value =
            Tensor::from_array(input).map_err(|source| Error::Inference { source })?;

        let outputs = session
            .run(ort::inputs![input_name => input_value])
            .map_err(|source| classify(source, device, batch_size))?;

        let output = outputs.values().next().ok_or_else(|| Error::ShapeMismatch {
            expected: "image output".to_string(),
            actual: "no output".to_string(),
        })?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|source| Error::Inference { source })?;
        let dims: Vec<i64> = shape.iter().copied().collect();
        reshape4(&dims, data.to_vec())
    }

    fn run_f16(&mut self, input: &BatchTensor) -> Result<BatchTensor> {
        let device = self.device;
        let batch_size = input.dim().0;
        let configured = self.config.input_name.clone();
        let session = self.session()?;
        let input_name = resolve_input_name(session, configured)?;
        let input_value = Tensor::from_array(input.mapv(f16::from_f32))
            .map_err(|source| Error::Inference { source })?;

        let outputs = session
            .run(ort::inputs![input_name => input_value])
            .map_err(|source| classify(source, device, batch_size))?;

        let output = outputs.values().next().ok_or_else(|| Error::ShapeMismatch {
            expected: "image output".to_string(),
            actual: "no output".to_string(),
        })?;

        let (shape, data) = output
            .try_extract_tensor::<f16>()
            .map_err(|source| Error::Inference { source })?;
        let dims: Vec<i64> = shape.iter().copied().collect();
        reshape4(&dims, data.iter().map(|v| v.to_f32()).collect())
    }
}

impl Transform for OnnxTransform {
    fn kind(&self) -> TransformKind {
        TransformKind::Onnx
    }

    fn params(&self) -> Map<String, Value> {
        to_params(self.kind(), &self.config)
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.config.scale, self.config.offset)
    }

    fn forward(&mut self, mut input: BatchTensor, precision: Precision) -> Result<BatchTensor> {
        if self.config.fp16 {
            return self.run_f16(&input);
        }
        if precision == Precision::Reduced {
            super::builtin::quantize_half(&mut input);
        }
        self.run_f32(input)
    }

    fn place(&mut self, device: Device) -> Result<()> {
        if device != self.device {
            self.device = device;
            self.session = None;
        }
        if self.model_path.is_some() {
            self.session()?;
        }
        Ok(())
    }

    fn load_weights(&mut self, bundle_dir: &Path) -> Result<()> {
        let path = bundle_dir.join(&self.config.weights);
        if !path.is_file() {
            return Err(Error::ModelNotFound {
                name: self.config.weights.display().to_string(),
                dir: bundle_dir.to_path_buf(),
            });
        }
        self.model_path = Some(path);
        self.session = None;
        Ok(())
    }
}

fn build_session(path: &Path, device: Device) -> Result<Session> {
    let name = path.display().to_string();
    let builder = Session::builder().map_err(|source| Error::ModelLoad {
        name: name.clone(),
        source,
    })?;
    let builder = match device {
        Device::Cpu => builder,
        Device::Gpu(id) => with_accelerator(builder, id)?,
    };
    tracing::info!("Loading {name} on {device}...");
    builder
        .commit_from_file(path)
        .map_err(|source| Error::ModelLoad { name, source })
}

#[cfg(feature = "cuda")]
fn with_accelerator(
    builder: ort::session::builder::SessionBuilder,
    id: u32,
) -> Result<ort::session::builder::SessionBuilder> {
    use ort::execution_providers::CUDAExecutionProvider;

    let device_id = i32::try_from(id).map_err(|_| Error::DeviceUnavailable {
        device: Device::Gpu(id),
        reason: "device id out of range".to_string(),
    })?;
    builder
        .with_execution_providers([CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()
            .error_on_failure()])
        .map_err(|err| Error::DeviceUnavailable {
            device: Device::Gpu(id),
            reason: err.to_string(),
        })
}

#[cfg(not(feature = "cuda"))]
#[allow(clippy::needless_pass_by_value)]
fn with_accelerator(
    _builder: ort::session::builder::SessionBuilder,
    id: u32,
) -> Result<ort::session::builder::SessionBuilder> {
    Err(Error::DeviceUnavailable {
        device: Device::Gpu(id),
        reason: "built without the cuda feature".to_string(),
    })
}

fn resolve_input_name(session: &Session, configured: Option<String>) -> Result<String> {
    if let Some(name) = configured {
        return Ok(name);
    }
    session
        .inputs
        .first()
        .map(|input| input.name.clone())
        .ok_or_else(|| Error::ShapeMismatch {
            expected: "one image input".to_string(),
            actual: "no inputs".to_string(),
        })
}

/// Runtime allocation failures are retryable with a smaller batch.
fn classify(source: ort::Error, device: Device, batch_size: usize) -> Error {
    let message = source.to_string().to_lowercase();
    if message.contains("out of memory") || message.contains("failed to allocate") {
        tracing::warn!("{device}: {message}");
        return Error::OutOfMemory { device, batch_size };
    }
    Error::Inference { source }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn reshape4(shape: &[i64], data: Vec<f32>) -> Result<BatchTensor> {
    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape.iter().map(|&x| x as usize).collect();

    if dims.len() != 4 {
        return Err(Error::ShapeMismatch {
            expected: "4D tensor".to_string(),
            actual: format!("{}D tensor", dims.len()),
        });
    }

    Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), data).map_err(|_| {
        Error::ShapeMismatch {
            expected: format!("{dims:?}"),
            actual: "reshape failed".to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_params_round_trip() {
        let config: OnnxConfig = serde_json::from_value(json!({
            "weights": "noise0_scale2x.onnx",
            "scale": 2,
            "offset": 16,
            "fp16": true
        }))
        .unwrap();
        let transform = OnnxTransform::new(config.clone()).unwrap();

        let rebuilt: OnnxConfig =
            serde_json::from_value(Value::Object(transform.params())).unwrap();
        assert_eq!(rebuilt, config);
        assert_eq!(transform.geometry(), Geometry::new(2, 16));
    }

    #[test]
    fn test_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut transform = OnnxTransform::new(OnnxConfig {
            weights: PathBuf::from("scale2x.onnx"),
            scale: 2,
            offset: 8,
            fp16: false,
            input_name: None,
        })
        .unwrap();

        assert!(matches!(
            transform.load_weights(dir.path()),
            Err(Error::ModelNotFound { .. })
        ));
    }

    #[test]
    fn test_reshape_rejects_non_4d() {
        assert!(reshape4(&[2, 3], vec![0.0; 6]).is_err());
        assert_eq!(reshape4(&[1, 1, 2, 3], vec![0.0; 6]).unwrap().dim(), (1, 1, 2, 3));
    }
}
