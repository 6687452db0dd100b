//! Image-to-image transformations and their checkpoint contract.
//!
//! Every transformation declares its [`Geometry`]: how much it scales its
//! input and how many output pixels along each border are unreliable. The
//! tiler depends only on that, never on what the transformation computes.

mod builtin;
mod descriptor;
mod loader;
#[cfg(feature = "onnx")]
mod onnx;

use std::fmt;
use std::path::Path;

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub use builtin::{BoxDenoise, BoxDenoiseConfig, Nearest, NearestConfig};
pub use descriptor::{construct, describe, Checkpoint, Descriptor};
pub use loader::{ModelKey, ModelStore};
#[cfg(feature = "onnx")]
pub use onnx::{OnnxConfig, OnnxTransform};

/// Batch of images in NCHW format with values in [0, 1].
pub type BatchTensor = Array4<f32>;

/// Spatial contract of a transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Output size = input size x `scale`.
    pub scale: u32,
    /// Context pixels the transformation needs on each side of a tile.
    pub offset: u32,
}

impl Geometry {
    #[must_use]
    pub const fn new(scale: u32, offset: u32) -> Self {
        Self { scale, offset }
    }

    #[must_use]
    pub const fn scale(&self) -> usize {
        self.scale as usize
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset as usize
    }
}

/// Numeric precision for the internal computation of a forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Full,
    /// Half precision. Output shape is unchanged; values may differ by about 1e-3.
    Reduced,
}

/// Compute device a transformation instance is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// General-purpose fallback path.
    Cpu,
    /// Accelerator by ordinal.
    Gpu(u32),
}

impl Device {
    /// Sentinel id meaning "no accelerator".
    pub const CPU_ID: i32 = -1;

    /// Map a CLI device id to a device; negative ids mean CPU.
    #[must_use]
    pub fn from_id(id: i32) -> Self {
        u32::try_from(id).map_or(Self::Cpu, Self::Gpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu(id) => write!(f, "gpu:{id}"),
        }
    }
}

/// Closed set of transformation kinds a checkpoint may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Nearest-neighbour replication.
    Nearest,
    /// Box filter denoise followed by nearest upscale.
    BoxDenoise,
    /// ONNX Runtime session.
    Onnx,
}

impl TransformKind {
    pub const ALL: [Self; 3] = [Self::Nearest, Self::BoxDenoise, Self::Onnx];

    /// Identifier stored in checkpoint descriptors.
    #[must_use]
    pub const fn id(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::BoxDenoise => "box_denoise",
            Self::Onnx => "onnx",
        }
    }

    /// Look up a kind by its descriptor identifier.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransformKind` for identifiers outside the registry.
    pub fn from_id(id: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() == id)
            .ok_or_else(|| Error::UnknownTransformKind {
                kind: id.to_string(),
            })
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// An image-to-image transformation the pipeline can run.
///
/// Instances are built by [`construct`] from a kind and its parameters and
/// are driven through `&mut self`: the device pool guarantees one caller at
/// a time per instance.
pub trait Transform: Send {
    fn kind(&self) -> TransformKind;

    /// Constructor parameters, sufficient to rebuild an equivalent instance.
    fn params(&self) -> Map<String, Value>;

    fn geometry(&self) -> Geometry;

    /// Run the transformation on an NCHW batch.
    ///
    /// The result must be `N x C x (H * scale) x (W * scale)`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` or `DeviceUnavailable` when the device cannot run
    /// the batch, or any runtime failure.
    fn forward(&mut self, input: BatchTensor, precision: Precision) -> Result<BatchTensor>;

    /// Move execution onto `device`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the device cannot host this instance.
    fn place(&mut self, device: Device) -> Result<()>;

    /// Attach weights stored in the checkpoint bundle directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights are missing or unreadable.
    fn load_weights(&mut self, _bundle_dir: &Path) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn to_params<T: Serialize>(kind: TransformKind, config: &T) -> Map<String, Value> {
    match serde_json::to_value(config) {
        Ok(Value::Object(map)) => map,
        other => {
            tracing::warn!("{kind} parameters did not serialize to an object: {other:?}");
            Map::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_from_id() {
        assert_eq!(Device::from_id(Device::CPU_ID), Device::Cpu);
        assert_eq!(Device::from_id(0), Device::Gpu(0));
        assert_eq!(Device::from_id(3), Device::Gpu(3));
    }

    #[test]
    fn test_kind_ids_round_trip() {
        for kind in TransformKind::ALL {
            assert_eq!(TransformKind::from_id(kind.id()).unwrap(), kind);
        }
        assert!(matches!(
            TransformKind::from_id("upconv_7"),
            Err(Error::UnknownTransformKind { .. })
        ));
    }
}
