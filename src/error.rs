//! Custom error types for waifu2x.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::Device;

/// Main error type for the waifu2x library.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad option or option combination, reported before any processing.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// No checkpoint bundle for the requested method and noise level.
    #[error("no model for {name} in {dir}")]
    ModelNotFound { name: String, dir: PathBuf },

    /// The checkpoint names a transformation kind outside the registry.
    #[error("unknown transform kind {kind:?}")]
    UnknownTransformKind { kind: String },

    /// The parameters do not fit the kind's constructor.
    #[error("invalid parameters for {kind}: {reason}")]
    InvalidParams { kind: String, reason: String },

    /// Tile size must be at least one pixel.
    #[error("invalid tile size {tile_size}: must be at least 1")]
    InvalidTileSize { tile_size: usize },

    /// An inference result does not have the shape the geometry promises.
    #[error("geometry mismatch: expected {expected:?}, got {actual:?}")]
    GeometryMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    /// The compute device cannot run the batch.
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: Device, reason: String },

    /// The batch did not fit in device memory.
    #[error("out of memory on device {device} (batch of {batch_size})")]
    OutOfMemory { device: Device, batch_size: usize },

    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to load an ONNX model.
    #[cfg(feature = "onnx")]
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// Model inference failed.
    #[cfg(feature = "onnx")]
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Checkpoint descriptor could not be read or written.
    #[error("invalid checkpoint descriptor {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Processing stopped by an interrupt before this job ran.
    #[error("cancelled")]
    Cancelled,

    /// An encode/write worker panicked.
    #[error("worker task panicked while writing {path}")]
    TaskPanicked { path: PathBuf },
}

impl Error {
    /// Whether this error leaves the run without anything valid to execute.
    ///
    /// Such errors abort a whole batch; all others are local to one file.
    #[must_use]
    pub const fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::ModelNotFound { .. }
                | Self::UnknownTransformKind { .. }
                | Self::InvalidParams { .. }
                | Self::InvalidTileSize { .. }
        )
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_params(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for waifu2x operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::config("bad extension").is_fatal_for_run());
        assert!(Error::UnknownTransformKind {
            kind: "vgg_7".to_string()
        }
        .is_fatal_for_run());
        assert!(!Error::GeometryMismatch {
            expected: (3, 4, 4),
            actual: (3, 2, 2)
        }
        .is_fatal_for_run());
        assert!(!Error::OutOfMemory {
            device: Device::Gpu(0),
            batch_size: 4
        }
        .is_fatal_for_run());
    }

    #[test]
    fn test_display_mentions_device() {
        let err = Error::DeviceUnavailable {
            device: Device::Gpu(1),
            reason: "lost".to_string(),
        };
        assert_eq!(err.to_string(), "device gpu:1 unavailable: lost");
    }
}
