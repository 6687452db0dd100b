//! Checkpoint descriptors and the transformation registry.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::builtin::{BoxDenoise, Nearest};
use super::{Transform, TransformKind};

/// Self-describing record of a transformation: what to build and its geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Registry identifier of the transformation kind.
    pub transform_id: String,
    /// Named constructor arguments.
    pub params: Map<String, Value>,
    pub scale: u32,
    pub offset: u32,
    /// Advisory only.
    pub updated_at: DateTime<Utc>,
}

impl Descriptor {
    /// Read a descriptor from a JSON file.
    ///
    /// A parameter literally named `self` is constructor plumbing and is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let mut descriptor: Self =
            serde_json::from_str(&json).map_err(|source| Error::Serialization {
                path: path.to_path_buf(),
                source,
            })?;
        descriptor.params.remove("self");
        descriptor.updated_at = Utc::now();
        Ok(descriptor)
    }

    /// Write the descriptor as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| Error::Serialization {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json)?;
        tracing::debug!("Descriptor saved to {}", path.display());
        Ok(())
    }

    /// Build a fresh instance from this descriptor.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransformKind` or `InvalidParams` when the descriptor
    /// cannot be built, including when the built instance reports a geometry
    /// different from the recorded one.
    pub fn construct(&self) -> Result<Box<dyn Transform>> {
        let transform = construct(&self.transform_id, &self.params)?;
        let geometry = transform.geometry();
        if (geometry.scale, geometry.offset) != (self.scale, self.offset) {
            return Err(Error::invalid_params(
                &self.transform_id,
                format!(
                    "descriptor records scale {} offset {}, instance reports scale {} offset {}",
                    self.scale, self.offset, geometry.scale, geometry.offset
                ),
            ));
        }
        Ok(transform)
    }
}

/// Build a transformation from its kind identifier and constructor parameters.
///
/// # Errors
///
/// Returns `UnknownTransformKind` if `transform_id` is not registered and
/// `InvalidParams` if `params` do not fit the kind's constructor.
pub fn construct(transform_id: &str, params: &Map<String, Value>) -> Result<Box<dyn Transform>> {
    let kind = TransformKind::from_id(transform_id)?;
    match kind {
        TransformKind::Nearest => Ok(Box::new(Nearest::new(parse_params(kind, params)?)?)),
        TransformKind::BoxDenoise => Ok(Box::new(BoxDenoise::new(parse_params(kind, params)?)?)),
        #[cfg(feature = "onnx")]
        TransformKind::Onnx => Ok(Box::new(super::onnx::OnnxTransform::new(parse_params(
            kind, params,
        )?)?)),
        #[cfg(not(feature = "onnx"))]
        TransformKind::Onnx => Err(Error::invalid_params(
            kind.id(),
            "built without ONNX Runtime support",
        )),
    }
}

/// Capture a live instance as a descriptor.
#[must_use]
pub fn describe(transform: &dyn Transform) -> Descriptor {
    let geometry = transform.geometry();
    Descriptor {
        transform_id: transform.kind().id().to_string(),
        params: transform.params(),
        scale: geometry.scale,
        offset: geometry.offset,
        updated_at: Utc::now(),
    }
}

fn parse_params<T: DeserializeOwned>(kind: TransformKind, params: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|err| Error::invalid_params(kind.id(), err.to_string()))
}

/// A descriptor loaded from disk together with its bundle directory.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub descriptor: Descriptor,
    /// Directory holding the descriptor and any weight files it references.
    pub bundle_dir: PathBuf,
}

impl Checkpoint {
    /// Load a checkpoint descriptor file.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let descriptor = Descriptor::load(path)?;
        let bundle_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        tracing::info!(
            "Loaded checkpoint {} ({}, scale {}, offset {})",
            path.display(),
            descriptor.transform_id,
            descriptor.scale,
            descriptor.offset
        );
        Ok(Self {
            descriptor,
            bundle_dir,
        })
    }

    /// Build an instance with its weights attached.
    ///
    /// # Errors
    ///
    /// Returns an error if construction or weight loading fails.
    pub fn instantiate(&self) -> Result<Box<dyn Transform>> {
        let mut transform = self.descriptor.construct()?;
        transform.load_weights(&self.bundle_dir)?;
        Ok(transform)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{BoxDenoiseConfig, Geometry};

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test params must be an object"),
        }
    }

    #[test]
    fn test_describe_construct_round_trip() {
        let original = BoxDenoise::new(BoxDenoiseConfig {
            scale: 2,
            radius: 8,
        })
        .unwrap();
        let descriptor = describe(&original);
        assert_eq!(descriptor.transform_id, "box_denoise");
        assert_eq!((descriptor.scale, descriptor.offset), (2, 8));

        let rebuilt = construct(&descriptor.transform_id, &descriptor.params).unwrap();
        assert_eq!(rebuilt.geometry(), Geometry::new(2, 8));
        assert_eq!(rebuilt.params(), descriptor.params);
    }

    #[test]
    fn test_unknown_kind() {
        let result = construct("swin_unet", &Map::new());
        assert!(matches!(result, Err(Error::UnknownTransformKind { kind }) if kind == "swin_unet"));
    }

    #[test]
    fn test_invalid_params() {
        let missing = construct("nearest", &Map::new());
        assert!(matches!(missing, Err(Error::InvalidParams { .. })));

        let extra = construct("nearest", &params(json!({"scale": 2, "layers": 7})));
        assert!(matches!(extra, Err(Error::InvalidParams { .. })));
    }

    #[test]
    fn test_load_strips_self_and_checks_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scale2x.json");
        fs::write(
            &path,
            json!({
                "transform_id": "nearest",
                "params": {"self": null, "scale": 2},
                "scale": 2,
                "offset": 0,
                "updated_at": "2024-01-01T00:00:00Z"
            })
            .to_string(),
        )
        .unwrap();

        let checkpoint = Checkpoint::load(&path).unwrap();
        assert!(!checkpoint.descriptor.params.contains_key("self"));
        assert_eq!(checkpoint.bundle_dir, dir.path());
        assert_eq!(checkpoint.instantiate().unwrap().geometry(), Geometry::new(2, 0));

        let mut wrong = checkpoint.descriptor;
        wrong.offset = 4;
        assert!(matches!(wrong.construct(), Err(Error::InvalidParams { .. })));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("noise1.json");
        let descriptor = describe(
            &BoxDenoise::new(BoxDenoiseConfig {
                scale: 1,
                radius: 2,
            })
            .unwrap(),
        );
        descriptor.save(&path).unwrap();

        let loaded = Descriptor::load(&path).unwrap();
        assert_eq!(loaded.transform_id, descriptor.transform_id);
        assert_eq!(loaded.params, descriptor.params);
        assert_eq!((loaded.scale, loaded.offset), (1, 2));
    }
}
