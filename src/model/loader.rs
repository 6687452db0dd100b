//! Persisted checkpoint layout.
//!
//! A model directory holds one descriptor per (method, noise level) pair:
//!
//! ```text
//! <model_dir>/scale2x.json
//! <model_dir>/noise{N}.json
//! <model_dir>/noise{N}_scale2x.json
//! ```
//!
//! Weight files referenced by a descriptor live beside it.

use std::path::{Path, PathBuf};

use crate::config::NoiseLevel;
use crate::error::{Error, Result};

use super::Checkpoint;

/// Which bundle of a model directory to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKey {
    /// 2x upscaling.
    Scale,
    /// Denoising at the given level, no scaling.
    Noise(NoiseLevel),
    /// Denoising and 2x upscaling in one pass.
    NoiseScale(NoiseLevel),
}

impl ModelKey {
    /// Descriptor file name for this bundle.
    #[must_use]
    pub fn filename(&self) -> String {
        match self {
            Self::Scale => "scale2x.json".to_string(),
            Self::Noise(level) => format!("noise{}.json", level.get()),
            Self::NoiseScale(level) => format!("noise{}_scale2x.json", level.get()),
        }
    }
}

/// A model directory on disk.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the descriptor for `key`.
    #[must_use]
    pub fn descriptor_path(&self, key: ModelKey) -> PathBuf {
        self.dir.join(key.filename())
    }

    /// Load the checkpoint for `key`.
    ///
    /// # Errors
    ///
    /// Returns `ModelNotFound` if the directory has no bundle for `key`, or
    /// an error if the descriptor is unreadable.
    pub fn load_checkpoint(&self, key: ModelKey) -> Result<Checkpoint> {
        let path = self.descriptor_path(key);
        if !path.is_file() {
            return Err(Error::ModelNotFound {
                name: key.filename(),
                dir: self.dir.clone(),
            });
        }
        Checkpoint::load(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{describe, Nearest, NearestConfig};

    #[test]
    fn test_filenames() {
        let level = NoiseLevel::new(2).unwrap();
        assert_eq!(ModelKey::Scale.filename(), "scale2x.json");
        assert_eq!(ModelKey::Noise(level).filename(), "noise2.json");
        assert_eq!(ModelKey::NoiseScale(level).filename(), "noise2_scale2x.json");
    }

    #[test]
    fn test_missing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let result = store.load_checkpoint(ModelKey::NoiseScale(NoiseLevel::new(3).unwrap()));

        assert!(matches!(result, Err(Error::ModelNotFound { name, .. }) if name == "noise3_scale2x.json"));
    }

    #[test]
    fn test_loads_matching_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        describe(&Nearest::new(NearestConfig { scale: 2 }).unwrap())
            .save(&store.descriptor_path(ModelKey::Scale))
            .unwrap();

        let checkpoint = store.load_checkpoint(ModelKey::Scale).unwrap();
        assert_eq!(checkpoint.descriptor.transform_id, "nearest");
        assert_eq!(checkpoint.bundle_dir, dir.path());
    }
}
