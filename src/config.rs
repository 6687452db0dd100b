//! Conversion settings and model directory lookup.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{ModelKey, Precision};

/// Denoising strength, 0 (weakest) to 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NoiseLevel(u8);

impl NoiseLevel {
    pub const MAX: u8 = 3;

    /// # Errors
    ///
    /// Returns a `Config` error for levels above 3.
    pub fn new(level: u8) -> Result<Self> {
        if level > Self::MAX {
            return Err(Error::config(format!(
                "noise level {level} out of range 0-{}",
                Self::MAX
            )));
        }
        Ok(Self(level))
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

/// What a conversion does to an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Scale,
    Noise,
    NoiseScale,
    Scale4x,
    NoiseScale4x,
}

impl Method {
    /// Transformation passes over the color planes, in order.
    #[must_use]
    pub fn passes(self, level: NoiseLevel) -> Vec<ModelKey> {
        match self {
            Self::Scale => vec![ModelKey::Scale],
            Self::Noise => vec![ModelKey::Noise(level)],
            Self::NoiseScale => vec![ModelKey::NoiseScale(level)],
            Self::Scale4x => vec![ModelKey::Scale, ModelKey::Scale],
            Self::NoiseScale4x => vec![ModelKey::NoiseScale(level), ModelKey::Scale],
        }
    }

    /// Passes over the alpha plane: scaling only, never denoising.
    #[must_use]
    pub fn alpha_passes(self) -> Vec<ModelKey> {
        match self {
            Self::Noise => Vec::new(),
            Self::Scale | Self::NoiseScale => vec![ModelKey::Scale],
            Self::Scale4x | Self::NoiseScale4x => vec![ModelKey::Scale, ModelKey::Scale],
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scale" | "scale2x" => Ok(Self::Scale),
            "noise" => Ok(Self::Noise),
            "noise_scale" | "noise_scale2x" => Ok(Self::NoiseScale),
            "scale4x" => Ok(Self::Scale4x),
            "noise_scale4x" => Ok(Self::NoiseScale4x),
            other => Err(Error::config(format!("unknown method {other:?}"))),
        }
    }
}

/// Family of pretrained models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Style {
    #[default]
    Art,
    ArtScan,
    Photo,
}

impl FromStr for Style {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "art" => Ok(Self::Art),
            "scan" | "art_scan" => Ok(Self::ArtScan),
            "photo" => Ok(Self::Photo),
            other => Err(Error::config(format!("unknown style {other:?}"))),
        }
    }
}

/// Style to model directory table, built once at startup.
#[derive(Debug, Clone)]
pub struct ModelDirectories {
    dirs: HashMap<Style, PathBuf>,
}

impl ModelDirectories {
    /// Standard layout under `root`: `swin_unet/{art,art_scan,photo}`.
    #[must_use]
    pub fn with_root(root: &Path) -> Self {
        let base = root.join("swin_unet");
        let dirs = HashMap::from([
            (Style::Art, base.join("art")),
            (Style::ArtScan, base.join("art_scan")),
            (Style::Photo, base.join("photo")),
        ]);
        Self { dirs }
    }

    /// Default root for pretrained models.
    ///
    /// - Linux: `~/.local/share/waifu2x/pretrained_models`
    /// - macOS: `~/Library/Application Support/waifu2x/pretrained_models`
    /// - Windows: `%APPDATA%\waifu2x\pretrained_models`
    #[must_use]
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("waifu2x")
            .join("pretrained_models")
    }

    /// Directory for `style`.
    #[must_use]
    pub fn get(&self, style: Style) -> Option<&Path> {
        self.dirs.get(&style).map(PathBuf::as_path)
    }

    /// Resolve the model directory: an explicit directory wins over the style table.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the table has no entry for `style`.
    pub fn resolve(&self, explicit: Option<&Path>, style: Style) -> Result<PathBuf> {
        if let Some(dir) = explicit {
            return Ok(dir.to_path_buf());
        }
        self.get(style)
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::config(format!("no model directory for style {style:?}")))
    }
}

impl Default for ModelDirectories {
    fn default() -> Self {
        Self::with_root(&Self::default_root())
    }
}

/// Encoded output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputFormat {
    #[default]
    Png,
    Webp,
    Jpeg,
}

impl OutputFormat {
    /// Recognize an output file extension.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for anything but png, webp, jpeg or jpg.
    pub fn from_extension(ext: &str) -> Result<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            other => Err(Error::config(format!(
                "unable to recognize image extension: {other}"
            ))),
        }
    }

    /// Format implied by a path's extension.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the extension is missing or unsupported.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::from_extension(ext)
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Settings for converting one image.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub method: Method,
    pub noise_level: NoiseLevel,
    /// Tile edge length in source pixels.
    pub tile_size: usize,
    /// Tiles per physical batch.
    pub batch_size: usize,
    /// Test-time augmentation.
    pub tta: bool,
    pub precision: Precision,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            method: Method::NoiseScale,
            noise_level: NoiseLevel::default(),
            tile_size: 256,
            batch_size: 4,
            tta: false,
            precision: Precision::Reduced,
        }
    }
}

impl ConvertOptions {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(Error::InvalidTileSize {
                tile_size: self.tile_size,
            });
        }

        if self.batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }

        Ok(())
    }

    /// Smaller settings for a retry after running out of memory.
    ///
    /// Halves the batch size, or the tile size once batches are single tiles.
    /// Returns `None` when neither can shrink.
    #[must_use]
    pub fn shrunk(&self) -> Option<Self> {
        if self.batch_size > 1 {
            Some(Self {
                batch_size: self.batch_size / 2,
                ..self.clone()
            })
        } else if self.tile_size > 1 {
            Some(Self {
                tile_size: self.tile_size / 2,
                ..self.clone()
            })
        } else {
            None
        }
    }
}
