//! Image loading, saving, and input listing.

mod list;
mod load;
mod save;

use std::path::PathBuf;

pub use list::{is_list_file, list_images, load_list_file, output_filename};
pub use load::load_image;
pub use save::save_image;

use ndarray::Array3;

/// Image planes in CHW format with values in [0, 1].
pub type ImageTensor = Array3<f32>;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;

/// JPEG quality used for encoded output (1-100).
pub const JPEG_QUALITY: u8 = 95;

/// Per-file details carried from decode to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub filename: PathBuf,
    /// Bits per channel, 8 or 16.
    pub depth: u8,
    /// Write the output as luma only.
    pub grayscale: bool,
    /// Embedded color profile, written back unchanged.
    pub icc_profile: Option<Vec<u8>>,
}

/// A decoded image, alpha kept as its own plane.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// `3 x H x W`.
    pub rgb: ImageTensor,
    /// `1 x H x W`, present when the source has an alpha channel.
    pub alpha: Option<ImageTensor>,
    pub meta: ImageMeta,
}

impl LoadedImage {
    /// `(width, height)` in pixels.
    #[must_use]
    pub fn dimensions(&self) -> (usize, usize) {
        let (_, h, w) = self.rgb.dim();
        (w, h)
    }
}
