//! Image loading utilities.

use std::path::Path;

use image::{ColorType, DynamicImage, ImageDecoder, ImageError};
use ndarray::Array3;

use crate::error::{Error, Result};

use super::{ImageMeta, ImageTensor, LoadedImage, RGB_CHANNELS};

/// Load an image from disk and split it into color and alpha planes.
///
/// The image is:
/// 1. Decoded from the specified path (format guessed from content)
/// 2. Converted to RGB(A) floats in [0, 1], keeping any ICC profile
/// 3. Returned as a `3 x H x W` tensor plus an optional `1 x H x W` alpha plane
///
/// # Errors
///
/// Returns an error if the image cannot be read or decoded.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<LoadedImage> {
    let path = path.as_ref();

    let load_error = |source: ImageError| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    };

    let mut decoder = image::ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()
        .map_err(load_error)?;
    let icc_profile = decoder.icc_profile().map_err(load_error)?;
    let img = DynamicImage::from_decoder(decoder).map_err(load_error)?;

    let meta = ImageMeta {
        filename: path.to_path_buf(),
        depth: bit_depth(img.color()),
        grayscale: false,
        icc_profile,
    };
    let (rgb, alpha) = image_to_tensors(&img);

    Ok(LoadedImage { rgb, alpha, meta })
}

const fn bit_depth(color: ColorType) -> u8 {
    match color {
        ColorType::L16
        | ColorType::La16
        | ColorType::Rgb16
        | ColorType::Rgba16
        | ColorType::Rgb32F
        | ColorType::Rgba32F => 16,
        _ => 8,
    }
}

/// Convert a `DynamicImage` to CHW color and alpha tensors.
#[allow(clippy::cast_possible_truncation)]
fn image_to_tensors(img: &DynamicImage) -> (ImageTensor, Option<ImageTensor>) {
    let rgba = img.to_rgba32f();
    let (width, height) = (rgba.width() as usize, rgba.height() as usize);

    let mut rgb = Array3::<f32>::zeros((RGB_CHANNELS, height, width));
    let mut alpha = img
        .color()
        .has_alpha()
        .then(|| Array3::<f32>::zeros((1, height, width)));

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            rgb[[c, y, x]] = pixel[c].clamp(0.0, 1.0);
        }
        if let Some(alpha) = alpha.as_mut() {
            alpha[[0, y, x]] = pixel[3].clamp(0.0, 1.0);
        }
    }

    (rgb, alpha)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    use super::*;

    #[test]
    fn test_tensor_shape_without_alpha() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, Rgb([255, 0, 51])));
        let (rgb, alpha) = image_to_tensors(&img);

        assert_eq!(rgb.dim(), (3, 2, 4));
        assert!(alpha.is_none());
        assert!((rgb[[0, 1, 3]] - 1.0).abs() < 1e-6);
        assert!((rgb[[2, 0, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_alpha_plane_split() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 3, Rgba([0, 0, 0, 255])));
        let (_, alpha) = image_to_tensors(&img);
        let alpha = alpha.unwrap();

        assert_eq!(alpha.dim(), (1, 3, 3));
        assert!(alpha.iter().all(|&a| (a - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_depth_and_decode_failure() {
        assert_eq!(bit_depth(ColorType::Rgb16), 16);
        assert_eq!(bit_depth(ColorType::Rgba8), 8);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(load_image(&path).is_err());
    }
}
