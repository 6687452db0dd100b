//! Image saving utilities.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageBuffer, ImageEncoder, ImageResult, Luma, LumaA, Pixel, Rgb, Rgba};

use crate::config::OutputFormat;
use crate::error::{Error, Result};

use super::{ImageMeta, ImageTensor, JPEG_QUALITY};

/// Encode color and optional alpha planes to `path`.
///
/// The planes are:
/// 1. Clamped to [0, 1] and quantized to the depth in `meta` (16 bits only for PNG)
/// 2. Reduced to luma if `meta.grayscale` is set
/// 3. Written in `format` with the source ICC profile; JPEG drops the alpha plane
///
/// # Arguments
///
/// * `rgb` - `3 x H x W` tensor with values in [0, 1]
/// * `alpha` - optional `1 x H x W` plane of the same size
/// * `path` - Output file path
/// * `meta` - Source metadata (depth, grayscale, ICC profile)
/// * `format` - Output encoding
///
/// # Errors
///
/// Returns an error if the image cannot be saved.
pub fn save_image<P: AsRef<Path>>(
    rgb: &ImageTensor,
    alpha: Option<&ImageTensor>,
    path: P,
    meta: &ImageMeta,
    format: OutputFormat,
) -> Result<()> {
    let path = path.as_ref();
    let alpha = match format {
        OutputFormat::Jpeg => None,
        OutputFormat::Png | OutputFormat::Webp => alpha,
    };
    let wide = meta.depth > 8 && format == OutputFormat::Png;

    let img = match (wide, meta.grayscale, alpha) {
        (true, true, Some(a)) => DynamicImage::ImageLumaA16(build(rgb, Some(a), luma_alpha_16)),
        (true, true, None) => DynamicImage::ImageLuma16(build(rgb, None, luma_16)),
        (true, false, Some(a)) => DynamicImage::ImageRgba16(build(rgb, Some(a), rgba_16)),
        (true, false, None) => DynamicImage::ImageRgb16(build(rgb, None, rgb_16)),
        (false, true, Some(a)) => DynamicImage::ImageLumaA8(build(rgb, Some(a), luma_alpha_8)),
        (false, true, None) => DynamicImage::ImageLuma8(build(rgb, None, luma_8)),
        (false, false, Some(a)) => DynamicImage::ImageRgba8(build(rgb, Some(a), rgba_8)),
        (false, false, None) => DynamicImage::ImageRgb8(build(rgb, None, rgb_8)),
    };

    let mut output = BufWriter::new(File::create(path)?);
    let icc = meta.icc_profile.as_deref();
    let encoded = match format {
        OutputFormat::Jpeg => encode(
            &img,
            JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY),
            icc,
        ),
        OutputFormat::Webp => {
            // WebP output is 8-bit color; grayscale is stored as equal channels.
            let img = if alpha.is_some() {
                DynamicImage::ImageRgba8(img.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(img.to_rgb8())
            };
            encode(&img, WebPEncoder::new_lossless(&mut output), icc)
        }
        OutputFormat::Png => encode(&img, PngEncoder::new(&mut output), icc),
    };

    encoded.map_err(|source| Error::ImageSave {
        path: path.to_path_buf(),
        source,
    })?;
    output.flush()?;
    Ok(())
}

fn encode<E: ImageEncoder>(img: &DynamicImage, mut encoder: E, icc: Option<&[u8]>) -> ImageResult<()> {
    if let Some(profile) = icc {
        if let Err(err) = encoder.set_icc_profile(profile.to_vec()) {
            tracing::debug!("ICC profile dropped: {err}");
        }
    }
    img.write_with_encoder(encoder)
}

/// Assemble an image buffer pixel by pixel from `[r, g, b, a]` samples.
#[allow(clippy::cast_possible_truncation)]
fn build<P, F>(rgb: &ImageTensor, alpha: Option<&ImageTensor>, pixel: F) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel,
    F: Fn([f32; 4]) -> P,
{
    let (_, height, width) = rgb.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        pixel([
            rgb[[0, y, x]],
            rgb[[1, y, x]],
            rgb[[2, y, x]],
            alpha.map_or(1.0, |a| a[[0, y, x]]),
        ])
    })
}

/// Standard luminosity formula: 0.299*R + 0.587*G + 0.114*B
fn luma([r, g, b, _]: [f32; 4]) -> f32 {
    0.299_f32.mul_add(r, 0.587_f32.mul_add(g, 0.114 * b))
}

/// Quantize a value in [0, 1] to [0, 255] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize8(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Quantize a value in [0, 1] to [0, 65535] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize16(value: f32) -> u16 {
    // Safe: clamped to [0, 65535] range before casting
    (value.clamp(0.0, 1.0) * 65535.0).round() as u16
}

fn rgb_8(v: [f32; 4]) -> Rgb<u8> {
    Rgb([quantize8(v[0]), quantize8(v[1]), quantize8(v[2])])
}

fn rgba_8(v: [f32; 4]) -> Rgba<u8> {
    Rgba([quantize8(v[0]), quantize8(v[1]), quantize8(v[2]), quantize8(v[3])])
}

fn luma_8(v: [f32; 4]) -> Luma<u8> {
    Luma([quantize8(luma(v))])
}

fn luma_alpha_8(v: [f32; 4]) -> LumaA<u8> {
    LumaA([quantize8(luma(v)), quantize8(v[3])])
}

fn rgb_16(v: [f32; 4]) -> Rgb<u16> {
    Rgb([quantize16(v[0]), quantize16(v[1]), quantize16(v[2])])
}

fn rgba_16(v: [f32; 4]) -> Rgba<u16> {
    Rgba([quantize16(v[0]), quantize16(v[1]), quantize16(v[2]), quantize16(v[3])])
}

fn luma_16(v: [f32; 4]) -> Luma<u16> {
    Luma([quantize16(luma(v))])
}

fn luma_alpha_16(v: [f32; 4]) -> LumaA<u16> {
    LumaA([quantize16(luma(v)), quantize16(v[3])])
}
