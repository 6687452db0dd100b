//! # waifu2x
//!
//! Tiled, batched image upscaling and denoising.
//!
//! A transformation is any image-to-image function that declares its scale
//! factor and border offset. The library cuts images into tiles with enough
//! context for that offset, runs them through the transformation in batches
//! (optionally under 8-way test-time augmentation and in half precision),
//! stitches the results, and streams whole directories through a bounded
//! load queue and a pool of writer threads.
//!
//! ## Example
//!
//! ```no_run
//! use waifu2x::config::ConvertOptions;
//! use waifu2x::model::{Device, ModelStore};
//! use waifu2x::pipeline::{convert_file, BatchOptions, Converter};
//!
//! # fn main() -> waifu2x::Result<()> {
//! let store = ModelStore::new("models/swin_unet/art");
//! let converter = Converter::new(&store, &[Device::Cpu], ConvertOptions::default())?;
//!
//! convert_file(
//!     &converter,
//!     "input.png".as_ref(),
//!     "output.png".as_ref(),
//!     &BatchOptions::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;
pub mod tiling;

pub use error::{Error, Result};
