//! Whole-image conversion: method passes over tiled, batched inference.

use std::collections::HashMap;
use std::path::PathBuf;

use ndarray::{ArrayView3, Axis};

use crate::config::ConvertOptions;
use crate::error::{Error, Result};
use crate::image::{ImageTensor, RGB_CHANNELS};
use crate::model::{Device, ModelKey, ModelStore};
use crate::tiling::{Tile, TilePlan};

use super::device::DevicePool;
use super::inference::{infer_batch, InferenceOptions};
use super::queue::CancelFlag;

/// Result of converting one image.
#[derive(Debug, Clone)]
pub struct ConvertedImage {
    pub rgb: ImageTensor,
    pub alpha: Option<ImageTensor>,
}

/// Runs the configured method over images, one device pool per model.
#[derive(Debug)]
pub struct Converter {
    options: ConvertOptions,
    pools: HashMap<ModelKey, DevicePool>,
    model_dir: PathBuf,
    cancel: CancelFlag,
}

impl Converter {
    /// Load every model the configured method needs onto `devices`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid, a model is missing or
    /// cannot be built, or no device can host it.
    pub fn new(store: &ModelStore, devices: &[Device], options: ConvertOptions) -> Result<Self> {
        options.validate()?;
        let mut pools = HashMap::new();
        let keys = options
            .method
            .passes(options.noise_level)
            .into_iter()
            .chain(options.method.alpha_passes());
        for key in keys {
            if pools.contains_key(&key) {
                continue;
            }
            let checkpoint = store.load_checkpoint(key)?;
            pools.insert(key, DevicePool::new(&checkpoint, devices)?);
        }
        tracing::info!(
            "Converter ready: {:?}, {} model(s) on {:?}",
            options.method,
            pools.len(),
            devices
        );
        Ok(Self {
            options,
            pools,
            model_dir: store.dir().to_path_buf(),
            cancel: CancelFlag::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_pools(options: ConvertOptions, pools: HashMap<ModelKey, DevicePool>) -> Self {
        Self {
            options,
            pools,
            model_dir: PathBuf::from("models"),
            cancel: CancelFlag::new(),
        }
    }

    /// Stop issuing inference batches once `cancel` is set; the image in
    /// progress then fails with `Cancelled`.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn options(&self) -> &ConvertOptions {
        &self.options
    }

    /// Convert color planes and an optional alpha plane.
    ///
    /// Running out of device memory triggers one retry of the whole image
    /// with a smaller batch or tile size.
    ///
    /// # Errors
    ///
    /// Returns inference, device or geometry errors for this image, or
    /// `Cancelled` if the cancel flag was set before it finished.
    pub fn convert(
        &self,
        rgb: ArrayView3<'_, f32>,
        alpha: Option<ArrayView3<'_, f32>>,
    ) -> Result<ConvertedImage> {
        match self.convert_with(&self.options, rgb, alpha) {
            Err(err @ Error::OutOfMemory { .. }) => {
                let Some(smaller) = self.options.shrunk() else {
                    return Err(err);
                };
                tracing::warn!(
                    "{err}; retrying with batch size {} and tile size {}",
                    smaller.batch_size,
                    smaller.tile_size
                );
                self.convert_with(&smaller, rgb, alpha)
            }
            result => result,
        }
    }

    fn convert_with(
        &self,
        options: &ConvertOptions,
        rgb: ArrayView3<'_, f32>,
        alpha: Option<ArrayView3<'_, f32>>,
    ) -> Result<ConvertedImage> {
        let mut color = rgb.to_owned();
        for key in options.method.passes(options.noise_level) {
            color = self.run_pass(key, color.view(), options)?;
        }

        let alpha = alpha
            .map(|plane| self.convert_alpha(options, plane))
            .transpose()?;

        Ok(ConvertedImage { rgb: color, alpha })
    }

    /// The alpha plane goes through the scale passes as three equal channels
    /// and is averaged back to one.
    fn convert_alpha(
        &self,
        options: &ConvertOptions,
        plane: ArrayView3<'_, f32>,
    ) -> Result<ImageTensor> {
        let passes = options.method.alpha_passes();
        if passes.is_empty() {
            return Ok(plane.to_owned());
        }
        let (_, h, w) = plane.dim();
        let mut planes = plane
            .broadcast((RGB_CHANNELS, h, w))
            .ok_or_else(|| Error::ShapeMismatch {
                expected: format!("1x{h}x{w} alpha plane"),
                actual: format!("{:?}", plane.dim()),
            })?
            .to_owned();
        for key in passes {
            planes = self.run_pass(key, planes.view(), options)?;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = planes.sum_axis(Axis(0)) / RGB_CHANNELS as f32;
        Ok(mean.insert_axis(Axis(0)).mapv_into(|v| v.clamp(0.0, 1.0)))
    }

    /// One transformation pass over a CHW plane stack.
    fn run_pass(
        &self,
        key: ModelKey,
        plane: ArrayView3<'_, f32>,
        options: &ConvertOptions,
    ) -> Result<ImageTensor> {
        let pool = self.pools.get(&key).ok_or_else(|| Error::ModelNotFound {
            name: key.filename(),
            dir: self.model_dir.clone(),
        })?;
        let (channels, h, w) = plane.dim();
        let plan = TilePlan::new(w, h, options.tile_size, pool.geometry())?;
        let tiles = plan.extract(plane)?;
        let inference = InferenceOptions {
            batch_size: options.batch_size,
            tta: options.tta,
            precision: options.precision,
        };

        let outputs = run_batches(pool, &tiles, &inference, &self.cancel)?;

        let mut canvas = plan.canvas(channels);
        for (tile, output) in tiles.iter().zip(&outputs) {
            canvas.place(&tile.region, output.view())?;
        }
        Ok(canvas.into_inner())
    }
}

/// Spread logical batches round-robin over the pool's devices, one scoped
/// thread per device, and return the outputs in tile order.
///
/// A single device runs its batches on the calling thread.
fn run_batches(
    pool: &DevicePool,
    tiles: &[Tile],
    options: &InferenceOptions,
    cancel: &CancelFlag,
) -> Result<Vec<ImageTensor>> {
    let batches: Vec<&[Tile]> = tiles.chunks(options.batch_size.max(1)).collect();
    let lanes = pool.len().min(batches.len()).max(1);
    tracing::debug!(
        "{} tiles in {} batches over {lanes} device(s)",
        tiles.len(),
        batches.len()
    );

    let mut finished = if lanes == 1 {
        run_lane(pool, 0, 1, &batches, options, cancel)
    } else {
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..lanes)
                .map(|lane| {
                    let batches = &batches;
                    scope.spawn(move || run_lane(pool, lane, lanes, batches, options, cancel))
                })
                .collect();

            let mut finished = Vec::with_capacity(batches.len());
            for (lane, handle) in handles.into_iter().enumerate() {
                let done = handle.join().map_err(|_| Error::DeviceUnavailable {
                    device: pool.devices()[lane % pool.len()],
                    reason: "inference thread panicked".to_string(),
                })?;
                finished.extend(done);
            }
            Ok::<_, Error>(finished)
        })?
    };

    finished.sort_by_key(|(index, _)| *index);
    let mut outputs = Vec::with_capacity(tiles.len());
    for (_, result) in finished {
        outputs.extend(result?);
    }
    if outputs.len() != tiles.len() {
        return Err(Error::ShapeMismatch {
            expected: format!("{} tile outputs", tiles.len()),
            actual: format!("{} tile outputs", outputs.len()),
        });
    }
    Ok(outputs)
}

type LaneOutput = Vec<(usize, Result<Vec<ImageTensor>>)>;

/// Batches `lane`, `lane + lanes`, ... on one device, stopping at the first
/// failure or once `cancel` is set.
fn run_lane(
    pool: &DevicePool,
    lane: usize,
    lanes: usize,
    batches: &[&[Tile]],
    options: &InferenceOptions,
    cancel: &CancelFlag,
) -> LaneOutput {
    let mut done = Vec::new();
    for (index, batch) in batches.iter().enumerate().skip(lane).step_by(lanes) {
        let result = if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            pool.run(lane, |transform| infer_batch(transform, batch, options))
        };
        let failed = result.is_err();
        done.push((index, result));
        if failed {
            break;
        }
    }
    done
}
