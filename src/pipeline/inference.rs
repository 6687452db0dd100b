//! Batched inference with optional test-time augmentation.
//!
//! A logical batch of tiles is expanded into variants (one per augmentation),
//! packed into physical batches of identically shaped variants, run through
//! the transformation, and folded back into one output per tile.

use ndarray::{stack, ArrayView3, Axis};

use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::model::{Precision, Transform};
use crate::tiling::Tile;

/// One symmetry of the square, applied to the spatial axes of a CHW tensor.
///
/// Applied as: optional vertical flip, optional horizontal flip, optional
/// transpose. The inverse undoes them in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Augmentation {
    flip_vertical: bool,
    flip_horizontal: bool,
    transpose: bool,
}

impl Augmentation {
    pub const IDENTITY: Self = Self::new(false, false, false);

    const fn new(flip_vertical: bool, flip_horizontal: bool, transpose: bool) -> Self {
        Self {
            flip_vertical,
            flip_horizontal,
            transpose,
        }
    }

    /// Whether the augmentation swaps height and width.
    #[must_use]
    pub const fn transposes(&self) -> bool {
        self.transpose
    }

    /// View of `tile` under this augmentation.
    #[must_use]
    pub fn apply<'a>(&self, tile: ArrayView3<'a, f32>) -> ArrayView3<'a, f32> {
        let mut view = tile;
        if self.flip_vertical {
            view.invert_axis(Axis(1));
        }
        if self.flip_horizontal {
            view.invert_axis(Axis(2));
        }
        if self.transpose {
            view.swap_axes(1, 2);
        }
        view
    }

    /// View of `output` with this augmentation undone.
    #[must_use]
    pub fn invert<'a>(&self, output: ArrayView3<'a, f32>) -> ArrayView3<'a, f32> {
        let mut view = output;
        if self.transpose {
            view.swap_axes(1, 2);
        }
        if self.flip_horizontal {
            view.invert_axis(Axis(2));
        }
        if self.flip_vertical {
            view.invert_axis(Axis(1));
        }
        view
    }
}

/// The 8-way augmentation set: identity, flips, rotations by 90/180/270
/// degrees and the two diagonal reflections.
pub const TTA_AUGMENTATIONS: [Augmentation; 8] = [
    Augmentation::IDENTITY,
    Augmentation::new(false, true, false),
    Augmentation::new(true, false, false),
    Augmentation::new(true, true, false),
    Augmentation::new(false, false, true),
    Augmentation::new(true, false, true),
    Augmentation::new(false, true, true),
    Augmentation::new(true, true, true),
];

/// Knobs for [`infer_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceOptions {
    /// Maximum variants per physical batch.
    pub batch_size: usize,
    pub tta: bool,
    pub precision: Precision,
}

impl InferenceOptions {
    fn augmentations(&self) -> &'static [Augmentation] {
        if self.tta {
            &TTA_AUGMENTATIONS
        } else {
            &[Augmentation::IDENTITY]
        }
    }
}

/// Run `transform` over `tiles`, returning one output per tile in input order.
///
/// With TTA every tile is run under each augmentation and the inverted
/// results are averaged. Variants of different tiles may share a physical
/// batch; a tile is only aggregated once all its variants have returned,
/// summing in augmentation order so the result does not depend on how the
/// variants were batched.
///
/// # Errors
///
/// Propagates transformation failures. Returns `ShapeMismatch` if the
/// transformation changes the batch length and `GeometryMismatch` if the
/// variants of one tile disagree in shape after inversion.
pub fn infer_batch(
    transform: &mut dyn Transform,
    tiles: &[Tile],
    options: &InferenceOptions,
) -> Result<Vec<ImageTensor>> {
    let augmentations = options.augmentations();
    let variants: Vec<ArrayView3<'_, f32>> = tiles
        .iter()
        .flat_map(|tile| augmentations.iter().map(|aug| aug.apply(tile.pixels.view())))
        .collect();

    let mut slots: Vec<Option<ImageTensor>> = vec![None; variants.len()];
    let max_batch = options.batch_size.max(1);
    let mut start = 0;
    while start < variants.len() {
        let shape = variants[start].dim();
        let end = variants[start..]
            .iter()
            .take(max_batch)
            .position(|v| v.dim() != shape)
            .map_or_else(|| (start + max_batch).min(variants.len()), |n| start + n);

        let outputs = run_physical(transform, &variants[start..end], options.precision)?;
        for (k, index) in (start..end).enumerate() {
            let aug = augmentations[index % augmentations.len()];
            slots[index] = Some(aug.invert(outputs.index_axis(Axis(0), k)).to_owned());
        }
        start = end;
    }

    slots
        .chunks(augmentations.len())
        .map(aggregate)
        .collect()
}

fn run_physical(
    transform: &mut dyn Transform,
    variants: &[ArrayView3<'_, f32>],
    precision: Precision,
) -> Result<ndarray::Array4<f32>> {
    let input = stack(Axis(0), variants).map_err(|err| Error::ShapeMismatch {
        expected: "variants of equal shape".to_string(),
        actual: err.to_string(),
    })?;
    tracing::trace!("Physical batch {:?}", input.dim());
    let output = transform.forward(input, precision)?;
    if output.dim().0 != variants.len() {
        return Err(Error::ShapeMismatch {
            expected: format!("batch of {}", variants.len()),
            actual: format!("batch of {}", output.dim().0),
        });
    }
    Ok(output)
}

/// Mean of one tile's variant outputs, summed in augmentation order.
#[allow(clippy::cast_precision_loss)]
fn aggregate(variants: &[Option<ImageTensor>]) -> Result<ImageTensor> {
    let mut outputs = variants.iter().flatten();
    let mut sum = outputs.next().cloned().ok_or_else(|| Error::ShapeMismatch {
        expected: "one output per variant".to_string(),
        actual: "no output".to_string(),
    })?;
    for output in outputs {
        if output.dim() != sum.dim() {
            return Err(Error::GeometryMismatch {
                expected: sum.dim(),
                actual: output.dim(),
            });
        }
        sum += output;
    }
    if variants.len() > 1 {
        sum /= variants.len() as f32;
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;
    use serde_json::{Map, Value};

    use super::*;
    use crate::model::{
        BatchTensor, BoxDenoise, BoxDenoiseConfig, Device, Geometry, Nearest, NearestConfig,
        TransformKind,
    };
    use crate::tiling::TilePlan;

    fn ramp(h: usize, w: usize) -> ImageTensor {
        Array3::from_shape_fn((3, h, w), |(c, y, x)| {
            ((c * 31 + y * 7 + x * 3) % 17) as f32 / 16.0
        })
    }

    fn tiles(image: &ImageTensor, tile_size: usize, geometry: Geometry) -> Vec<Tile> {
        let (_, h, w) = image.dim();
        TilePlan::new(w, h, tile_size, geometry)
            .unwrap()
            .extract(image.view())
            .unwrap()
    }

    /// Records physical batch lengths, otherwise nearest 2x.
    struct Recording {
        inner: Nearest,
        batches: Vec<usize>,
    }

    impl Transform for Recording {
        fn kind(&self) -> TransformKind {
            TransformKind::Nearest
        }
        fn params(&self) -> Map<String, Value> {
            self.inner.params()
        }
        fn geometry(&self) -> Geometry {
            self.inner.geometry()
        }
        fn forward(&mut self, input: BatchTensor, precision: Precision) -> Result<BatchTensor> {
            self.batches.push(input.dim().0);
            self.inner.forward(input, precision)
        }
        fn place(&mut self, _device: Device) -> Result<()> {
            Ok(())
        }
    }

    /// Drops the last item of every batch.
    struct Lossy;

    impl Transform for Lossy {
        fn kind(&self) -> TransformKind {
            TransformKind::Nearest
        }
        fn params(&self) -> Map<String, Value> {
            Map::new()
        }
        fn geometry(&self) -> Geometry {
            Geometry::new(1, 0)
        }
        fn forward(&mut self, input: BatchTensor, _precision: Precision) -> Result<BatchTensor> {
            let n = input.dim().0.saturating_sub(1);
            Ok(input.slice_move(ndarray::s![..n, .., .., ..]))
        }
        fn place(&mut self, _device: Device) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_augmentations_invert() {
        let tile = ramp(3, 5);
        for aug in TTA_AUGMENTATIONS {
            let applied = aug.apply(tile.view()).to_owned();
            if aug.transposes() {
                assert_eq!(applied.dim(), (3, 5, 3));
            }
            assert_eq!(aug.invert(applied.view()), tile.view(), "{aug:?}");
        }
    }

    #[test]
    fn test_augmentations_are_distinct() {
        let tile = ramp(4, 4);
        let images: Vec<Array3<f32>> = TTA_AUGMENTATIONS
            .iter()
            .map(|aug| aug.apply(tile.view()).to_owned())
            .collect();
        for (i, a) in images.iter().enumerate() {
            for b in &images[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_outputs_follow_tile_order() {
        let image = ramp(10, 10);
        let tiles = tiles(&image, 4, Geometry::new(2, 0));
        let mut transform = Nearest::new(NearestConfig { scale: 2 }).unwrap();
        let options = InferenceOptions {
            batch_size: 2,
            tta: false,
            precision: Precision::Full,
        };

        let outputs = infer_batch(&mut transform, &tiles, &options).unwrap();
        assert_eq!(outputs.len(), tiles.len());
        for (tile, output) in tiles.iter().zip(&outputs) {
            let (h, w) = tile.region.input_size();
            assert_eq!(output.dim(), (3, 2 * h, 2 * w));
            assert_eq!(output[[1, 1, 1]], tile.pixels[[1, 0, 0]]);
        }
    }

    #[test]
    fn test_tta_of_equivariant_transform_is_exact() {
        let image = ramp(9, 6);
        let tiles = tiles(&image, 16, Geometry::new(2, 1));
        let mut transform = BoxDenoise::new(BoxDenoiseConfig {
            scale: 2,
            radius: 1,
        })
        .unwrap();
        let plain = InferenceOptions {
            batch_size: 4,
            tta: false,
            precision: Precision::Full,
        };
        let tta = InferenceOptions { tta: true, ..plain };

        let expected = infer_batch(&mut transform, &tiles, &plain).unwrap();
        let first = infer_batch(&mut transform, &tiles, &tta).unwrap();
        let second = infer_batch(&mut transform, &tiles, &tta).unwrap();

        assert_eq!(first, second);
        for (a, b) in first[0].iter().zip(expected[0].iter()) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_physical_batches_split_by_shape_and_size() {
        // 6x4 tile: transposed variants are 4x6 and cannot share a batch.
        let image = ramp(6, 4);
        let tiles = tiles(&image, 8, Geometry::new(2, 0));
        let mut transform = Recording {
            inner: Nearest::new(NearestConfig { scale: 2 }).unwrap(),
            batches: Vec::new(),
        };
        let options = InferenceOptions {
            batch_size: 3,
            tta: true,
            precision: Precision::Full,
        };

        let outputs = infer_batch(&mut transform, &tiles, &options).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(transform.batches, vec![3, 1, 3, 1]);
        let expected = Nearest::new(NearestConfig { scale: 2 })
            .unwrap()
            .forward(image.insert_axis(Axis(0)), Precision::Full)
            .unwrap()
            .index_axis_move(Axis(0), 0);
        for (a, b) in outputs[0].iter().zip(expected.iter()) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_batch_length_checked() {
        let image = ramp(4, 4);
        let tiles = tiles(&image, 2, Geometry::new(1, 0));
        let options = InferenceOptions {
            batch_size: 4,
            tta: false,
            precision: Precision::Full,
        };

        let result = infer_batch(&mut Lossy, &tiles, &options);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}
