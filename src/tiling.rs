//! Tile partitioning and stitching.
//!
//! The source image is cut into a grid of `tile_size` squares (the last row
//! and column may be smaller). Each tile is extracted together with a halo of
//! `offset` context pixels on every side that faces another tile; at the image
//! border the halo is clipped away. After inference the halo's contribution,
//! `scale * halo` output pixels per side, is cropped and the remainder is
//! written to the canvas at `scale * origin`. Cropped regions never overlap,
//! so stitching is a plain copy.

use ndarray::{s, Array3, ArrayView3};

use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::model::Geometry;

/// Context pixels around a tile, per side, in source pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Halo {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

/// Placement of one tile in the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    /// Left edge of the tile proper.
    pub x: usize,
    /// Top edge of the tile proper.
    pub y: usize,
    pub width: usize,
    pub height: usize,
    pub halo: Halo,
}

impl TileRegion {
    /// Height and width of the extracted buffer, halo included.
    #[must_use]
    pub const fn input_size(&self) -> (usize, usize) {
        (
            self.height + self.halo.top + self.halo.bottom,
            self.width + self.halo.left + self.halo.right,
        )
    }

    /// `(channels, height, width)` an inference result must have.
    #[must_use]
    pub const fn expected_output(&self, channels: usize, scale: usize) -> (usize, usize, usize) {
        let (h, w) = self.input_size();
        (channels, h * scale, w * scale)
    }
}

/// A tile's pixels, halo included.
#[derive(Debug, Clone)]
pub struct Tile {
    /// Position in the plan, row-major.
    pub index: usize,
    pub region: TileRegion,
    pub pixels: ImageTensor,
}

/// Partition of one image for a given geometry.
#[derive(Debug, Clone)]
pub struct TilePlan {
    width: usize,
    height: usize,
    geometry: Geometry,
    regions: Vec<TileRegion>,
}

impl TilePlan {
    /// Plan tiles for a `width` x `height` source.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTileSize` if `tile_size` is zero.
    pub fn new(width: usize, height: usize, tile_size: usize, geometry: Geometry) -> Result<Self> {
        if tile_size == 0 {
            return Err(Error::InvalidTileSize { tile_size });
        }
        let offset = geometry.offset();
        let mut regions = Vec::new();
        for y in (0..height).step_by(tile_size) {
            let tile_h = tile_size.min(height - y);
            for x in (0..width).step_by(tile_size) {
                let tile_w = tile_size.min(width - x);
                let halo = Halo {
                    left: offset.min(x),
                    top: offset.min(y),
                    right: offset.min(width - x - tile_w),
                    bottom: offset.min(height - y - tile_h),
                };
                regions.push(TileRegion {
                    x,
                    y,
                    width: tile_w,
                    height: tile_h,
                    halo,
                });
            }
        }
        tracing::debug!(
            "Tile plan {width}x{height}: {} tiles of {tile_size}, scale {}, offset {offset}",
            regions.len(),
            geometry.scale
        );
        Ok(Self {
            width,
            height,
            geometry,
            regions,
        })
    }

    #[must_use]
    pub fn regions(&self) -> &[TileRegion] {
        &self.regions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    #[must_use]
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// `(height, width)` of the assembled output.
    #[must_use]
    pub const fn output_size(&self) -> (usize, usize) {
        let scale = self.geometry.scale();
        (self.height * scale, self.width * scale)
    }

    /// Cut `image` (CHW) into owned tiles.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `image` is not the size the plan was made for.
    pub fn extract(&self, image: ArrayView3<'_, f32>) -> Result<Vec<Tile>> {
        let (_, h, w) = image.dim();
        if (h, w) != (self.height, self.width) {
            return Err(Error::ShapeMismatch {
                expected: format!("{}x{} image", self.width, self.height),
                actual: format!("{w}x{h} image"),
            });
        }
        Ok(self
            .regions
            .iter()
            .enumerate()
            .map(|(index, region)| {
                let y0 = region.y - region.halo.top;
                let x0 = region.x - region.halo.left;
                let (in_h, in_w) = region.input_size();
                Tile {
                    index,
                    region: *region,
                    pixels: image
                        .slice(s![.., y0..y0 + in_h, x0..x0 + in_w])
                        .to_owned(),
                }
            })
            .collect())
    }

    /// Empty output canvas for `channels` planes.
    #[must_use]
    pub fn canvas(&self, channels: usize) -> Canvas {
        let (h, w) = self.output_size();
        Canvas {
            data: Array3::zeros((channels, h, w)),
            scale: self.geometry.scale(),
        }
    }
}

/// Full-resolution output being assembled from tile results.
#[derive(Debug, Clone)]
pub struct Canvas {
    data: ImageTensor,
    scale: usize,
}

impl Canvas {
    /// Crop a tile's inference result and copy it into place.
    ///
    /// # Errors
    ///
    /// Returns `GeometryMismatch` if `output` is not exactly
    /// `scale x (tile + halo)` in both dimensions.
    pub fn place(&mut self, region: &TileRegion, output: ArrayView3<'_, f32>) -> Result<()> {
        let channels = self.data.dim().0;
        let expected = region.expected_output(channels, self.scale);
        if output.dim() != expected {
            return Err(Error::GeometryMismatch {
                expected,
                actual: output.dim(),
            });
        }
        let scale = self.scale;
        let crop_y = region.halo.top * scale;
        let crop_x = region.halo.left * scale;
        let (out_h, out_w) = (region.height * scale, region.width * scale);
        let (dst_y, dst_x) = (region.y * scale, region.x * scale);
        self.data
            .slice_mut(s![.., dst_y..dst_y + out_h, dst_x..dst_x + out_w])
            .assign(&output.slice(s![.., crop_y..crop_y + out_h, crop_x..crop_x + out_w]));
        Ok(())
    }

    #[must_use]
    pub fn into_inner(self) -> ImageTensor {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array3};

    use super::*;

    fn coverage(plan: &TilePlan, width: usize, height: usize) -> Array2<u32> {
        let mut count = Array2::<u32>::zeros((height, width));
        for r in plan.regions() {
            count
                .slice_mut(s![r.y..r.y + r.height, r.x..r.x + r.width])
                .mapv_inplace(|c| c + 1);
        }
        count
    }

    #[test]
    fn test_tiles_cover_image_exactly_once() {
        for (w, h, t, o) in [(300, 300, 128, 8), (7, 13, 3, 2), (5, 5, 1, 4), (64, 32, 100, 8)] {
            let plan = TilePlan::new(w, h, t, Geometry::new(2, o)).unwrap();
            assert!(coverage(&plan, w, h).iter().all(|&c| c == 1), "{w}x{h} tile {t}");
            assert_eq!(plan.output_size(), (2 * h, 2 * w));
        }
    }

    #[test]
    fn test_halo_clipped_at_edges() {
        let plan = TilePlan::new(300, 300, 128, Geometry::new(2, 8)).unwrap();
        assert_eq!(plan.len(), 9);

        let corner = plan.regions()[0];
        assert_eq!(
            corner.halo,
            Halo {
                left: 0,
                top: 0,
                right: 8,
                bottom: 8
            }
        );
        let center = plan.regions()[4];
        assert_eq!((center.x, center.y), (128, 128));
        assert_eq!(center.input_size(), (144, 144));
        let last = plan.regions()[8];
        assert_eq!((last.width, last.height), (44, 44));
        assert_eq!(last.input_size(), (52, 52));
    }

    #[test]
    fn test_single_tile_has_no_halo() {
        let plan = TilePlan::new(300, 200, 300, Geometry::new(2, 8)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.regions()[0].halo, Halo::default());
    }

    #[test]
    fn test_zero_tile_size() {
        assert!(matches!(
            TilePlan::new(10, 10, 0, Geometry::new(2, 0)),
            Err(Error::InvalidTileSize { tile_size: 0 })
        ));
    }

    #[test]
    fn test_stitch_identity_reproduces_source() {
        let (w, h) = (37, 23);
        let image = Array3::from_shape_fn((3, h, w), |(c, y, x)| (c * 10_000 + y * 100 + x) as f32);
        let plan = TilePlan::new(w, h, 8, Geometry::new(1, 3)).unwrap();
        let mut canvas = plan.canvas(3);
        for tile in plan.extract(image.view()).unwrap() {
            canvas.place(&tile.region, tile.pixels.view()).unwrap();
        }
        assert_eq!(canvas.into_inner(), image);
    }

    #[test]
    fn test_place_rejects_wrong_geometry() {
        let plan = TilePlan::new(16, 16, 8, Geometry::new(2, 2)).unwrap();
        let mut canvas = plan.canvas(3);
        let region = plan.regions()[0];
        let wrong = Array3::<f32>::zeros((3, 16, 16));

        let err = canvas.place(&region, wrong.view()).unwrap_err();
        assert!(matches!(
            err,
            Error::GeometryMismatch {
                expected: (3, 20, 20),
                actual: (3, 16, 16)
            }
        ));
    }
}
