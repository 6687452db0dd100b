//! Transformations computed directly on the CPU.
//!
//! They run without weights, which makes them usable as reference
//! transformations and as a fallback when no runtime is available.

use half::f16;
use ndarray::{Array4, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::{to_params, BatchTensor, Device, Geometry, Precision, Transform, TransformKind};

/// Parameters of [`Nearest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NearestConfig {
    pub scale: u32,
}

/// Nearest-neighbour upscaler.
#[derive(Debug, Clone)]
pub struct Nearest {
    config: NearestConfig,
}

impl Nearest {
    /// # Errors
    ///
    /// Returns `InvalidParams` if `scale` is zero.
    pub fn new(config: NearestConfig) -> Result<Self> {
        check_scale(TransformKind::Nearest, config.scale)?;
        Ok(Self { config })
    }
}

impl Transform for Nearest {
    fn kind(&self) -> TransformKind {
        TransformKind::Nearest
    }

    fn params(&self) -> Map<String, Value> {
        to_params(self.kind(), &self.config)
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.config.scale, 0)
    }

    fn forward(&mut self, mut input: BatchTensor, precision: Precision) -> Result<BatchTensor> {
        if precision == Precision::Reduced {
            quantize_half(&mut input);
        }
        Ok(upscale_nearest(&input, self.geometry().scale()))
    }

    fn place(&mut self, device: Device) -> Result<()> {
        log_cpu_fallback(self.kind(), device);
        Ok(())
    }
}

/// Parameters of [`BoxDenoise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoxDenoiseConfig {
    pub scale: u32,
    /// Filter radius in source pixels.
    pub radius: u32,
}

/// Box-filter smoothing followed by nearest-neighbour upscale.
///
/// Each output pixel depends on a `(2 * radius + 1)` square of source pixels,
/// so the transformation declares `offset = radius`.
#[derive(Debug, Clone)]
pub struct BoxDenoise {
    config: BoxDenoiseConfig,
}

impl BoxDenoise {
    /// # Errors
    ///
    /// Returns `InvalidParams` if `scale` is zero.
    pub fn new(config: BoxDenoiseConfig) -> Result<Self> {
        check_scale(TransformKind::BoxDenoise, config.scale)?;
        Ok(Self { config })
    }
}

impl Transform for BoxDenoise {
    fn kind(&self) -> TransformKind {
        TransformKind::BoxDenoise
    }

    fn params(&self) -> Map<String, Value> {
        to_params(self.kind(), &self.config)
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.config.scale, self.config.radius)
    }

    fn forward(&mut self, mut input: BatchTensor, precision: Precision) -> Result<BatchTensor> {
        if precision == Precision::Reduced {
            quantize_half(&mut input);
        }
        let radius = self.geometry().offset();
        let smoothed = box_filter(&box_filter(&input, radius, Axis(3)), radius, Axis(2));
        let mut output = upscale_nearest(&smoothed, self.geometry().scale());
        if precision == Precision::Reduced {
            quantize_half(&mut output);
        }
        Ok(output)
    }

    fn place(&mut self, device: Device) -> Result<()> {
        log_cpu_fallback(self.kind(), device);
        Ok(())
    }
}

fn check_scale(kind: TransformKind, scale: u32) -> Result<()> {
    if scale == 0 {
        return Err(Error::invalid_params(kind.id(), "scale must be at least 1"));
    }
    Ok(())
}

fn log_cpu_fallback(kind: TransformKind, device: Device) {
    if device != Device::Cpu {
        tracing::debug!("{kind} has no accelerator path; {device} runs it on the CPU");
    }
}

/// Round every value through IEEE half precision.
pub(crate) fn quantize_half(tensor: &mut BatchTensor) {
    tensor.mapv_inplace(|v| f16::from_f32(v).to_f32());
}

fn upscale_nearest(input: &BatchTensor, scale: usize) -> BatchTensor {
    if scale == 1 {
        return input.clone();
    }
    let (n, c, h, w) = input.dim();
    Array4::from_shape_fn((n, c, h * scale, w * scale), |(b, ch, y, x)| {
        input[[b, ch, y / scale, x / scale]]
    })
}

/// Mean over a `2 * radius + 1` window along `axis`, replicating edge pixels.
///
/// Every window is summed in the same order regardless of where it sits,
/// so equal neighbourhoods give bit-identical results.
#[allow(clippy::cast_precision_loss)]
fn box_filter(input: &BatchTensor, radius: usize, axis: Axis) -> BatchTensor {
    if radius == 0 {
        return input.clone();
    }
    let len = input.len_of(axis);
    let last = len - 1;
    let norm = (2 * radius + 1) as f32;
    Array4::from_shape_fn(input.dim(), |(b, ch, y, x)| {
        let center = if axis == Axis(3) { x } else { y };
        let mut sum = 0.0f32;
        for k in 0..=2 * radius {
            let pos = (center + k).saturating_sub(radius).min(last);
            sum += if axis == Axis(3) {
                input[[b, ch, y, pos]]
            } else {
                input[[b, ch, pos, x]]
            };
        }
        sum / norm
    })
}
