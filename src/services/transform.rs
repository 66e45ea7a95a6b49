//! Image transformation pipeline.
//!
//! Named [`Transformer`]s are looked up by the keys of a run's
//! `transformations` map and applied in order. A transform that fails or
//! panics is logged and skipped; the image carries on through the rest of the
//! chain. Output sizes are checked against [`MAX_PIXELS`] before any buffer is
//! allocated.

use crate::models::{ParamError, TransformParams, TransformSpec};
use crate::state::observers::panic_message;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use indexmap::IndexMap;
use std::borrow::Cow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;

/// Resolution assumed when `scale` is given an absolute `width_mm`
pub const SCALE_DPI: f64 = 300.0;

const MM_PER_INCH: f64 = 25.4;

/// Fill for uncovered areas unless a transform's `background` says otherwise
pub const DEFAULT_BACKGROUND: u8 = 255;

/// Largest output a transform may produce (one byte per pixel, 512 MiB)
pub const MAX_PIXELS: u64 = 512 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error(transparent)]
    Param(#[from] ParamError),

    #[error("parameter `{key}` must be positive, got {value}")]
    NotPositive { key: &'static str, value: f64 },

    #[error("output of {width}x{height} pixels exceeds the limit of {MAX_PIXELS} pixels")]
    TooLarge { width: u64, height: u64 },
}

/// Round a requested output size to whole pixels, refusing anything over [`MAX_PIXELS`]
fn output_size(width: f64, height: f64) -> Result<(u32, u32), TransformError> {
    let width = width.round().max(1.0);
    let height = height.round().max(1.0);

    let too_large = || TransformError::TooLarge {
        width: width as u64,
        height: height as u64,
    };
    if width > u32::MAX as f64 || height > u32::MAX as f64 || width * height > MAX_PIXELS as f64 {
        return Err(too_large());
    }
    Ok((width as u32, height as u32))
}

/// A single image operation configured by a parameter map.
///
/// Returning `Cow::Borrowed` means "unchanged"; the pipeline then keeps the
/// input without copying it.
pub trait Transformer: Send + Sync {
    fn transform<'a>(
        &self,
        image: &'a GrayImage,
        params: &TransformParams,
    ) -> Result<Cow<'a, GrayImage>, TransformError>;
}

/// Ordered chain of named transformers
#[derive(Clone, Default)]
pub struct TransformationPipeline {
    transformers: IndexMap<String, Arc<dyn Transformer>>,
}

impl TransformationPipeline {
    /// Empty pipeline; see [`create_transform_pipeline`] for the built-in set
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `transformer`, replacing any earlier binding
    pub fn register(&mut self, name: impl Into<String>, transformer: Arc<dyn Transformer>) {
        let name = name.into();
        if self.transformers.insert(name.clone(), transformer).is_some() {
            tracing::debug!("Replaced transformer '{}'", name);
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.transformers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.transformers.keys().map(String::as_str)
    }

    /// Run `specs` over `image` in order.
    ///
    /// Unknown names are skipped silently; a transform that fails or panics is
    /// logged and skipped.
    pub fn apply(&self, image: GrayImage, specs: &[TransformSpec]) -> GrayImage {
        let mut current = image;

        for spec in specs {
            let Some(transformer) = self.transformers.get(&spec.name) else {
                tracing::debug!("No transformer registered for '{}', skipping", spec.name);
                continue;
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                transformer.transform(&current, &spec.params).map(|out| match out {
                    Cow::Owned(next) => Some(next),
                    Cow::Borrowed(_) => None,
                })
            }));

            let next = match outcome {
                Ok(Ok(next)) => next,
                Ok(Err(e)) => {
                    tracing::warn!("Transform '{}' failed, skipping: {}", spec.name, e);
                    None
                }
                Err(payload) => {
                    tracing::error!(
                        "Transform '{}' panicked, skipping: {}",
                        spec.name,
                        panic_message(payload.as_ref())
                    );
                    None
                }
            };

            if let Some(next) = next {
                tracing::debug!(
                    "Applied '{}': {}x{} -> {}x{}",
                    spec.name,
                    current.width(),
                    current.height(),
                    next.width(),
                    next.height()
                );
                current = next;
            }
        }

        current
    }
}

/// Pipeline with `rotate`, `scale`, `center` and `mirror` registered.
///
/// `rotation` is bound to the rotate transformer as well, for older run files.
pub fn create_transform_pipeline() -> TransformationPipeline {
    let mut pipeline = TransformationPipeline::new();
    let rotate: Arc<dyn Transformer> = Arc::new(RotateTransform);
    pipeline.register("rotate", rotate.clone());
    pipeline.register("rotation", rotate);
    pipeline.register("scale", Arc::new(ScaleTransform));
    pipeline.register("center", Arc::new(CenterTransform));
    pipeline.register("mirror", Arc::new(MirrorTransform));
    pipeline
}

/// `angle` degrees counter-clockwise with bicubic resampling.
///
/// The canvas grows to hold the rotated image unless `expand: false`.
/// Uncovered area is filled with `background`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RotateTransform;

impl Transformer for RotateTransform {
    fn transform<'a>(
        &self,
        image: &'a GrayImage,
        params: &TransformParams,
    ) -> Result<Cow<'a, GrayImage>, TransformError> {
        let angle = params.f64("angle")?.unwrap_or(0.0);
        let background = params.u8("background")?.unwrap_or(DEFAULT_BACKGROUND);
        let expand = params.bool("expand")?.unwrap_or(true);

        let turn = angle.rem_euclid(360.0);
        if turn == 0.0 {
            return Ok(Cow::Borrowed(image));
        }

        // Quarter turns are lossless; imageops rotates clockwise
        let square = image.width() == image.height();
        if turn == 180.0 {
            return Ok(Cow::Owned(imageops::rotate180(image)));
        }
        if expand || square {
            if turn == 90.0 {
                return Ok(Cow::Owned(imageops::rotate270(image)));
            }
            if turn == 270.0 {
                return Ok(Cow::Owned(imageops::rotate90(image)));
            }
        }

        Ok(Cow::Owned(rotate_bicubic(image, turn, background, expand)?))
    }
}

fn rotate_bicubic(
    image: &GrayImage,
    degrees: f64,
    background: u8,
    expand: bool,
) -> Result<GrayImage, TransformError> {
    let (w, h) = (image.width() as f64, image.height() as f64);
    let radians = degrees.to_radians();

    let (out_w, out_h) = if expand {
        let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
        output_size(
            ((w * cos + h * sin) - 1e-6).ceil(),
            ((w * sin + h * cos) - 1e-6).ceil(),
        )?
    } else {
        (image.width(), image.height())
    };

    // Image y grows downward, so a counter-clockwise turn is a negative angle
    let projection = Projection::translate(-(w / 2.0) as f32, -(h / 2.0) as f32)
        .and_then(Projection::rotate(-radians as f32))
        .and_then(Projection::translate(
            out_w as f32 / 2.0,
            out_h as f32 / 2.0,
        ));

    let mut out = GrayImage::from_pixel(out_w, out_h, Luma([background]));
    warp_into(
        image,
        &projection,
        Interpolation::Bicubic,
        Luma([background]),
        &mut out,
    );
    Ok(out)
}

/// Resize by `factor`, or to an absolute `width_mm` at `dpi` (default [`SCALE_DPI`]).
///
/// `factor` wins when both are present. Catmull-Rom (bicubic) resampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleTransform;

impl Transformer for ScaleTransform {
    fn transform<'a>(
        &self,
        image: &'a GrayImage,
        params: &TransformParams,
    ) -> Result<Cow<'a, GrayImage>, TransformError> {
        let (w, h) = (image.width() as f64, image.height() as f64);

        let (new_w, new_h) = if let Some(factor) = params.f64("factor")? {
            if factor <= 0.0 || !factor.is_finite() {
                return Err(TransformError::NotPositive {
                    key: "factor",
                    value: factor,
                });
            }
            if factor == 1.0 {
                return Ok(Cow::Borrowed(image));
            }
            (w * factor, h * factor)
        } else if let Some(width_mm) = params.f64("width_mm")? {
            if width_mm <= 0.0 || !width_mm.is_finite() {
                return Err(TransformError::NotPositive {
                    key: "width_mm",
                    value: width_mm,
                });
            }
            let dpi = params.f64("dpi")?.unwrap_or(SCALE_DPI);
            if dpi <= 0.0 || !dpi.is_finite() {
                return Err(TransformError::NotPositive { key: "dpi", value: dpi });
            }
            let target_w = (width_mm / MM_PER_INCH * dpi).round().max(1.0);
            (target_w, h * target_w / w)
        } else {
            return Ok(Cow::Borrowed(image));
        };

        let (new_w, new_h) = output_size(new_w, new_h)?;
        if (new_w, new_h) == image.dimensions() {
            return Ok(Cow::Borrowed(image));
        }

        Ok(Cow::Owned(imageops::resize(
            image,
            new_w,
            new_h,
            FilterType::CatmullRom,
        )))
    }
}

/// Pad to a `width` x `height` canvas with the image centered.
///
/// Images already as large as the target in either axis pass through; this
/// never crops.
#[derive(Debug, Clone, Copy, Default)]
pub struct CenterTransform;

impl Transformer for CenterTransform {
    fn transform<'a>(
        &self,
        image: &'a GrayImage,
        params: &TransformParams,
    ) -> Result<Cow<'a, GrayImage>, TransformError> {
        let (Some(width), Some(height)) = (params.u32("width")?, params.u32("height")?) else {
            return Ok(Cow::Borrowed(image));
        };
        let background = params.u8("background")?.unwrap_or(DEFAULT_BACKGROUND);

        if image.width() >= width || image.height() >= height {
            return Ok(Cow::Borrowed(image));
        }
        output_size(width as f64, height as f64)?;

        let mut canvas = GrayImage::from_pixel(width, height, Luma([background]));
        let x = (width - image.width()) / 2;
        let y = (height - image.height()) / 2;
        imageops::replace(&mut canvas, image, x as i64, y as i64);
        Ok(Cow::Owned(canvas))
    }
}

/// Flip on `horizontal` and/or `vertical`; both is a half turn
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorTransform;

impl Transformer for MirrorTransform {
    fn transform<'a>(
        &self,
        image: &'a GrayImage,
        params: &TransformParams,
    ) -> Result<Cow<'a, GrayImage>, TransformError> {
        let horizontal = params.bool("horizontal")?.unwrap_or(false);
        let vertical = params.bool("vertical")?.unwrap_or(false);

        Ok(match (horizontal, vertical) {
            (true, true) => Cow::Owned(imageops::rotate180(image)),
            (true, false) => Cow::Owned(imageops::flip_horizontal(image)),
            (false, true) => Cow::Owned(imageops::flip_vertical(image)),
            (false, false) => Cow::Borrowed(image),
        })
    }
}
