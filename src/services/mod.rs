//! Services module - the pieces a trial run is built from.
//!
//! These are independent of the controller and of each other, and usable on
//! their own.
//!
//! # Components
//!
//! - [`transform`]: named image [`Transformer`]s chained by a
//!   [`TransformationPipeline`]. Built-ins are rotate, scale, center and mirror.
//! - [`display`]: the [`DisplayAdapter`] capability with
//!   [`VirtualDisplay`] and [`HardwareDisplay`] variants, plus the
//!   [`create_display`] policy that falls back to virtual.
//! - [`image_source`]: loading images as 8-bit grayscale through an
//!   [`ImageSource`].
//!
//! # Usage Example
//!
//! ```ignore
//! use epdtrial::services::create_transform_pipeline;
//!
//! let pipeline = create_transform_pipeline();
//! let shown = pipeline.apply(image, &run_config.transform_specs());
//! ```

pub mod display;
pub mod image_source;
pub mod transform;

pub use display::{
    DisplayAdapter, DisplayError, DisplayKind, HardwareDisplay, PanelDriver, PanelRotation,
    VirtualDisplay, create_display, unavailable_panel,
};
pub use image_source::{FileImageSource, ImageLoadError, ImageSource, MemoryImageSource};
pub use transform::{
    CenterTransform, MAX_PIXELS, MirrorTransform, RotateTransform, SCALE_DPI, ScaleTransform,
    TransformError, TransformationPipeline, Transformer, create_transform_pipeline,
};
