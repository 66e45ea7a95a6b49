//! Display adapters.
//!
//! [`VirtualDisplay`] keeps the last frame in memory. [`HardwareDisplay`]
//! drives an e-paper panel through a [`PanelDriver`]. [`create_display`]
//! picks one, falling back to virtual whenever the panel cannot be brought up.

use crate::models::{DisplaySettings, RefreshMode};
use crate::state::observers::panic_message;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

const WHITE: Luma<u8> = Luma([0xFF]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisplayError {
    #[error("Panel driver unavailable: {0}")]
    Unavailable(String),

    #[error("Panel driver error: {0}")]
    Driver(String),

    #[error("Panel reports an empty frame ({0}x{1})")]
    EmptyFrame(u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    Virtual,
    Hardware,
}

impl std::fmt::Display for DisplayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayKind::Virtual => f.write_str("virtual"),
            DisplayKind::Hardware => f.write_str("hardware"),
        }
    }
}

/// Something a run can show images on.
///
/// `render` and `clear` report failure as `false` after logging it; the run
/// records the item as failed and moves on.
pub trait DisplayAdapter: Send {
    /// Bring the display up. Calling it again on a prepared display is a no-op.
    fn prepare(&mut self) -> Result<(), DisplayError>;

    fn render(&mut self, image: &GrayImage) -> bool;

    fn clear(&mut self) -> bool;

    /// Blank and power down. The adapter must be prepared again before reuse.
    fn release(&mut self);

    fn dimensions(&self) -> (u32, u32);

    fn kind(&self) -> DisplayKind;
}

/// Low-level e-paper panel access
pub trait PanelDriver: Send {
    fn dimensions(&self) -> (u32, u32);

    /// Push a whole frame with the given waveform
    fn draw_full(&mut self, frame: &GrayImage, mode: RefreshMode) -> Result<(), DisplayError>;

    fn clear(&mut self) -> Result<(), DisplayError>;

    fn sleep(&mut self) -> Result<(), DisplayError>;
}

/// In-memory display for development and tests
#[derive(Debug, Clone)]
pub struct VirtualDisplay {
    width: u32,
    height: u32,
    current: Option<GrayImage>,
    renders: usize,
    prepared: bool,
}

impl VirtualDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            current: None,
            renders: 0,
            prepared: false,
        }
    }

    /// Most recently rendered image, as given
    pub fn current_image(&self) -> Option<&GrayImage> {
        self.current.as_ref()
    }

    pub fn render_count(&self) -> usize {
        self.renders
    }
}

impl Default for VirtualDisplay {
    fn default() -> Self {
        let settings = DisplaySettings::default();
        Self::new(settings.width, settings.height)
    }
}

impl DisplayAdapter for VirtualDisplay {
    fn prepare(&mut self) -> Result<(), DisplayError> {
        if !self.prepared {
            tracing::info!("Initialized virtual display {}x{}", self.width, self.height);
            self.prepared = true;
        }
        Ok(())
    }

    fn render(&mut self, image: &GrayImage) -> bool {
        if !self.prepared {
            tracing::error!("Virtual display not prepared");
            return false;
        }

        self.current = Some(image.clone());
        self.renders += 1;
        tracing::debug!(
            "Virtual display updated with image {}x{}",
            image.width(),
            image.height()
        );
        true
    }

    fn clear(&mut self) -> bool {
        if !self.prepared {
            return false;
        }
        self.current = None;
        tracing::debug!("Virtual display cleared");
        true
    }

    fn release(&mut self) {
        self.current = None;
        self.prepared = false;
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn kind(&self) -> DisplayKind {
        DisplayKind::Virtual
    }
}

/// How the panel is mounted, in clockwise degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelRotation {
    None,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl From<u16> for PanelRotation {
    fn from(degrees: u16) -> Self {
        match degrees % 360 {
            90 => PanelRotation::Rotate90,
            180 => PanelRotation::Rotate180,
            270 => PanelRotation::Rotate270,
            _ => PanelRotation::None,
        }
    }
}

/// E-paper panel behind a [`PanelDriver`]
pub struct HardwareDisplay {
    driver: Box<dyn PanelDriver>,
    rotation: PanelRotation,
    mirror: bool,
    refresh_mode: RefreshMode,
    frame: GrayImage,
    prepared: bool,
}

impl HardwareDisplay {
    pub fn new(driver: Box<dyn PanelDriver>, settings: &DisplaySettings) -> Self {
        if settings.rotation % 90 != 0 {
            tracing::warn!(
                "Unsupported panel rotation {} degrees, mounting unrotated",
                settings.rotation
            );
        }

        Self {
            driver,
            rotation: PanelRotation::from(settings.rotation),
            mirror: settings.mirror,
            refresh_mode: settings.refresh_mode,
            frame: GrayImage::new(0, 0),
            prepared: false,
        }
    }

    /// Rotate and mirror for the mounting, then shrink to fit the panel
    fn fit(&self, image: &GrayImage) -> GrayImage {
        let mut oriented = match self.rotation {
            PanelRotation::None => image.clone(),
            PanelRotation::Rotate90 => imageops::rotate90(image),
            PanelRotation::Rotate180 => imageops::rotate180(image),
            PanelRotation::Rotate270 => imageops::rotate270(image),
        };
        if self.mirror {
            imageops::flip_horizontal_in_place(&mut oriented);
        }

        let (panel_w, panel_h) = self.frame.dimensions();
        let (w, h) = oriented.dimensions();
        if w <= panel_w && h <= panel_h {
            return oriented;
        }

        let ratio = (panel_w as f64 / w as f64).min(panel_h as f64 / h as f64);
        let new_w = ((w as f64 * ratio) as u32).clamp(1, panel_w);
        let new_h = ((h as f64 * ratio) as u32).clamp(1, panel_h);
        tracing::debug!("Downscaling {}x{} -> {}x{} for panel", w, h, new_w, new_h);
        imageops::resize(&oriented, new_w, new_h, FilterType::CatmullRom)
    }
}

impl DisplayAdapter for HardwareDisplay {
    fn prepare(&mut self) -> Result<(), DisplayError> {
        if self.prepared {
            return Ok(());
        }

        let (width, height) = self.driver.dimensions();
        if width == 0 || height == 0 {
            return Err(DisplayError::EmptyFrame(width, height));
        }

        self.frame = GrayImage::from_pixel(width, height, WHITE);
        self.prepared = true;
        tracing::info!("Hardware display initialized: {}x{}", width, height);
        Ok(())
    }

    fn render(&mut self, image: &GrayImage) -> bool {
        if !self.prepared {
            tracing::error!("Hardware display not prepared");
            return false;
        }

        let fitted = self.fit(image);
        let (panel_w, panel_h) = self.frame.dimensions();
        let x = (panel_w - fitted.width()) / 2;
        let y = (panel_h - fitted.height()) / 2;

        for pixel in self.frame.pixels_mut() {
            *pixel = WHITE;
        }
        imageops::replace(&mut self.frame, &fitted, x as i64, y as i64);

        match self.driver.draw_full(&self.frame, self.refresh_mode) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Error displaying image: {}", e);
                false
            }
        }
    }

    fn clear(&mut self) -> bool {
        if !self.prepared {
            return false;
        }

        for pixel in self.frame.pixels_mut() {
            *pixel = WHITE;
        }
        match self.driver.clear() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Error clearing display: {}", e);
                false
            }
        }
    }

    fn release(&mut self) {
        if !self.prepared {
            return;
        }

        self.clear();
        if let Err(e) = self.driver.sleep() {
            tracing::warn!("Panel did not enter sleep: {}", e);
        }
        self.prepared = false;
        tracing::info!("Hardware display released");
    }

    fn dimensions(&self) -> (u32, u32) {
        if self.prepared {
            self.frame.dimensions()
        } else {
            self.driver.dimensions()
        }
    }

    fn kind(&self) -> DisplayKind {
        DisplayKind::Hardware
    }
}

/// Build the display described by `settings`.
///
/// When hardware is requested, `open_panel` is called and the result is
/// prepared; if either step fails or panics the error is logged and a virtual
/// display of the configured size is returned instead.
pub fn create_display<F>(settings: &DisplaySettings, open_panel: F) -> Box<dyn DisplayAdapter>
where
    F: FnOnce(&DisplaySettings) -> Result<Box<dyn PanelDriver>, DisplayError>,
{
    if settings.virtual_display {
        return Box::new(VirtualDisplay::new(settings.width, settings.height));
    }

    let hardware = catch_unwind(AssertUnwindSafe(|| {
        open_panel(settings).and_then(|driver| {
            let mut display = HardwareDisplay::new(driver, settings);
            display.prepare()?;
            Ok(display)
        })
    }))
    .unwrap_or_else(|payload| {
        Err(DisplayError::Unavailable(format!(
            "panel driver panicked: {}",
            panic_message(payload.as_ref())
        )))
    });

    match hardware {
        Ok(display) => Box::new(display),
        Err(e) => {
            tracing::warn!(
                "Hardware display initialization failed, falling back to virtual: {}",
                e
            );
            Box::new(VirtualDisplay::new(settings.width, settings.height))
        }
    }
}

/// Panel opener for builds without a panel driver; always fails
pub fn unavailable_panel(_: &DisplaySettings) -> Result<Box<dyn PanelDriver>, DisplayError> {
    Err(DisplayError::Unavailable("no panel driver linked".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every frame pushed to it
    struct FakePanel {
        size: (u32, u32),
        frames: Arc<Mutex<Vec<GrayImage>>>,
        fail_draw: bool,
    }

    impl PanelDriver for FakePanel {
        fn dimensions(&self) -> (u32, u32) {
            self.size
        }

        fn draw_full(&mut self, frame: &GrayImage, _: RefreshMode) -> Result<(), DisplayError> {
            if self.fail_draw {
                return Err(DisplayError::Driver("SPI timeout".to_string()));
            }
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn clear(&mut self) -> Result<(), DisplayError> {
            Ok(())
        }

        fn sleep(&mut self) -> Result<(), DisplayError> {
            Ok(())
        }
    }

    fn panel(size: (u32, u32)) -> (FakePanel, Arc<Mutex<Vec<GrayImage>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            FakePanel {
                size,
                frames: frames.clone(),
                fail_draw: false,
            },
            frames,
        )
    }

    fn hardware_settings() -> DisplaySettings {
        DisplaySettings {
            virtual_display: false,
            ..DisplaySettings::default()
        }
    }

    #[test]
    fn test_virtual_requires_prepare() {
        let mut display = VirtualDisplay::new(800, 600);
        let image = GrayImage::new(10, 10);

        assert!(!display.render(&image));
        display.prepare().unwrap();
        assert!(display.render(&image));
        assert_eq!(display.render_count(), 1);
        assert_eq!(display.current_image().unwrap().dimensions(), (10, 10));

        assert!(display.clear());
        assert!(display.current_image().is_none());

        display.release();
        assert!(!display.render(&image));
    }

    #[test]
    fn test_hardware_centers_small_image() {
        let (driver, frames) = panel((40, 30));
        let mut display = HardwareDisplay::new(Box::new(driver), &hardware_settings());
        display.prepare().unwrap();

        assert!(display.render(&GrayImage::from_pixel(10, 10, Luma([0]))));

        let frames = frames.lock().unwrap();
        let frame = &frames[0];
        assert_eq!(frame.dimensions(), (40, 30));
        assert_eq!(frame.get_pixel(14, 10), &WHITE);
        assert_eq!(frame.get_pixel(15, 10), &Luma([0]));
        assert_eq!(frame.get_pixel(24, 19), &Luma([0]));
        assert_eq!(frame.get_pixel(25, 20), &WHITE);
    }

    #[test]
    fn test_hardware_downscales_preserving_aspect() {
        let (driver, _) = panel((100, 100));
        let display = {
            let mut d = HardwareDisplay::new(Box::new(driver), &hardware_settings());
            d.prepare().unwrap();
            d
        };

        let fitted = display.fit(&GrayImage::new(400, 100));
        assert_eq!(fitted.dimensions(), (100, 25));
    }

    #[test]
    fn test_hardware_mount_rotation() {
        let (driver, _) = panel((100, 100));
        let settings = DisplaySettings {
            rotation: 90,
            ..hardware_settings()
        };
        let mut display = HardwareDisplay::new(Box::new(driver), &settings);
        display.prepare().unwrap();

        let fitted = display.fit(&GrayImage::new(20, 10));
        assert_eq!(fitted.dimensions(), (10, 20));
    }

    #[test]
    fn test_hardware_draw_failure_is_false() {
        let (mut driver, _) = panel((10, 10));
        driver.fail_draw = true;
        let mut display = HardwareDisplay::new(Box::new(driver), &hardware_settings());
        display.prepare().unwrap();

        assert!(!display.render(&GrayImage::new(5, 5)));
    }

    #[test]
    fn test_create_display_virtual_when_requested() {
        let settings = DisplaySettings::virtual_panel(320, 240);
        let display = create_display(&settings, |_| panic!("panel must not be opened"));

        assert_eq!(display.kind(), DisplayKind::Virtual);
        assert_eq!(display.dimensions(), (320, 240));
    }

    #[test]
    fn test_create_display_falls_back() {
        let display = create_display(&hardware_settings(), unavailable_panel);
        assert_eq!(display.kind(), DisplayKind::Virtual);
        assert_eq!(display.dimensions(), (800, 600));

        let display = create_display(&hardware_settings(), |_| {
            Ok(Box::new(panel((0, 0)).0) as Box<dyn PanelDriver>)
        });
        assert_eq!(display.kind(), DisplayKind::Virtual);
    }

    #[test]
    fn test_create_display_hardware() {
        let display = create_display(&hardware_settings(), |_| {
            Ok(Box::new(panel((1448, 1072)).0) as Box<dyn PanelDriver>)
        });
        assert_eq!(display.kind(), DisplayKind::Hardware);
        assert_eq!(display.dimensions(), (1448, 1072));
    }
}
