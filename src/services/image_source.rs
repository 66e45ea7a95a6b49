//! Where run images come from.

use camino::{Utf8Path, Utf8PathBuf};
use image::GrayImage;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageLoadError {
    #[error("Image not found: {0}")]
    NotFound(Utf8PathBuf),

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: Utf8PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Loads an image as 8-bit grayscale
pub trait ImageSource: Send + Sync {
    fn load(&self, path: &Utf8Path) -> Result<GrayImage, ImageLoadError>;
}

/// Reads images from disk with the `image` crate
#[derive(Debug, Clone, Default)]
pub struct FileImageSource {
    base_dir: Option<Utf8PathBuf>,
}

impl FileImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `base_dir`
    pub fn with_base_dir(base_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ImageSource for FileImageSource {
    fn load(&self, path: &Utf8Path) -> Result<GrayImage, ImageLoadError> {
        let resolved = self.resolve(path);
        if !resolved.is_file() {
            return Err(ImageLoadError::NotFound(path.to_path_buf()));
        }

        let image = image::open(&resolved).map_err(|source| ImageLoadError::Decode {
            path: resolved.clone(),
            source,
        })?;
        Ok(image.into_luma8())
    }
}

/// In-memory images keyed by path
#[derive(Debug, Clone, Default)]
pub struct MemoryImageSource {
    images: HashMap<Utf8PathBuf, GrayImage>,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, path: impl Into<Utf8PathBuf>, image: GrayImage) -> Self {
        self.insert(path, image);
        self
    }

    pub fn insert(&mut self, path: impl Into<Utf8PathBuf>, image: GrayImage) {
        self.images.insert(path.into(), image);
    }
}

impl ImageSource for MemoryImageSource {
    fn load(&self, path: &Utf8Path) -> Result<GrayImage, ImageLoadError> {
        self.images
            .get(path)
            .cloned()
            .ok_or_else(|| ImageLoadError::NotFound(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use tempfile::TempDir;

    #[test]
    fn test_file_source_converts_to_luma() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf()).unwrap();

        let rgb = image::RgbImage::from_pixel(4, 3, image::Rgb([255, 255, 255]));
        rgb.save(dir.join("white.png")).unwrap();

        let source = FileImageSource::with_base_dir(dir.clone());
        let image = source.load(Utf8Path::new("white.png")).unwrap();

        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(0, 0), &Luma([255]));
    }

    #[test]
    fn test_file_source_missing() {
        let source = FileImageSource::new();
        let err = source.load(Utf8Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(matches!(err, ImageLoadError::NotFound(_)));
        assert_eq!(err.to_string(), "Image not found: /definitely/not/here.png");
    }

    #[test]
    fn test_file_source_undecodable() {
        let temp_dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp_dir.path().join("junk.png")).unwrap();
        std::fs::write(&path, b"not an image").unwrap();

        let err = FileImageSource::new().load(&path).unwrap_err();
        assert!(matches!(err, ImageLoadError::Decode { .. }));
    }

    #[test]
    fn test_memory_source() {
        let source = MemoryImageSource::new().with_image("a.png", GrayImage::new(2, 2));
        assert!(source.load(Utf8Path::new("a.png")).is_ok());
        assert!(source.load(Utf8Path::new("b.png")).is_err());
    }
}
