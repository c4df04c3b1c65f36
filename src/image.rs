// image.rs: the generated RGBA8 image.
//
// `GeneratedImage` is produced only by a successful generation session and is
// immutable afterwards: the pixel buffer is private and exposed read-only.
// Rows are tightly packed (stride == width * 4); unlike a GPU texture copy,
// a buffer-to-buffer readback has no row alignment padding to strip.

use std::fmt;
use std::path::Path;

use thiserror::Error;

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("pixel buffer holds {got} bytes, {width}×{height} RGBA8 needs {expected}")]
    SizeMismatch { width: u32, height: u32, expected: usize, got: usize },
}

/// A `width`×`height` RGBA8 image. Immutable once constructed.
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GeneratedImage {
    /// Wrap an RGBA8 buffer of exactly `width * height * 4` bytes.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ImageError> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(ImageError::SizeMismatch { width, height, expected, got: pixels.len() });
        }
        Ok(GeneratedImage { width, height, pixels })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA8 bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// RGBA of the pixel at `(x, y)`, or `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let px = &self.pixels[i..i + BYTES_PER_PIXEL];
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Encode as PNG at `path`.
    pub fn save_png(&self, path: &Path) -> Result<(), image::ImageError> {
        image::save_buffer_with_format(
            path,
            &self.pixels,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
    }
}

impl fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl fmt::Display for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} RGBA8", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(w: u32, h: u32) -> GeneratedImage {
        let pixels = (0..w * h)
            .flat_map(|i| if i % 2 == 0 { [255, 255, 255, 255] } else { [0, 0, 0, 255] })
            .collect();
        GeneratedImage::from_rgba(w, h, pixels).unwrap()
    }

    #[test]
    fn rejects_wrong_length() {
        let err = GeneratedImage::from_rgba(4, 4, vec![0; 63]).unwrap_err();
        assert_eq!(err, ImageError::SizeMismatch { width: 4, height: 4, expected: 64, got: 63 });
    }

    #[test]
    fn pixel_lookup_is_row_major() {
        let img = checker(3, 2);
        assert_eq!(img.pixel(0, 0), Some([255, 255, 255, 255]));
        assert_eq!(img.pixel(1, 0), Some([0, 0, 0, 255]));
        // index 3 → (0, 1), odd
        assert_eq!(img.pixel(0, 1), Some([0, 0, 0, 255]));
        assert_eq!(img.pixel(3, 0), None);
        assert_eq!(img.pixel(0, 2), None);
    }

    #[test]
    fn png_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let img = checker(8, 8);
        img.save_png(&path).unwrap();
        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded.as_raw(), img.as_bytes());
    }
}
