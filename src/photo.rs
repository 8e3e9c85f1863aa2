use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::models::PhotoUpload;

/// A decoded photo: raw RGB8 buffer plus the metadata derived from it.
/// Immutable once the compliance gate has evaluated it.
#[derive(Debug, Clone)]
pub struct Photo {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub byte_len: u64,
    pub pixels: Vec<u8>,
}

impl Photo {
    pub fn from_upload(upload: &PhotoUpload) -> Self {
        let pixels = BASE64.decode(upload.pixels.as_bytes()).unwrap_or_default();
        let byte_len = upload.byte_len.unwrap_or(pixels.len() as u64);
        Self {
            filename: upload.filename.clone(),
            width: upload.width,
            height: upload.height,
            byte_len,
            pixels,
        }
    }

    pub fn from_pixels(filename: &str, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        let byte_len = pixels.len() as u64;
        Self {
            filename: filename.to_string(),
            width,
            height,
            byte_len,
            pixels,
        }
    }

    /// True when the buffer length matches the declared dimensions.
    pub fn buffer_consistent(&self) -> bool {
        self.pixels.len() as u64 == self.width as u64 * self.height as u64 * 3
    }

    pub fn rgb_at(&self, x: u32, y: u32) -> (u8, u8, u8) {
        let idx = ((y * self.width + x) * 3) as usize;
        (self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2])
    }

    /// Rec. 601 luma for a single pixel.
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        let (r, g, b) = self.rgb_at(x, y);
        ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
    }
}

#[cfg(test)]
pub mod testutil {
    use super::Photo;

    /// Solid-colour photo, flat enough to fail any sharpness check.
    pub fn flat(width: u32, height: u32, rgb: (u8, u8, u8)) -> Photo {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..(width * height) {
            pixels.extend_from_slice(&[rgb.0, rgb.1, rgb.2]);
        }
        Photo::from_pixels("flat.jpg", width, height, pixels)
    }

    /// Two-tone checkerboard, strong edges on every pixel boundary.
    pub fn checkerboard(width: u32, height: u32, a: (u8, u8, u8), b: (u8, u8, u8)) -> Photo {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let cell = if (x + y) % 2 == 0 { a } else { b };
                pixels.extend_from_slice(&[cell.0, cell.1, cell.2]);
            }
        }
        Photo::from_pixels("checker.jpg", width, height, pixels)
    }

    pub fn named(mut photo: Photo, filename: &str) -> Photo {
        photo.filename = filename.to_string();
        photo
    }
}
