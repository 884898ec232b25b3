//! Owned image buffers.
//!
//! [`Image`] is a flat pixel buffer with a closed [`PixelFormat`] tag.  The
//! memory accepts grayscale or 3-channel colour imagery plus 16-bit/float
//! depth maps (or an 8-bit right stereo image), and needs only a handful of
//! operations on them: grayscale conversion for feature detection, integer
//! decimation for storage, per-pixel depth lookup and the float→16-bit depth
//! conversion used before compression.

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// PixelFormat
// ────────────────────────────────────────────────────────────────────────────

/// Supported pixel layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit single-channel intensity.
    Gray8,
    /// 8-bit 3-channel colour, B-G-R byte order.
    Bgr8,
    /// 16-bit unsigned depth in millimetres.
    Depth16U,
    /// 32-bit float depth in metres.
    Depth32F,
}

impl PixelFormat {
    /// Bytes per pixel for this format.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Bgr8 => 3,
            PixelFormat::Depth16U => 2,
            PixelFormat::Depth32F => 4,
        }
    }

    /// True for the two depth layouts.
    pub fn is_depth(self) -> bool {
        matches!(self, PixelFormat::Depth16U | PixelFormat::Depth32F)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Image
// ────────────────────────────────────────────────────────────────────────────

/// A raw image frame: dimensions, format and tightly packed pixel data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Default for Image {
    fn default() -> Self {
        Image::empty()
    }
}

impl Image {
    /// An empty (zero-sized) image.
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Gray8,
            data: Vec::new(),
        }
    }

    /// Build an image from raw data.  The data length must equal
    /// `width * height * bytes_per_pixel`.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            width as usize * height as usize * format.bytes_per_pixel(),
            "image buffer size does not match {}x{} {:?}",
            width,
            height,
            format
        );
        Self {
            width,
            height,
            format,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Convert to a single-channel grayscale image.
    ///
    /// Gray input is returned unchanged; BGR uses the usual luma weights.
    /// Depth formats are not convertible and return an empty image.
    pub fn to_gray(&self) -> Image {
        match self.format {
            PixelFormat::Gray8 => self.clone(),
            PixelFormat::Bgr8 => {
                let mut out = Vec::with_capacity(self.width as usize * self.height as usize);
                for px in self.data.chunks_exact(3) {
                    let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
                    out.push((0.114 * b + 0.587 * g + 0.299 * r).round() as u8);
                }
                Image::new(self.width, self.height, PixelFormat::Gray8, out)
            }
            _ => Image::empty(),
        }
    }

    /// Intensity at pixel `(u, v)` of a grayscale image, `None` out of bounds
    /// or for non-gray formats.
    pub fn gray_at(&self, u: u32, v: u32) -> Option<u8> {
        if self.format != PixelFormat::Gray8 || u >= self.width || v >= self.height {
            return None;
        }
        Some(self.data[(v * self.width + u) as usize])
    }

    /// Depth in metres at pixel `(u, v)`.
    ///
    /// 16-bit depth is interpreted as millimetres.  Returns `None` for
    /// non-depth formats, out-of-bounds pixels and zero/invalid readings.
    pub fn depth_at(&self, u: u32, v: u32) -> Option<f32> {
        if u >= self.width || v >= self.height {
            return None;
        }
        let idx = (v * self.width + u) as usize;
        match self.format {
            PixelFormat::Depth16U => {
                let lo = self.data[idx * 2];
                let hi = self.data[idx * 2 + 1];
                let mm = u16::from_le_bytes([lo, hi]);
                if mm == 0 { None } else { Some(mm as f32 / 1000.0) }
            }
            PixelFormat::Depth32F => {
                let b = &self.data[idx * 4..idx * 4 + 4];
                let m = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                if m.is_finite() && m > 0.0 { Some(m) } else { None }
            }
            _ => None,
        }
    }

    /// Keep every `step`-th pixel in both directions.  `step <= 1` returns a
    /// clone; empty images stay empty.
    pub fn decimate(&self, step: u32) -> Image {
        if step <= 1 || self.is_empty() {
            return self.clone();
        }
        let bpp = self.format.bytes_per_pixel();
        let new_w = self.width / step;
        let new_h = self.height / step;
        let mut out = Vec::with_capacity(new_w as usize * new_h as usize * bpp);
        for y in 0..new_h {
            for x in 0..new_w {
                let src = ((y * step) * self.width + x * step) as usize * bpp;
                out.extend_from_slice(&self.data[src..src + bpp]);
            }
        }
        Image::new(new_w, new_h, self.format, out)
    }

    /// Convert 32-bit float depth (metres) to 16-bit depth (millimetres).
    ///
    /// Readings beyond the 16-bit range or non-finite values become 0
    /// (invalid).  Non-`Depth32F` images are returned unchanged.
    pub fn depth_to_16u(&self) -> Image {
        if self.format != PixelFormat::Depth32F {
            return self.clone();
        }
        let mut out = Vec::with_capacity(self.data.len() / 2);
        for b in self.data.chunks_exact(4) {
            let m = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            let mm = if m.is_finite() && m > 0.0 && m * 1000.0 <= u16::MAX as f32 {
                (m * 1000.0).round() as u16
            } else {
                0
            };
            out.extend_from_slice(&mm.to_le_bytes());
        }
        Image::new(self.width, self.height, PixelFormat::Depth16U, out)
    }

    /// Serialize to a framed byte blob (header + pixels), the unit handed to
    /// a [`BlobCodec`][crate::sensor_data::BlobCodec].  Empty images
    /// serialize to an empty blob.
    pub fn to_blob(&self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut blob = Vec::with_capacity(9 + self.data.len());
        blob.extend_from_slice(&self.width.to_le_bytes());
        blob.extend_from_slice(&self.height.to_le_bytes());
        blob.push(match self.format {
            PixelFormat::Gray8 => 0,
            PixelFormat::Bgr8 => 1,
            PixelFormat::Depth16U => 2,
            PixelFormat::Depth32F => 3,
        });
        blob.extend_from_slice(&self.data);
        blob
    }

    /// Inverse of [`to_blob`][Self::to_blob].  Returns `None` on a malformed
    /// header or truncated pixel data.
    pub fn from_blob(blob: &[u8]) -> Option<Image> {
        if blob.is_empty() {
            return Some(Image::empty());
        }
        if blob.len() < 9 {
            return None;
        }
        let width = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        let height = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        let format = match blob[8] {
            0 => PixelFormat::Gray8,
            1 => PixelFormat::Bgr8,
            2 => PixelFormat::Depth16U,
            3 => PixelFormat::Depth32F,
            _ => return None,
        };
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if blob.len() - 9 != expected {
            return None;
        }
        Some(Image::new(width, height, format, blob[9..].to_vec()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_gray(width: u32, height: u32) -> Image {
        let data = (0..width * height).map(|i| (i % 251) as u8).collect();
        Image::new(width, height, PixelFormat::Gray8, data)
    }

    // ── conversion ──────────────────────────────────────────────────────────

    #[test]
    fn bgr_to_gray_uses_luma_weights() {
        let img = Image::new(1, 1, PixelFormat::Bgr8, vec![0, 0, 255]); // pure red
        let gray = img.to_gray();
        assert_eq!(gray.format, PixelFormat::Gray8);
        assert_eq!(gray.gray_at(0, 0), Some(76)); // 0.299 * 255
    }

    #[test]
    fn gray_to_gray_is_identity() {
        let img = gradient_gray(4, 4);
        assert_eq!(img.to_gray(), img);
    }

    #[test]
    fn depth_to_gray_is_empty() {
        let img = Image::new(1, 1, PixelFormat::Depth16U, vec![0, 0]);
        assert!(img.to_gray().is_empty());
    }

    // ── depth lookup ────────────────────────────────────────────────────────

    #[test]
    fn depth16_is_millimetres() {
        let img = Image::new(1, 1, PixelFormat::Depth16U, 1500u16.to_le_bytes().to_vec());
        assert!((img.depth_at(0, 0).unwrap() - 1.5).abs() < 1e-5);
    }

    #[test]
    fn depth32_is_metres() {
        let img = Image::new(1, 1, PixelFormat::Depth32F, 2.25f32.to_le_bytes().to_vec());
        assert!((img.depth_at(0, 0).unwrap() - 2.25).abs() < 1e-5);
    }

    #[test]
    fn zero_depth_is_invalid() {
        let img = Image::new(1, 1, PixelFormat::Depth16U, vec![0, 0]);
        assert!(img.depth_at(0, 0).is_none());
    }

    #[test]
    fn depth_out_of_bounds_is_none() {
        let img = Image::new(1, 1, PixelFormat::Depth16U, vec![10, 0]);
        assert!(img.depth_at(1, 0).is_none());
        assert!(img.depth_at(0, 1).is_none());
    }

    // ── decimation ──────────────────────────────────────────────────────────

    #[test]
    fn decimate_halves_dimensions() {
        let img = gradient_gray(8, 6);
        let out = img.decimate(2);
        assert_eq!(out.width, 4);
        assert_eq!(out.height, 3);
        // Top-left pixel survives.
        assert_eq!(out.gray_at(0, 0), img.gray_at(0, 0));
        // Pixel (1,1) of the output is (2,2) of the input.
        assert_eq!(out.gray_at(1, 1), img.gray_at(2, 2));
    }

    #[test]
    fn decimate_step_one_is_clone() {
        let img = gradient_gray(4, 4);
        assert_eq!(img.decimate(1), img);
    }

    // ── depth 16-bit conversion ─────────────────────────────────────────────

    #[test]
    fn depth32_to_16u_converts_to_millimetres() {
        let img = Image::new(1, 1, PixelFormat::Depth32F, 1.234f32.to_le_bytes().to_vec());
        let out = img.depth_to_16u();
        assert_eq!(out.format, PixelFormat::Depth16U);
        assert!((out.depth_at(0, 0).unwrap() - 1.234).abs() < 1e-3);
    }

    #[test]
    fn depth32_to_16u_clamps_invalid() {
        let img = Image::new(
            1,
            1,
            PixelFormat::Depth32F,
            f32::INFINITY.to_le_bytes().to_vec(),
        );
        let out = img.depth_to_16u();
        assert!(out.depth_at(0, 0).is_none());
    }

    // ── blob framing ────────────────────────────────────────────────────────

    #[test]
    fn blob_roundtrip() {
        let img = gradient_gray(5, 3);
        let back = Image::from_blob(&img.to_blob()).unwrap();
        assert_eq!(back, img);
    }

    #[test]
    fn empty_blob_is_empty_image() {
        assert!(Image::from_blob(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let mut blob = gradient_gray(4, 4).to_blob();
        blob.pop();
        assert!(Image::from_blob(&blob).is_none());
    }
}
