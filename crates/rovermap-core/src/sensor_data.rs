//! Sensor observation bundles and retained payloads.
//!
//! [`SensorData`] is the raw input handed to the memory for one observation:
//! imagery, optional depth or right image, optional laser scan, calibration,
//! free-form user data, and optionally pre-extracted features.
//! [`SensorPayload`] is what a map node retains after the builder pipeline:
//! compressed blobs plus the calibration, and optionally the raw buffers.
//!
//! Compression itself is an external concern behind the [`BlobCodec`] seam;
//! [`PlainCodec`] is the identity implementation used by default and in tests.

use serde::{Deserialize, Serialize};

use crate::camera::{CameraModel, StereoCameraModel};
use crate::feature::{Descriptors, KeyPoint};
use crate::image::Image;
use crate::scan::LaserScan;

// ────────────────────────────────────────────────────────────────────────────
// BlobCodec
// ────────────────────────────────────────────────────────────────────────────

/// Compression seam for retained sensor blobs.
///
/// Implementations must be `Send + Sync`: the builder compresses the image,
/// depth, scan and user-data blobs of one observation concurrently.
pub trait BlobCodec: Send + Sync {
    /// Compress a serialized blob.
    fn encode(&self, blob: &[u8]) -> Vec<u8>;

    /// Decompress; `None` when the blob is not valid for this codec.
    fn decode(&self, blob: &[u8]) -> Option<Vec<u8>>;
}

/// Identity codec: stores blobs uncompressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCodec;

impl BlobCodec for PlainCodec {
    fn encode(&self, blob: &[u8]) -> Vec<u8> {
        blob.to_vec()
    }

    fn decode(&self, blob: &[u8]) -> Option<Vec<u8>> {
        Some(blob.to_vec())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SensorData
// ────────────────────────────────────────────────────────────────────────────

/// One raw observation, as submitted to the memory.
#[derive(Debug, Clone, Default)]
pub struct SensorData {
    /// Source-assigned id; 0 lets the memory allocate, negative marks an
    /// intermediate (feature-less) node.
    pub id: i32,
    /// Acquisition time, seconds since an arbitrary epoch.
    pub stamp: f64,
    /// Grayscale or BGR camera image; may be empty.
    pub image: Image,
    /// Depth map registered to `image`, or the right image of a stereo pair;
    /// may be empty.
    pub depth_or_right: Image,
    /// Pinhole models for `image` (one per horizontal sub-image).
    pub camera_models: Vec<CameraModel>,
    /// Stereo calibration; when set, `depth_or_right` is the right image.
    pub stereo_model: Option<StereoCameraModel>,
    /// Optional laser scan.
    pub laser_scan: LaserScan,
    /// Free-form user blob carried with the node.
    pub user_data: Vec<u8>,
    /// Pre-extracted keypoints; when non-empty the builder skips detection.
    pub keypoints: Vec<KeyPoint>,
    /// Descriptors matching `keypoints` row-for-row.
    pub descriptors: Descriptors,
}

impl SensorData {
    /// An image-only observation.
    pub fn from_image(id: i32, stamp: f64, image: Image) -> Self {
        Self {
            id,
            stamp,
            image,
            ..Default::default()
        }
    }

    /// True when there is no sensor content at all.
    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
            && self.depth_or_right.is_empty()
            && self.laser_scan.is_empty()
            && self.user_data.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SensorPayload
// ────────────────────────────────────────────────────────────────────────────

/// The sensor content retained by a map node: compressed blobs, calibration,
/// scan limits, and optionally the raw buffers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorPayload {
    pub image: Vec<u8>,
    pub depth_or_right: Vec<u8>,
    pub scan: Vec<u8>,
    pub user_data: Vec<u8>,
    pub scan_max_points: u32,
    pub scan_max_range: f32,
    pub camera_models: Vec<CameraModel>,
    pub stereo_model: Option<StereoCameraModel>,
    /// Raw (uncompressed) copies, retained only when configured.
    #[serde(skip)]
    pub raw_image: Image,
    #[serde(skip)]
    pub raw_depth_or_right: Image,
    #[serde(skip)]
    pub raw_scan: LaserScan,
    #[serde(skip)]
    pub raw_user_data: Vec<u8>,
}

impl SensorPayload {
    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
            && self.depth_or_right.is_empty()
            && self.scan.is_empty()
            && self.user_data.is_empty()
    }

    /// Drop the raw buffers, keeping only the compressed blobs.
    pub fn clear_raw(&mut self) {
        self.raw_image = Image::empty();
        self.raw_depth_or_right = Image::empty();
        self.raw_scan = LaserScan::empty();
        self.raw_user_data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PixelFormat;

    #[test]
    fn plain_codec_roundtrip() {
        let codec = PlainCodec;
        let blob = vec![1u8, 2, 3, 4];
        assert_eq!(codec.decode(&codec.encode(&blob)).unwrap(), blob);
    }

    #[test]
    fn sensor_data_emptiness() {
        assert!(SensorData::default().is_empty());
        let img = Image::new(1, 1, PixelFormat::Gray8, vec![5]);
        assert!(!SensorData::from_image(1, 0.0, img).is_empty());
    }

    #[test]
    fn payload_clear_raw_keeps_compressed() {
        let mut payload = SensorPayload {
            image: vec![1, 2, 3],
            raw_image: Image::new(1, 1, PixelFormat::Gray8, vec![9]),
            ..Default::default()
        };
        payload.clear_raw();
        assert!(payload.raw_image.is_empty());
        assert_eq!(payload.image, vec![1, 2, 3]);
    }
}
