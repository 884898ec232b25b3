//! Feature detection seam.
//!
//! The detector itself is an external algorithm; the memory only requires the
//! [`FeatureDetector`] capability trait.  [`GridDetector`] is a deterministic
//! stand-in that samples a regular grid of patch descriptors, sufficient for
//! simulation and tests.
//!
//! Also here: rectangular [`Roi`] computation from the `"L R T B"` ratio
//! string and keypoint depth filtering.

use rovermap_core::{Descriptors, Image, KeyPoint};

use crate::VisionError;

// ────────────────────────────────────────────────────────────────────────────
// Roi
// ────────────────────────────────────────────────────────────────────────────

/// A rectangular region of interest in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// The full frame of `image`.
    pub fn full(image: &Image) -> Self {
        Self {
            x: 0,
            y: 0,
            width: image.width,
            height: image.height,
        }
    }

    /// Crop `image` by the ratios `[left, right, top, bottom]`, each the
    /// fraction of the corresponding border to discard.
    pub fn from_ratios(image: &Image, ratios: &[f32; 4]) -> Self {
        let w = image.width as f32;
        let h = image.height as f32;
        let x = (ratios[0] * w) as u32;
        let y = (ratios[2] * h) as u32;
        Self {
            x,
            y,
            width: (w - ratios[1] * w) as u32 - x,
            height: (h - ratios[3] * h) as u32 - y,
        }
    }

    pub fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x as f32
            && py >= self.y as f32
            && px < (self.x + self.width) as f32
            && py < (self.y + self.height) as f32
    }
}

/// Parse `"L R T B"` space-separated ratios.
///
/// Each value must be in `[0, 1)` and opposing pairs must leave a non-empty
/// region (`L + R < 1`, `T + B < 1`).
pub fn parse_roi_ratios(s: &str) -> Result<[f32; 4], VisionError> {
    let values: Vec<f32> = s
        .split_whitespace()
        .map(|v| v.parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|e| VisionError::BadRoi(format!("{s:?}: {e}")))?;
    if values.len() != 4 {
        return Err(VisionError::BadRoi(format!(
            "expected 4 values, got {} in {s:?}",
            values.len()
        )));
    }
    let [l, r, t, b] = [values[0], values[1], values[2], values[3]];
    let in_range = |v: f32| (0.0..1.0).contains(&v);
    if !(in_range(l) && in_range(r) && in_range(t) && in_range(b)) || l + r >= 1.0 || t + b >= 1.0 {
        return Err(VisionError::BadRoi(s.to_string()));
    }
    Ok([l, r, t, b])
}

// ────────────────────────────────────────────────────────────────────────────
// FeatureDetector
// ────────────────────────────────────────────────────────────────────────────

/// A 2-D feature detector/descriptor backend.
///
/// Swapping strategies builds a fresh implementation from configuration; no
/// hot mutation of internal state across strategies.
pub trait FeatureDetector: Send {
    /// Upper bound on returned keypoints; negative disables extraction.
    fn max_features(&self) -> i32;

    /// Detect keypoints in the grayscale `image`, restricted to `roi`.
    fn detect(&self, image: &Image, roi: &Roi) -> Vec<KeyPoint>;

    /// Compute one descriptor row per keypoint, in order.
    fn describe(&self, image: &Image, keypoints: &[KeyPoint]) -> Descriptors;

    /// Refine keypoint positions to sub-pixel accuracy in place.
    ///
    /// The default implementation is a no-op; backends with a corner refiner
    /// override it.
    fn refine_subpixel(
        &self,
        image: &Image,
        keypoints: &mut [KeyPoint],
        win_size: i32,
        iterations: i32,
        eps: f32,
    ) {
        let _ = (image, keypoints, win_size, iterations, eps);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// GridDetector
// ────────────────────────────────────────────────────────────────────────────

/// Deterministic stand-in detector: keypoints on a regular grid, descriptors
/// sampled from the surrounding intensity patch.
///
/// Identical images yield identical descriptors, which makes quantization and
/// rehearsal behaviour reproducible in tests and simulation.
#[derive(Debug, Clone)]
pub struct GridDetector {
    max_features: i32,
    /// Square patch side sampled around each keypoint.
    patch: u32,
}

impl GridDetector {
    pub fn new(max_features: i32) -> Self {
        Self {
            max_features,
            patch: 4,
        }
    }
}

impl FeatureDetector for GridDetector {
    fn max_features(&self) -> i32 {
        self.max_features
    }

    fn detect(&self, image: &Image, roi: &Roi) -> Vec<KeyPoint> {
        if self.max_features <= 0 || image.is_empty() || roi.width == 0 || roi.height == 0 {
            return Vec::new();
        }
        // Grid spacing that yields at most max_features points.
        let target = self.max_features as f32;
        let cells = (roi.width as f32 * roi.height as f32 / target).sqrt().max(1.0) as u32;
        let step = cells.max(self.patch);

        let mut keypoints = Vec::new();
        let mut y = roi.y + step / 2;
        while y < roi.y + roi.height {
            let mut x = roi.x + step / 2;
            while x < roi.x + roi.width {
                if keypoints.len() as i32 >= self.max_features {
                    return keypoints;
                }
                let response = image.gray_at(x, y).unwrap_or(0) as f32 / 255.0;
                let mut kp = KeyPoint::new(x as f32, y as f32, self.patch as f32);
                kp.response = response;
                keypoints.push(kp);
                x += step;
            }
            y += step;
        }
        keypoints
    }

    fn describe(&self, image: &Image, keypoints: &[KeyPoint]) -> Descriptors {
        let mut descriptors = Descriptors::empty();
        let half = (self.patch / 2) as i64;
        for kp in keypoints {
            let mut row = Vec::with_capacity((self.patch * self.patch) as usize);
            for dy in -half..half {
                for dx in -half..half {
                    let u = (kp.x as i64 + dx).max(0) as u32;
                    let v = (kp.y as i64 + dy).max(0) as u32;
                    let value = image
                        .gray_at(u.min(image.width.saturating_sub(1)), v.min(image.height.saturating_sub(1)))
                        .unwrap_or(0);
                    row.push(value as f32 / 255.0);
                }
            }
            descriptors.push_row(&row);
        }
        descriptors
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Depth filter
// ────────────────────────────────────────────────────────────────────────────

/// Drop keypoints whose depth reading falls outside `[min_depth, max_depth]`
/// (a bound of 0 disables that side).  Descriptor rows are filtered in step.
pub fn filter_keypoints_by_depth(
    keypoints: Vec<KeyPoint>,
    descriptors: Descriptors,
    depth: &Image,
    min_depth: f32,
    max_depth: f32,
) -> (Vec<KeyPoint>, Descriptors) {
    if min_depth <= 0.0 && max_depth <= 0.0 {
        return (keypoints, descriptors);
    }
    let keep: Vec<bool> = keypoints
        .iter()
        .map(|kp| match depth.depth_at(kp.x as u32, kp.y as u32) {
            Some(d) => {
                !((min_depth > 0.0 && d < min_depth) || (max_depth > 0.0 && d > max_depth))
            }
            None => false,
        })
        .collect();
    let filtered_desc = if descriptors.is_empty() {
        descriptors
    } else {
        descriptors.filter_rows(&keep)
    };
    let filtered_kps = keypoints
        .into_iter()
        .zip(&keep)
        .filter_map(|(kp, &k)| k.then_some(kp))
        .collect();
    (filtered_kps, filtered_desc)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
