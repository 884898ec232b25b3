//! Pinhole and stereo camera models.
//!
//! A [`CameraModel`] carries the rectified intrinsics needed to project 3-D
//! points into pixels and back-project pixels with known depth into 3-D.
//! A [`StereoCameraModel`] pairs two rectified pinhole models with a baseline
//! and converts horizontal disparity into depth.

use serde::{Deserialize, Serialize};

use crate::transform::{Transform, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// CameraModel
// ────────────────────────────────────────────────────────────────────────────

/// A rectified pinhole camera: focal lengths, principal point, image size and
/// the camera's mounting transform on the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    /// Rectified image width in pixels.
    pub width: u32,
    /// Rectified image height in pixels.
    pub height: u32,
    /// Pose of the optical frame relative to the robot base.
    pub local_transform: Transform,
}

impl CameraModel {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            local_transform: Transform::identity(),
        }
    }

    /// True when the intrinsics describe a usable camera.
    pub fn is_valid(&self) -> bool {
        self.fx > 0.0 && self.fy > 0.0 && self.cx >= 0.0 && self.cy >= 0.0
    }

    /// Project a 3-D point in the optical frame onto the image plane.
    ///
    /// Returns `None` when the point is at or behind the camera.
    pub fn project(&self, p: Vec3) -> Option<(f32, f32)> {
        if p.z <= 0.0 || !p.is_finite() {
            return None;
        }
        Some((
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Back-project pixel `(u, v)` at `depth` metres into the optical frame.
    pub fn back_project(&self, u: f32, v: f32, depth: f32) -> Vec3 {
        if depth <= 0.0 || !depth.is_finite() {
            return Vec3::nan();
        }
        Vec3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// Rescale the intrinsics, e.g. by `1/decimation` after image decimation.
    pub fn scale(&mut self, factor: f32) {
        self.fx *= factor;
        self.fy *= factor;
        self.cx *= factor;
        self.cy *= factor;
        self.width = (self.width as f32 * factor) as u32;
        self.height = (self.height as f32 * factor) as u32;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StereoCameraModel
// ────────────────────────────────────────────────────────────────────────────

/// A rectified stereo pair: left/right pinhole models plus the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoCameraModel {
    pub left: CameraModel,
    pub right: CameraModel,
    /// Distance between the two optical centres, in metres.
    pub baseline: f32,
}

impl StereoCameraModel {
    pub fn new(left: CameraModel, right: CameraModel, baseline: f32) -> Self {
        Self {
            left,
            right,
            baseline,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.left.is_valid() && self.right.is_valid() && self.baseline > 0.0
    }

    /// Depth from horizontal disparity: `z = baseline * fx / disparity`.
    ///
    /// Returns `None` for a non-positive disparity (point at infinity or a
    /// failed correspondence).
    pub fn depth_from_disparity(&self, disparity: f32) -> Option<f32> {
        if disparity > 0.0 {
            Some(self.baseline * self.left.fx / disparity)
        } else {
            None
        }
    }

    /// Rescale both models (the baseline is metric and unaffected).
    pub fn scale(&mut self, factor: f32) {
        self.left.scale(factor);
        self.right.scale(factor);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
