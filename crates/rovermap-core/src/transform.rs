//! Rigid-body transform math.
//!
//! A [`Transform`] is the 6-DoF pose of one frame relative to another:
//! a translation followed by a unit-quaternion rotation.  Map nodes carry an
//! optional odometry pose, and graph links carry the relative transform
//! between two nodes; both are composed, inverted and compared through the
//! operations here.
//!
//! # Example
//!
//! ```rust
//! use rovermap_core::transform::{Transform, Vec3};
//!
//! let a = Transform::from_translation(Vec3::new(1.0, 0.0, 0.0));
//! let b = Transform::from_translation(Vec3::new(2.5, 0.0, 0.0));
//!
//! // Relative motion a -> b.
//! let motion = a.inverse().compose(&b);
//! assert!((motion.translation.x - 1.5).abs() < 1e-5);
//!
//! // Composing back recovers b.
//! let back = a.compose(&motion);
//! assert!((back.translation.x - 2.5).abs() < 1e-5);
//! ```

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Vec3
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector (translation, point or direction).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Create a new vector.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// A vector with every component set to NaN, marking an unknown 3-D
    /// point (e.g. a visual word whose depth could not be recovered).
    pub fn nan() -> Self {
        Self::new(f32::NAN, f32::NAN, f32::NAN)
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn cross(self, rhs: Self) -> Self {
        Self::new(
            self.y * rhs.z - self.z * rhs.y,
            self.z * rhs.x - self.x * rhs.z,
            self.x * rhs.y - self.y * rhs.x,
        )
    }

    pub fn norm(self) -> f32 {
        self.dot(self).sqrt()
    }

    pub fn norm_squared(self) -> f32 {
        self.dot(self)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Quaternion
// ────────────────────────────────────────────────────────────────────────────

/// A unit quaternion representing a 3-D rotation (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    /// Create a quaternion.  The caller is responsible for providing a unit
    /// quaternion (|q| = 1); use [`normalized`][Self::normalized] when unsure.
    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    /// The identity rotation (no rotation).
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Build a rotation from intrinsic roll (X), pitch (Y), yaw (Z) angles
    /// in radians.
    pub fn from_euler(roll: f32, pitch: f32, yaw: f32) -> Self {
        let (sr, cr) = (roll * 0.5).sin_cos();
        let (sp, cp) = (pitch * 0.5).sin_cos();
        let (sy, cy) = (yaw * 0.5).sin_cos();
        Self::new(
            cr * cp * cy + sr * sp * sy,
            sr * cp * cy - cr * sp * sy,
            cr * sp * cy + sr * cp * sy,
            cr * cp * sy - sr * sp * cy,
        )
    }

    /// Extract (roll, pitch, yaw) Euler angles in radians.
    pub fn to_euler(self) -> (f32, f32, f32) {
        // roll (X axis)
        let sinr_cosp = 2.0 * (self.w * self.x + self.y * self.z);
        let cosr_cosp = 1.0 - 2.0 * (self.x * self.x + self.y * self.y);
        let roll = sinr_cosp.atan2(cosr_cosp);

        // pitch (Y axis), clamped at the gimbal singularity
        let sinp = 2.0 * (self.w * self.y - self.z * self.x);
        let pitch = if sinp.abs() >= 1.0 {
            std::f32::consts::FRAC_PI_2.copysign(sinp)
        } else {
            sinp.asin()
        };

        // yaw (Z axis)
        let siny_cosp = 2.0 * (self.w * self.z + self.x * self.y);
        let cosy_cosp = 1.0 - 2.0 * (self.y * self.y + self.z * self.z);
        let yaw = siny_cosp.atan2(cosy_cosp);

        (roll, pitch, yaw)
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Return this quaternion scaled to unit norm.
    pub fn normalized(self) -> Self {
        let n = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if n > 0.0 {
            Self::new(self.w / n, self.x / n, self.y / n, self.z / n)
        } else {
            Self::identity()
        }
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Vec3::new(rotated.x, rotated.y, rotated.z)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transform
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body 3-D transform: the pose of frame B relative to frame A.
///
/// To convert a point expressed in frame B into frame A, rotate it by
/// `rotation` then add `translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl Transform {
    /// Create a transform from a translation and rotation.
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// The identity transform (no translation, no rotation).
    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }

    /// A pure translation.
    pub fn from_translation(translation: Vec3) -> Self {
        Self::new(translation, Quaternion::identity())
    }

    /// Build from x/y/z translation and roll/pitch/yaw angles in radians.
    pub fn from_xyz_rpy(x: f32, y: f32, z: f32, roll: f32, pitch: f32, yaw: f32) -> Self {
        Self::new(Vec3::new(x, y, z), Quaternion::from_euler(roll, pitch, yaw))
    }

    /// Compose two transforms: `self` applied first, then `other`.
    ///
    /// If `self` = T_A_B and `other` = T_B_C, the result is T_A_C.
    pub fn compose(&self, other: &Self) -> Self {
        let translated = self
            .translation
            .add(self.rotation.rotate(other.translation));
        let rotated = self.rotation.mul(other.rotation);
        Self::new(translated, rotated)
    }

    /// The inverse transform: if `self` = T_A_B, the result is T_B_A.
    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.conjugate();
        let inv_trans = inv_rot.rotate(self.translation).scale(-1.0);
        Self::new(inv_trans, inv_rot)
    }

    /// The relative transform from `self` to `other` (both expressed in the
    /// same parent frame): `self⁻¹ ∘ other`.
    pub fn relative_to(&self, other: &Self) -> Self {
        self.inverse().compose(other)
    }

    /// Apply this transform to a point.
    pub fn apply(&self, p: Vec3) -> Vec3 {
        self.rotation.rotate(p).add(self.translation)
    }

    /// Translation components and Euler angles as a 6-tuple
    /// `(x, y, z, roll, pitch, yaw)`.
    pub fn to_xyz_rpy(&self) -> (f32, f32, f32, f32, f32, f32) {
        let (roll, pitch, yaw) = self.rotation.to_euler();
        (
            self.translation.x,
            self.translation.y,
            self.translation.z,
            roll,
            pitch,
            yaw,
        )
    }

    /// Squared Euclidean distance between the translation parts.
    pub fn distance_squared(&self, other: &Self) -> f32 {
        self.translation.sub(other.translation).norm_squared()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2};

    // ── Quaternion ──────────────────────────────────────────────────────────

    #[test]
    fn quaternion_identity_rotate_is_noop() {
        let q = Quaternion::identity();
        let v = Vec3::new(1.0, 2.0, 3.0);
        let r = q.rotate(v);
        assert!((r.x - 1.0).abs() < 1e-5);
        assert!((r.y - 2.0).abs() < 1e-5);
        assert!((r.z - 3.0).abs() < 1e-5);
    }

    #[test]
    fn quaternion_90deg_yaw_rotates_x_to_y() {
        let q = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let v = Vec3::new(1.0, 0.0, 0.0);
        let r = q.rotate(v);
        assert!(r.x.abs() < 1e-5, "x should be ~0, got {}", r.x);
        assert!((r.y - 1.0).abs() < 1e-5, "y should be ~1, got {}", r.y);
        assert!(r.z.abs() < 1e-5);
    }

    #[test]
    fn quaternion_euler_roundtrip() {
        let q = Quaternion::from_euler(0.1, -0.2, 0.3);
        let (roll, pitch, yaw) = q.to_euler();
        assert!((roll - 0.1).abs() < 1e-5);
        assert!((pitch + 0.2).abs() < 1e-5);
        assert!((yaw - 0.3).abs() < 1e-5);
    }

    #[test]
    fn quaternion_conjugate_is_inverse() {
        let q = Quaternion::from_euler(0.4, 0.1, -0.7);
        let prod = q.mul(q.conjugate());
        assert!((prod.w - 1.0).abs() < 1e-5);
        assert!(prod.x.abs() < 1e-5);
        assert!(prod.y.abs() < 1e-5);
        assert!(prod.z.abs() < 1e-5);
    }

    // ── Vec3 ────────────────────────────────────────────────────────────────

    #[test]
    fn vec3_cross_follows_right_hand_rule() {
        let x = Vec3::new(1.0, 0.0, 0.0);
        let y = Vec3::new(0.0, 1.0, 0.0);
        let z = x.cross(y);
        assert!((z.z - 1.0).abs() < 1e-6);
        assert!(z.x.abs() < 1e-6 && z.y.abs() < 1e-6);
    }

    #[test]
    fn vec3_nan_is_not_finite() {
        assert!(!Vec3::nan().is_finite());
        assert!(Vec3::zero().is_finite());
    }

    // ── Transform ───────────────────────────────────────────────────────────

    #[test]
    fn compose_translations_add() {
        let t1 = Transform::from_translation(Vec3::new(1.0, 0.0, 0.0));
        let t2 = Transform::from_translation(Vec3::new(2.0, 0.0, 0.0));
        let composed = t1.compose(&t2);
        assert!((composed.translation.x - 3.0).abs() < 1e-5);
    }

    #[test]
    fn inverse_undoes_transform() {
        let t = Transform::from_xyz_rpy(1.0, -2.0, 0.5, 0.2, -0.1, 0.9);
        let round = t.compose(&t.inverse());
        assert!(round.translation.norm() < 1e-4);
        let (r, p, y) = round.rotation.to_euler();
        assert!(r.abs() < 1e-4 && p.abs() < 1e-4 && y.abs() < 1e-4);
    }

    #[test]
    fn relative_to_gives_motion_between_poses() {
        let a = Transform::from_translation(Vec3::new(1.0, 0.0, 0.0));
        let b = Transform::from_translation(Vec3::new(1.0, 2.0, 0.0));
        let motion = a.relative_to(&b);
        assert!(motion.translation.x.abs() < 1e-5);
        assert!((motion.translation.y - 2.0).abs() < 1e-5);
    }

    #[test]
    fn relative_to_respects_rotation() {
        // a faces +Y (90° yaw); b is 1 m ahead of a in the world (+Y).
        // In a's own frame that motion is along local +X.
        let a = Transform::from_xyz_rpy(0.0, 0.0, 0.0, 0.0, 0.0, FRAC_PI_2);
        let b = Transform::from_xyz_rpy(0.0, 1.0, 0.0, 0.0, 0.0, FRAC_PI_2);
        let motion = a.relative_to(&b);
        assert!((motion.translation.x - 1.0).abs() < 1e-5, "{motion:?}");
        assert!(motion.translation.y.abs() < 1e-5);
    }

    #[test]
    fn apply_moves_point_into_parent_frame() {
        let t = Transform::from_xyz_rpy(1.0, 0.0, 0.0, 0.0, 0.0, FRAC_PI_2);
        let p = t.apply(Vec3::new(1.0, 0.0, 0.0));
        assert!((p.x - 1.0).abs() < 1e-5);
        assert!((p.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn to_xyz_rpy_extracts_components() {
        let t = Transform::from_xyz_rpy(0.5, 1.5, -2.0, 0.0, 0.0, 0.25);
        let (x, y, z, roll, pitch, yaw) = t.to_xyz_rpy();
        assert!((x - 0.5).abs() < 1e-5);
        assert!((y - 1.5).abs() < 1e-5);
        assert!((z + 2.0).abs() < 1e-5);
        assert!(roll.abs() < 1e-5);
        assert!(pitch.abs() < 1e-5);
        assert!((yaw - 0.25).abs() < 1e-5);
    }

    #[test]
    fn distance_squared_between_poses() {
        let a = Transform::from_translation(Vec3::new(0.0, 0.0, 0.0));
        let b = Transform::from_translation(Vec3::new(3.0, 4.0, 0.0));
        assert!((a.distance_squared(&b) - 25.0).abs() < 1e-4);
    }
}
