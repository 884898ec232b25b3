//! 3-D keypoint generation.
//!
//! Three recovery paths produce the `words3d` side of a signature:
//!
//! 1. **Depth** – back-project each keypoint through its pinhole model using
//!    the registered depth map.
//! 2. **Stereo** – disparity from left/right correspondences, then depth,
//!    then back-projection through the left model.
//! 3. **Mono** – two-view midpoint triangulation of words shared with the
//!    previous signature, given the relative camera transform from odometry.
//!
//! Unrecoverable points are returned as NaN, which downstream code treats as
//! "2-D word without 3-D".

use std::collections::BTreeMap;

use rovermap_core::{CameraModel, Image, KeyPoint, StereoCameraModel, Transform, Vec3};

/// Back-project keypoints through `models` using the registered `depth` map.
///
/// With several models the image is assumed to be their horizontal
/// concatenation, each model covering an equal-width sub-image.  Points are
/// returned in the robot base frame (each model's local transform applied).
pub fn keypoints3d_from_depth(
    keypoints: &[KeyPoint],
    depth: &Image,
    models: &[CameraModel],
) -> Vec<Vec3> {
    if models.is_empty() || depth.is_empty() {
        return vec![Vec3::nan(); keypoints.len()];
    }
    let sub_width = depth.width / models.len() as u32;
    keypoints
        .iter()
        .map(|kp| {
            let cam_index = if sub_width > 0 {
                ((kp.x as u32) / sub_width).min(models.len() as u32 - 1) as usize
            } else {
                0
            };
            let model = &models[cam_index];
            match depth.depth_at(kp.x as u32, kp.y as u32) {
                Some(d) => {
                    let local_x = kp.x - (cam_index as u32 * sub_width) as f32;
                    let p = model.back_project(local_x, kp.y, d);
                    if p.is_finite() {
                        model.local_transform.apply(p)
                    } else {
                        Vec3::nan()
                    }
                }
                None => Vec3::nan(),
            }
        })
        .collect()
}

/// Triangulate stereo correspondences into 3-D points in the robot base
/// frame.  Corners flagged invalid in `status` become NaN.
pub fn keypoints3d_from_stereo(
    left_corners: &[(f32, f32)],
    right_corners: &[(f32, f32)],
    status: &[bool],
    stereo: &StereoCameraModel,
) -> Vec<Vec3> {
    left_corners
        .iter()
        .zip(right_corners)
        .zip(status)
        .map(|((&(lx, ly), &(rx, _)), &ok)| {
            if !ok {
                return Vec3::nan();
            }
            match stereo.depth_from_disparity(lx - rx) {
                Some(depth) => {
                    let p = stereo.left.back_project(lx, ly, depth);
                    if p.is_finite() {
                        stereo.left.local_transform.apply(p)
                    } else {
                        Vec3::nan()
                    }
                }
                None => Vec3::nan(),
            }
        })
        .collect()
}

/// Two-view midpoint triangulation over shared words.
///
/// `words_a` / `words_b` map word id → pixel position in each view.
/// `transform_a_b` is the pose of view B's camera expressed in view A's
/// camera frame.  Returns, in A's camera frame, the words that triangulate to
/// a finite point in front of both cameras.
pub fn words3d_mono(
    words_a: &BTreeMap<i32, KeyPoint>,
    words_b: &BTreeMap<i32, KeyPoint>,
    model: &CameraModel,
    transform_a_b: &Transform,
) -> BTreeMap<i32, Vec3> {
    let mut out = BTreeMap::new();

    // Triangulation is meaningless without parallax.
    if transform_a_b.translation.norm() < 1e-4 {
        return out;
    }

    let origin_b = transform_a_b.translation;
    for (&word_id, kp_a) in words_a {
        let Some(kp_b) = words_b.get(&word_id) else {
            continue;
        };
        let dir_a = pixel_ray(model, kp_a.x, kp_a.y);
        let dir_b = transform_a_b
            .rotation
            .rotate(pixel_ray(model, kp_b.x, kp_b.y));

        // Closest points between the two rays (midpoint method).
        let w0 = origin_b.scale(-1.0); // O_a - O_b with O_a at the origin
        let a = dir_a.dot(dir_a);
        let b = dir_a.dot(dir_b);
        let c = dir_b.dot(dir_b);
        let d = dir_a.dot(w0);
        let e = dir_b.dot(w0);
        let denom = a * c - b * b;
        if denom.abs() < 1e-9 {
            continue; // parallel rays
        }
        let s = (b * e - c * d) / denom;
        let t = (a * e - b * d) / denom;
        if s <= 0.0 || t <= 0.0 {
            continue; // behind one of the cameras
        }
        let p_a = dir_a.scale(s);
        let p_b = origin_b.add(dir_b.scale(t));
        let midpoint = p_a.add(p_b).scale(0.5);
        if midpoint.is_finite() {
            out.insert(word_id, midpoint);
        }
    }
    out
}

fn pixel_ray(model: &CameraModel, u: f32, v: f32) -> Vec3 {
    Vec3::new((u - model.cx) / model.fx, (v - model.cy) / model.fy, 1.0)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rovermap_core::PixelFormat;

    fn model() -> CameraModel {
        CameraModel::new(100.0, 100.0, 32.0, 24.0, 64, 48)
    }

    // ── depth ───────────────────────────────────────────────────────────────

    #[test]
    fn depth_backprojection_matches_model() {
        let mm = 2000u16; // 2 m everywhere
        let data = (0..64 * 48).flat_map(|_| mm.to_le_bytes()).collect();
        let depth = Image::new(64, 48, PixelFormat::Depth16U, data);

        let kps = vec![KeyPoint::new(32.0, 24.0, 3.0), KeyPoint::new(42.0, 24.0, 3.0)];
        let points = keypoints3d_from_depth(&kps, &depth, &[model()]);

        // Principal point back-projects straight ahead.
        assert!((points[0].x).abs() < 1e-4);
        assert!((points[0].z - 2.0).abs() < 1e-4);
        // 10 px right of centre at fx=100, z=2 → x = 0.2.
        assert!((points[1].x - 0.2).abs() < 1e-4);
    }

    #[test]
    fn missing_depth_yields_nan() {
        let data = vec![0u8; 64 * 48 * 2]; // all-zero depth = invalid
        let depth = Image::new(64, 48, PixelFormat::Depth16U, data);
        let points = keypoints3d_from_depth(&[KeyPoint::new(5.0, 5.0, 3.0)], &depth, &[model()]);
        assert!(!points[0].is_finite());
    }

    // ── stereo ──────────────────────────────────────────────────────────────

    #[test]
    fn stereo_triangulation_uses_disparity() {
        let stereo = StereoCameraModel::new(model(), model(), 0.1);
        // disparity 5 px → z = 0.1*100/5 = 2 m
        let points = keypoints3d_from_stereo(
            &[(32.0, 24.0)],
            &[(27.0, 24.0)],
            &[true],
            &stereo,
        );
        assert!((points[0].z - 2.0).abs() < 1e-4);
    }

    #[test]
    fn invalid_status_yields_nan() {
        let stereo = StereoCameraModel::new(model(), model(), 0.1);
        let points = keypoints3d_from_stereo(&[(32.0, 24.0)], &[(27.0, 24.0)], &[false], &stereo);
        assert!(!points[0].is_finite());
    }

    // ── mono ────────────────────────────────────────────────────────────────

    fn project_into(model: &CameraModel, camera_pose: &Transform, p: Vec3) -> KeyPoint {
        let local = camera_pose.inverse().apply(p);
        let (u, v) = model.project(local).unwrap();
        KeyPoint::new(u, v, 3.0)
    }

    #[test]
    fn mono_triangulation_recovers_point() {
        let m = model();
        let truth = Vec3::new(0.3, -0.2, 3.0);
        // View A at the origin, view B half a metre to the right.
        let pose_b = Transform::from_translation(Vec3::new(0.5, 0.0, 0.0));

        let mut words_a = BTreeMap::new();
        let mut words_b = BTreeMap::new();
        words_a.insert(7, project_into(&m, &Transform::identity(), truth));
        words_b.insert(7, project_into(&m, &pose_b, truth));

        let out = words3d_mono(&words_a, &words_b, &m, &pose_b);
        let p = out.get(&7).expect("triangulated");
        assert!((p.x - truth.x).abs() < 1e-2, "{p:?}");
        assert!((p.y - truth.y).abs() < 1e-2);
        assert!((p.z - truth.z).abs() < 1e-2);
    }

    #[test]
    fn mono_without_parallax_returns_nothing() {
        let m = model();
        let mut words = BTreeMap::new();
        words.insert(1, KeyPoint::new(30.0, 20.0, 3.0));
        let out = words3d_mono(&words, &words, &m, &Transform::identity());
        assert!(out.is_empty());
    }

    #[test]
    fn mono_skips_unshared_words() {
        let m = model();
        let pose_b = Transform::from_translation(Vec3::new(0.5, 0.0, 0.0));
        let mut words_a = BTreeMap::new();
        let mut words_b = BTreeMap::new();
        words_a.insert(1, KeyPoint::new(30.0, 20.0, 3.0));
        words_b.insert(2, KeyPoint::new(30.0, 20.0, 3.0));
        assert!(words3d_mono(&words_a, &words_b, &m, &pose_b).is_empty());
    }
}
