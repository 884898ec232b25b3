//! Laser-scan buffers.
//!
//! A [`LaserScan`] is a flat list of 3-D points (planar scans carry z = 0)
//! plus the sensor's point budget and maximum range.  The memory only
//! subsamples and serializes scans; registration against them is an external
//! concern.

use serde::{Deserialize, Serialize};

use crate::transform::Vec3;

/// A laser scan: points in the sensor frame plus acquisition limits.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LaserScan {
    pub points: Vec<Vec3>,
    /// The sensor's nominal maximum number of points per sweep (0 = unknown).
    pub max_points: u32,
    /// Maximum usable range in metres (0 = unknown).
    pub max_range: f32,
}

impl LaserScan {
    pub fn new(points: Vec<Vec3>, max_points: u32, max_range: f32) -> Self {
        Self {
            points,
            max_points,
            max_range,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Keep every `step`-th point and shrink the point budget accordingly.
    /// `step <= 1` returns a clone.
    pub fn downsample(&self, step: u32) -> LaserScan {
        if step <= 1 || self.is_empty() {
            return self.clone();
        }
        LaserScan {
            points: self
                .points
                .iter()
                .step_by(step as usize)
                .copied()
                .collect(),
            max_points: self.max_points / step,
            max_range: self.max_range,
        }
    }

    /// Serialize to a little-endian f32 blob (x y z per point).
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.points.len() * 12);
        for p in &self.points {
            blob.extend_from_slice(&p.x.to_le_bytes());
            blob.extend_from_slice(&p.y.to_le_bytes());
            blob.extend_from_slice(&p.z.to_le_bytes());
        }
        blob
    }

    /// Inverse of [`to_blob`][Self::to_blob]; limits must be supplied by the
    /// caller (they are persisted separately).
    pub fn from_blob(blob: &[u8], max_points: u32, max_range: f32) -> LaserScan {
        let points = blob
            .chunks_exact(12)
            .map(|c| {
                Vec3::new(
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                    f32::from_le_bytes([c[8], c[9], c[10], c[11]]),
                )
            })
            .collect();
        LaserScan::new(points, max_points, max_range)
    }
}
