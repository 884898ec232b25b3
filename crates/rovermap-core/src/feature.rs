//! Plain feature data: keypoints and descriptor matrices.
//!
//! These are the types exchanged between the memory and the feature layer.
//! Detection and description algorithms live behind capability traits in
//! `rovermap-vision`; this module only carries their outputs.

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// KeyPoint
// ────────────────────────────────────────────────────────────────────────────

/// A detected 2-D interest point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the meaningful neighbourhood, in pixels.
    pub size: f32,
    /// Orientation in degrees, -1 when not computed.
    pub angle: f32,
    /// Detector response strength.
    pub response: f32,
    /// Pyramid octave the keypoint was detected at.
    pub octave: i32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, size: f32) -> Self {
        Self {
            x,
            y,
            size,
            angle: -1.0,
            response: 0.0,
            octave: 0,
        }
    }

    /// Rescale position and size, e.g. after image decimation.
    pub fn scaled(&self, factor: f32) -> KeyPoint {
        KeyPoint {
            x: self.x * factor,
            y: self.y * factor,
            size: self.size * factor,
            ..*self
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Descriptors
// ────────────────────────────────────────────────────────────────────────────

/// A row-major matrix of f32 feature descriptors; one row per keypoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Descriptors {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Descriptors {
    /// An empty matrix (no rows, no columns).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from row-major data; `data.len()` must be `rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * cols, "descriptor matrix shape mismatch");
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Append one descriptor row.  The first row fixes the column count.
    pub fn push_row(&mut self, row: &[f32]) {
        if self.rows == 0 {
            self.cols = row.len();
        }
        assert_eq!(row.len(), self.cols, "descriptor length mismatch");
        self.data.extend_from_slice(row);
        self.rows += 1;
    }

    /// Keep only the rows where `keep` is true (parallel to the row index).
    pub fn filter_rows(&self, keep: &[bool]) -> Descriptors {
        assert_eq!(keep.len(), self.rows);
        let mut out = Descriptors::empty();
        for (i, &k) in keep.iter().enumerate() {
            if k {
                out.push_row(self.row(i));
            }
        }
        out
    }

    /// Drop all rows, leaving an empty matrix.
    pub fn clear(&mut self) {
        self.rows = 0;
        self.cols = 0;
        self.data.clear();
    }
}
