//! Stereo correspondence seam.
//!
//! Dense or sparse stereo matching is an external algorithm; the memory only
//! requires the [`StereoMatcher`] capability trait.  [`ScanlineMatcher`] is a
//! minimal stand-in: it searches the same rectified scanline for the best
//! SAD patch match, which is enough for simulation and tests.

use rovermap_core::Image;

/// A sparse stereo matcher over a rectified pair.
pub trait StereoMatcher: Send {
    /// For each left-image corner, find its correspondence on the right
    /// image.  Returns right corners parallel to `left_corners` and a
    /// validity flag per corner (false = no correspondence).
    fn correspondences(
        &self,
        left: &Image,
        right: &Image,
        left_corners: &[(f32, f32)],
    ) -> (Vec<(f32, f32)>, Vec<bool>);
}

/// Brute-force rectified scanline matcher (stand-in backend).
#[derive(Debug, Clone)]
pub struct ScanlineMatcher {
    /// Maximum disparity searched, in pixels.
    pub max_disparity: u32,
    /// Half side of the SAD patch.
    pub half_patch: u32,
}

impl Default for ScanlineMatcher {
    fn default() -> Self {
        Self {
            max_disparity: 64,
            half_patch: 2,
        }
    }
}

impl ScanlineMatcher {
    fn sad(&self, left: &Image, right: &Image, lx: i64, ly: i64, rx: i64) -> Option<u32> {
        let h = self.half_patch as i64;
        let mut sum = 0u32;
        for dy in -h..=h {
            for dx in -h..=h {
                let lv = left.gray_at((lx + dx).try_into().ok()?, (ly + dy).try_into().ok()?)?;
                let rv = right.gray_at((rx + dx).try_into().ok()?, (ly + dy).try_into().ok()?)?;
                sum += lv.abs_diff(rv) as u32;
            }
        }
        Some(sum)
    }
}

impl StereoMatcher for ScanlineMatcher {
    fn correspondences(
        &self,
        left: &Image,
        right: &Image,
        left_corners: &[(f32, f32)],
    ) -> (Vec<(f32, f32)>, Vec<bool>) {
        let mut right_corners = Vec::with_capacity(left_corners.len());
        let mut status = Vec::with_capacity(left_corners.len());
        for &(lx, ly) in left_corners {
            let (lxi, lyi) = (lx as i64, ly as i64);
            let mut best: Option<(i64, u32)> = None;
            for d in 0..=self.max_disparity as i64 {
                let rx = lxi - d;
                if rx < self.half_patch as i64 {
                    break;
                }
                if let Some(cost) = self.sad(left, right, lxi, lyi, rx)
                    && best.is_none_or(|(_, c)| cost < c)
                {
                    best = Some((rx, cost));
                }
            }
            match best {
                Some((rx, _)) => {
                    right_corners.push((rx as f32, ly));
                    status.push(true);
                }
                None => {
                    right_corners.push((lx, ly));
                    status.push(false);
                }
            }
        }
        (right_corners, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rovermap_core::PixelFormat;

    /// A gray image with a bright vertical bar at column `bar_x`.
    fn bar_image(width: u32, height: u32, bar_x: u32) -> Image {
        let mut data = vec![20u8; (width * height) as usize];
        for y in 0..height {
            for x in bar_x..(bar_x + 2).min(width) {
                data[(y * width + x) as usize] = 240;
            }
        }
        Image::new(width, height, PixelFormat::Gray8, data)
    }

    #[test]
    fn bar_shift_recovers_disparity() {
        // The right image's bar is 6 px to the left of the left image's.
        let left = bar_image(64, 16, 30);
        let right = bar_image(64, 16, 24);
        let matcher = ScanlineMatcher::default();
        let (rights, status) = matcher.correspondences(&left, &right, &[(30.0, 8.0)]);
        assert!(status[0]);
        let disparity = 30.0 - rights[0].0;
        assert!((disparity - 6.0).abs() < 1.5, "disparity={disparity}");
    }

    #[test]
    fn border_corner_is_invalid() {
        let left = bar_image(64, 16, 30);
        let right = bar_image(64, 16, 24);
        let matcher = ScanlineMatcher::default();
        // Too close to the top edge for the SAD patch.
        let (_, status) = matcher.correspondences(&left, &right, &[(30.0, 0.0)]);
        assert!(!status[0]);
    }

    #[test]
    fn outputs_are_parallel_to_inputs() {
        let left = bar_image(64, 16, 30);
        let right = bar_image(64, 16, 24);
        let matcher = ScanlineMatcher::default();
        let corners = vec![(30.0, 8.0), (10.0, 8.0), (50.0, 4.0)];
        let (rights, status) = matcher.correspondences(&left, &right, &corners);
        assert_eq!(rights.len(), 3);
        assert_eq!(status.len(), 3);
    }
}
