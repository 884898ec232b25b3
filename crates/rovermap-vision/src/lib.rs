//! `rovermap-vision` – Feature layer of the rovermap mapping memory.
//!
//! Turns camera imagery into the bag-of-visual-words representation the
//! memory indexes, behind swappable capability traits for the parts that are
//! external algorithms.
//!
//! # Modules
//!
//! - [`feature`] – the [`FeatureDetector`][feature::FeatureDetector]
//!   capability trait, ROI handling, depth filtering, and the deterministic
//!   [`GridDetector`][feature::GridDetector] stand-in.
//! - [`stereo`] – the [`StereoMatcher`][stereo::StereoMatcher] capability
//!   trait and the [`ScanlineMatcher`][stereo::ScanlineMatcher] stand-in.
//! - [`points3d`] – 3-D keypoint generation from depth maps, stereo
//!   correspondences, and two-view mono triangulation over shared words.
//! - [`dictionary`] – [`VwDictionary`][dictionary::VwDictionary]: the visual
//!   word table, inverted index and nearest-neighbour quantizer.

pub mod dictionary;
pub mod feature;
pub mod points3d;
pub mod stereo;

pub use dictionary::{VisualWord, VwDictionary};
pub use feature::{FeatureDetector, GridDetector, Roi};
pub use stereo::{ScanlineMatcher, StereoMatcher};

use thiserror::Error;

/// Errors raised by the feature layer.
#[derive(Error, Debug)]
pub enum VisionError {
    #[error("invalid ROI ratios: {0}")]
    BadRoi(String),
}
