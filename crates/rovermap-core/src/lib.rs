//! `rovermap-core` – Shared math and sensor types.
//!
//! The vocabulary every other rovermap crate speaks: rigid-body transforms,
//! camera models, image and laser-scan buffers, and the [`SensorData`] bundle
//! that carries one observation through the mapping memory.
//!
//! # Modules
//!
//! - [`transform`] – [`Transform`][transform::Transform]: 6-DoF rigid-body
//!   pose (translation + unit quaternion) with composition, inversion and
//!   Euler-angle extraction.
//! - [`camera`] – [`CameraModel`][camera::CameraModel] and
//!   [`StereoCameraModel`][camera::StereoCameraModel]: pinhole intrinsics,
//!   projection/back-projection, intrinsic rescaling.
//! - [`image`] – [`Image`][image::Image]: owned pixel buffer with a closed
//!   format tag, grayscale conversion, decimation and depth lookup.
//! - [`scan`] – [`LaserScan`][scan::LaserScan]: flat 3-D point buffer with a
//!   point budget, stride downsampling.
//! - [`feature`] – [`KeyPoint`][feature::KeyPoint] and
//!   [`Descriptors`][feature::Descriptors]: the plain data exchanged with the
//!   feature-extraction layer.
//! - [`link`] – [`Link`][link::Link]: typed, invertible graph edges between
//!   map nodes.
//! - [`sensor_data`] – [`SensorData`][sensor_data::SensorData]: the input
//!   bundle, [`SensorPayload`][sensor_data::SensorPayload]: the compressed
//!   form retained by a map node, and the [`BlobCodec`][sensor_data::BlobCodec]
//!   compression seam.

pub mod camera;
pub mod feature;
pub mod image;
pub mod link;
pub mod scan;
pub mod sensor_data;
pub mod transform;

pub use camera::{CameraModel, StereoCameraModel};
pub use feature::{Descriptors, KeyPoint};
pub use image::{Image, PixelFormat};
pub use link::{Link, LinkInfo, LinkKind};
pub use scan::LaserScan;
pub use sensor_data::{BlobCodec, PlainCodec, SensorData, SensorPayload};
pub use transform::{Quaternion, Transform, Vec3};
