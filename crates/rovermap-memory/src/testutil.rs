//! Shared test fixtures for the memory crate.

use rovermap_core::{Image, PixelFormat, SensorData, Transform, Vec3};

use crate::config::MemoryConfig;
use crate::memory::Memory;

/// A deterministic 64x48 grayscale image; different seeds give images whose
/// patch descriptors are far apart, the same seed gives identical images.
pub fn seeded_image(seed: u64) -> Image {
    let (width, height) = (64u32, 48u32);
    let data = (0..width * height)
        .map(|i| {
            let v = (i as u64).wrapping_mul(7).wrapping_add(seed.wrapping_mul(83));
            (v % 241) as u8
        })
        .collect();
    Image::new(width, height, PixelFormat::Gray8, data)
}

/// An image-only observation with a seed-dependent appearance.
pub fn observation(seed: u64) -> SensorData {
    SensorData::from_image(0, seed as f64, seeded_image(seed))
}

pub fn translate(x: f32) -> Transform {
    Transform::from_translation(Vec3::new(x, 0.0, 0.0))
}

/// A memory with small, test-friendly extraction settings; `tweak` adjusts
/// the config before construction.
pub fn make_memory(tweak: impl FnOnce(&mut MemoryConfig)) -> Memory {
    let mut config = MemoryConfig {
        kp_max_features: 25,
        ..MemoryConfig::default()
    };
    tweak(&mut config);
    Memory::new(config).expect("test memory")
}
