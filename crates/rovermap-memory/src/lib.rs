//! `rovermap-memory` – The multi-tier mapping memory.
//!
//! Maintains the store of *signatures* (sensor observations summarized as
//! bags of visual words), the typed link graph connecting them, and the
//! three memory tiers that keep loop-closure detection tractable at scale:
//!
//! - **STM** – a short, ordered queue of the newest signatures, where
//!   rehearsal merges near-duplicates;
//! - **WM** – the timestamped pool searched for loop closures;
//! - **LTM** – SQLite-persisted nodes, no longer resident in RAM.
//!
//! All public mutating operations run on a single owner thread; the only
//! background activity is the parallel dictionary-index rebuild during
//! signature creation and the persistence worker owned by
//! [`rovermap_storage::Storage`].
//!
//! # Modules
//!
//! - [`memory`] – [`Memory`][memory::Memory]: the facade; tiers, counters,
//!   the `update` entry point and signature lifecycle.
//! - [`signature`] – [`Signature`][signature::Signature] map nodes.
//! - [`builder`] – observation → signature pipeline (feature extraction,
//!   quantization, 3-D recovery, compression).
//! - [`graph`] – link-graph operations and neighbourhood walks.
//! - [`rehearsal`] – similarity-driven merges and graph reduction.
//! - [`policy`] – the WM transfer/forget selection policy.
//! - [`likelihood`] – TF-IDF / raw-similarity scoring of WM candidates.
//! - [`config`] – [`MemoryConfig`][config::MemoryConfig].
//! - [`stats`] – the injected [`Statistics`][stats::Statistics] sink.
//! - [`dump`] – line-oriented debug dumps.

pub mod builder;
pub mod config;
pub mod dump;
pub mod graph;
pub mod likelihood;
pub mod memory;
pub mod persistence;
pub mod policy;
pub mod rehearsal;
pub mod signature;
pub mod stats;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::MemoryConfig;
pub use memory::{ID_INVALID, ID_VIRTUAL, Memory};
pub use signature::Signature;
pub use stats::Statistics;

use thiserror::Error;

/// Errors surfaced by memory operations.
///
/// Internal consistency violations are not represented here: they are bugs
/// and abort via assertions.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Malformed sensor data: bad image type, missing calibration, invalid
    /// ROI.  The observation is dropped without mutating state.
    #[error("bad sensor input: {0}")]
    BadInput(String),

    /// An externally supplied id does not exceed the allocator high-water
    /// mark.
    #[error("observation id {received} is not above the last id in memory ({current})")]
    IdOrder { received: i32, current: i32 },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence failure; the in-memory tiers continue without it.
    #[error(transparent)]
    Db(#[from] rovermap_storage::StorageError),
}
