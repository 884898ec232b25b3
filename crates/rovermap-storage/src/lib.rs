//! `rovermap-storage` – Persistence layer of the rovermap mapping memory.
//!
//! Long-term memory lives in a local SQLite database.  The mapping memory
//! only ever talks to [`Storage`][bridge::Storage], which owns the database
//! driver behind a background worker so that demoted nodes and garbage
//! words are persisted asynchronously, in enqueue order, without stalling
//! the owner thread.
//!
//! # Modules
//!
//! - [`driver`] – the [`DbDriver`][driver::DbDriver] contract and the plain
//!   [`NodeRecord`][driver::NodeRecord] / [`WordRecord`][driver::WordRecord]
//!   rows it exchanges.
//! - [`sqlite`] – [`SqliteDriver`][sqlite::SqliteDriver]: the rusqlite
//!   implementation.
//! - [`bridge`] – [`Storage`][bridge::Storage]: trash queue, background
//!   persistence worker, and synchronous query passthrough.

pub mod bridge;
pub mod driver;
pub mod sqlite;

pub use bridge::{Storage, TrashItem};
pub use driver::{DbDriver, NodeInfo, NodeRecord, WordRecord};
pub use sqlite::SqliteDriver;

use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database is not connected")]
    NotConnected,
    #[error("persistence worker is gone")]
    WorkerGone,
}
