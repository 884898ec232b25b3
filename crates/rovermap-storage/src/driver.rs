//! The database driver contract.
//!
//! A [`DbDriver`] persists map nodes, links and visual words and answers the
//! lookups the memory needs when faulting data back in.  The memory never
//! holds a driver directly (it goes through
//! [`Storage`][crate::bridge::Storage]), but the contract is public so that
//! alternative backends can be dropped in.
//!
//! Records are plain rows: the memory converts its in-RAM signatures and
//! dictionary words to/from these when crossing the persistence boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use rovermap_core::{KeyPoint, Link, LinkKind, SensorPayload, Transform, Vec3};

use crate::StorageError;

// ────────────────────────────────────────────────────────────────────────────
// Records
// ────────────────────────────────────────────────────────────────────────────

/// A persisted map node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: i32,
    pub map_id: i32,
    pub weight: i32,
    pub label: String,
    pub stamp: f64,
    pub pose: Option<Transform>,
    pub links: Vec<Link>,
    /// word id → keypoints citing it (multi-valued).
    pub words: Vec<(i32, KeyPoint)>,
    /// word id → 3-D points (parallel to `words`; NaN marks unknown).
    pub words3: Vec<(i32, Vec3)>,
    pub payload: SensorPayload,
}

/// A persisted visual word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordRecord {
    pub id: i32,
    pub descriptor: Vec<f32>,
}

/// Lightweight node header returned by [`DbDriver::node_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub id: i32,
    pub map_id: i32,
    pub weight: i32,
    pub label: String,
    pub stamp: f64,
    pub pose: Option<Transform>,
}

// ────────────────────────────────────────────────────────────────────────────
// DbDriver
// ────────────────────────────────────────────────────────────────────────────

/// Persistence backend contract.
///
/// Implementations must be `Send`; the driver lives behind the trash worker
/// and is shared with the owner thread for synchronous reads.
pub trait DbDriver: Send {
    // ── connection ──────────────────────────────────────────────────────────

    fn open(&mut self, url: &str, overwrite: bool) -> Result<(), StorageError>;
    fn close(&mut self) -> Result<(), StorageError>;
    fn is_connected(&self) -> bool;
    fn url(&self) -> &str;

    /// When disabled, re-saving an existing row preserves its original
    /// entry timestamp (used for links-only updates at shutdown).
    fn set_timestamp_update_enabled(&mut self, enabled: bool);

    // ── writes (called from the trash worker) ───────────────────────────────

    fn save_node(&mut self, node: &NodeRecord) -> Result<(), StorageError>;
    fn save_word(&mut self, word: &WordRecord) -> Result<(), StorageError>;

    /// Record an end-of-run statistics row; also the session boundary marker
    /// that [`load_last_nodes`][Self::load_last_nodes] keys on.
    fn add_statistics_after_run(
        &mut self,
        memory_size: usize,
        last_node_id: i32,
        dictionary_size: usize,
    ) -> Result<(), StorageError>;

    // ── node reads ──────────────────────────────────────────────────────────

    /// Nodes persisted at or after the last statistics marker: the working
    /// memory of the previous session.
    fn load_last_nodes(&self) -> Result<Vec<NodeRecord>, StorageError>;
    fn all_node_ids(&self) -> Result<Vec<i32>, StorageError>;
    fn load_nodes(&self, ids: &[i32]) -> Result<Vec<NodeRecord>, StorageError>;
    fn node_info(&self, id: i32) -> Result<Option<NodeInfo>, StorageError>;
    fn node_words(&self, id: i32) -> Result<Vec<(i32, KeyPoint)>, StorageError>;
    fn node_payload(&self, id: i32) -> Result<Option<SensorPayload>, StorageError>;
    fn node_id_by_label(&self, label: &str) -> Result<Option<i32>, StorageError>;
    fn all_labels(&self) -> Result<BTreeMap<i32, String>, StorageError>;
    fn last_node_id(&self) -> Result<i32, StorageError>;

    // ── link reads ──────────────────────────────────────────────────────────

    /// Links stored for `id`, optionally restricted to one kind.
    fn load_links(
        &self,
        id: i32,
        filter: Option<LinkKind>,
    ) -> Result<BTreeMap<i32, Link>, StorageError>;

    /// Every stored link as `(from, link)` pairs; `ignore_null` drops
    /// transform-less links.
    fn all_links(&self, ignore_null: bool) -> Result<Vec<(i32, Link)>, StorageError>;

    // ── word reads ──────────────────────────────────────────────────────────

    fn load_words(&self, ids: &[i32]) -> Result<Vec<WordRecord>, StorageError>;

    /// Words persisted at or after the last statistics marker: the
    /// dictionary of the previous session.
    fn load_last_words(&self) -> Result<Vec<WordRecord>, StorageError>;
    fn last_word_id(&self) -> Result<i32, StorageError>;
}
