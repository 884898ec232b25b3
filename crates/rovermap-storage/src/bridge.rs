//! The persistence bridge: trash queue + background worker.
//!
//! [`Storage`] owns the database driver behind an `Arc<Mutex<..>>` shared
//! with a background worker thread.  Demoted nodes and garbage words are
//! handed to [`async_save_node`][Storage::async_save_node] /
//! [`async_save_word`][Storage::async_save_word], which enqueue and return
//! immediately; the worker drains the queue in enqueue order.  Synchronous
//! reads lock the driver directly from the owner thread.
//!
//! Ordering guarantees: the queue is FIFO, so a flush marker reaching the
//! worker means every previously enqueued item has been applied, and a
//! timestamp-mode toggle takes effect exactly between the items enqueued
//! around it.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use rovermap_core::{KeyPoint, Link, LinkKind, SensorPayload};

use crate::StorageError;
use crate::driver::{DbDriver, NodeInfo, NodeRecord, WordRecord};

// ────────────────────────────────────────────────────────────────────────────
// Queue items
// ────────────────────────────────────────────────────────────────────────────

/// One unit of asynchronously persisted state.
#[derive(Debug)]
pub enum TrashItem {
    Node(Box<NodeRecord>),
    Word(WordRecord),
}

enum WorkerMsg {
    Save(TrashItem),
    SetTimestampUpdate(bool),
    Flush(Sender<()>),
}

// ────────────────────────────────────────────────────────────────────────────
// Storage
// ────────────────────────────────────────────────────────────────────────────

/// The mapping memory's handle on persistence.
pub struct Storage {
    driver: Arc<Mutex<Box<dyn DbDriver>>>,
    queue: Option<Sender<WorkerMsg>>,
    worker: Option<JoinHandle<()>>,
}

impl Storage {
    /// Wrap a driver and start the persistence worker.
    pub fn new(driver: Box<dyn DbDriver>) -> Self {
        let driver = Arc::new(Mutex::new(driver));
        let (tx, rx) = channel();
        let worker_driver = Arc::clone(&driver);
        let worker = std::thread::Builder::new()
            .name("rovermap-trash".to_string())
            .spawn(move || Self::worker_loop(worker_driver, rx))
            .expect("spawn persistence worker");
        Self {
            driver,
            queue: Some(tx),
            worker: Some(worker),
        }
    }

    fn worker_loop(driver: Arc<Mutex<Box<dyn DbDriver>>>, rx: Receiver<WorkerMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                WorkerMsg::Save(item) => {
                    let mut driver = driver.lock().expect("driver lock");
                    let result = match &item {
                        TrashItem::Node(node) => driver.save_node(node),
                        TrashItem::Word(word) => driver.save_word(word),
                    };
                    if let Err(e) = result {
                        // Persistence failures degrade gracefully: the
                        // in-memory tiers continue, this item is lost.
                        error!("trash save failed: {e}");
                    }
                }
                WorkerMsg::SetTimestampUpdate(enabled) => {
                    driver
                        .lock()
                        .expect("driver lock")
                        .set_timestamp_update_enabled(enabled);
                }
                WorkerMsg::Flush(ack) => {
                    // FIFO queue: everything enqueued before this marker has
                    // already been applied.
                    let _ = ack.send(());
                }
            }
        }
        debug!("persistence worker stopped");
    }

    fn send(&self, msg: WorkerMsg) -> Result<(), StorageError> {
        self.queue
            .as_ref()
            .ok_or(StorageError::WorkerGone)?
            .send(msg)
            .map_err(|_| StorageError::WorkerGone)
    }

    // ── connection ──────────────────────────────────────────────────────────

    pub fn open(&self, url: &str, overwrite: bool) -> Result<(), StorageError> {
        self.driver.lock().expect("driver lock").open(url, overwrite)
    }

    pub fn is_connected(&self) -> bool {
        self.driver.lock().expect("driver lock").is_connected()
    }

    pub fn url(&self) -> String {
        self.driver.lock().expect("driver lock").url().to_string()
    }

    /// Drain the queue, then close the database connection.
    pub fn close(&mut self) -> Result<(), StorageError> {
        self.empty_trashes(true)?;
        self.driver.lock().expect("driver lock").close()
    }

    /// Toggle entry-timestamp refresh for subsequent saves (ordered with the
    /// queue).
    pub fn set_timestamp_update_enabled(&self, enabled: bool) -> Result<(), StorageError> {
        self.send(WorkerMsg::SetTimestampUpdate(enabled))
    }

    // ── async writes ────────────────────────────────────────────────────────

    /// Enqueue a node for persistence; returns immediately.
    pub fn async_save_node(&self, node: NodeRecord) -> Result<(), StorageError> {
        self.send(WorkerMsg::Save(TrashItem::Node(Box::new(node))))
    }

    /// Enqueue a word for persistence; returns immediately.
    pub fn async_save_word(&self, word: WordRecord) -> Result<(), StorageError> {
        self.send(WorkerMsg::Save(TrashItem::Word(word)))
    }

    /// Drain the trash queue.  With `blocking` the call returns only after
    /// every previously enqueued item has been applied.
    pub fn empty_trashes(&self, blocking: bool) -> Result<(), StorageError> {
        let (ack_tx, ack_rx) = channel();
        self.send(WorkerMsg::Flush(ack_tx))?;
        if blocking && ack_rx.recv().is_err() {
            warn!("persistence worker went away during flush");
        }
        Ok(())
    }

    /// Wait until the worker is idle.
    pub fn join(&self) -> Result<(), StorageError> {
        self.empty_trashes(true)
    }

    // ── synchronous reads (owner thread) ────────────────────────────────────

    pub fn load_last_nodes(&self) -> Result<Vec<NodeRecord>, StorageError> {
        self.driver.lock().expect("driver lock").load_last_nodes()
    }

    pub fn all_node_ids(&self) -> Result<Vec<i32>, StorageError> {
        self.driver.lock().expect("driver lock").all_node_ids()
    }

    pub fn load_nodes(&self, ids: &[i32]) -> Result<Vec<NodeRecord>, StorageError> {
        self.driver.lock().expect("driver lock").load_nodes(ids)
    }

    pub fn node_info(&self, id: i32) -> Result<Option<NodeInfo>, StorageError> {
        self.driver.lock().expect("driver lock").node_info(id)
    }

    pub fn node_words(&self, id: i32) -> Result<Vec<(i32, KeyPoint)>, StorageError> {
        self.driver.lock().expect("driver lock").node_words(id)
    }

    pub fn node_payload(&self, id: i32) -> Result<Option<SensorPayload>, StorageError> {
        self.driver.lock().expect("driver lock").node_payload(id)
    }

    pub fn node_id_by_label(&self, label: &str) -> Result<Option<i32>, StorageError> {
        self.driver.lock().expect("driver lock").node_id_by_label(label)
    }

    pub fn all_labels(&self) -> Result<BTreeMap<i32, String>, StorageError> {
        self.driver.lock().expect("driver lock").all_labels()
    }

    pub fn last_node_id(&self) -> Result<i32, StorageError> {
        self.driver.lock().expect("driver lock").last_node_id()
    }

    pub fn load_links(
        &self,
        id: i32,
        filter: Option<LinkKind>,
    ) -> Result<BTreeMap<i32, Link>, StorageError> {
        self.driver.lock().expect("driver lock").load_links(id, filter)
    }

    pub fn all_links(&self, ignore_null: bool) -> Result<Vec<(i32, Link)>, StorageError> {
        self.driver.lock().expect("driver lock").all_links(ignore_null)
    }

    pub fn load_words(&self, ids: &[i32]) -> Result<Vec<WordRecord>, StorageError> {
        self.driver.lock().expect("driver lock").load_words(ids)
    }

    pub fn load_last_words(&self) -> Result<Vec<WordRecord>, StorageError> {
        self.driver.lock().expect("driver lock").load_last_words()
    }

    pub fn last_word_id(&self) -> Result<i32, StorageError> {
        self.driver.lock().expect("driver lock").last_word_id()
    }

    pub fn add_statistics_after_run(
        &self,
        memory_size: usize,
        last_node_id: i32,
        dictionary_size: usize,
    ) -> Result<(), StorageError> {
        self.driver
            .lock()
            .expect("driver lock")
            .add_statistics_after_run(memory_size, last_node_id, dictionary_size)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // Closing the channel stops the worker after it drains the queue.
        self.queue.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("persistence worker panicked");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
