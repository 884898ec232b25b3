//! Signature lifecycle across the persistence boundary.
//!
//! Demotion to LTM goes through [`Memory::move_to_trash`]: links and word
//! references are unwound in memory, then the node is handed to the storage
//! bridge's background queue (or freed).  `init`/`close` load and flush whole
//! sessions; reactivation faults LTM nodes back into WM, remapping their
//! words onto the currently active dictionary when necessary.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use rovermap_core::{KeyPoint, LinkKind, SensorPayload};
use rovermap_storage::{SqliteDriver, Storage, WordRecord};
use rovermap_vision::VisualWord;

use crate::memory::{ID_VIRTUAL, Memory};
use crate::signature::Signature;
use crate::MemoryError;

/// Settle time after draining the trash so that the next session's rows get
/// strictly later entry timestamps.
const SESSION_STAMP_SETTLE: Duration = Duration::from_millis(1500);

impl Memory {
    // ── trash ───────────────────────────────────────────────────────────────

    /// Remove a signature from the in-memory tiers.
    ///
    /// With `keep_linked_to_graph` the node keeps its links (only virtual
    /// ones are stripped) and is persisted.  Without it, or for an unsaved
    /// bad signature when those are ignored, the node must still be in STM:
    /// every peer drops its side, closure weight falls back to the older
    /// node, and freshly unused words are garbage-collected (their ids
    /// reported through `deleted_words`).
    pub fn move_to_trash(
        &mut self,
        id: i32,
        keep_linked_to_graph: bool,
        mut deleted_words: Option<&mut Vec<i32>>,
    ) {
        let Some(signature) = self.signatures.get(&id) else {
            warn!(id, "nothing to trash");
            return;
        };
        debug!(id, keep_linked_to_graph, "moving to trash");

        let strip = !keep_linked_to_graph
            || (!signature.is_saved()
                && signature.is_bad_signature()
                && self.config.bad_signatures_ignored);
        if strip {
            assert!(
                self.stm.contains(&id),
                "deleting location {id} outside the STM is not implemented"
            );
            let links = self.signatures[&id].links().clone();
            let victim_weight = self.signatures[&id].weight();
            for (peer, link) in &links {
                let peer_signature = self
                    .signatures
                    .get_mut(peer)
                    .unwrap_or_else(|| panic!("peer {peer} of deleted location {id} not resident"));
                if *peer > id && links.len() > 1 {
                    warn!(
                        peer,
                        id, "removing a link to a newer node may split the map"
                    );
                }
                if link.kind == LinkKind::GlobalClosure && id > *peer {
                    peer_signature.set_weight(peer_signature.weight() + victim_weight);
                }
                peer_signature.remove_link(id);
            }
            let signature = self.signatures.get_mut(&id).expect("checked");
            signature.remove_links();
            signature.set_weight(0);
            signature.set_label("");
        } else {
            self.remove_virtual_links(id);
        }

        self.disable_words_ref(id);
        if !keep_linked_to_graph && self.vwd.is_incremental() {
            for word_id in self.signatures[&id].unique_word_ids() {
                if self.vwd.unused_word(word_id).is_none() {
                    continue;
                }
                if let Some(word) = self.vwd.remove_word(word_id) {
                    if let Some(storage) = &self.storage {
                        let record = WordRecord {
                            id: word.id(),
                            descriptor: word.descriptor().to_vec(),
                        };
                        if let Err(e) = storage.async_save_word(record) {
                            warn!(word_id, "word save failed: {e}");
                        }
                    }
                    if let Some(list) = deleted_words.as_deref_mut() {
                        list.push(word_id);
                    }
                }
            }
        }

        self.wm.remove(&id);
        self.stm.remove(&id);
        let signature = self.signatures.remove(&id).expect("checked");
        if self.signatures_added > 0 {
            self.signatures_added -= 1;
        }

        if self.last_signature_id == id {
            self.last_signature_id = self
                .stm
                .last()
                .copied()
                .or_else(|| {
                    self.wm
                        .keys()
                        .rev()
                        .find(|&&member| member > 0 && self.signatures.contains_key(&member))
                        .copied()
                })
                .unwrap_or(0);
        }
        if self.last_global_loop_closure_id == id {
            self.last_global_loop_closure_id = 0;
        }

        let persist = (self.config.not_linked_nodes_kept || keep_linked_to_graph)
            && id > 0
            && (self.config.incremental_memory || signature.is_saved());
        if persist && let Some(storage) = &self.storage {
            if let Err(e) = storage.async_save_node(signature.to_record()) {
                warn!(id, "node save failed: {e}");
            }
        }
        // Otherwise the signature is simply dropped here.
    }

    /// Trash a node unconditionally, reporting any words freed with it.
    pub fn delete_location(&mut self, id: i32, deleted_words: Option<&mut Vec<i32>>) {
        debug!(id, "deleting location");
        if self.signatures.contains_key(&id) {
            self.move_to_trash(id, false, deleted_words);
        }
    }

    /// Block until the persistence queue has drained.
    pub fn empty_trash(&self) {
        if let Some(storage) = &self.storage
            && let Err(e) = storage.empty_trashes(true)
        {
            warn!("trash flush failed: {e}");
        }
    }

    /// Wait for the persistence worker to go idle.
    pub fn join_trash_thread(&self) {
        if let Some(storage) = &self.storage
            && let Err(e) = storage.join()
        {
            warn!("trash join failed: {e}");
        }
    }

    // ── word-reference lifecycle ────────────────────────────────────────────

    /// Withdraw a signature's citations from the inverted index.
    pub(crate) fn disable_words_ref(&mut self, id: i32) {
        let Some(signature) = self.signatures.get_mut(&id) else {
            return;
        };
        if !signature.is_enabled() {
            return;
        }
        signature.set_enabled(false);
        let word_ids = signature.unique_word_ids();
        let before = self.vwd.total_active_references();
        for word_id in word_ids {
            self.vwd.remove_all_word_refs(word_id, id);
        }
        debug!(
            id,
            removed = before - self.vwd.total_active_references(),
            "word references disabled"
        );
    }

    /// Garbage-collect reference-less words: persisted when storage is
    /// attached, freed otherwise.
    pub(crate) fn clean_unused_words(&mut self) {
        if !self.vwd.is_incremental() {
            return;
        }
        let removed = self.vwd.take_unused_words();
        if removed.is_empty() {
            return;
        }
        debug!(count = removed.len(), "removing unused words");
        if let Some(storage) = &self.storage {
            for word in removed {
                let record = WordRecord {
                    id: word.id(),
                    descriptor: word.descriptor().to_vec(),
                };
                if let Err(e) = storage.async_save_word(record) {
                    warn!("word save failed: {e}");
                }
            }
        }
    }

    /// Register the citations of disabled resident signatures, remapping
    /// words that were GC'd meanwhile onto currently active words via NN
    /// search.
    pub(crate) fn enable_words_ref(&mut self, ids: &[i32]) {
        let to_enable: Vec<i32> = ids
            .iter()
            .copied()
            .filter(|id| self.signatures.get(id).is_some_and(|s| !s.is_enabled()))
            .collect();

        // Words cited by these signatures that no longer exist in the
        // dictionary.
        let mut missing: BTreeSet<i32> = BTreeSet::new();
        for &id in &to_enable {
            for word_id in self.signatures[&id].unique_word_ids() {
                if self.vwd.word(word_id).is_none() {
                    missing.insert(word_id);
                }
            }
        }

        if !missing.is_empty() && let Some(storage) = &self.storage {
            let ids_to_load: Vec<i32> = missing.iter().copied().collect();
            let loaded = match storage.load_words(&ids_to_load) {
                Ok(records) => records,
                Err(e) => {
                    warn!("word load failed: {e}");
                    Vec::new()
                }
            };
            let queries: Vec<VisualWord> = loaded
                .into_iter()
                .map(|record| VisualWord::new(record.id, record.descriptor))
                .collect();
            let active_ids = self.vwd.find_nn(&queries);

            let mut refs_to_change: BTreeMap<i32, i32> = BTreeMap::new();
            for (query, active) in queries.into_iter().zip(active_ids) {
                if active > 0 {
                    // An equivalent active word exists; the loaded copy is
                    // already persisted and can be dropped.
                    refs_to_change.insert(query.id(), active);
                } else {
                    self.vwd.add_word(query);
                }
            }
            debug!(remapped = refs_to_change.len(), "word references remapped");
            for (&old_word, &new_word) in &refs_to_change {
                for &id in &to_enable {
                    if let Some(signature) = self.signatures.get_mut(&id) {
                        signature.change_word_ref(old_word, new_word);
                    }
                }
            }
        }

        let before = self.vwd.total_active_references();
        for &id in &to_enable {
            let citations: Vec<(i32, usize)> = self.signatures[&id]
                .words()
                .iter()
                .map(|(&word, kps)| (word, kps.len()))
                .collect();
            for (word, count) in &citations {
                for _ in 0..*count {
                    self.vwd.add_word_ref(*word, id);
                }
            }
            if !citations.is_empty() {
                self.signatures
                    .get_mut(&id)
                    .expect("checked")
                    .set_enabled(true);
            }
        }
        debug!(
            added = self.vwd.total_active_references() - before,
            signatures = to_enable.len(),
            "word references enabled"
        );
    }

    // ── reactivation ────────────────────────────────────────────────────────

    /// Fault up to `max_loaded` (0 = unbounded) of `ids` back from LTM into
    /// WM, re-enabling their words.  Returns the ids actually requested from
    /// storage.
    pub fn reactivate_signatures(&mut self, ids: &[i32], max_loaded: usize) -> Vec<i32> {
        let mut to_load: Vec<i32> = Vec::new();
        for &id in ids {
            if !self.signatures.contains_key(&id)
                && !to_load.contains(&id)
                && (max_loaded == 0 || to_load.len() < max_loaded)
            {
                info!(id, "loading location from database");
                to_load.push(id);
            }
        }
        if to_load.is_empty() {
            return to_load;
        }
        let Some(storage) = &self.storage else {
            return Vec::new();
        };
        let records = match storage.load_nodes(&to_load) {
            Ok(records) => records,
            Err(e) => {
                warn!("reactivation load failed: {e}");
                return Vec::new();
            }
        };
        let loaded: Vec<i32> = records.iter().map(|r| r.id).collect();
        for record in records {
            self.add_signature_to_wm_from_ltm(Signature::from_record(record));
        }
        self.enable_words_ref(&loaded);
        to_load
    }

    // ── node data access ────────────────────────────────────────────────────

    /// A node's sensor payload, faulting in from LTM when requested.
    pub fn node_payload_of(&self, id: i32, look_in_db: bool) -> Option<SensorPayload> {
        if let Some(signature) = self.signatures.get(&id) {
            return Some(signature.payload().clone());
        }
        if look_in_db && let Some(storage) = &self.storage {
            match storage.node_payload(id) {
                Ok(payload) => return payload,
                Err(e) => warn!(id, "payload load failed: {e}"),
            }
        }
        None
    }

    /// A node's word citations as `(word id, keypoint)` pairs.
    pub fn node_words_of(&self, id: i32, look_in_db: bool) -> Vec<(i32, KeyPoint)> {
        if let Some(signature) = self.signatures.get(&id) {
            let mut out = Vec::with_capacity(signature.word_count());
            for (&word, kps) in signature.words() {
                for kp in kps {
                    out.push((word, *kp));
                }
            }
            return out;
        }
        if look_in_db && let Some(storage) = &self.storage {
            match storage.node_words(id) {
                Ok(words) => return words,
                Err(e) => warn!(id, "word load failed: {e}"),
            }
        }
        Vec::new()
    }

    // ── session lifecycle ───────────────────────────────────────────────────

    /// Open (or reopen) the memory over a database.
    ///
    /// Clears the in-memory state (preserving the database connection when
    /// nothing changed, to avoid a reopen), connects, loads the previous
    /// session's WM (or every node) along with the matching dictionary,
    /// and re-registers word references.  Returns false when the database
    /// cannot be opened; the memory then continues without persistence.
    pub fn init(&mut self, url: &str, overwrite: bool) -> Result<bool, MemoryError> {
        let unchanged = !self.memory_changed && !self.links_changed;
        let stashed = if unchanged || overwrite {
            self.storage.take()
        } else {
            if !self.memory_changed
                && self.links_changed
                && let Some(storage) = &self.storage
            {
                // Links-only session: keep original entry stamps.
                let _ = storage.set_timestamp_update_enabled(false);
            }
            None
        };
        self.clear();
        if let Some(storage) = stashed {
            self.storage = Some(storage);
        }

        if let Some(storage) = &mut self.storage {
            storage.close()?;
        }
        if self.storage.is_none() && !url.is_empty() {
            self.storage = Some(Storage::new(Box::new(SqliteDriver::new())));
        }
        let Some(storage) = &self.storage else {
            return Ok(true);
        };
        let _ = storage.set_timestamp_update_enabled(true);

        if let Err(e) = storage.open(url, overwrite) {
            error!(url, "cannot open database: {e}");
            return Ok(false);
        }

        // Populate WM.
        let records = if self.config.init_wm_with_all_nodes {
            let ids = storage.all_node_ids()?;
            storage.load_nodes(&ids)?
        } else {
            storage.load_last_nodes()?
        };
        let age = self.now_age();
        for record in records {
            let signature = Signature::from_record(record);
            if signature.is_bad_signature() && self.config.bad_signatures_ignored {
                continue;
            }
            // Previous-session nodes always land in WM: they can only be
            // relinked to this session through loop closures.
            self.wm.insert(signature.id(), age);
            self.signatures.insert(signature.id(), signature);
        }
        info!(loaded = self.signatures.len(), "nodes loaded into WM");

        self.last_signature_id = self
            .wm
            .keys()
            .rev()
            .find(|&&id| id > 0 && self.signatures.contains_key(&id))
            .copied()
            .unwrap_or(0);
        self.id_count = storage.last_node_id()?;
        self.id_map_count = self
            .last_working_signature()
            .map(|s| s.map_id() + 1)
            .unwrap_or(0);

        // Load the dictionary: every word cited by the loaded nodes, or the
        // last session's dictionary.
        let word_records = if self.config.init_wm_with_all_nodes {
            let mut word_ids: BTreeSet<i32> = BTreeSet::new();
            for signature in self.signatures.values() {
                word_ids.extend(signature.unique_word_ids());
            }
            let ids: Vec<i32> = word_ids.into_iter().collect();
            storage.load_words(&ids)?
        } else {
            storage.load_last_words()?
        };
        let word_count = word_records.len();
        for record in word_records {
            self.vwd.add_word(VisualWord::new(record.id, record.descriptor));
        }
        self.vwd.set_last_word_id(storage.last_word_id()?);
        self.vwd.update();
        info!(words = word_count, "dictionary loaded");

        // Re-register citations of everything loaded.
        let ids: Vec<i32> = self.signatures.keys().copied().collect();
        for id in ids {
            let citations: Vec<(i32, usize)> = self.signatures[&id]
                .words()
                .iter()
                .map(|(&word, kps)| (word, kps.len()))
                .collect();
            for (word, count) in &citations {
                for _ in 0..*count {
                    self.vwd.add_word_ref(*word, id);
                }
            }
            if !citations.is_empty() {
                self.signatures
                    .get_mut(&id)
                    .expect("resident")
                    .set_enabled(true);
            }
        }
        if self.vwd.unused_count() > 0 {
            warn!(
                unused = self.vwd.unused_count(),
                "loaded words without any loaded citation"
            );
        }
        Ok(true)
    }

    /// Shut the memory down.  With `save` and pending changes, the resident
    /// tiers are flushed through the trash before the database closes; a
    /// links-only change preserves entry timestamps.
    pub fn close(&mut self, save: bool) {
        debug!(save, "closing memory");
        if !save || (!self.memory_changed && !self.links_changed) {
            debug!("no changes to save");
            // Drop storage first so clear() does not persist anything.
            if let Some(mut storage) = self.storage.take()
                && let Err(e) = storage.close()
            {
                warn!("database close failed: {e}");
            }
            self.clear();
        } else {
            if !self.memory_changed
                && self.links_changed
                && let Some(storage) = &self.storage
            {
                let _ = storage.set_timestamp_update_enabled(false);
            }
            self.clear();
            if let Some(mut storage) = self.storage.take() {
                let _ = storage.empty_trashes(true);
                if let Err(e) = storage.close() {
                    warn!("database close failed: {e}");
                }
            }
        }
    }

    /// Flush every tier and reset all counters.  With storage attached this
    /// writes the end-of-run statistics marker and persists the resident
    /// nodes and dictionary behind it, defining the next session's restore
    /// point.
    pub fn clear(&mut self) {
        debug!("clearing memory");
        while let Some(&head) = self.stm.first() {
            self.migrate_stm_to_wm(head);
        }
        self.clean_unused_words();

        if let Some(storage) = &self.storage {
            let _ = storage.empty_trashes(true);
            let _ = storage.join();
            // Rows persisted after this point belong to the next restore
            // set; keep their stamps strictly after everything before.
            std::thread::sleep(SESSION_STAMP_SETTLE);
        }

        if let Some(storage) = &self.storage
            && !self.signatures.is_empty()
        {
            let resident = self.wm.len() - usize::from(self.wm.contains_key(&ID_VIRTUAL))
                + self.stm.len();
            assert_eq!(
                resident,
                self.signatures.len(),
                "tier membership and the signature table disagree"
            );
            if self.memory_changed
                && let Err(e) = storage.add_statistics_after_run(
                    resident,
                    self.last_signature_id,
                    self.vwd.len(),
                )
            {
                warn!("statistics write failed: {e}");
            }
        }

        let mut ids: Vec<i32> = self.signatures.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.move_to_trash(id, true, None);
        }
        assert!(
            self.wm.keys().all(|&id| id == ID_VIRTUAL),
            "WM must only hold the sentinel after clearing"
        );
        assert!(self.signatures.is_empty());
        self.wm.clear();
        self.wm.insert(ID_VIRTUAL, 0.0);

        if let Some(storage) = &self.storage {
            let _ = storage.empty_trashes(true);
            let _ = storage.join();
        }
        // Words orphaned by the flush above are persisted inside the new
        // restore set.
        self.clean_unused_words();
        if let Some(storage) = &self.storage {
            let _ = storage.empty_trashes(true);
        }

        self.last_signature_id = 0;
        self.last_global_loop_closure_id = 0;
        self.id_count = 0;
        self.id_map_count = 0;
        self.memory_changed = false;
        self.links_changed = false;
        self.vwd.clear();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
