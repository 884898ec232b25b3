//! The memory facade: tiers, counters and the update entry point.
//!
//! [`Memory`] owns the signature arena, the STM/WM tier collections, the
//! visual-word dictionary and the feature backends.  All mutating operations
//! run on the owner thread; the graph, rehearsal, policy, builder and
//! persistence modules extend this type with further `impl` blocks.
//!
//! Tier rules:
//!
//! - a new signature enters **STM** at the tail, linked to the previous tail;
//! - when STM holds more than `stm_size` non-intermediate nodes, the head
//!   migrates to **WM** (optionally collapsing through graph reduction);
//! - the forget policy demotes WM members to **LTM** through the trash.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use rovermap_core::{
    BlobCodec, Link, LinkInfo, LinkKind, PlainCodec, SensorData, Transform,
};
use rovermap_storage::Storage;
use rovermap_vision::feature::parse_roi_ratios;
use rovermap_vision::{FeatureDetector, GridDetector, ScanlineMatcher, StereoMatcher, VwDictionary};

use crate::config::MemoryConfig;
use crate::signature::Signature;
use crate::stats::Statistics;
use crate::MemoryError;

/// The invalid id; never assigned to a signature.
pub const ID_INVALID: i32 = 0;
/// The virtual sentinel: lives in WM, never in the signature table.
pub const ID_VIRTUAL: i32 = -1;

/// The multi-tier mapping memory.
pub struct Memory {
    pub(crate) config: MemoryConfig,
    pub(crate) roi_ratios: [f32; 4],

    /// Arena of resident signatures (STM ∪ WM), keyed by id.
    pub(crate) signatures: HashMap<i32, Signature>,
    /// STM membership, ordered by insertion (== id order).
    pub(crate) stm: BTreeSet<i32>,
    /// WM membership: id → last-access age in seconds.
    pub(crate) wm: BTreeMap<i32, f64>,

    pub(crate) vwd: VwDictionary,
    pub(crate) detector: Box<dyn FeatureDetector>,
    pub(crate) stereo: Box<dyn StereoMatcher>,
    pub(crate) codec: Arc<dyn BlobCodec>,
    pub(crate) storage: Option<Storage>,

    pub(crate) id_count: i32,
    pub(crate) id_map_count: i32,
    pub(crate) last_signature_id: i32,
    pub(crate) last_global_loop_closure_id: i32,
    pub(crate) memory_changed: bool,
    pub(crate) links_changed: bool,
    pub(crate) signatures_added: i32,

    epoch: Instant,
}

impl Memory {
    /// Build a memory with the default backends (grid detector, scanline
    /// stereo, identity codec) and no storage attached.
    pub fn new(config: MemoryConfig) -> Result<Self, MemoryError> {
        config.validate()?;
        let roi_ratios = parse_roi_ratios(&config.kp_roi_ratios)
            .map_err(|e| MemoryError::Config(e.to_string()))?;
        let vwd = VwDictionary::new(config.kp_incremental_dictionary, config.kp_nn_distance);
        let detector = Box::new(GridDetector::new(config.kp_max_features));
        Ok(Self {
            roi_ratios,
            vwd,
            detector,
            stereo: Box::new(ScanlineMatcher::default()),
            codec: Arc::new(PlainCodec),
            storage: None,
            signatures: HashMap::new(),
            stm: BTreeSet::new(),
            wm: BTreeMap::from([(ID_VIRTUAL, 0.0)]),
            id_count: 0,
            id_map_count: 0,
            last_signature_id: 0,
            last_global_loop_closure_id: 0,
            memory_changed: false,
            links_changed: false,
            signatures_added: 0,
            epoch: Instant::now(),
            config,
        })
    }

    /// Swap in a feature-detector backend (drops the previous one).
    pub fn set_detector(&mut self, detector: Box<dyn FeatureDetector>) {
        self.detector = detector;
    }

    /// Swap in a stereo-matcher backend.
    pub fn set_stereo_matcher(&mut self, stereo: Box<dyn StereoMatcher>) {
        self.stereo = stereo;
    }

    /// Swap in a payload codec.
    pub fn set_codec(&mut self, codec: Arc<dyn BlobCodec>) {
        self.codec = codec;
    }

    // ── accessors ───────────────────────────────────────────────────────────

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn is_incremental(&self) -> bool {
        self.config.incremental_memory
    }

    pub fn signature(&self, id: i32) -> Option<&Signature> {
        self.signatures.get(&id)
    }

    pub(crate) fn signature_mut(&mut self, id: i32) -> Option<&mut Signature> {
        self.signatures.get_mut(&id)
    }

    /// Ids of every resident signature (STM ∪ WM, excluding the sentinel).
    pub fn all_signature_ids(&self) -> BTreeSet<i32> {
        self.signatures.keys().copied().collect()
    }

    pub fn stm_ids(&self) -> &BTreeSet<i32> {
        &self.stm
    }

    pub fn wm_ids(&self) -> Vec<i32> {
        self.wm.keys().copied().collect()
    }

    pub fn is_in_stm(&self, id: i32) -> bool {
        self.stm.contains(&id)
    }

    pub fn is_in_wm(&self, id: i32) -> bool {
        self.wm.contains_key(&id)
    }

    /// Resident in either tier (the sentinel counts as WM).
    pub fn is_in_memory(&self, id: i32) -> bool {
        self.is_in_stm(id) || self.is_in_wm(id)
    }

    /// The most recent signature: STM tail, else newest WM entry.
    pub fn last_working_signature(&self) -> Option<&Signature> {
        self.signatures.get(&self.last_signature_id)
    }

    pub fn last_signature_id(&self) -> i32 {
        self.id_count
    }

    pub fn last_global_loop_closure_id(&self) -> i32 {
        self.last_global_loop_closure_id
    }

    pub fn is_memory_changed(&self) -> bool {
        self.memory_changed
    }

    pub fn are_links_changed(&self) -> bool {
        self.links_changed
    }

    pub fn dictionary(&self) -> &VwDictionary {
        &self.vwd
    }

    /// WM weights, for the loop-closure hypothesis filter.  The virtual
    /// sentinel reports -1.
    pub fn weights(&self) -> BTreeMap<i32, i32> {
        self.wm
            .keys()
            .map(|&id| {
                if id > 0 {
                    let s = self
                        .signatures
                        .get(&id)
                        .unwrap_or_else(|| panic!("WM member {id} must be resident"));
                    (id, s.weight())
                } else {
                    (id, -1)
                }
            })
            .collect()
    }

    /// Monotonic age in seconds, used for WM last-access stamps.
    pub(crate) fn now_age(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    // ── id allocation ───────────────────────────────────────────────────────

    pub(crate) fn next_id(&mut self) -> i32 {
        self.id_count += 1;
        self.id_count
    }

    /// Start a new map: if the current map has at least one node, flush STM
    /// to WM and bump the map counter.  Nodes collapsed by reduction during
    /// the flush are reported through `reduced_ids`.
    pub fn increment_map_id(&mut self, mut reduced_ids: Option<&mut BTreeMap<i32, i32>>) -> i32 {
        let on_current_map = self
            .last_working_signature()
            .is_some_and(|s| s.map_id() == self.id_map_count);
        if on_current_map {
            while let Some(&head) = self.stm.first() {
                let reduced = self.migrate_stm_to_wm(head);
                if let (Some(target), Some(map)) = (reduced, reduced_ids.as_deref_mut()) {
                    map.insert(head, target);
                }
            }
            self.id_map_count += 1;
            info!(map_id = self.id_map_count, "new map started");
        }
        self.id_map_count
    }

    /// Refresh a WM member's last-access stamp.
    pub fn update_age(&mut self, id: i32) {
        let age = self.now_age();
        if let Some(entry) = self.wm.get_mut(&id) {
            *entry = age;
        }
    }

    // ── update entry point ──────────────────────────────────────────────────

    /// Garbage-collect unused words and (when not parallelized) rebuild the
    /// dictionary index.  Runs at the start of every update.
    pub fn pre_update(&mut self) {
        self.signatures_added = 0;
        self.clean_unused_words();
        if !self.config.kp_parallelized {
            self.vwd.update();
        }
    }

    /// Process one observation: create a signature, insert it into STM, run
    /// rehearsal, and migrate STM overflow into WM.  Returns the new
    /// signature's id.
    pub fn update(
        &mut self,
        data: SensorData,
        pose: Option<Transform>,
        covariance: Option<(f32, f32)>,
        mut stats: Option<&mut Statistics>,
    ) -> Result<i32, MemoryError> {
        self.pre_update();

        let signature = self.create_signature(data, pose, stats.as_deref_mut())?;
        let id = signature.id();

        self.add_signature_to_stm(signature, covariance);
        self.last_signature_id = id;

        if self.config.incremental_memory {
            if self.config.rehearsal_similarity < 1.0 {
                self.rehearsal(id, stats.as_deref_mut());
            }
        } else if self.wm.len() <= 1 {
            warn!(
                "the working memory is empty and the memory is not incremental, \
                 no loop closure can be detected"
            );
        }

        // Migrate the oldest STM entries while too many non-intermediate
        // nodes are resident.
        let mut non_intermediate = self
            .stm
            .iter()
            .filter(|&&id| self.signatures[&id].weight() >= 0)
            .count();
        let mut reduced_ids = BTreeMap::new();
        while let Some(&head) = self.stm.first() {
            if non_intermediate <= self.config.stm_size {
                break;
            }
            if self.signatures[&head].weight() >= 0 {
                non_intermediate -= 1;
            }
            if let Some(target) = self.migrate_stm_to_wm(head) {
                reduced_ids.insert(head, target);
            }
        }
        if let Some(stats) = stats {
            stats.set_reduced_ids(reduced_ids);
        }

        if self.config.incremental_memory {
            self.memory_changed = true;
        }
        Ok(id)
    }

    // ── STM insertion ───────────────────────────────────────────────────────

    /// Place a freshly built signature at the STM tail, linking it to the
    /// previous tail (same map) or auto-labelling the first node of a new
    /// map.
    pub(crate) fn add_signature_to_stm(
        &mut self,
        mut signature: Signature,
        covariance: Option<(f32, f32)>,
    ) {
        debug!(id = signature.id(), "inserting into STM");
        if let Some(&tail) = self.stm.last() {
            let tail_map_id = self.signatures[&tail].map_id();
            if tail_map_id == signature.map_id() {
                let info = covariance
                    .map(|(rot, trans)| LinkInfo::from_covariance(rot, trans))
                    .unwrap_or_default();
                let motion = match (self.signatures[&tail].pose(), signature.pose()) {
                    (Some(a), Some(b)) => Some(a.relative_to(b)),
                    _ => None,
                };
                let link = Link::new(tail, signature.id(), LinkKind::Neighbor, motion)
                    .with_info(info);
                signature.add_link(link.inverse());
                self.signatures
                    .get_mut(&tail)
                    .expect("STM tail resident")
                    .add_link(link);
            } else {
                debug!(
                    from = tail,
                    to = signature.id(),
                    "no neighbor link across maps ({} vs {})",
                    tail_map_id,
                    signature.map_id()
                );
                self.maybe_label_first_of_map(&mut signature);
            }
        } else if self.config.map_labels_added {
            self.maybe_label_first_of_map(&mut signature);
        }

        self.stm.insert(signature.id());
        self.signatures.insert(signature.id(), signature);
        self.signatures_added += 1;
    }

    fn maybe_label_first_of_map(&self, signature: &mut Signature) {
        if !self.config.map_labels_added {
            return;
        }
        let tag = format!("map{}", signature.map_id());
        if self.signature_id_by_label(&tag, false).is_none() {
            info!(id = signature.id(), label = %tag, "tagging first node of map");
            signature.set_label(tag);
        }
    }

    /// Insert a signature loaded back from LTM directly into WM.
    pub(crate) fn add_signature_to_wm_from_ltm(&mut self, signature: Signature) {
        debug!(id = signature.id(), "inserting from LTM into WM");
        self.wm.insert(signature.id(), self.now_age());
        self.signatures.insert(signature.id(), signature);
        self.signatures_added += 1;
    }

    // ── STM → WM migration ──────────────────────────────────────────────────

    /// Move the STM head into WM.  With graph reduction enabled the head may
    /// instead collapse into a lower-id peer; the target id is returned.
    ///
    /// The caller must pass the current STM head.
    pub fn migrate_stm_to_wm(&mut self, id: i32) -> Option<i32> {
        assert_eq!(
            self.stm.first().copied(),
            Some(id),
            "migration must start at the STM head"
        );
        debug!(id, "migrating from STM to WM");

        if self.config.reduce_graph
            && let Some(target) = self.reduce_into_peer(id)
        {
            return Some(target);
        }

        self.wm.insert(id, self.now_age());
        self.stm.remove(&id);
        None
    }

    // ── labels ──────────────────────────────────────────────────────────────

    /// Resolve a label to a signature id, optionally searching LTM.
    pub fn signature_id_by_label(&self, label: &str, look_in_db: bool) -> Option<i32> {
        if label.is_empty() {
            return None;
        }
        for signature in self.signatures.values() {
            if signature.label() == label {
                return Some(signature.id());
            }
        }
        if look_in_db && let Some(storage) = &self.storage {
            match storage.node_id_by_label(label) {
                Ok(found) => return found,
                Err(e) => warn!("label lookup failed: {e}"),
            }
        }
        None
    }

    /// Assign a unique label to a node, in memory or directly in LTM.
    /// Fails when another node already carries the label.
    pub fn label_signature(&mut self, id: i32, label: &str) -> bool {
        match self.signature_id_by_label(label, true) {
            Some(existing) if existing != id => {
                warn!(existing, label, "label already in use");
                false
            }
            _ => {
                if let Some(signature) = self.signatures.get_mut(&id) {
                    signature.set_label(label);
                    self.memory_changed = true;
                    true
                } else if let Some(storage) = &self.storage {
                    match storage.load_nodes(&[id]) {
                        Ok(mut nodes) if !nodes.is_empty() => {
                            let mut record = nodes.remove(0);
                            record.label = label.to_string();
                            if let Err(e) = storage.async_save_node(record) {
                                warn!("failed to relabel node {id} in LTM: {e}");
                                return false;
                            }
                            true
                        }
                        Ok(_) => {
                            warn!(id, label, "node not found, cannot label");
                            false
                        }
                        Err(e) => {
                            warn!("label load failed: {e}");
                            false
                        }
                    }
                } else {
                    warn!(id, label, "node not found, cannot label");
                    false
                }
            }
        }
    }

    /// Every label in memory and LTM.
    pub fn all_labels(&self) -> BTreeMap<i32, String> {
        let mut labels: BTreeMap<i32, String> = self
            .signatures
            .values()
            .filter(|s| !s.label().is_empty())
            .map(|s| (s.id(), s.label().to_string()))
            .collect();
        if let Some(storage) = &self.storage {
            match storage.all_labels() {
                Ok(stored) => {
                    for (id, label) in stored {
                        labels.entry(id).or_insert(label);
                    }
                }
                Err(e) => warn!("label scan failed: {e}"),
            }
        }
        labels
    }

    /// Attach a user blob to a resident node.
    pub fn set_user_data(&mut self, id: i32, data: Vec<u8>) -> bool {
        if let Some(signature) = self.signatures.get_mut(&id) {
            signature.set_user_data(data);
            self.memory_changed = true;
            true
        } else {
            warn!(id, "node not resident, cannot set user data");
            false
        }
    }

    // ── post-update cleanup ─────────────────────────────────────────────────

    /// Drop the last signature when it is a bad signature (and those are
    /// ignored) or when the memory is in localization mode.  Returns the
    /// removed id, or 0.
    pub fn cleanup(&mut self) -> i32 {
        let Some(last) = self.last_working_signature() else {
            return ID_INVALID;
        };
        let id = last.id();
        let bad = last.is_bad_signature();
        if (bad && self.config.bad_signatures_ignored) || !self.config.incremental_memory {
            if bad {
                debug!(id, "dropping bad signature");
            }
            self.move_to_trash(id, self.config.incremental_memory, None);
            return id;
        }
        ID_INVALID
    }
}

impl Drop for Memory {
    /// Dropping the memory is the abort path: flush and close as if
    /// [`close(true)`][Memory::close] had been called.
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if self.storage.is_some() {
            self.close(true);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_memory, observation, translate};

    // ── scenario: neighbor chain ────────────────────────────────────────────

    #[test]
    fn neighbor_chain_links_consecutive_nodes() {
        let mut memory = make_memory(|c| c.stm_size = 10);
        let poses = [0.0f32, 0.1, 0.2];
        for (i, x) in poses.iter().enumerate() {
            let id = memory
                .update(
                    observation(i as u64),
                    Some(translate(*x)),
                    None,
                    None,
                )
                .unwrap();
            assert_eq!(id, i as i32 + 1);
        }

        assert_eq!(memory.stm_ids().iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(memory.last_working_signature().unwrap().id(), 3);

        // Mutual neighbor links 1↔2 and 2↔3 with the relative transforms.
        for (a, b) in [(1, 2), (2, 3)] {
            let link = &memory.signature(a).unwrap().links()[&b];
            assert_eq!(link.kind, LinkKind::Neighbor);
            let t = link.transform.expect("metric link");
            assert!((t.translation.x - 0.1).abs() < 1e-5);
            let back = &memory.signature(b).unwrap().links()[&a];
            assert!((back.transform.unwrap().translation.x + 0.1).abs() < 1e-5);
        }
        // No loop closures anywhere.
        for id in [1, 2, 3] {
            assert!(memory.loop_closure_links(id, false).is_empty());
        }
    }

    #[test]
    fn first_node_gets_map_label() {
        let mut memory = make_memory(|_| {});
        memory
            .update(observation(1), None, None, None)
            .unwrap();
        assert_eq!(memory.signature(1).unwrap().label(), "map0");
        assert_eq!(memory.signature_id_by_label("map0", false), Some(1));
    }

    #[test]
    fn nodes_across_maps_are_not_linked() {
        let mut memory = make_memory(|_| {});
        memory.update(observation(1), None, None, None).unwrap();
        memory.increment_map_id(None);
        memory.update(observation(2), None, None, None).unwrap();

        assert!(memory.signature(2).unwrap().links().is_empty());
        assert_eq!(memory.signature(2).unwrap().map_id(), 1);
        assert_eq!(memory.signature(2).unwrap().label(), "map1");
        // The first map's node migrated to WM during the map switch.
        assert!(memory.is_in_wm(1));
    }

    // ── scenario: transfer under pressure ───────────────────────────────────

    #[test]
    fn stm_overflow_migrates_oldest_to_wm() {
        let mut memory = make_memory(|c| c.stm_size = 2);
        for i in 0..5 {
            memory.update(observation(i), None, None, None).unwrap();
        }
        assert_eq!(memory.stm_ids().iter().copied().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(memory.wm_ids(), vec![ID_VIRTUAL, 1, 2, 3]);
    }

    // ── boundary: STM size 0 ────────────────────────────────────────────────

    #[test]
    fn stm_size_zero_migrates_immediately() {
        let mut memory = make_memory(|c| c.stm_size = 0);
        let id = memory.update(observation(1), None, None, None).unwrap();
        assert!(!memory.is_in_stm(id));
        assert!(memory.is_in_wm(id));
    }

    // ── boundary: empty descriptors ─────────────────────────────────────────

    #[test]
    fn featureless_observation_still_creates_signature() {
        let mut memory = make_memory(|_| {});
        let mut data = observation(1);
        data.image = rovermap_core::Image::empty();
        let id = memory.update(data, None, None, None).unwrap();

        let s = memory.signature(id).unwrap();
        assert!(s.is_bad_signature());
        assert!(!s.is_enabled());
        assert_eq!(s.weight(), -1, "empty image marks an intermediate node");
    }

    // ── virtual sentinel ────────────────────────────────────────────────────

    #[test]
    fn virtual_sentinel_lives_in_wm_only() {
        let memory = make_memory(|_| {});
        assert!(memory.is_in_wm(ID_VIRTUAL));
        assert!(memory.signature(ID_VIRTUAL).is_none());
        assert_eq!(memory.weights()[&ID_VIRTUAL], -1);
        assert!(!memory.all_signature_ids().contains(&ID_VIRTUAL));
    }

    // ── ids ─────────────────────────────────────────────────────────────────

    #[test]
    fn ids_strictly_increase() {
        let mut memory = make_memory(|c| c.stm_size = 1);
        let mut previous = 0;
        for i in 0..4 {
            let id = memory.update(observation(i), None, None, None).unwrap();
            assert!(id > previous);
            previous = id;
        }
        assert_eq!(memory.last_signature_id(), 4);
    }

    #[test]
    fn external_ids_must_increase() {
        let mut memory = make_memory(|c| c.generate_ids = false);
        let mut data = observation(1);
        data.id = 5;
        memory.update(data, None, None, None).unwrap();

        let mut stale = observation(2);
        stale.id = 3;
        let err = memory.update(stale, None, None, None).unwrap_err();
        assert!(matches!(err, MemoryError::IdOrder { received: 3, current: 5 }));
    }

    // ── map id increment ────────────────────────────────────────────────────

    #[test]
    fn increment_map_id_noop_on_empty_map() {
        let mut memory = make_memory(|_| {});
        assert_eq!(memory.increment_map_id(None), 0);
        memory.update(observation(1), None, None, None).unwrap();
        assert_eq!(memory.increment_map_id(None), 1);
        // No new node on map 1 yet: second bump is a no-op.
        assert_eq!(memory.increment_map_id(None), 1);
    }

    // ── labels ──────────────────────────────────────────────────────────────

    #[test]
    fn labels_stay_unique() {
        let mut memory = make_memory(|c| c.map_labels_added = false);
        memory.update(observation(1), None, None, None).unwrap();
        memory.update(observation(2), None, None, None).unwrap();

        assert!(memory.label_signature(1, "dock"));
        assert!(!memory.label_signature(2, "dock"), "duplicate label refused");
        assert!(memory.label_signature(1, "dock"), "relabelling itself is fine");
        assert_eq!(memory.all_labels(), BTreeMap::from([(1, "dock".to_string())]));
    }

    // ── cleanup ─────────────────────────────────────────────────────────────

    #[test]
    fn cleanup_drops_bad_signature_when_ignored() {
        let mut memory = make_memory(|c| c.bad_signatures_ignored = true);
        let mut data = observation(1);
        data.id = -1; // intermediate: no features extracted
        let id = memory.update(data, None, None, None).unwrap();
        assert_eq!(memory.cleanup(), id);
        assert!(memory.signature(id).is_none());
    }

    #[test]
    fn cleanup_keeps_good_signature() {
        let mut memory = make_memory(|_| {});
        memory.update(observation(1), None, None, None).unwrap();
        assert_eq!(memory.cleanup(), ID_INVALID);
        assert!(memory.signature(1).is_some());
    }

    // ── user data ───────────────────────────────────────────────────────────

    #[test]
    fn set_user_data_on_resident_node() {
        let mut memory = make_memory(|_| {});
        memory.update(observation(1), None, None, None).unwrap();
        assert!(memory.set_user_data(1, vec![7, 7]));
        assert_eq!(memory.signature(1).unwrap().payload().user_data, vec![7, 7]);
        assert!(!memory.set_user_data(99, vec![1]));
    }

    // ── poses on neighbor links ─────────────────────────────────────────────

    #[test]
    fn poseless_neighbors_get_transformless_link() {
        let mut memory = make_memory(|_| {});
        memory.update(observation(1), None, None, None).unwrap();
        memory
            .update(observation(2), Some(translate(1.0)), None, None)
            .unwrap();
        let link = &memory.signature(1).unwrap().links()[&2];
        assert!(link.transform.is_none(), "one null pose gives a null-safe link");
    }
}
