//! Map nodes.
//!
//! A [`Signature`] summarizes one observation: identity, pose, weight, the
//! multi-valued word maps, the retained sensor payload and the links to its
//! peers.  Links are plain `(peer id, Link)` entries; the graph is arena
//! keyed, never owning references.

use std::collections::BTreeMap;

use rovermap_core::{KeyPoint, Link, LinkKind, SensorPayload, Transform, Vec3};
use rovermap_storage::NodeRecord;

/// One node of the map graph.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    id: i32,
    map_id: i32,
    /// Usage count; -1 marks an intermediate (non-queryable) node.
    weight: i32,
    label: String,
    stamp: f64,
    pose: Option<Transform>,
    links: BTreeMap<i32, Link>,
    /// word id → keypoints citing it (one word may appear several times).
    words: BTreeMap<i32, Vec<KeyPoint>>,
    /// word id → 3-D points, parallel to `words`; NaN marks unknown.
    words3: BTreeMap<i32, Vec<Vec3>>,
    payload: SensorPayload,
    /// Whether this signature's words currently count in the inverted index.
    enabled: bool,
    /// Whether this signature has ever been persisted.
    saved: bool,
}

impl Signature {
    pub fn new(id: i32, map_id: i32, weight: i32, stamp: f64, pose: Option<Transform>) -> Self {
        assert!(id > 0, "signature ids are positive (got {id})");
        assert!(map_id >= 0, "map ids are non-negative (got {map_id})");
        Self {
            id,
            map_id,
            weight,
            stamp,
            pose,
            ..Default::default()
        }
    }

    // ── identity ────────────────────────────────────────────────────────────

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn map_id(&self) -> i32 {
        self.map_id
    }

    pub fn stamp(&self) -> f64 {
        self.stamp
    }

    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: i32) {
        self.weight = weight;
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn pose(&self) -> Option<&Transform> {
        self.pose.as_ref()
    }

    pub fn set_pose(&mut self, pose: Option<Transform>) {
        self.pose = pose;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn set_saved(&mut self, saved: bool) {
        self.saved = saved;
    }

    /// A bad signature has no words: nothing to index or compare.
    pub fn is_bad_signature(&self) -> bool {
        self.words.is_empty()
    }

    // ── links ───────────────────────────────────────────────────────────────

    pub fn links(&self) -> &BTreeMap<i32, Link> {
        &self.links
    }

    pub fn has_link(&self, peer: i32) -> bool {
        self.links.contains_key(&peer)
    }

    /// Install a link originating here.  Replacing an existing link to the
    /// same peer is a bug.
    pub fn add_link(&mut self, link: Link) {
        assert_eq!(link.from, self.id, "link.from must be this signature");
        assert!(
            !self.links.contains_key(&link.to),
            "signature {} already linked to {}",
            self.id,
            link.to
        );
        self.links.insert(link.to, link);
    }

    pub fn remove_link(&mut self, peer: i32) -> Option<Link> {
        self.links.remove(&peer)
    }

    pub fn remove_links(&mut self) {
        self.links.clear();
    }

    /// Drop virtual-closure links, returning the peers that held them.
    pub fn remove_virtual_links(&mut self) -> Vec<i32> {
        let peers: Vec<i32> = self
            .links
            .iter()
            .filter(|(_, l)| l.kind == LinkKind::VirtualClosure)
            .map(|(&peer, _)| peer)
            .collect();
        for peer in &peers {
            self.links.remove(peer);
        }
        peers
    }

    // ── words ───────────────────────────────────────────────────────────────

    pub fn words(&self) -> &BTreeMap<i32, Vec<KeyPoint>> {
        &self.words
    }

    pub fn words3(&self) -> &BTreeMap<i32, Vec<Vec3>> {
        &self.words3
    }

    pub fn set_words(&mut self, words: BTreeMap<i32, Vec<KeyPoint>>) {
        self.words = words;
    }

    pub fn set_words3(&mut self, words3: BTreeMap<i32, Vec<Vec3>>) {
        self.words3 = words3;
    }

    /// Total word citations (counting repeats).
    pub fn word_count(&self) -> usize {
        self.words.values().map(Vec::len).sum()
    }

    /// Distinct word ids cited by this signature.
    pub fn unique_word_ids(&self) -> Vec<i32> {
        self.words.keys().copied().collect()
    }

    /// Citation count of one word.
    pub fn word_citations(&self, word_id: i32) -> usize {
        self.words.get(&word_id).map_or(0, Vec::len)
    }

    /// Rewrite citations of `old_word` to `new_word` (dictionary remapping
    /// after reactivation).
    pub fn change_word_ref(&mut self, old_word: i32, new_word: i32) {
        if let Some(kps) = self.words.remove(&old_word) {
            self.words.entry(new_word).or_default().extend(kps);
        }
        if let Some(pts) = self.words3.remove(&old_word) {
            self.words3.entry(new_word).or_default().extend(pts);
        }
    }

    /// Cosine similarity of the two signatures' word-count vectors.
    ///
    /// Only shared words contribute to the dot product; disjoint vocabularies
    /// give 0, identical ones give 1.
    pub fn compare_to(&self, other: &Signature) -> f32 {
        if self.words.is_empty() || other.words.is_empty() {
            return 0.0;
        }
        let dot: f32 = self
            .words
            .iter()
            .filter_map(|(id, kps)| {
                other
                    .words
                    .get(id)
                    .map(|other_kps| kps.len() as f32 * other_kps.len() as f32)
            })
            .sum();
        let norm = |s: &Signature| {
            s.words
                .values()
                .map(|k| (k.len() * k.len()) as f32)
                .sum::<f32>()
                .sqrt()
        };
        let denom = norm(self) * norm(other);
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    // ── payload ─────────────────────────────────────────────────────────────

    pub fn payload(&self) -> &SensorPayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut SensorPayload {
        &mut self.payload
    }

    pub fn set_payload(&mut self, payload: SensorPayload) {
        self.payload = payload;
    }

    /// Attach a free-form user blob.
    pub fn set_user_data(&mut self, data: Vec<u8>) {
        self.payload.user_data = data;
    }

    // ── persistence conversion ──────────────────────────────────────────────

    /// Flatten into a storage row.
    pub fn to_record(&self) -> NodeRecord {
        let mut words = Vec::with_capacity(self.word_count());
        for (&id, kps) in &self.words {
            for kp in kps {
                words.push((id, *kp));
            }
        }
        let mut words3 = Vec::new();
        for (&id, pts) in &self.words3 {
            for p in pts {
                words3.push((id, *p));
            }
        }
        NodeRecord {
            id: self.id,
            map_id: self.map_id,
            weight: self.weight,
            label: self.label.clone(),
            stamp: self.stamp,
            pose: self.pose,
            links: self.links.values().cloned().collect(),
            words,
            words3,
            payload: self.payload.clone(),
        }
    }

    /// Rebuild from a storage row; the signature is marked saved and
    /// disabled (its word refs are not registered yet).
    pub fn from_record(record: NodeRecord) -> Self {
        let mut words: BTreeMap<i32, Vec<KeyPoint>> = BTreeMap::new();
        for (id, kp) in record.words {
            words.entry(id).or_default().push(kp);
        }
        let mut words3: BTreeMap<i32, Vec<Vec3>> = BTreeMap::new();
        for (id, p) in record.words3 {
            words3.entry(id).or_default().push(p);
        }
        let mut links = BTreeMap::new();
        for link in record.links {
            links.insert(link.to, link);
        }
        Self {
            id: record.id,
            map_id: record.map_id,
            weight: record.weight,
            label: record.label,
            stamp: record.stamp,
            pose: record.pose,
            links,
            words,
            words3,
            payload: record.payload,
            enabled: false,
            saved: true,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn with_words(id: i32, word_counts: &[(i32, usize)]) -> Signature {
        let mut s = Signature::new(id, 0, 0, 0.0, None);
        let mut words = BTreeMap::new();
        for &(word, count) in word_counts {
            words.insert(word, vec![KeyPoint::new(0.0, 0.0, 3.0); count]);
        }
        s.set_words(words);
        s
    }

    // ── compare_to ──────────────────────────────────────────────────────────

    #[test]
    fn identical_word_sets_compare_to_one() {
        let a = with_words(1, &[(10, 1), (11, 2)]);
        let b = with_words(2, &[(10, 1), (11, 2)]);
        assert!((a.compare_to(&b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn disjoint_word_sets_compare_to_zero() {
        let a = with_words(1, &[(10, 1)]);
        let b = with_words(2, &[(20, 1)]);
        assert_eq!(a.compare_to(&b), 0.0);
    }

    #[test]
    fn partial_overlap_is_between() {
        let a = with_words(1, &[(10, 1), (11, 1)]);
        let b = with_words(2, &[(10, 1), (12, 1)]);
        let sim = a.compare_to(&b);
        assert!(sim > 0.0 && sim < 1.0);
        assert!((sim - 0.5).abs() < 1e-5); // 1 / (√2·√2)
    }

    #[test]
    fn empty_signature_compares_to_zero() {
        let a = with_words(1, &[]);
        let b = with_words(2, &[(10, 1)]);
        assert_eq!(a.compare_to(&b), 0.0);
        assert!(a.is_bad_signature());
    }

    // ── links ───────────────────────────────────────────────────────────────

    #[test]
    fn add_and_remove_link() {
        let mut s = Signature::new(1, 0, 0, 0.0, None);
        s.add_link(Link::new(1, 2, LinkKind::Neighbor, None));
        assert!(s.has_link(2));
        assert!(s.remove_link(2).is_some());
        assert!(!s.has_link(2));
    }

    #[test]
    #[should_panic]
    fn duplicate_link_panics() {
        let mut s = Signature::new(1, 0, 0, 0.0, None);
        s.add_link(Link::new(1, 2, LinkKind::Neighbor, None));
        s.add_link(Link::new(1, 2, LinkKind::GlobalClosure, None));
    }

    #[test]
    #[should_panic]
    fn foreign_link_panics() {
        let mut s = Signature::new(1, 0, 0, 0.0, None);
        s.add_link(Link::new(5, 2, LinkKind::Neighbor, None));
    }

    #[test]
    fn remove_virtual_links_only_touches_virtual() {
        let mut s = Signature::new(1, 0, 0, 0.0, None);
        s.add_link(Link::new(1, 2, LinkKind::Neighbor, None));
        s.add_link(Link::new(1, 3, LinkKind::VirtualClosure, None));
        s.add_link(Link::new(1, 4, LinkKind::VirtualClosure, None));
        let removed = s.remove_virtual_links();
        assert_eq!(removed, vec![3, 4]);
        assert!(s.has_link(2));
        assert_eq!(s.links().len(), 1);
    }

    // ── words ───────────────────────────────────────────────────────────────

    #[test]
    fn word_counts_include_repeats() {
        let s = with_words(1, &[(10, 3), (11, 1)]);
        assert_eq!(s.word_count(), 4);
        assert_eq!(s.word_citations(10), 3);
        assert_eq!(s.unique_word_ids(), vec![10, 11]);
    }

    #[test]
    fn change_word_ref_merges_citations() {
        let mut s = with_words(1, &[(10, 2), (20, 1)]);
        s.change_word_ref(10, 20);
        assert_eq!(s.word_citations(10), 0);
        assert_eq!(s.word_citations(20), 3);
    }

    // ── record conversion ───────────────────────────────────────────────────

    #[test]
    fn record_roundtrip_preserves_content() {
        let mut s = with_words(4, &[(10, 2)]);
        s.set_label("kitchen");
        s.set_weight(7);
        s.set_pose(Some(Transform::identity()));
        s.add_link(Link::new(4, 2, LinkKind::GlobalClosure, None));

        let back = Signature::from_record(s.to_record());
        assert_eq!(back.id(), 4);
        assert_eq!(back.label(), "kitchen");
        assert_eq!(back.weight(), 7);
        assert_eq!(back.word_citations(10), 2);
        assert!(back.has_link(2));
        assert!(back.is_saved());
        assert!(!back.is_enabled());
    }

    #[test]
    #[should_panic]
    fn zero_id_panics() {
        let _ = Signature::new(0, 0, 0, 0.0, None);
    }
}
