//! Visual-word dictionary and inverted index.
//!
//! Every descriptor extracted from an observation is *quantized* to a visual
//! word: the nearest existing word within a distance threshold, or a freshly
//! allocated word when the dictionary is incremental.  Each word keeps its
//! inverted-index entry, a map from signature id to the number of times that
//! signature cites the word; that is what makes bag-of-words likelihood
//! queries cheap.
//!
//! The nearest-neighbour index over descriptors is deliberately
//! implementation-free: here it is a flat list of *indexed* word ids scanned
//! linearly, rebuilt by [`VwDictionary::update`].  Words created since the
//! last `update()` are not matched against (except within the same
//! quantization call), mirroring how an approximate index lags behind
//! insertions until it is rebuilt.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use rovermap_core::Descriptors;

// ────────────────────────────────────────────────────────────────────────────
// VisualWord
// ────────────────────────────────────────────────────────────────────────────

/// A quantization cluster of descriptors plus its inverted-index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualWord {
    id: i32,
    descriptor: Vec<f32>,
    /// signature id → number of citations by that signature.
    references: BTreeMap<i32, i32>,
    /// True once the word has been persisted.
    saved: bool,
}

impl VisualWord {
    pub fn new(id: i32, descriptor: Vec<f32>) -> Self {
        Self {
            id,
            descriptor,
            references: BTreeMap::new(),
            saved: false,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn descriptor(&self) -> &[f32] {
        &self.descriptor
    }

    pub fn references(&self) -> &BTreeMap<i32, i32> {
        &self.references
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn set_saved(&mut self, saved: bool) {
        self.saved = saved;
    }

    /// Total citations across all signatures.
    pub fn total_references(&self) -> i32 {
        self.references.values().sum()
    }

    fn add_ref(&mut self, signature_id: i32) {
        *self.references.entry(signature_id).or_insert(0) += 1;
    }

    /// Remove every citation by `signature_id`, returning how many there were.
    fn remove_all_refs(&mut self, signature_id: i32) -> i32 {
        self.references.remove(&signature_id).unwrap_or(0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// VwDictionary
// ────────────────────────────────────────────────────────────────────────────

/// The visual-word table, inverted index and NN quantizer.
#[derive(Debug)]
pub struct VwDictionary {
    words: BTreeMap<i32, VisualWord>,
    /// Word ids present in the NN index (searchable).
    indexed: BTreeSet<i32>,
    /// Words added since the last [`update`][Self::update].
    not_indexed: BTreeSet<i32>,
    /// Words whose reference set is empty, awaiting GC.
    unused: BTreeSet<i32>,
    last_word_id: i32,
    incremental: bool,
    nn_distance: f32,
    total_active_refs: usize,
}

impl Default for VwDictionary {
    fn default() -> Self {
        Self::new(true, 0.2)
    }
}

impl VwDictionary {
    /// Create an empty dictionary.
    ///
    /// - `incremental` – whether quantization misses allocate new words.
    /// - `nn_distance` – maximum L2 descriptor distance for an NN match.
    pub fn new(incremental: bool, nn_distance: f32) -> Self {
        Self {
            words: BTreeMap::new(),
            indexed: BTreeSet::new(),
            not_indexed: BTreeSet::new(),
            unused: BTreeSet::new(),
            last_word_id: 0,
            incremental,
            nn_distance,
            total_active_refs: 0,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, id: i32) -> Option<&VisualWord> {
        self.words.get(&id)
    }

    /// Iterate over all words in id order.
    pub fn words(&self) -> impl Iterator<Item = &VisualWord> {
        self.words.values()
    }

    /// Returns the word only if its reference set is empty.
    pub fn unused_word(&self, id: i32) -> Option<&VisualWord> {
        self.unused.contains(&id).then(|| &self.words[&id])
    }

    pub fn unused_count(&self) -> usize {
        self.unused.len()
    }

    /// Words added since the last index rebuild.
    pub fn not_indexed_count(&self) -> usize {
        self.not_indexed.len()
    }

    /// Total active inverted-index citations across all words.
    pub fn total_active_references(&self) -> usize {
        self.total_active_refs
    }

    pub fn last_word_id(&self) -> i32 {
        self.last_word_id
    }

    /// Raise the id allocator, e.g. after loading a dictionary from storage.
    pub fn set_last_word_id(&mut self, id: i32) {
        if id > self.last_word_id {
            self.last_word_id = id;
        }
    }

    // ── quantization ────────────────────────────────────────────────────────

    /// Quantize `descriptors` for `signature_id`, returning one word id per
    /// row, in order.  Each returned id gains one reference.
    ///
    /// Matching is restricted to indexed words plus the words created earlier
    /// in this same call.  In a non-incremental dictionary a miss falls back
    /// to the nearest word regardless of the threshold; with an empty
    /// dictionary no ids are returned at all.
    pub fn quantize(&mut self, descriptors: &Descriptors, signature_id: i32) -> Vec<i32> {
        if descriptors.is_empty() {
            return Vec::new();
        }
        if !self.incremental && self.words.is_empty() {
            warn!("empty fixed dictionary, no words assigned");
            return Vec::new();
        }

        let mut assigned = Vec::with_capacity(descriptors.rows());
        let mut new_this_call: Vec<i32> = Vec::new();
        for row in 0..descriptors.rows() {
            let descriptor = descriptors.row(row);
            let candidates = self.indexed.iter().chain(new_this_call.iter());
            let best = self.best_match(descriptor, candidates);

            let word_id = match best {
                Some((id, dist)) if dist <= self.nn_distance || !self.incremental => id,
                _ if self.incremental => {
                    self.last_word_id += 1;
                    let id = self.last_word_id;
                    self.words
                        .insert(id, VisualWord::new(id, descriptor.to_vec()));
                    self.not_indexed.insert(id);
                    new_this_call.push(id);
                    id
                }
                _ => continue,
            };
            self.add_word_ref(word_id, signature_id);
            assigned.push(word_id);
        }
        debug!(
            signature_id,
            assigned = assigned.len(),
            created = new_this_call.len(),
            "quantized descriptors"
        );
        assigned
    }

    fn best_match<'a>(
        &self,
        descriptor: &[f32],
        candidates: impl Iterator<Item = &'a i32>,
    ) -> Option<(i32, f32)> {
        let mut best: Option<(i32, f32)> = None;
        for &id in candidates {
            let word = &self.words[&id];
            if word.descriptor.len() != descriptor.len() {
                continue;
            }
            let dist = l2_distance(&word.descriptor, descriptor);
            if best.is_none_or(|(_, d)| dist < d) {
                best = Some((id, dist));
            }
        }
        best
    }

    // ── reference lifecycle ─────────────────────────────────────────────────

    /// Add one citation of `word_id` by `signature_id`.
    pub fn add_word_ref(&mut self, word_id: i32, signature_id: i32) {
        if let Some(word) = self.words.get_mut(&word_id) {
            word.add_ref(signature_id);
            self.unused.remove(&word_id);
            self.total_active_refs += 1;
        } else {
            warn!(word_id, signature_id, "add_word_ref on unknown word");
        }
    }

    /// Remove every citation of `word_id` by `signature_id`; a word left
    /// without references becomes a GC candidate.
    pub fn remove_all_word_refs(&mut self, word_id: i32, signature_id: i32) {
        if let Some(word) = self.words.get_mut(&word_id) {
            let removed = word.remove_all_refs(signature_id);
            self.total_active_refs -= removed as usize;
            if word.references.is_empty() {
                self.unused.insert(word_id);
            }
        }
    }

    /// Insert a pre-built word (loaded from storage).  Its id must not be in
    /// the table; the allocator is raised past it.
    pub fn add_word(&mut self, word: VisualWord) {
        let id = word.id;
        self.set_last_word_id(id);
        if word.references.is_empty() {
            self.unused.insert(id);
        }
        self.not_indexed.insert(id);
        self.words.insert(id, word);
    }

    // ── GC ──────────────────────────────────────────────────────────────────

    /// Detach and return every reference-less word.
    pub fn take_unused_words(&mut self) -> Vec<VisualWord> {
        let ids: Vec<i32> = self.unused.iter().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.remove_word(id))
            .collect()
    }

    /// Detach a single word from the table and index.
    pub fn remove_word(&mut self, id: i32) -> Option<VisualWord> {
        let word = self.words.remove(&id)?;
        self.indexed.remove(&id);
        self.not_indexed.remove(&id);
        self.unused.remove(&id);
        self.total_active_refs -= word.total_references() as usize;
        Some(word)
    }

    // ── index maintenance ───────────────────────────────────────────────────

    /// Rebuild the NN index to cover every word in the table.
    ///
    /// May run concurrently with feature extraction (the dictionary is moved
    /// into the update task and joined before quantization).
    pub fn update(&mut self) {
        if !self.not_indexed.is_empty() {
            debug!(
                added = self.not_indexed.len(),
                total = self.words.len(),
                "rebuilding dictionary index"
            );
        }
        self.indexed = self.words.keys().copied().collect();
        self.not_indexed.clear();
    }

    /// Map externally loaded words onto currently active words.
    ///
    /// For each query word, returns the id of the nearest indexed word within
    /// the match threshold, or 0 when none qualifies.  Used during
    /// reactivation when a signature's original words were GC'd meanwhile.
    pub fn find_nn(&self, queries: &[VisualWord]) -> Vec<i32> {
        queries
            .iter()
            .map(|q| {
                match self.best_match(&q.descriptor, self.indexed.iter()) {
                    Some((id, dist)) if dist <= self.nn_distance => id,
                    _ => 0,
                }
            })
            .collect()
    }

    /// Drop all words and reset counters.
    pub fn clear(&mut self) {
        self.words.clear();
        self.indexed.clear();
        self.not_indexed.clear();
        self.unused.clear();
        self.last_word_id = 0;
        self.total_active_refs = 0;
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(rows: &[&[f32]]) -> Descriptors {
        let mut d = Descriptors::empty();
        for row in rows {
            d.push_row(row);
        }
        d
    }

    // ── quantize ────────────────────────────────────────────────────────────

    #[test]
    fn quantize_allocates_new_words() {
        let mut dict = VwDictionary::new(true, 0.1);
        let ids = dict.quantize(&descriptors(&[&[0.0, 0.0], &[1.0, 1.0]]), 1);
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.total_active_references(), 2);
    }

    #[test]
    fn quantize_matches_indexed_words_after_update() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.quantize(&descriptors(&[&[0.0, 0.0]]), 1);
        dict.update();
        let ids = dict.quantize(&descriptors(&[&[0.01, 0.0]]), 2);
        assert_eq!(ids, vec![1], "close descriptor reuses word 1");
        assert_eq!(dict.word(1).unwrap().references().len(), 2);
    }

    #[test]
    fn quantize_does_not_match_unindexed_words_across_calls() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.quantize(&descriptors(&[&[0.0, 0.0]]), 1);
        // No update(): word 1 is not searchable yet.
        let ids = dict.quantize(&descriptors(&[&[0.0, 0.0]]), 2);
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn quantize_shares_word_within_one_call() {
        let mut dict = VwDictionary::new(true, 0.1);
        let ids = dict.quantize(&descriptors(&[&[0.5, 0.5], &[0.5, 0.5]]), 1);
        assert_eq!(ids, vec![1, 1], "identical rows in one call share a word");
        assert_eq!(dict.word(1).unwrap().references()[&1], 2);
    }

    #[test]
    fn fixed_dictionary_assigns_nearest_regardless_of_threshold() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.quantize(&descriptors(&[&[0.0, 0.0]]), 1);
        dict.update();

        let mut fixed = VwDictionary::new(false, 0.1);
        std::mem::swap(&mut fixed.words, &mut dict.words);
        fixed.update();

        let ids = fixed.quantize(&descriptors(&[&[5.0, 5.0]]), 2);
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn fixed_empty_dictionary_returns_no_ids() {
        let mut dict = VwDictionary::new(false, 0.1);
        assert!(dict.quantize(&descriptors(&[&[1.0]]), 1).is_empty());
    }

    // ── reference lifecycle ─────────────────────────────────────────────────

    #[test]
    fn remove_all_refs_marks_word_unused() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.quantize(&descriptors(&[&[0.0, 0.0]]), 1);
        assert_eq!(dict.unused_count(), 0);
        dict.remove_all_word_refs(1, 1);
        assert_eq!(dict.unused_count(), 1);
        assert!(dict.unused_word(1).is_some());
        assert_eq!(dict.total_active_references(), 0);
    }

    #[test]
    fn unused_word_is_none_while_referenced() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.quantize(&descriptors(&[&[0.0, 0.0]]), 1);
        assert!(dict.unused_word(1).is_none());
    }

    #[test]
    fn take_unused_words_detaches_them() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.quantize(&descriptors(&[&[0.0, 0.0], &[1.0, 1.0]]), 1);
        dict.remove_all_word_refs(1, 1);
        dict.remove_all_word_refs(2, 1);
        let taken = dict.take_unused_words();
        assert_eq!(taken.len(), 2);
        assert!(dict.is_empty());
        assert_eq!(dict.unused_count(), 0);
    }

    #[test]
    fn readding_ref_rescues_word_from_gc() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.quantize(&descriptors(&[&[0.0, 0.0]]), 1);
        dict.remove_all_word_refs(1, 1);
        dict.add_word_ref(1, 2);
        assert_eq!(dict.unused_count(), 0);
        assert!(dict.take_unused_words().is_empty());
    }

    // ── loading / find_nn ───────────────────────────────────────────────────

    #[test]
    fn add_word_raises_allocator() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.add_word(VisualWord::new(42, vec![1.0, 0.0]));
        assert_eq!(dict.last_word_id(), 42);
        dict.update();
        dict.add_word_ref(42, 1);
        let ids = dict.quantize(&descriptors(&[&[9.0, 9.0]]), 1);
        assert_eq!(ids, vec![43], "new words allocate past loaded ids");
    }

    #[test]
    fn find_nn_maps_old_words_to_active() {
        let mut dict = VwDictionary::new(true, 0.05);
        dict.quantize(&descriptors(&[&[0.0, 0.0], &[1.0, 1.0]]), 1);
        dict.update();

        let queries = vec![
            VisualWord::new(900, vec![0.01, 0.0]), // near word 1
            VisualWord::new(901, vec![5.0, 5.0]),  // near nothing
        ];
        assert_eq!(dict.find_nn(&queries), vec![1, 0]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut dict = VwDictionary::new(true, 0.1);
        dict.quantize(&descriptors(&[&[0.0, 0.0]]), 1);
        dict.clear();
        assert!(dict.is_empty());
        assert_eq!(dict.last_word_id(), 0);
        assert_eq!(dict.total_active_references(), 0);
    }
}
