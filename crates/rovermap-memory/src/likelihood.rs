//! Likelihood of a signature against WM candidates.
//!
//! Two formulas, selected by configuration:
//!
//! - **raw similarity** – cosine over the word-count vectors of the query
//!   and each resident candidate;
//! - **TF-IDF** – for each query word `w` with `nw` referencing locations
//!   out of `N` resident signatures, every candidate `c` cited `nwi` times
//!   gains `(nwi * log10(N / nw)) / ni(c)`, where `ni(c)` is the
//!   candidate's total word count (fetched from LTM when not resident).
//!
//! Candidates are assumed older than the query.

use std::collections::BTreeMap;

use tracing::{error, warn};

use crate::memory::Memory;

impl Memory {
    /// Score `ids` against the resident signature `signature_id`.
    /// Returns an empty map when the query is unknown or `ids` is empty.
    pub fn compute_likelihood(&self, signature_id: i32, ids: &[i32]) -> BTreeMap<i32, f32> {
        let mut likelihood = BTreeMap::new();
        let Some(query) = self.signatures.get(&signature_id) else {
            error!(signature_id, "likelihood query is not resident");
            return likelihood;
        };
        if ids.is_empty() {
            warn!("likelihood candidate list is empty");
            return likelihood;
        }

        if !self.config.kp_tfidf_likelihood_used {
            for &id in ids {
                let score = if id > 0 {
                    match self.signatures.get(&id) {
                        Some(candidate) => query.compare_to(candidate),
                        None => {
                            warn!(id, "candidate not resident, scoring 0");
                            0.0
                        }
                    }
                } else {
                    0.0
                };
                likelihood.insert(id, score);
            }
            return likelihood;
        }

        for &id in ids {
            likelihood.insert(id, 0.0);
        }
        let total = self.signatures.len() as f32;
        if total == 0.0 {
            return likelihood;
        }

        for word_id in query.unique_word_ids() {
            let Some(word) = self.vwd.word(word_id) else {
                continue;
            };
            let nw = word.references().len() as f32;
            if nw == 0.0 {
                continue;
            }
            let log_n_nw = (total / nw).log10();
            if log_n_nw == 0.0 {
                continue;
            }
            for (&candidate, &nwi) in word.references() {
                let Some(score) = likelihood.get_mut(&candidate) else {
                    continue;
                };
                let ni = self.ni(candidate);
                if ni != 0 {
                    *score += (nwi as f32 * log_n_nw) / ni as f32;
                }
            }
        }
        likelihood
    }

    /// Total word citations of a node, faulting the count in from LTM when
    /// the node is not resident.
    fn ni(&self, id: i32) -> usize {
        if let Some(signature) = self.signatures.get(&id) {
            return signature.word_count();
        }
        if let Some(storage) = &self.storage {
            match storage.node_words(id) {
                Ok(words) => return words.len(),
                Err(e) => warn!(id, "word-count load failed: {e}"),
            }
        }
        0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
