//! WM transfer/forget selection.
//!
//! When the working memory must shrink, members are demoted to LTM in
//! (weight, age, id) order: the least consulted, least recently touched,
//! oldest first.  A set of members is immune: the sentinel, caller-pinned
//! ids, the last loop-closure anchor, anything still linked into STM, and a
//! recency window of nodes newer than the last global loop closure.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::memory::Memory;

/// Transfer priority key: smaller sorts first (removed earlier).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WeightAgeIdKey {
    pub weight: i32,
    pub age: f64,
    pub id: i32,
}

impl Eq for WeightAgeIdKey {}

impl Ord for WeightAgeIdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then(self.age.total_cmp(&other.age))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for WeightAgeIdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Memory {
    /// Pick up to `count` WM members eligible for demotion, in removal
    /// order.
    pub fn removable_signatures(&self, count: usize, ignored: &BTreeSet<i32>) -> Vec<i32> {
        let mut removable = Vec::new();
        if self.wm.is_empty() || count == 0 {
            warn!("not enough signatures to get an old one");
            return removable;
        }

        let recent_wm_max_size =
            (self.config.recent_wm_ratio * self.wm.len() as f32) as i32;
        let anchor = self.last_global_loop_closure_id;

        // How many WM members sit at or above the loop-closure anchor.
        let mut current_recent_wm_size = 0;
        let mut recent_wm_immunized = false;
        if anchor > 0 && !self.stm.contains(&anchor) {
            current_recent_wm_size = self.wm.range(anchor..).count() as i32;
            if current_recent_wm_size > 1 && current_recent_wm_size < recent_wm_max_size {
                recent_wm_immunized = true;
            } else if current_recent_wm_size == 0 && self.wm.len() > 1 {
                warn!(anchor, "last loop closure id not found in WM");
            }
            debug!(
                current_recent_wm_size,
                recent_wm_max_size, recent_wm_immunized, "recent-WM window"
            );
        }

        let mut candidates: BTreeMap<WeightAgeIdKey, i32> = BTreeMap::new();
        for (&id, &age) in &self.wm {
            if id == anchor || (recent_wm_immunized && id > anchor) {
                continue; // recent memory
            }
            if id <= 0 || ignored.contains(&id) {
                continue;
            }
            let Some(signature) = self.signatures.get(&id) else {
                warn!(id, "WM member not resident, skipping");
                continue;
            };
            // Nodes linked into STM stay: rehearsal may still redirect
            // their links.
            if signature.links().keys().any(|peer| self.stm.contains(peer)) {
                debug!(id, "ignored, linked into STM");
                continue;
            }
            candidates.insert(
                WeightAgeIdKey {
                    weight: signature.weight(),
                    age: if self.config.transfer_sorting_by_weight_id {
                        0.0
                    } else {
                        age
                    },
                    id,
                },
                id,
            );
        }

        // Walk candidates in priority order; demoting enough old nodes can
        // re-arm the recency immunity mid-walk.
        let mut recent_wm_count = 0;
        for (key, &id) in &candidates {
            if !recent_wm_immunized {
                debug!(weight = key.weight, id, "removable");
                removable.push(id);
                if anchor > 0 && id > anchor {
                    recent_wm_count += 1;
                    if current_recent_wm_size - recent_wm_count < recent_wm_max_size {
                        debug!("recent-WM window re-immunized");
                        recent_wm_immunized = true;
                    }
                }
            } else if anchor == 0 || id < anchor {
                debug!(weight = key.weight, id, "removable");
                removable.push(id);
            }
            if removable.len() >= count {
                break;
            }
        }
        removable
    }

    /// Demote WM members to LTM.
    ///
    /// With an incremental dictionary, nodes are removed one at a time until
    /// as many words have fallen unused as were added this update; otherwise
    /// at least one more node than was added is removed.  Returns the
    /// demoted ids.
    pub fn forget(&mut self, ignored: &BTreeSet<i32>) -> Vec<i32> {
        let mut removed = Vec::new();
        if self.is_incremental() && self.vwd.is_incremental() && !self.vwd.is_empty() {
            let new_words = self.vwd.not_indexed_count();
            let mut words_freed = 0;
            while words_freed < new_words {
                let candidates = self.removable_signatures(1, ignored);
                let Some(&id) = candidates.first() else {
                    break;
                };
                removed.push(id);
                self.move_to_trash(id, true, None);
                words_freed = self.vwd.unused_count();
            }
            debug!(new_words, words_freed, "forget by dictionary pressure");
        } else {
            let target = (self.signatures_added + 1).max(1) as usize;
            let candidates = self.removable_signatures(target, ignored);
            if candidates.len() < self.signatures_added as usize {
                warn!(
                    transferred = candidates.len(),
                    added = self.signatures_added,
                    "less signatures transferred than added, the working memory cannot shrink"
                );
            }
            for id in candidates {
                removed.push(id);
                self.move_to_trash(id, true, None);
            }
        }
        removed
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
