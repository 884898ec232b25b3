//! Rehearsal merges and graph reduction.
//!
//! Rehearsal fires after every STM insert: the new signature is compared to
//! the newest non-intermediate STM entry and, when similar enough, the pair
//! is merged so that revisited places accumulate *weight* instead of
//! duplicate nodes.  Graph reduction is the migration-time analogue: a node
//! that loop-closed onto an older peer collapses into it, its links
//! redirected.

use tracing::{debug, error, info, warn};

use rovermap_core::{Link, LinkKind};

use crate::memory::Memory;
use crate::stats::Statistics;

impl Memory {
    /// Compare a freshly inserted signature against the newest
    /// non-intermediate STM entry and merge (or bump weights) when they are
    /// similar enough.
    pub(crate) fn rehearsal(&mut self, id: i32, stats: Option<&mut Statistics>) {
        let record = |stats: Option<&mut Statistics>, merged: i32, sim: f32, with: i32| {
            if let Some(stats) = stats {
                stats.add("rehearsal/merged", merged as f32);
                stats.add("rehearsal/sim", sim);
                stats.add("rehearsal/id", with as f32);
            }
        };

        let Some(signature) = self.signatures.get(&id) else {
            return;
        };
        if signature.links().len() != 1 || signature.is_bad_signature() {
            record(stats, 0, 0.0, 0);
            return;
        }

        // The newest non-intermediate STM entry other than the new one.
        let candidate = self
            .stm
            .iter()
            .rev()
            .find(|&&other| other != id && self.signatures[&other].weight() >= 0)
            .copied();
        let Some(old_id) = candidate else {
            record(stats, 0, 0.0, 0);
            return;
        };

        let sim = self.signatures[&id].compare_to(&self.signatures[&old_id]);
        debug!(id, old_id, sim, "rehearsal comparison");

        let mut merged = 0;
        if sim >= self.config.rehearsal_similarity {
            if self.config.incremental_memory {
                if self.rehearsal_merge(old_id, id) {
                    merged = old_id;
                }
            } else {
                // Localization mode: only the weight moves.
                let old_weight = self.signatures[&old_id].weight();
                let signature = self.signatures.get_mut(&id).expect("checked");
                signature.set_weight(signature.weight() + 1 + old_weight);
            }
        }
        let compared_to = if sim >= self.config.rehearsal_similarity {
            old_id
        } else {
            0
        };
        record(stats, merged, sim, compared_to);
    }

    /// Merge two rehearsal candidates.
    ///
    /// In metric mode (the new node's link carries a transform) the pair
    /// fully merges only when the robot is not moving and the nodes are
    /// directly linked; without a direct link the loser is instead demoted
    /// to an intermediate node.  In non-metric mode a full merge requires
    /// the mutual link itself to be transform-less.
    ///
    /// Returns true on a full merge (one node was trashed).
    pub fn rehearsal_merge(&mut self, old_id: i32, new_id: i32) -> bool {
        if old_id == new_id {
            return false;
        }
        if !self.config.incremental_memory
            || !self.signatures.contains_key(&old_id)
            || !self.signatures.contains_key(&new_id)
        {
            for end in [old_id, new_id] {
                if !self.signatures.contains_key(&end) {
                    error!(id = end, "signature not found in working/st memories");
                }
            }
            return false;
        }
        if let Some(link) = self.signatures[&old_id].links().get(&new_id)
            && !link.kind.is_neighbor()
        {
            warn!(old_id, new_id, "already merged");
            return false;
        }
        assert!(
            !self.signatures[&new_id].is_saved(),
            "rehearsal merges only unsaved signatures"
        );
        info!(old_id, new_id, "rehearsal merging");

        let mutual = self.signatures[&new_id].has_link(old_id);
        let first_link_transform = self.signatures[&new_id]
            .links()
            .values()
            .next()
            .and_then(|l| l.transform);

        let (full_merge, intermediate_merge) = match first_link_transform {
            Some(motion) => {
                let (x, y, z, roll, pitch, yaw) = motion.to_xyz_rpy();
                let lin = self.config.linear_update;
                let ang = self.config.angular_update;
                let moving = x.abs() > lin
                    || y.abs() > lin
                    || z.abs() > lin
                    || roll.abs() > ang
                    || pitch.abs() > ang
                    || yaw.abs() > ang;
                if moving && self.config.rehearsal_weight_ignored_while_moving {
                    info!(
                        old_id,
                        new_id, "rehearsal ignored, the robot moved past the update thresholds"
                    );
                    return false;
                }
                (!moving && mutual, !moving && !mutual)
            }
            None => {
                // Non-metric mapping: merge only through a transform-less
                // mutual link.
                let mutual_null = self.signatures[&new_id]
                    .links()
                    .get(&old_id)
                    .is_some_and(|l| l.transform.is_none());
                (mutual_null, false)
            }
        };

        if full_merge {
            let new_to_old = self.signatures[&new_id].links()[&old_id].clone();
            self.signatures
                .get_mut(&old_id)
                .expect("checked")
                .remove_link(new_id);
            self.signatures
                .get_mut(&new_id)
                .expect("checked")
                .remove_link(old_id);

            let victim = if self.config.rehearsal_id_updated_to_new_one {
                // The new node survives: redirect every link of the old one
                // onto it, composing through the mutual transform.
                let old_links = self.signatures[&old_id].links().clone();
                for link in old_links.values() {
                    let merged = new_to_old.merge(link, link.kind);
                    if let Some(peer) = self.signatures.get_mut(&link.to) {
                        peer.remove_link(old_id);
                        peer.add_link(merged.inverse());
                        self.signatures
                            .get_mut(&new_id)
                            .expect("checked")
                            .add_link(merged);
                    } else {
                        error!(peer = link.to, old_id, "merge peer not resident");
                    }
                }
                let old_label = {
                    let old = self.signatures.get_mut(&old_id).expect("checked");
                    let label = old.label().to_string();
                    old.set_label("");
                    old.remove_links();
                    old.add_link(Link::new(old_id, new_id, LinkKind::GlobalClosure, None));
                    label
                };
                let old_payload = self.signatures[&old_id].payload().clone();
                let old_weight = self.signatures[&old_id].weight();
                let new = self.signatures.get_mut(&new_id).expect("checked");
                new.set_label(old_label);
                new.set_payload(old_payload);
                new.set_weight(new.weight() + 1 + old_weight);
                if self.last_global_loop_closure_id == old_id {
                    self.last_global_loop_closure_id = new_id;
                }
                old_id
            } else {
                // The old node survives; the new one keeps only a forwarding
                // closure back to it.
                self.signatures
                    .get_mut(&new_id)
                    .expect("checked")
                    .add_link(Link::new(new_id, old_id, LinkKind::GlobalClosure, None));
                let new_weight = self.signatures[&new_id].weight();
                let old = self.signatures.get_mut(&old_id).expect("checked");
                old.set_weight(new_weight + 1 + old.weight());
                if self.last_signature_id == new_id {
                    self.last_signature_id = old_id;
                }
                new_id
            };

            self.move_to_trash(victim, self.config.not_linked_nodes_kept, None);
            true
        } else {
            // Weights only; an intermediate merge demotes the loser.
            if self.config.rehearsal_id_updated_to_new_one {
                let old_weight = self.signatures[&old_id].weight().max(0);
                let new = self.signatures.get_mut(&new_id).expect("checked");
                new.set_weight(old_weight + new.weight() + 1);
                self.signatures
                    .get_mut(&old_id)
                    .expect("checked")
                    .set_weight(if intermediate_merge { -1 } else { 0 });
                if self.last_global_loop_closure_id == old_id {
                    self.last_global_loop_closure_id = new_id;
                }
            } else {
                let new_weight = self.signatures[&new_id].weight().max(0);
                let old = self.signatures.get_mut(&old_id).expect("checked");
                old.set_weight(new_weight + old.weight() + 1);
                self.signatures
                    .get_mut(&new_id)
                    .expect("checked")
                    .set_weight(if intermediate_merge { -1 } else { 0 });
            }
            false
        }
    }

    /// Collapse a migrating STM head into a lower-id peer it loop-closed
    /// with.  Returns the reduction target, or `None` when the node does not
    /// qualify (no eligible link, carries a label, or holds link user data).
    pub(crate) fn reduce_into_peer(&mut self, id: i32) -> Option<i32> {
        let (target, neighbors, links_snapshot) = {
            let signature = &self.signatures[&id];
            if !signature.label().is_empty() {
                return None;
            }
            let mut target = None;
            let mut neighbors = Vec::new();
            for link in signature.links().values() {
                if target.is_none()
                    && link.to < id
                    && link.kind.reduces()
                    && link.user_data.is_empty()
                {
                    target = Some(link.to);
                }
                if link.kind == LinkKind::Neighbor {
                    neighbors.push(link.clone());
                }
            }
            (target?, neighbors, signature.links().clone())
        };
        debug!(id, target, "graph reduction");

        for (peer, link) in &links_snapshot {
            if let Some(peer_signature) = self.signatures.get_mut(peer) {
                peer_signature.remove_link(id);
            }
            if link.kind.is_neighbor() || link.kind == LinkKind::Undef {
                continue;
            }
            // Bridge the reduced node: its closure peer takes over its
            // neighbour chain with composed transforms.
            for neighbor_link in &neighbors {
                let other = neighbor_link.to;
                if *peer == other
                    || self.signatures.get(peer).is_none_or(|s| s.has_link(other))
                {
                    continue;
                }
                let merged_kind =
                    if link.user_data.is_empty() && link.kind != LinkKind::VirtualClosure {
                        LinkKind::NeighborMerged
                    } else {
                        link.kind
                    };
                let merged = link.inverse().merge(neighbor_link, merged_kind);
                self.signatures
                    .get_mut(peer)
                    .expect("closure peer resident")
                    .add_link(merged.clone());
                self.signatures
                    .get_mut(&other)
                    .expect("neighbour peer resident")
                    .add_link(merged.inverse());
            }
        }

        // The reduced node keeps only its closure links; the neighbour chain
        // now bypasses it.
        for (peer, link) in &links_snapshot {
            if link.kind.is_neighbor() {
                self.signatures
                    .get_mut(&id)
                    .expect("reduced node resident")
                    .remove_link(*peer);
                if link.kind == LinkKind::Neighbor && self.last_global_loop_closure_id == id {
                    self.last_global_loop_closure_id = *peer;
                }
            }
        }

        self.move_to_trash(id, self.config.not_linked_nodes_kept, None);
        Some(target)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_memory, observation, translate};
    use rovermap_core::Transform;

    // ── full merge, survivor = older (default) ──────────────────────────────

    #[test]
    fn identical_observations_fully_merge_into_older() {
        let mut memory = make_memory(|c| c.rehearsal_similarity = 0.5);
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();

        assert!(memory.signature(1).is_some());
        assert!(memory.signature(2).is_none(), "victim trashed");
        assert_eq!(memory.signature(1).unwrap().weight(), 1);
        assert_eq!(memory.last_working_signature().unwrap().id(), 1);
    }

    #[test]
    fn three_identical_observations_accumulate_weight_two() {
        let mut memory = make_memory(|c| c.rehearsal_similarity = 0.5);
        for _ in 0..3 {
            memory
                .update(observation(9), Some(Transform::identity()), None, None)
                .unwrap();
        }
        assert_eq!(memory.signature(1).unwrap().weight(), 2);
        assert_eq!(memory.all_signature_ids().len(), 1);
    }

    #[test]
    fn merge_reports_statistics() {
        let mut memory = make_memory(|c| c.rehearsal_similarity = 0.5);
        let mut stats = Statistics::new();
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();
        memory
            .update(
                observation(9),
                Some(Transform::identity()),
                None,
                Some(&mut stats),
            )
            .unwrap();
        assert_eq!(stats.value("rehearsal/merged"), Some(1.0));
        assert!(stats.value("rehearsal/sim").unwrap() > 0.99);
    }

    // ── survivor = newer ────────────────────────────────────────────────────

    #[test]
    fn id_updated_to_new_one_keeps_newer_node() {
        let mut memory = make_memory(|c| {
            c.rehearsal_similarity = 0.5;
            c.rehearsal_id_updated_to_new_one = true;
        });
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();

        assert!(memory.signature(1).is_none(), "older node trashed");
        let survivor = memory.signature(2).unwrap();
        assert_eq!(survivor.weight(), 1);
        assert_eq!(survivor.label(), "map0", "label transferred from victim");
    }

    // ── dissimilar / threshold boundaries ───────────────────────────────────

    #[test]
    fn dissimilar_observations_do_not_merge() {
        let mut memory = make_memory(|c| c.rehearsal_similarity = 0.5);
        memory
            .update(observation(1), Some(Transform::identity()), None, None)
            .unwrap();
        memory
            .update(observation(2), Some(Transform::identity()), None, None)
            .unwrap();
        assert_eq!(memory.all_signature_ids().len(), 2);
        assert_eq!(memory.signature(2).unwrap().weight(), 0);
    }

    #[test]
    fn threshold_one_disables_rehearsal() {
        let mut memory = make_memory(|c| c.rehearsal_similarity = 1.0);
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();
        assert_eq!(memory.all_signature_ids().len(), 2, "never merges");
    }

    // ── motion gating ───────────────────────────────────────────────────────

    #[test]
    fn moving_with_weight_ignored_skips_merge() {
        let mut memory = make_memory(|c| {
            c.rehearsal_similarity = 0.5;
            c.linear_update = 0.05;
            c.rehearsal_weight_ignored_while_moving = true;
        });
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();
        // 0.2 m forward: above the 0.05 m linear threshold.
        memory
            .update(observation(9), Some(translate(0.2)), None, None)
            .unwrap();
        assert_eq!(memory.all_signature_ids().len(), 2);
        assert_eq!(memory.signature(2).unwrap().weight(), 0);
    }

    // ── intermediate merge ──────────────────────────────────────────────────

    #[test]
    fn similar_but_unlinked_pair_demotes_to_intermediate() {
        let mut memory = make_memory(|c| c.rehearsal_similarity = 0.5);
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();
        // A featureless intermediate node separates the two similar ones.
        let mut gap = observation(50);
        gap.image = rovermap_core::Image::empty();
        memory
            .update(gap, Some(Transform::identity()), None, None)
            .unwrap();
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();

        // No direct link 1↔3, so both stay, the newer demoted.
        assert_eq!(memory.signature(1).unwrap().weight(), 1);
        assert_eq!(memory.signature(3).unwrap().weight(), -1);
    }

    // ── non-metric mode ─────────────────────────────────────────────────────

    #[test]
    fn non_metric_full_merge_requires_null_mutual_link() {
        let mut memory = make_memory(|c| c.rehearsal_similarity = 0.5);
        memory.update(observation(9), None, None, None).unwrap();
        memory.update(observation(9), None, None, None).unwrap();

        assert!(memory.signature(2).is_none(), "merged through null link");
        assert_eq!(memory.signature(1).unwrap().weight(), 1);
    }

    // ── merging with itself ─────────────────────────────────────────────────

    #[test]
    fn self_merge_has_no_effect() {
        let mut memory = make_memory(|_| {});
        memory
            .update(observation(1), Some(Transform::identity()), None, None)
            .unwrap();
        assert!(!memory.rehearsal_merge(1, 1));
        assert_eq!(memory.signature(1).unwrap().weight(), 0);
    }

    // ── localization mode ───────────────────────────────────────────────────

    #[test]
    fn localization_mode_bumps_weight_without_merging() {
        let mut memory = make_memory(|c| {
            c.rehearsal_similarity = 0.5;
            c.incremental_memory = false;
        });
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();
        memory
            .update(observation(9), Some(Transform::identity()), None, None)
            .unwrap();

        assert_eq!(memory.all_signature_ids().len(), 2, "nothing trashed");
        assert_eq!(memory.signature(2).unwrap().weight(), 1);
        assert_eq!(memory.signature(1).unwrap().weight(), 0);
    }

    // ── graph reduction ─────────────────────────────────────────────────────

    #[test]
    fn migrating_node_collapses_into_closure_peer() {
        let mut memory = make_memory(|c| {
            c.stm_size = 1;
            c.reduce_graph = true;
            c.map_labels_added = false;
        });
        // Chain 1–2–3; 1 and 2 migrate to WM as the chain grows.
        for i in 0..3 {
            memory
                .update(observation(i), Some(translate(i as f32)), None, None)
                .unwrap();
        }
        // 3 loop-closes onto 1.
        assert!(memory.add_link(Link::new(
            3,
            1,
            LinkKind::GlobalClosure,
            Some(translate(-2.0))
        )));
        // Inserting 4 migrates 3, which now collapses into 1.
        let mut stats = Statistics::new();
        memory
            .update(observation(3), Some(translate(3.0)), None, Some(&mut stats))
            .unwrap();

        assert!(memory.signature(3).is_none(), "3 reduced away");
        assert_eq!(stats.reduced_ids().get(&3), Some(&1));

        // 4's neighbour chain was rewired onto 1 with the composed
        // transform: closure⁻¹ (1→3 = +2) then neighbour (3→4 = +1).
        let rewired = &memory.signature(4).unwrap().links()[&1];
        assert_eq!(rewired.kind, LinkKind::NeighborMerged);
        let t = rewired.inverse().transform.unwrap();
        assert!((t.translation.x - 3.0).abs() < 1e-4, "{t:?}");
        // And 2's side as well, composed through the closure.
        assert!(memory.signature(2).unwrap().has_link(1) || memory.signature(1).unwrap().has_link(2));
    }

    #[test]
    fn labelled_node_is_never_reduced() {
        let mut memory = make_memory(|c| {
            c.stm_size = 1;
            c.reduce_graph = true;
            c.map_labels_added = false;
        });
        for i in 0..3 {
            memory
                .update(observation(i), Some(translate(i as f32)), None, None)
                .unwrap();
        }
        memory.add_link(Link::new(3, 1, LinkKind::GlobalClosure, Some(translate(-2.0))));
        assert!(memory.label_signature(3, "keep-me"));

        memory
            .update(observation(3), Some(translate(3.0)), None, None)
            .unwrap();
        assert!(memory.signature(3).is_some(), "labelled node migrated intact");
        assert!(memory.is_in_wm(3));
    }
}
