//! Link-graph operations and neighbourhood walks.
//!
//! Every mutation preserves the bidirectional invariant: a link installed on
//! `from` has its inverse installed on `to`, and removals strip both sides.
//! Queries fall back to LTM when asked to (`look_in_db`).

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, warn};

use rovermap_core::{Link, LinkInfo, LinkKind, Transform};

use crate::memory::Memory;

impl Memory {
    // ── mutations ───────────────────────────────────────────────────────────

    /// Install a loop-closure link (both sides).  Returns false when either
    /// endpoint is not resident.  Idempotent when the two nodes are already
    /// linked.
    ///
    /// In incremental mode a non-virtual closure marks the graph changed,
    /// updates the last-global-loop-closure id and transfers the younger
    /// node's weight onto the older one (which is also the survivor when
    /// graph reduction later collapses the pair).
    pub fn add_link(&mut self, link: Link) -> bool {
        assert!(
            link.kind != LinkKind::Neighbor && link.kind != LinkKind::Undef,
            "add_link takes closure links, got {:?}",
            link.kind
        );
        info!(from = link.from, to = link.to, kind = ?link.kind, "adding link");

        if !self.signatures.contains_key(&link.from) || !self.signatures.contains_key(&link.to) {
            for end in [link.from, link.to] {
                if !self.signatures.contains_key(&end) {
                    error!(id = end, "link endpoint not found in working/st memories");
                }
            }
            return false;
        }
        if self.signatures[&link.to].has_link(link.from) {
            info!(from = link.from, to = link.to, "already linked");
            return true;
        }

        let (from, to, kind) = (link.from, link.to, link.kind);
        let inverse = link.inverse();
        self.signatures.get_mut(&to).expect("checked").add_link(inverse);
        self.signatures.get_mut(&from).expect("checked").add_link(link.clone());

        if self.config.incremental_memory && kind != LinkKind::VirtualClosure {
            self.links_changed = true;

            // Scan-matching closures carrying user data do not update
            // weights or the recency marker.
            if kind != LinkKind::LocalSpaceClosure || link.user_data.is_empty() {
                self.last_global_loop_closure_id = from.max(to);

                let from_weight = self.signatures[&from].weight();
                let to_weight = self.signatures[&to].weight();
                assert!(
                    from_weight >= 0 && to_weight >= 0,
                    "loop closures never involve intermediate nodes"
                );
                // The older node aggregates the pair's weight; the younger
                // one is the donor (and, under reduction, the collapse
                // victim).
                let (older, newer) = (from.min(to), from.max(to));
                self.signatures
                    .get_mut(&older)
                    .expect("checked")
                    .set_weight(from_weight + to_weight);
                self.signatures.get_mut(&newer).expect("checked").set_weight(0);
            }
        }
        true
    }

    /// Remove the mutual link between two nodes.  A removed `GlobalClosure`
    /// returns one unit of weight from the newer node to the older one.
    pub fn remove_link(&mut self, a: i32, b: i32) {
        let (old_id, new_id) = (a.min(b), a.max(b));
        if !self.signatures.contains_key(&old_id) || !self.signatures.contains_key(&new_id) {
            error!(a, b, "cannot remove link, node not resident");
            return;
        }
        if !self.signatures[&old_id].has_link(new_id) || !self.signatures[&new_id].has_link(old_id)
        {
            error!(a, b, "nodes do not have a bidirectional link");
            return;
        }
        info!(old_id, new_id, "removing link");

        let kind = self.signatures[&old_id].links()[&new_id].kind;
        if kind == LinkKind::GlobalClosure && self.signatures[&new_id].weight() > 0 {
            let old_weight = self.signatures[&old_id].weight();
            let new_weight = self.signatures[&new_id].weight();
            self.signatures.get_mut(&old_id).expect("checked").set_weight(old_weight + 1);
            self.signatures.get_mut(&new_id).expect("checked").set_weight((new_weight - 1).max(0));
        }

        self.signatures.get_mut(&old_id).expect("checked").remove_link(new_id);
        self.signatures.get_mut(&new_id).expect("checked").remove_link(old_id);

        if kind != LinkKind::VirtualClosure {
            self.links_changed = true;
        }

        // Drop the recency marker when the newer node has no child closures
        // left.
        if new_id == self.last_global_loop_closure_id {
            let no_children = self.signatures[&new_id]
                .links()
                .iter()
                .all(|(&peer, l)| l.kind.is_neighbor() || peer >= new_id);
            if no_children {
                self.last_global_loop_closure_id = 0;
            }
        }
    }

    /// Replace the transform/information of an existing mutual link,
    /// preserving its kind.
    pub fn update_link(&mut self, a: i32, b: i32, transform: Option<Transform>, info: LinkInfo) {
        let both_linked = self
            .signatures
            .get(&a)
            .is_some_and(|s| s.has_link(b))
            && self.signatures.get(&b).is_some_and(|s| s.has_link(a));
        if !both_linked {
            error!(a, b, "cannot update link, nodes are not linked");
            return;
        }
        let kind = self.signatures[&a].links()[&b].kind;
        let link = Link::new(a, b, kind, transform).with_info(info);
        let inverse = link.inverse();
        {
            let s = self.signatures.get_mut(&a).expect("checked");
            s.remove_link(b);
            s.add_link(link);
        }
        {
            let s = self.signatures.get_mut(&b).expect("checked");
            s.remove_link(a);
            s.add_link(inverse);
        }
        if kind != LinkKind::VirtualClosure {
            self.links_changed = true;
        }
    }

    /// Strip every virtual link touching `id` (both sides).
    pub fn remove_virtual_links(&mut self, id: i32) {
        let Some(signature) = self.signatures.get_mut(&id) else {
            error!(id, "signature not resident");
            return;
        };
        let peers = signature.remove_virtual_links();
        for peer in peers {
            if let Some(peer_signature) = self.signatures.get_mut(&peer) {
                peer_signature.remove_link(id);
            } else {
                error!(peer, id, "virtual-link peer not resident");
            }
        }
    }

    /// Strip every virtual link in memory.
    pub fn remove_all_virtual_links(&mut self) {
        debug!("removing all virtual links");
        let ids: Vec<i32> = self.signatures.keys().copied().collect();
        for id in ids {
            if let Some(signature) = self.signatures.get_mut(&id) {
                signature.remove_virtual_links();
            }
        }
    }

    // ── queries ─────────────────────────────────────────────────────────────

    /// Neighbour-chain links of a node; falls back to LTM when not resident.
    pub fn neighbor_links(&self, id: i32, look_in_db: bool) -> BTreeMap<i32, Link> {
        match self.signatures.get(&id) {
            Some(signature) => signature
                .links()
                .iter()
                .filter(|(_, l)| l.kind.is_neighbor())
                .map(|(&peer, l)| (peer, l.clone()))
                .collect(),
            None if look_in_db => match self.load_links_from_db(id) {
                Some(mut links) => {
                    links.retain(|_, l| l.kind.is_neighbor());
                    links
                }
                None => BTreeMap::new(),
            },
            None => {
                warn!(id, "cannot find signature in memory");
                BTreeMap::new()
            }
        }
    }

    /// Loop-closure links of a node (everything that is neither a neighbour
    /// nor unset).
    pub fn loop_closure_links(&self, id: i32, look_in_db: bool) -> BTreeMap<i32, Link> {
        match self.signatures.get(&id) {
            Some(signature) => signature
                .links()
                .iter()
                .filter(|(_, l)| l.kind.is_closure())
                .map(|(&peer, l)| (peer, l.clone()))
                .collect(),
            None if look_in_db => match self.load_links_from_db(id) {
                Some(mut links) => {
                    links.retain(|_, l| l.kind.is_closure());
                    links
                }
                None => BTreeMap::new(),
            },
            None => BTreeMap::new(),
        }
    }

    /// Every link of a node.
    pub fn links_of(&self, id: i32, look_in_db: bool) -> BTreeMap<i32, Link> {
        match self.signatures.get(&id) {
            Some(signature) => signature.links().clone(),
            None if look_in_db => self.load_links_from_db(id).unwrap_or_default(),
            None => {
                warn!(id, "cannot find signature in memory");
                BTreeMap::new()
            }
        }
    }

    fn load_links_from_db(&self, id: i32) -> Option<BTreeMap<i32, Link>> {
        let storage = self.storage.as_ref()?;
        match storage.load_links(id, None) {
            Ok(links) => Some(links),
            Err(e) => {
                warn!(id, "link load failed: {e}");
                None
            }
        }
    }

    /// Every link in the graph as `(from, link)` pairs; resident nodes
    /// override their LTM copies.
    pub fn all_links(&self, look_in_db: bool, ignore_null: bool) -> Vec<(i32, Link)> {
        let mut links: Vec<(i32, Link)> = Vec::new();
        if look_in_db && let Some(storage) = &self.storage {
            match storage.all_links(ignore_null) {
                Ok(stored) => {
                    links = stored
                        .into_iter()
                        .filter(|(from, _)| !self.signatures.contains_key(from))
                        .collect()
                }
                Err(e) => warn!("all-links load failed: {e}"),
            }
        }
        let mut resident: Vec<i32> = self.signatures.keys().copied().collect();
        resident.sort_unstable();
        for id in resident {
            for link in self.signatures[&id].links().values() {
                if !ignore_null || link.is_valid() {
                    links.push((id, link.clone()));
                }
            }
        }
        links
    }

    /// The odometry pose of a node, faulting in from LTM when requested.
    pub fn odom_pose(&self, id: i32, look_in_db: bool) -> Option<Transform> {
        if let Some(signature) = self.signatures.get(&id) {
            return signature.pose().copied();
        }
        if look_in_db && let Some(storage) = &self.storage {
            match storage.node_info(id) {
                Ok(info) => return info.and_then(|i| i.pose),
                Err(e) => warn!(id, "node info load failed: {e}"),
            }
        }
        None
    }

    // ── neighbourhood walks ─────────────────────────────────────────────────

    /// Breadth-first walk by link margin from `id`, returning node → margin.
    ///
    /// - `max_depth` 0 means unbounded;
    /// - `max_checked_in_db` bounds LTM faults (-1 unbounded, 0 disables);
    /// - loop closures either extend the frontier (`increment_margin_on_loop`)
    ///   or join the current margin;
    /// - `ignore_intermediate` walks through weight -1 nodes without
    ///   reporting them.
    pub fn neighbors_by_depth(
        &self,
        id: i32,
        max_depth: usize,
        max_checked_in_db: i32,
        increment_margin_on_loop: bool,
        ignore_loop_ids: bool,
        ignore_intermediate: bool,
    ) -> BTreeMap<i32, usize> {
        let mut margins: BTreeMap<i32, usize> = BTreeMap::new();
        if id <= 0 {
            return margins;
        }
        let mut loaded_from_db = 0;
        let mut ignored: BTreeSet<i32> = BTreeSet::new();
        let mut next_margin: BTreeSet<i32> = BTreeSet::from([id]);
        let mut margin = 0usize;

        while (max_depth == 0 || margin < max_depth) && !next_margin.is_empty() {
            // More recent ids first: they get database-fault priority.
            let mut current: Vec<i32> = next_margin.iter().rev().copied().collect();
            next_margin.clear();
            let mut current_set: BTreeSet<i32> = BTreeSet::new();

            let mut index = 0;
            while index < current.len() {
                let node = current[index];
                index += 1;
                if margins.contains_key(&node) || ignored.contains(&node) {
                    continue;
                }

                let mut node_is_intermediate = false;
                let links: BTreeMap<i32, Link> = if let Some(signature) = self.signatures.get(&node)
                {
                    node_is_intermediate = signature.weight() == -1;
                    if ignore_intermediate && node_is_intermediate {
                        ignored.insert(node);
                    } else {
                        margins.insert(node, margin);
                    }
                    signature.links().clone()
                } else if max_checked_in_db == -1
                    || (max_checked_in_db > 0 && loaded_from_db < max_checked_in_db)
                {
                    loaded_from_db += 1;
                    margins.insert(node, margin);
                    self.load_links_from_db(node).unwrap_or_default()
                } else {
                    continue;
                };

                for (peer, link) in &links {
                    if margins.contains_key(peer) || ignored.contains(peer) {
                        continue;
                    }
                    if link.kind.is_neighbor() {
                        if ignore_intermediate && node_is_intermediate {
                            // Stay on the same margin while walking through
                            // an intermediate chain.
                            if current_set.insert(*peer) {
                                current.push(*peer);
                            }
                        } else {
                            next_margin.insert(*peer);
                        }
                    } else if !ignore_loop_ids {
                        if increment_margin_on_loop {
                            next_margin.insert(*peer);
                        } else if current_set.insert(*peer) {
                            current.push(*peer);
                        }
                    }
                }
            }
            margin += 1;
        }
        margins
    }

    /// Breadth-first walk bounded by metric distance over optimized poses,
    /// returning node → squared distance from `id`.
    pub fn neighbors_by_radius(
        &self,
        id: i32,
        radius: f32,
        optimized_poses: &BTreeMap<i32, Transform>,
        max_depth: usize,
    ) -> BTreeMap<i32, f32> {
        assert!(id > 0, "radius walks start from a real node");
        let Some(referential) = optimized_poses.get(&id) else {
            warn!(id, "no optimized pose for radius query");
            return BTreeMap::new();
        };
        let radius_squared = radius * radius;
        let mut distances: BTreeMap<i32, f32> = BTreeMap::new();
        let mut saved: BTreeMap<i32, f32> = BTreeMap::from([(id, 0.0)]);
        let mut next_margin: BTreeSet<i32> = BTreeSet::from([id]);
        let mut margin = 0usize;

        while (max_depth == 0 || margin < max_depth) && !next_margin.is_empty() {
            let current: Vec<i32> = next_margin.iter().copied().collect();
            next_margin.clear();
            for node in current {
                if distances.contains_key(&node) {
                    continue;
                }
                let Some(signature) = self.signatures.get(&node) else {
                    continue;
                };
                distances.insert(node, saved[&node]);
                for (peer, link) in signature.links() {
                    if distances.contains_key(peer)
                        || link.kind == LinkKind::VirtualClosure
                        || !optimized_poses.contains_key(peer)
                    {
                        continue;
                    }
                    let distance = referential.distance_squared(&optimized_poses[peer]);
                    if radius_squared == 0.0 || distance < radius_squared {
                        saved.insert(*peer, distance);
                        next_margin.insert(*peer);
                    }
                }
            }
            margin += 1;
        }
        distances
    }

    // ── constraint extraction ───────────────────────────────────────────────

    /// Poses and unique links for graph optimization over `ids`.
    ///
    /// Neighbour chains passing through intermediate nodes are collapsed into
    /// single merged constraints, and the intermediates' poses are dropped.
    pub fn metric_constraints(
        &self,
        ids: &BTreeSet<i32>,
        look_in_db: bool,
    ) -> (BTreeMap<i32, Transform>, Vec<Link>) {
        let mut poses: BTreeMap<i32, Transform> = BTreeMap::new();
        for &id in ids {
            if let Some(pose) = self.odom_pose(id, look_in_db) {
                poses.insert(id, pose);
            }
        }

        let mut links: Vec<Link> = Vec::new();
        for &id in ids {
            if !poses.contains_key(&id) {
                continue;
            }
            for (peer, link) in self.links_of(id, look_in_db) {
                if !link.is_valid()
                    || !poses.contains_key(&peer)
                    || links
                        .iter()
                        .any(|l| (l.from == id && l.to == peer) || (l.from == peer && l.to == id))
                {
                    continue;
                }
                if !look_in_db && link.kind.is_neighbor() {
                    // Chain through intermediate nodes so optimization sees
                    // one constraint per real segment.
                    let mut merged = link.clone();
                    let mut cursor = peer;
                    while let Some(signature) = self.signatures.get(&cursor) {
                        if signature.weight() != -1 {
                            break;
                        }
                        let onward = self
                            .neighbor_links(cursor, false)
                            .into_iter()
                            .find(|(next, _)| *next > cursor);
                        match onward {
                            Some((next, onward_link)) => {
                                merged = merged.merge(&onward_link, onward_link.kind);
                                poses.remove(&cursor);
                                cursor = next;
                            }
                            None => break,
                        }
                    }
                    links.push(merged);
                } else {
                    links.push(link);
                }
            }
        }
        (poses, links)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_memory, observation, translate};

    fn chain(n: u64, stm_size: usize) -> Memory {
        let mut memory = make_memory(|c| {
            c.stm_size = stm_size;
            c.map_labels_added = false;
        });
        for i in 0..n {
            memory
                .update(observation(i), Some(translate(i as f32 * 0.5)), None, None)
                .unwrap();
        }
        memory
    }

    // ── add/remove laws ─────────────────────────────────────────────────────

    #[test]
    fn add_then_remove_restores_graph() {
        let mut memory = chain(4, 10);
        let before_1 = memory.signature(1).unwrap().links().clone();
        let before_4 = memory.signature(4).unwrap().links().clone();

        let link = Link::new(4, 1, LinkKind::VirtualClosure, Some(translate(0.1)));
        assert!(memory.add_link(link));
        memory.remove_link(4, 1);

        assert_eq!(memory.signature(1).unwrap().links(), &before_1);
        assert_eq!(memory.signature(4).unwrap().links(), &before_4);
    }

    #[test]
    fn add_link_is_idempotent() {
        let mut memory = chain(4, 10);
        let link = Link::new(4, 1, LinkKind::GlobalClosure, Some(translate(0.1)));
        assert!(memory.add_link(link.clone()));
        assert!(memory.add_link(link), "second add is a no-op success");
        assert_eq!(memory.signature(4).unwrap().links().len(), 2); // neighbor + closure
    }

    #[test]
    fn add_link_installs_both_sides() {
        let mut memory = chain(4, 10);
        memory.add_link(Link::new(4, 1, LinkKind::GlobalClosure, Some(translate(1.5))));

        let forward = &memory.signature(4).unwrap().links()[&1];
        let backward = &memory.signature(1).unwrap().links()[&4];
        assert_eq!(forward.kind, LinkKind::GlobalClosure);
        assert_eq!(backward.kind, LinkKind::GlobalClosure);
        let t = forward.transform.unwrap();
        let ti = backward.transform.unwrap();
        assert!((t.translation.x + ti.translation.x).abs() < 1e-5);
    }

    #[test]
    fn add_link_missing_endpoint_fails() {
        let mut memory = chain(2, 10);
        assert!(!memory.add_link(Link::new(2, 99, LinkKind::GlobalClosure, None)));
    }

    // ── weight transfer ─────────────────────────────────────────────────────

    #[test]
    fn closure_transfers_weight_to_older_node() {
        let mut memory = chain(4, 10);
        memory.signature_mut(4).unwrap().set_weight(3);
        memory.add_link(Link::new(4, 1, LinkKind::GlobalClosure, Some(translate(0.1))));

        assert_eq!(memory.signature(1).unwrap().weight(), 3);
        assert_eq!(memory.signature(4).unwrap().weight(), 0);
        assert_eq!(memory.last_global_loop_closure_id(), 4);
    }

    #[test]
    fn virtual_closure_does_not_touch_weights() {
        let mut memory = chain(4, 10);
        memory.signature_mut(4).unwrap().set_weight(3);
        memory.add_link(Link::new(4, 1, LinkKind::VirtualClosure, None));

        assert_eq!(memory.signature(4).unwrap().weight(), 3);
        assert_eq!(memory.last_global_loop_closure_id(), 0);
        assert!(!memory.are_links_changed());
    }

    #[test]
    fn removing_global_closure_restores_one_weight_unit() {
        let mut memory = chain(4, 10);
        memory.signature_mut(4).unwrap().set_weight(2);
        memory.add_link(Link::new(4, 1, LinkKind::GlobalClosure, Some(translate(0.1))));
        // Weight moved to node 1; give node 4 some back to observe the
        // adjustment.
        memory.signature_mut(4).unwrap().set_weight(5);

        memory.remove_link(1, 4);
        assert_eq!(memory.signature(1).unwrap().weight(), 3); // 2 + 1
        assert_eq!(memory.signature(4).unwrap().weight(), 4);
        assert_eq!(memory.last_global_loop_closure_id(), 0);
    }

    // ── update_link ─────────────────────────────────────────────────────────

    #[test]
    fn update_link_replaces_transform_keeps_kind() {
        let mut memory = chain(3, 10);
        memory.update_link(1, 2, Some(translate(9.0)), LinkInfo::new(2.0, 2.0));

        let link = &memory.signature(1).unwrap().links()[&2];
        assert_eq!(link.kind, LinkKind::Neighbor);
        assert!((link.transform.unwrap().translation.x - 9.0).abs() < 1e-5);
        let back = &memory.signature(2).unwrap().links()[&1];
        assert!((back.transform.unwrap().translation.x + 9.0).abs() < 1e-5);
    }

    #[test]
    fn update_link_on_unlinked_nodes_is_noop() {
        let mut memory = chain(3, 10);
        memory.update_link(1, 3, Some(translate(1.0)), LinkInfo::default());
        assert!(!memory.signature(1).unwrap().has_link(3));
    }

    // ── virtual links ───────────────────────────────────────────────────────

    #[test]
    fn remove_virtual_links_strips_both_sides() {
        let mut memory = chain(4, 10);
        memory.add_link(Link::new(4, 1, LinkKind::VirtualClosure, None));
        memory.add_link(Link::new(4, 2, LinkKind::GlobalClosure, Some(translate(0.1))));

        memory.remove_virtual_links(4);
        assert!(!memory.signature(1).unwrap().has_link(4));
        assert!(memory.signature(4).unwrap().has_link(2), "real closure kept");
    }

    // ── queries ─────────────────────────────────────────────────────────────

    #[test]
    fn neighbor_and_loop_queries_partition_links() {
        let mut memory = chain(4, 10);
        memory.add_link(Link::new(4, 1, LinkKind::GlobalClosure, Some(translate(0.1))));

        let neighbors = memory.neighbor_links(4, false);
        assert_eq!(neighbors.keys().copied().collect::<Vec<_>>(), vec![3]);

        let loops = memory.loop_closure_links(4, false);
        assert_eq!(loops.keys().copied().collect::<Vec<_>>(), vec![1]);

        assert_eq!(memory.links_of(4, false).len(), 2);
    }

    #[test]
    fn all_links_lists_both_directions() {
        let memory = chain(3, 10);
        let links = memory.all_links(false, false);
        // 1↔2 and 2↔3, stored on both endpoints.
        assert_eq!(links.len(), 4);
    }

    #[test]
    fn all_links_ignores_null_when_asked() {
        let mut memory = chain(2, 10);
        memory.add_link(Link::new(2, 1, LinkKind::VirtualClosure, None));
        let non_null = memory.all_links(false, true);
        assert!(non_null.iter().all(|(_, l)| l.is_valid()));
    }

    // ── neighbourhood walks ─────────────────────────────────────────────────

    #[test]
    fn neighbors_by_depth_walks_margins() {
        let memory = chain(5, 10);
        let margins = memory.neighbors_by_depth(3, 0, 0, false, false, false);
        assert_eq!(margins[&3], 0);
        assert_eq!(margins[&2], 1);
        assert_eq!(margins[&4], 1);
        assert_eq!(margins[&1], 2);
        assert_eq!(margins[&5], 2);
    }

    #[test]
    fn neighbors_by_depth_respects_max_depth() {
        let memory = chain(5, 10);
        let margins = memory.neighbors_by_depth(3, 2, 0, false, false, false);
        assert!(margins.contains_key(&2) && margins.contains_key(&4));
        assert!(!margins.contains_key(&1) && !margins.contains_key(&5));
    }

    #[test]
    fn loop_closures_join_current_margin() {
        let mut memory = chain(5, 10);
        memory.add_link(Link::new(5, 1, LinkKind::GlobalClosure, Some(translate(0.1))));
        let margins = memory.neighbors_by_depth(5, 1, 0, false, false, false);
        // One margin step: neighbor 4 is at margin 1, but closure peer 1
        // joins margin 0's frontier.
        assert_eq!(margins[&1], 0);
        assert!(!margins.contains_key(&3));
    }

    #[test]
    fn intermediate_nodes_are_walked_through() {
        let mut memory = chain(4, 10);
        memory.signature_mut(2).unwrap().set_weight(-1);
        memory.signature_mut(3).unwrap().set_weight(-1);
        let margins = memory.neighbors_by_depth(1, 2, 0, false, false, true);
        assert!(!margins.contains_key(&2));
        assert!(!margins.contains_key(&3));
        // 4 is reachable through the intermediate chain without spending
        // margin on it.
        assert!(margins.contains_key(&4));
    }

    #[test]
    fn neighbors_by_radius_bounds_metric_distance() {
        let memory = chain(5, 10);
        let poses: BTreeMap<i32, Transform> = (1..=5)
            .map(|i| (i, translate((i - 1) as f32 * 0.5)))
            .collect();
        let nearby = memory.neighbors_by_radius(1, 0.8, &poses, 0);
        assert!(nearby.contains_key(&1));
        assert!(nearby.contains_key(&2));
        assert!(!nearby.contains_key(&4), "1.5 m away, outside 0.8 m radius");
    }

    // ── metric constraints ──────────────────────────────────────────────────

    #[test]
    fn metric_constraints_are_unique_per_pair() {
        let mut memory = chain(4, 10);
        memory.add_link(Link::new(4, 1, LinkKind::GlobalClosure, Some(translate(0.1))));
        let ids: BTreeSet<i32> = (1..=4).collect();
        let (poses, links) = memory.metric_constraints(&ids, false);
        assert_eq!(poses.len(), 4);
        // 3 neighbor constraints + 1 closure, each counted once.
        assert_eq!(links.len(), 4);
    }

    #[test]
    fn metric_constraints_chain_through_intermediates() {
        let mut memory = chain(3, 10);
        memory.signature_mut(2).unwrap().set_weight(-1);
        let ids: BTreeSet<i32> = (1..=3).collect();
        let (poses, links) = memory.metric_constraints(&ids, false);

        assert!(!poses.contains_key(&2), "intermediate pose dropped");
        let chained = links
            .iter()
            .find(|l| l.from == 1 && l.to == 3)
            .expect("chained constraint");
        assert!((chained.transform.unwrap().translation.x - 1.0).abs() < 1e-5);
    }
}
