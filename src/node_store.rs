//! Bounded set of known peers, ranked by reach-weighted distance.
//!
//! There are no k-buckets and no good/bad node flags here. Every query for
//! "who should handle target T" minimizes `distance(node, T) / reach(node)`,
//! so a strong node with a little extra distance beats a weak node sitting
//! right next to the target. Nodes that time out keep their slot but drop
//! to reach 0, where they are only ever used as seeding fallback.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddrV4;

use tracing::debug;

use crate::common::{Id, Node};
use crate::config::Config;

/// Bounded set of at most `capacity` known peers keyed by id.
#[derive(Debug)]
pub struct NodeStore {
    id: Id,
    capacity: usize,
    max_timeouts: u32,
    reach_decrease_per_second: u32,
    nodes: HashMap<Id, Node>,
}

impl NodeStore {
    pub fn new(id: Id, config: &Config) -> Self {
        NodeStore {
            id,
            capacity: config.node_store_size,
            max_timeouts: config.max_timeouts,
            reach_decrease_per_second: config.reach_decrease_per_second,
            nodes: HashMap::with_capacity(config.node_store_size.min(1024)),
        }
    }

    // === Getters ===

    /// The id this store measures distances from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &Id) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// This router's opinion of its own reach: the maximum reach of any
    /// node it knows.
    pub fn self_reach(&self) -> u32 {
        self.nodes.values().map(|node| node.reach).max().unwrap_or(0)
    }

    // === Public Methods ===

    /// Insert a peer, or refresh its endpoint if the id is already known.
    ///
    /// New peers start at reach 0; a full store evicts its lowest-ranked
    /// node to make room. Our own id is never stored.
    pub fn add(&mut self, id: Id, address: SocketAddrV4) {
        if id == self.id {
            return;
        }

        if let Some(existing) = self.nodes.get_mut(&id) {
            existing.address = address;
            return;
        }

        if self.nodes.len() >= self.capacity {
            self.evict_worst();
        }

        self.nodes.insert(id, Node::new(id, address));
    }

    /// The up-to-`k` nodes with the lowest reach-weighted distance to
    /// `target`, ascending.
    ///
    /// Never returns a node whose 160-bit XOR distance to the target is
    /// not strictly below this router's own; returning such a node could
    /// form a routing loop. When every proven node is no closer than us,
    /// the result falls back to unproven (reach 0) closer nodes, or
    /// nothing at all.
    pub fn closest_k(&self, target: &Id, k: usize) -> Vec<Node> {
        if k == 0 {
            return Vec::new();
        }

        let self_distance = self.id.xor(target);

        let mut candidates: Vec<&Node> = self
            .nodes
            .values()
            .filter(|node| node.id.xor(target) < self_distance)
            .collect();

        if candidates.len() > k {
            candidates.select_nth_unstable_by(k - 1, |a, b| rank(a, b, target));
            candidates.truncate(k);
        }
        candidates.sort_unstable_by(|a, b| rank(a, b, target));

        candidates.into_iter().cloned().collect()
    }

    /// Subtract `reach_decrease_per_second x elapsed` from every proven
    /// node, saturating at 0. Nodes already at 0 are left there.
    pub fn decay_all(&mut self, elapsed_seconds: u32) {
        let decrease = self.reach_decrease_per_second as u64 * elapsed_seconds as u64;
        let decrease = decrease.min(u32::MAX as u64) as u32;

        for node in self.nodes.values_mut() {
            if node.reach > 0 {
                node.reach = node.reach.saturating_sub(decrease);
            }
        }
    }

    /// A probe to this node went unanswered: reach drops to 0, and enough
    /// consecutive timeouts remove the node entirely.
    pub fn mark_timeout(&mut self, id: &Id) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.reach = 0;
            node.consecutive_timeouts += 1;

            if node.consecutive_timeouts >= self.max_timeouts {
                debug!(node_id = ?id, "Removing node after consecutive timeouts");
                self.nodes.remove(id);
            }
        }
    }

    /// The node replied: credit it with `delta_reach` (saturating) and
    /// clear its timeout streak.
    pub fn mark_replied(&mut self, id: &Id, delta_reach: u32) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.reach = node.reach.saturating_add(delta_reach);
            node.consecutive_timeouts = 0;
        }
    }

    /// Strip a node of its reach without touching its timeout streak.
    /// Used when a node hands out peers farther from the target than
    /// itself.
    pub(crate) fn zero_reach(&mut self, id: &Id) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.reach = 0;
        }
    }

    /// True iff this router has the lowest reach-weighted distance to
    /// `target` among everything it knows.
    ///
    /// Searches for such targets would be answered out of our own unproven
    /// fallback, which is what the local maintenance search trains away.
    pub fn is_self_winner(&self, target: &Id) -> bool {
        let self_reach = self.self_reach();
        if self_reach == 0 {
            return true;
        }

        let self_distance = (self.id.prefix() ^ target.prefix()) as u64;

        !self.nodes.values().any(|node| {
            if node.reach == 0 {
                return false;
            }
            let distance = (node.id.prefix() ^ target.prefix()) as u64;

            // node_d / node_r < self_d / self_r, without division.
            distance * (self_reach as u64) < self_distance * (node.reach as u64)
        })
    }

    // === Private Methods ===

    fn evict_worst(&mut self) {
        let self_id = self.id;

        let victim = self
            .nodes
            .values()
            .max_by(|a, b| rank(a, b, &self_id))
            .map(|node| node.id);

        if let Some(id) = victim {
            debug!(node_id = ?id, "Node store full, evicting lowest ranked node");
            self.nodes.remove(&id);
        }
    }
}

/// Ascending reach-weighted distance to `target`: lower `distance/reach`
/// ranks first, reach 0 counts as infinite, and exact ties (including
/// 0-reach vs 0-reach) fall back to the full 160-bit distance.
fn rank(a: &Node, b: &Node, target: &Id) -> Ordering {
    match (a.reach, b.reach) {
        (0, 0) => a.id.xor(target).cmp(&b.id.xor(target)),
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        (a_reach, b_reach) => {
            let a_distance = (a.id.prefix() ^ target.prefix()) as u64;
            let b_distance = (b.id.prefix() ^ target.prefix()) as u64;

            // a_d/a_r vs b_d/b_r, cross-multiplied to stay in integers.
            (a_distance * b_reach as u64)
                .cmp(&(b_distance * a_reach as u64))
                .then_with(|| a.id.xor(target).cmp(&b.id.xor(target)))
        }
    }
}
