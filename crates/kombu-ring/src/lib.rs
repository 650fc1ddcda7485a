//! Virtual-node consistent hash ring.
//!
//! Each logical node claims many virtual positions (default 100) on a u32
//! ring, hashed with xxhash64 seed 0. Keys route to the first virtual
//! position at or after their hash, wrapping around; replica sets are the
//! next distinct nodes in ring order. Adding or removing a node only
//! reassigns that node's own virtual positions, so key churn is bounded by
//! `keys / total virtual nodes` instead of a full remap.

use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Default number of virtual positions per logical node.
pub const DEFAULT_VIRTUAL_NODES: u32 = 100;

/// Hash a byte string to a ring position (xxhash64, seed 0, folded to u32).
fn ring_hash(data: &[u8]) -> u32 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish() as u32
}

/// Ordered ring of virtual positions → owning node id.
#[derive(Debug, Clone)]
pub struct HashRing {
    positions: BTreeMap<u32, String>,
    virtual_nodes: u32,
}

impl HashRing {
    /// Builds a ring over `nodes`, each expanded into `virtual_nodes`
    /// positions hashed from `"<node>-<index>"`.
    pub fn new<I, S>(nodes: I, virtual_nodes: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self {
            positions: BTreeMap::new(),
            virtual_nodes: virtual_nodes.max(1),
        };
        for node in nodes {
            ring.add_node(node.as_ref());
        }
        ring
    }

    /// Adds one node's virtual positions. On a (rare) position collision the
    /// existing claimant keeps the slot, which keeps routing deterministic.
    pub fn add_node(&mut self, node: &str) {
        for index in 0..self.virtual_nodes {
            let position = ring_hash(format!("{node}-{index}").as_bytes());
            self.positions.entry(position).or_insert_with(|| node.to_string());
        }
    }

    /// Removes only the positions owned by `node`.
    pub fn remove_node(&mut self, node: &str) {
        self.positions.retain(|_, owner| owner != node);
    }

    /// The node owning `key`: first virtual position at or after the key's
    /// hash, wrapping to the ring start.
    pub fn node_for(&self, key: &str) -> Option<&str> {
        let hash = ring_hash(key.as_bytes());
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node.as_str())
    }

    /// Up to `count` distinct nodes in ring order starting at the key's
    /// position; element 0 is the primary, the rest are replicas.
    pub fn nodes_for(&self, key: &str, count: usize) -> Vec<String> {
        let mut result: Vec<String> = Vec::with_capacity(count);
        if count == 0 || self.positions.is_empty() {
            return result;
        }

        let hash = ring_hash(key.as_bytes());
        let walk = self
            .positions
            .range(hash..)
            .chain(self.positions.range(..hash));
        for (_, node) in walk {
            if !result.iter().any(|n| n == node) {
                result.push(node.clone());
                if result.len() == count {
                    break;
                }
            }
        }
        result
    }

    /// Number of distinct logical nodes on the ring.
    pub fn node_count(&self) -> usize {
        let mut nodes: Vec<&str> = self.positions.values().map(String::as_str).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition_names(n: u32) -> Vec<String> {
        (0..n).map(|i| format!("partition-{i}")).collect()
    }

    #[test]
    fn test_routing_is_deterministic() {
        let ring = HashRing::new(partition_names(4), DEFAULT_VIRTUAL_NODES);
        let first = ring.node_for("user:42").unwrap().to_string();
        for _ in 0..10 {
            assert_eq!(ring.node_for("user:42").unwrap(), first);
        }
    }

    #[test]
    fn test_empty_ring_routes_nowhere() {
        let ring = HashRing::new(Vec::<String>::new(), DEFAULT_VIRTUAL_NODES);
        assert!(ring.node_for("k").is_none());
        assert!(ring.nodes_for("k", 3).is_empty());
    }

    #[test]
    fn test_replica_set_is_distinct_and_ordered() {
        let ring = HashRing::new(partition_names(5), DEFAULT_VIRTUAL_NODES);
        let replicas = ring.nodes_for("some-key", 3);
        assert_eq!(replicas.len(), 3);
        assert_eq!(replicas[0], ring.node_for("some-key").unwrap());

        let mut unique = replicas.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_replica_count_capped_by_node_count() {
        let ring = HashRing::new(partition_names(2), DEFAULT_VIRTUAL_NODES);
        assert_eq!(ring.nodes_for("k", 5).len(), 2);
    }

    #[test]
    fn test_adding_node_moves_bounded_fraction_of_keys() {
        let before = HashRing::new(partition_names(10), DEFAULT_VIRTUAL_NODES);
        let mut after = before.clone();
        after.add_node("partition-10");

        let total = 2000;
        let mut moved = 0;
        for i in 0..total {
            let key = format!("key-{i}");
            let old = before.node_for(&key).unwrap();
            let new = after.node_for(&key).unwrap();
            if old != new {
                // Keys may only move onto the new node, never between
                // existing nodes.
                assert_eq!(new, "partition-10");
                moved += 1;
            }
        }

        // Roughly 1/11 of keys should move; allow generous variance.
        assert!(moved > 0, "expected some keys to move");
        assert!(
            moved < total / 4,
            "expected bounded churn, {moved}/{total} keys moved"
        );
    }

    #[test]
    fn test_removing_node_reroutes_only_its_keys() {
        let full = HashRing::new(partition_names(5), DEFAULT_VIRTUAL_NODES);
        let mut reduced = full.clone();
        reduced.remove_node("partition-3");

        for i in 0..500 {
            let key = format!("key-{i}");
            let old = full.node_for(&key).unwrap();
            let new = reduced.node_for(&key).unwrap();
            if old != "partition-3" {
                assert_eq!(old, new);
            } else {
                assert_ne!(new, "partition-3");
            }
        }
        assert_eq!(reduced.node_count(), 4);
    }

    #[test]
    fn test_keys_spread_across_nodes() {
        let ring = HashRing::new(partition_names(8), DEFAULT_VIRTUAL_NODES);
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        for i in 0..1000 {
            seen.insert(ring.node_for(&format!("key-{i}")).unwrap().to_string());
        }
        assert_eq!(seen.len(), 8, "all partitions should receive keys");
    }
}
