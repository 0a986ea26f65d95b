//! Consistent hashing over virtual nodes.
//!
//! Each real node contributes `replicas` points on a 32-bit ring, hashed
//! from the replica index concatenated with the node name. A key resolves
//! to the owner of the first point at or past its own hash, wrapping at the
//! end of the ring. Adding a node therefore only remaps the arcs adjacent
//! to its new points.

use std::collections::HashMap;

/// Ring hash function. Defaults to CRC32-IEEE.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Sorted virtual-node ring mapping keys to real node names.
///
/// # Examples
///
/// ```rust
/// use ika::cache::HashRing;
///
/// let mut ring = HashRing::new(50);
/// ring.add(["node-a", "node-b", "node-c"]);
///
/// let owner = ring.get("some-key").unwrap();
/// // The same key always lands on the same node.
/// assert_eq!(ring.get("some-key"), Some(owner));
/// ```
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    points: Vec<u32>,
    owners: HashMap<u32, String>,
}

impl HashRing {
    /// Creates a ring with `replicas` virtual points per node and the
    /// default CRC32-IEEE hash.
    pub fn new(replicas: usize) -> Self {
        Self::with_hash(replicas, Box::new(crc32fast::hash))
    }

    /// Creates a ring with a caller-supplied hash function.
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        Self {
            hash,
            replicas,
            points: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Adds real nodes, inserting `replicas` points for each and re-sorting
    /// the ring. Colliding points resolve last-writer-wins.
    pub fn add<S: AsRef<str>>(&mut self, nodes: impl IntoIterator<Item = S>) {
        for node in nodes {
            let node = node.as_ref();
            for i in 0..self.replicas {
                let point = (self.hash)(format!("{i}{node}").as_bytes());
                self.points.push(point);
                self.owners.insert(point, node.to_string());
            }
        }
        self.points.sort_unstable();
        self.points.dedup();
    }

    /// Resolves `key` to the owning node, or `None` on an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hashed = (self.hash)(key.as_bytes());
        let idx = self.points.partition_point(|&p| p < hashed);
        let point = self.points[idx % self.points.len()];
        self.owners.get(&point).map(String::as_str)
    }

    /// Whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("points", &self.points.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decimal_ring() -> HashRing {
        // A decimal "hash" makes ownership arithmetic predictable.
        HashRing::with_hash(
            3,
            Box::new(|key| {
                std::str::from_utf8(key)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default()
            }),
        )
    }

    #[test]
    fn keys_resolve_to_nearest_clockwise_point() {
        let mut ring = decimal_ring();
        // Points: 02/12/22, 04/14/24, 06/16/26.
        ring.add(["6", "4", "2"]);

        for (key, owner) in [("2", "2"), ("11", "2"), ("23", "4"), ("27", "2")] {
            assert_eq!(ring.get(key), Some(owner), "key {key}");
        }

        // A new node captures the arcs around its points.
        ring.add(["8"]);
        assert_eq!(ring.get("27"), Some("8"));
    }

    #[test]
    fn adding_nodes_remaps_only_adjacent_arcs() {
        let mut ring = decimal_ring();
        ring.add(["1", "3", "5"]);

        let cases = [("2", "3"), ("22", "3"), ("24", "5"), ("16", "1"), ("26", "1")];
        for (key, owner) in cases {
            assert_eq!(ring.get(key), Some(owner), "key {key}");
        }

        ring.add(["6"]);
        for (key, owner) in [("2", "3"), ("22", "3"), ("24", "5"), ("16", "6"), ("26", "6")] {
            assert_eq!(ring.get(key), Some(owner), "key {key}");
        }
    }

    #[test]
    fn empty_ring_resolves_nothing() {
        let ring = HashRing::new(3);
        assert!(ring.get("anything").is_none());
    }

    #[test]
    fn default_hash_spreads_keys_across_nodes() {
        let mut ring = HashRing::new(50);
        ring.add(["alpha", "beta", "gamma"]);

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for i in 0..300 {
            let owner = ring.get(&format!("key-{i}")).unwrap();
            *counts.entry(owner).or_default() += 1;
        }

        // Weak balance check: every node owns a meaningful share.
        assert_eq!(counts.len(), 3);
        for (&node, &count) in &counts {
            assert!(count > 30, "node {node} owns only {count} of 300 keys");
        }
    }
}
