//! Short name → node lookup
//!
//! The directory lets chat users address mesh nodes by their short name
//! (`/pm base hello`). It is filled from the radio's node table on every
//! scan and from each received packet. Entries are upserted and never
//! removed for the lifetime of the process.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::interface::KnownNode;

#[derive(Debug, Default)]
struct DirectoryInner {
    by_name: HashMap<String, u32>,
    by_num: HashMap<u32, KnownNode>,
}

/// Shared node directory
#[derive(Debug, Default)]
pub struct NodeDirectory {
    inner: RwLock<DirectoryInner>,
}

impl NodeDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node; returns true if the name mapping changed
    pub fn upsert(&self, node: &KnownNode) -> bool {
        let key = node.short_name.trim().to_lowercase();
        if key.is_empty() {
            return false;
        }
        let mut inner = self.inner.write();
        inner.by_num.insert(node.num, node.clone());
        let previous = inner.by_name.insert(key.clone(), node.num);
        let changed = previous != Some(node.num);
        if changed {
            debug!(name = %key, node = %node.id, "Directory entry updated");
        }
        changed
    }

    /// Merge a full node table; returns how many name mappings changed
    pub fn refresh<'a>(&self, nodes: impl IntoIterator<Item = &'a KnownNode>) -> usize {
        let updated = nodes.into_iter().filter(|node| self.upsert(node)).count();
        if updated > 0 {
            info!(updated, total = self.len(), "Node directory refreshed");
        }
        updated
    }

    /// Resolve a short name (case-insensitive) to a node number
    pub fn resolve(&self, short_name: &str) -> Option<u32> {
        self.inner
            .read()
            .by_name
            .get(&short_name.trim().to_lowercase())
            .copied()
    }

    /// Look a node up by number
    pub fn node(&self, num: u32) -> Option<KnownNode> {
        self.inner.read().by_num.get(&num).cloned()
    }

    /// Find a node whose number ends in the given byte
    ///
    /// Relay information in mesh packets only carries the low byte of the
    /// relaying node's number.
    pub fn find_by_last_byte(&self, last_byte: u8) -> Option<KnownNode> {
        let inner = self.inner.read();
        let mut matches = inner
            .by_num
            .values()
            .filter(|node| (node.num & 0xFF) as u8 == last_byte);
        let first = matches.next()?;
        // Ambiguous when more than one known node shares the byte
        match matches.next() {
            Some(_) => None,
            None => Some(first.clone()),
        }
    }

    /// Number of named nodes
    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    /// Check if the directory is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(num: u32, short: &str) -> KnownNode {
        KnownNode::new(num, short, format!("{} long", short))
    }

    #[test]
    fn test_upsert_and_resolve() {
        let dir = NodeDirectory::new();
        assert!(dir.upsert(&node(0x1111_2222, "Base")));
        assert_eq!(dir.resolve("base"), Some(0x1111_2222));
        assert_eq!(dir.resolve("BASE"), Some(0x1111_2222));
        assert_eq!(dir.resolve("rover"), None);
    }

    #[test]
    fn test_last_write_wins() {
        let dir = NodeDirectory::new();
        dir.upsert(&node(1, "base"));
        assert!(!dir.upsert(&node(1, "base")));
        assert!(dir.upsert(&node(2, "Base")));
        assert_eq!(dir.resolve("base"), Some(2));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_nameless_nodes_are_skipped() {
        let dir = NodeDirectory::new();
        assert!(!dir.upsert(&node(7, "  ")));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_refresh_counts_changes() {
        let dir = NodeDirectory::new();
        let table = vec![node(1, "a"), node(2, "b"), node(3, "c")];
        assert_eq!(dir.refresh(&table), 3);
        assert_eq!(dir.refresh(&table), 0);
        assert_eq!(dir.len(), 3);
    }

    #[test]
    fn test_find_by_last_byte() {
        let dir = NodeDirectory::new();
        dir.upsert(&node(0xAABB_CC10, "one"));
        dir.upsert(&node(0xAABB_CC20, "two"));
        dir.upsert(&node(0x1122_3320, "three"));

        assert_eq!(dir.find_by_last_byte(0x10).unwrap().short_name, "one");
        assert!(dir.find_by_last_byte(0x20).is_none());
        assert!(dir.find_by_last_byte(0x30).is_none());
    }
}
