//! Mesh ↔ chat message correlation
//!
//! When a mesh message is mirrored into the chat, the pair of identifiers
//! is remembered so that a chat reply to the mirror can be threaded back to
//! the mesh message (and its sender, for private conversations), and a mesh
//! reply can be threaded onto the mirrored chat message.
//!
//! The window is bounded. Eviction is strictly by insertion order: records
//! are only ever inspected with `peek`, so looking one up never refreshes it.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tracing::trace;

use crate::config::CORRELATION_CAPACITY;

/// One mirrored mesh message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationRecord {
    /// Packet id of the mesh message
    pub mesh_message_id: u32,
    /// Chat message id of its mirror
    pub mirror_message_id: i64,
    /// Sender node, kept only for private messages
    pub destination_node: Option<u32>,
    /// Whether the mesh message was addressed to this node only
    pub is_private: bool,
}

/// Bounded, insertion-ordered store of [`CorrelationRecord`]s
#[derive(Debug)]
pub struct CorrelationStore {
    records: Mutex<LruCache<u32, CorrelationRecord>>,
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationStore {
    /// Create a store with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(CORRELATION_CAPACITY)
    }

    /// Create a store holding at most `capacity` records
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Remember a mirrored message, evicting the oldest record when full
    ///
    /// A mesh id that is already present keeps its original record and
    /// position.
    pub fn record(
        &self,
        mesh_message_id: u32,
        mirror_message_id: i64,
        destination_node: Option<u32>,
        is_private: bool,
    ) {
        let mut records = self.records.lock();
        if records.contains(&mesh_message_id) {
            trace!(mesh_id = mesh_message_id, "Correlation already recorded");
            return;
        }
        let record = CorrelationRecord {
            mesh_message_id,
            mirror_message_id,
            destination_node,
            is_private,
        };
        if let Some((evicted, _)) = records.push(mesh_message_id, record) {
            trace!(evicted, "Correlation window full, dropped oldest");
        }
    }

    /// Find the record of a mesh message
    pub fn lookup_by_mesh_id(&self, mesh_message_id: u32) -> Option<CorrelationRecord> {
        self.records.lock().peek(&mesh_message_id).copied()
    }

    /// Find the record whose mirror is the given chat message
    pub fn lookup_by_mirror_id(&self, mirror_message_id: i64) -> Option<CorrelationRecord> {
        self.records
            .lock()
            .iter()
            .map(|(_, record)| record)
            .find(|record| record.mirror_message_id == mirror_message_id)
            .copied()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Maximum number of records
    pub fn capacity(&self) -> usize {
        self.records.lock().cap().get()
    }
}
