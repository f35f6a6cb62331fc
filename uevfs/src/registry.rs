//! Mount registry: which readers are mounted and which are not.
//!
//! Every registered reader lives in exactly one partition, *Unmounted* or
//! *Mounted*. Each reader has a single registry slot and the partition is a
//! field of that slot, so moving a reader is one compare-and-set under the
//! slot's shard lock. There is no window where a reader is in neither
//! partition, and two racing callers cannot both win the move.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::keys::KeyId;
use crate::reader::{ArchiveReader, ReaderId, VfsReader};

/// Registry partition a reader belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountState {
    Unmounted,
    Mounted,
}

#[derive(Debug)]
struct Slot {
    reader: Arc<VfsReader>,
    state: MountState,
}

/// Concurrent partition of readers into *Unmounted* and *Mounted*.
#[derive(Debug, Default)]
pub struct MountRegistry {
    slots: DashMap<ReaderId, Slot>,
    next_id: AtomicU64,
}

impl MountRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader as *Unmounted* and return its handle.
    pub fn insert(&self, reader: Arc<dyn ArchiveReader>) -> Arc<VfsReader> {
        let id = ReaderId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(VfsReader::new(id, reader));
        self.slots.insert(
            id,
            Slot {
                reader: Arc::clone(&handle),
                state: MountState::Unmounted,
            },
        );
        handle
    }

    /// Atomically move a reader from *Unmounted* to *Mounted*.
    ///
    /// Returns `false` if the reader was already mounted (another caller won
    /// the move) or is unknown. Losing the move is not an error.
    pub fn mark_mounted(&self, id: ReaderId) -> bool {
        match self.slots.get_mut(&id) {
            Some(mut slot) if slot.state == MountState::Unmounted => {
                slot.state = MountState::Mounted;
                true
            }
            _ => false,
        }
    }

    /// Partition of a reader, if registered.
    pub fn state_of(&self, id: ReaderId) -> Option<MountState> {
        self.slots.get(&id).map(|slot| slot.state)
    }

    /// Handle for a registered reader.
    pub fn get(&self, id: ReaderId) -> Option<Arc<VfsReader>> {
        self.slots.get(&id).map(|slot| Arc::clone(&slot.reader))
    }

    /// Snapshot of *Unmounted* readers, in registration order.
    pub fn unmounted(&self) -> Vec<Arc<VfsReader>> {
        self.snapshot(|slot| slot.state == MountState::Unmounted)
    }

    /// Snapshot of *Unmounted* readers declaring key id `id`.
    pub fn unmounted_by_key(&self, id: KeyId) -> Vec<Arc<VfsReader>> {
        self.snapshot(|slot| {
            slot.state == MountState::Unmounted && slot.reader.encryption_key_id() == Some(id)
        })
    }

    /// Snapshot of *Mounted* readers, in registration order.
    pub fn mounted(&self) -> Vec<Arc<VfsReader>> {
        self.snapshot(|slot| slot.state == MountState::Mounted)
    }

    /// Number of registered readers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no reader is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of *Mounted* readers.
    pub fn mounted_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == MountState::Mounted)
            .count()
    }

    fn snapshot(&self, keep: impl Fn(&Slot) -> bool) -> Vec<Arc<VfsReader>> {
        let mut readers: Vec<Arc<VfsReader>> = self
            .slots
            .iter()
            .filter(|slot| keep(slot.value()))
            .map(|slot| Arc::clone(&slot.reader))
            .collect();
        readers.sort_by_key(|r| r.id());
        readers
    }
}
