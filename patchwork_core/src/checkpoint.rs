//! Tagged snapshots of a home patch's particle state.

use crate::atom::FullAtom;
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything needed to restore a patch to an earlier state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub lattice: Lattice,
    pub atoms: Vec<FullAtom>,
    pub step: u64,
}

/// Storage backend for checkpoints.
///
/// The in-memory store is the default; callers with durable storage
/// supply their own implementation.
pub trait CheckpointStore: Send {
    /// Stores `checkpoint` under `tag`, replacing any previous entry.
    fn store(&mut self, tag: &str, checkpoint: Checkpoint);

    fn load(&self, tag: &str) -> Option<Checkpoint>;

    /// Removes and returns the entry for `tag`.
    fn remove(&mut self, tag: &str) -> Option<Checkpoint>;

    fn tags(&self) -> Vec<String>;
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: HashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn store(&mut self, tag: &str, checkpoint: Checkpoint) {
        self.entries.insert(tag.to_string(), checkpoint);
    }

    fn load(&self, tag: &str) -> Option<Checkpoint> {
        self.entries.get(tag).cloned()
    }

    fn remove(&mut self, tag: &str) -> Option<Checkpoint> {
        self.entries.remove(tag)
    }

    fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.entries.keys().cloned().collect();
        tags.sort();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomId;
    use nalgebra::Vector3;

    #[test]
    fn test_store_replace_remove() {
        let mut store = MemoryCheckpointStore::new();
        let atoms = vec![FullAtom::new(AtomId(1), Vector3::new(1.0, 2.0, 3.0))];
        store.store(
            "a",
            Checkpoint {
                lattice: Lattice::cubic(10.0),
                atoms: atoms.clone(),
                step: 4,
            },
        );
        store.store(
            "a",
            Checkpoint {
                lattice: Lattice::cubic(10.0),
                atoms: Vec::new(),
                step: 9,
            },
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("a").unwrap().step, 9);
        assert_eq!(store.tags(), vec!["a".to_string()]);
        assert!(store.remove("a").is_some());
        assert!(store.load("a").is_none());
        assert!(store.is_empty());
    }
}
