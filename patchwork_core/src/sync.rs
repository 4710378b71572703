//! Per-node readiness barrier.
//!
//! A compute is released for a step once every patch it depends on has
//! published positions for that step on this node. Readiness may arrive
//! before or after the compute registers.

use crate::compute::ComputeId;
use crate::error::{PatchError, PatchResult};
use crate::patch::PatchId;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct Waiting {
    step: u64,
    remaining: BTreeSet<PatchId>,
}

#[derive(Debug)]
pub struct ReadinessBarrier {
    capacity: usize,
    waiting: BTreeMap<ComputeId, Waiting>,
    ready: BTreeMap<u64, BTreeSet<PatchId>>,
}

impl ReadinessBarrier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            waiting: BTreeMap::new(),
            ready: BTreeMap::new(),
        }
    }

    /// Registers `cid` for `step`. Returns `true` if all of `deps` are
    /// already ready and the compute is released right away.
    pub fn register(&mut self, cid: ComputeId, deps: &[PatchId], step: u64) -> PatchResult<bool> {
        let ready = self.ready.get(&step);
        let remaining: BTreeSet<PatchId> = deps
            .iter()
            .copied()
            .filter(|pid| !ready.is_some_and(|r| r.contains(pid)))
            .collect();
        if remaining.is_empty() {
            return Ok(true);
        }
        if !self.waiting.contains_key(&cid) && self.waiting.len() >= self.capacity {
            return Err(PatchError::CapacityExceeded {
                what: "sync",
                capacity: self.capacity,
            });
        }
        self.waiting.insert(cid, Waiting { step, remaining });
        Ok(false)
    }

    /// Marks `patch` ready for `step` and returns the computes this
    /// released, in id order.
    pub fn patch_ready(&mut self, patch: PatchId, step: u64) -> PatchResult<Vec<ComputeId>> {
        if !self.ready.entry(step).or_default().insert(patch) {
            return Err(PatchError::DuplicateReady { patch, step });
        }
        let mut released = Vec::new();
        for (cid, waiting) in self.waiting.iter_mut() {
            if waiting.step == step && waiting.remaining.remove(&patch) && waiting.remaining.is_empty() {
                released.push(*cid);
            }
        }
        for cid in &released {
            self.waiting.remove(cid);
        }
        Ok(released)
    }

    /// Whether `cid` is registered and still waiting.
    pub fn is_waiting(&self, cid: ComputeId) -> bool {
        self.waiting.contains_key(&cid)
    }

    /// Drops a registration (the compute is leaving the node).
    pub fn forget(&mut self, cid: ComputeId) -> bool {
        self.waiting.remove(&cid).is_some()
    }

    pub fn pending(&self) -> usize {
        self.waiting.len()
    }

    pub fn pending_for(&self, step: u64) -> usize {
        self.waiting.values().filter(|w| w.step == step).count()
    }

    /// Forgets readiness records older than `step`.
    pub fn retire_before(&mut self, step: u64) {
        self.ready = self.ready.split_off(&step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_after_all_dependencies() {
        let mut sync = ReadinessBarrier::new(8);
        assert!(!sync.register(ComputeId(0), &[PatchId(0), PatchId(1)], 0).unwrap());
        assert!(!sync.register(ComputeId(1), &[PatchId(1)], 0).unwrap());

        assert_eq!(sync.patch_ready(PatchId(1), 0).unwrap(), vec![ComputeId(1)]);
        assert_eq!(sync.patch_ready(PatchId(0), 0).unwrap(), vec![ComputeId(0)]);
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn test_ready_before_register() {
        let mut sync = ReadinessBarrier::new(8);
        sync.patch_ready(PatchId(3), 2).unwrap();
        assert!(sync.register(ComputeId(4), &[PatchId(3)], 2).unwrap());
        // Readiness of another step does not count.
        assert!(!sync.register(ComputeId(5), &[PatchId(3)], 3).unwrap());
        assert_eq!(sync.pending_for(3), 1);
    }

    #[test]
    fn test_duplicate_ready_is_fatal() {
        let mut sync = ReadinessBarrier::new(8);
        sync.patch_ready(PatchId(0), 0).unwrap();
        assert!(matches!(
            sync.patch_ready(PatchId(0), 0),
            Err(PatchError::DuplicateReady { patch: PatchId(0), step: 0 })
        ));
        sync.patch_ready(PatchId(0), 1).unwrap();
    }

    #[test]
    fn test_capacity_and_retire() {
        let mut sync = ReadinessBarrier::new(1);
        sync.register(ComputeId(0), &[PatchId(0)], 0).unwrap();
        assert!(matches!(
            sync.register(ComputeId(1), &[PatchId(0)], 0),
            Err(PatchError::CapacityExceeded { what: "sync", capacity: 1 })
        ));
        sync.patch_ready(PatchId(0), 0).unwrap();
        sync.retire_before(1);
        sync.patch_ready(PatchId(0), 0).unwrap();
        assert!(!sync.forget(ComputeId(0)));
    }
}
