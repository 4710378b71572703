//! Global registry of computes: what each computes, over which patches,
//! on which node, and where it is being moved.
//!
//! Shared by every node through [`SharedComputeMap`]. A relocation commit
//! takes the write lock once, so readers see either the old or the new
//! owner and never a half-moved record.

use crate::compute::{ComputeId, ComputeKind};
use crate::error::{PatchError, PatchResult};
use crate::patch::PatchId;
use crate::patch_map::PatchMap;
use patchwork_env::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeRecord {
    pub id: ComputeId,
    pub kind: ComputeKind,
    /// Sorted input patches (one or two)
    pub patches: Vec<PatchId>,
    pub node: NodeId,
    pub move_to: Option<NodeId>,
}

/// Which compute kinds [`ComputeMap::from_patch_map`] creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeSet {
    pub nonbonded: bool,
    pub bonded: bool,
    pub long_range: bool,
}

impl Default for ComputeSet {
    fn default() -> Self {
        Self {
            nonbonded: true,
            bonded: false,
            long_range: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComputeMap {
    records: Vec<ComputeRecord>,
    index: HashMap<(ComputeKind, Vec<PatchId>), ComputeId>,
}

impl ComputeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard work list for a decomposition: self terms on each patch's
    /// home, pair terms on the home of the lower-numbered patch.
    pub fn from_patch_map(map: &PatchMap, set: ComputeSet) -> PatchResult<Self> {
        let mut computes = Self::new();
        for record in map.records() {
            if set.nonbonded {
                computes.store_compute(ComputeKind::NonbondedSelf, &[record.id], record.home)?;
            }
            if set.bonded {
                computes.store_compute(ComputeKind::BondedSelf, &[record.id], record.home)?;
            }
            if set.long_range {
                computes.store_compute(ComputeKind::LongRange, &[record.id], record.home)?;
            }
        }
        if set.nonbonded {
            for (a, b) in map.neighbor_pairs() {
                computes.store_compute(ComputeKind::NonbondedPair, &[a, b], map.home_node(a)?)?;
            }
        }
        Ok(computes)
    }

    /// Adds a compute. A second compute of the same kind over the same
    /// patches is rejected.
    pub fn store_compute(&mut self, kind: ComputeKind, patches: &[PatchId], node: NodeId) -> PatchResult<ComputeId> {
        let id = ComputeId(self.records.len() as u32);
        let mut key = patches.to_vec();
        key.sort();
        if key.len() != kind.num_patches() || key.windows(2).any(|w| w[0] == w[1]) {
            return Err(PatchError::InvalidCompute {
                cid: id,
                reason: format!("{kind} over {key:?}"),
            });
        }
        if self.index.contains_key(&(kind, key.clone())) {
            return Err(PatchError::DuplicateCompute {
                kind: kind.to_string(),
                patches: key,
            });
        }
        self.index.insert((kind, key.clone()), id);
        self.records.push(ComputeRecord {
            id,
            kind,
            patches: key,
            node,
            move_to: None,
        });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ComputeRecord] {
        &self.records
    }

    pub fn record(&self, cid: ComputeId) -> PatchResult<&ComputeRecord> {
        self.records.get(cid.0 as usize).ok_or(PatchError::UnknownCompute(cid))
    }

    fn record_mut(&mut self, cid: ComputeId) -> PatchResult<&mut ComputeRecord> {
        self.records.get_mut(cid.0 as usize).ok_or(PatchError::UnknownCompute(cid))
    }

    pub fn find(&self, kind: ComputeKind, patches: &[PatchId]) -> Option<ComputeId> {
        let mut key = patches.to_vec();
        key.sort();
        self.index.get(&(kind, key)).copied()
    }

    pub fn node(&self, cid: ComputeId) -> PatchResult<NodeId> {
        self.record(cid).map(|r| r.node)
    }

    pub fn computes_on(&self, node: NodeId) -> Vec<ComputeId> {
        self.records.iter().filter(|r| r.node == node).map(|r| r.id).collect()
    }

    /// Phase one of a relocation: records the destination.
    pub fn request_move(&mut self, cid: ComputeId, target: NodeId) -> PatchResult<()> {
        self.record_mut(cid)?.move_to = Some(target);
        Ok(())
    }

    /// Abandons a requested move; the compute stays where it is.
    pub fn cancel_move(&mut self, cid: ComputeId) -> PatchResult<()> {
        self.record_mut(cid)?.move_to = None;
        Ok(())
    }

    /// Final phase: the destination becomes the owner. Returns it.
    pub fn commit_move(&mut self, cid: ComputeId) -> PatchResult<NodeId> {
        let record = self.record_mut(cid)?;
        let target = record.move_to.take().ok_or(PatchError::NoPendingMove { cid })?;
        record.node = target;
        Ok(target)
    }

    /// Computes with a move in progress.
    pub fn pending_moves(&self) -> Vec<(ComputeId, NodeId)> {
        self.records
            .iter()
            .filter_map(|r| r.move_to.map(|to| (r.id, to)))
            .collect()
    }
}

/// Lock-guarded compute map shared by all nodes of a simulation.
#[derive(Debug, Clone, Default)]
pub struct SharedComputeMap {
    inner: Arc<RwLock<ComputeMap>>,
}

impl SharedComputeMap {
    pub fn new(map: ComputeMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ComputeMap> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ComputeMap> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::Lattice;

    #[test]
    fn test_from_patch_map_counts() {
        let map = PatchMap::decompose(Lattice::cubic(30.0), [3, 3, 3], 3);
        let computes = ComputeMap::from_patch_map(
            &map,
            ComputeSet {
                nonbonded: true,
                bonded: true,
                long_range: true,
            },
        )
        .unwrap();
        // 27 patches x 3 self kinds, plus 27 * 26 / 2 neighbor pairs.
        assert_eq!(computes.len(), 27 * 3 + 351);
        let pair = computes.find(ComputeKind::NonbondedPair, &[PatchId(5), PatchId(4)]).unwrap();
        assert_eq!(computes.record(pair).unwrap().patches, vec![PatchId(4), PatchId(5)]);
        assert_eq!(computes.node(pair).unwrap(), map.home_node(PatchId(4)).unwrap());
    }

    #[test]
    fn test_duplicate_compute_rejected() {
        let mut computes = ComputeMap::new();
        computes
            .store_compute(ComputeKind::NonbondedPair, &[PatchId(1), PatchId(0)], NodeId(0))
            .unwrap();
        assert!(matches!(
            computes.store_compute(ComputeKind::NonbondedPair, &[PatchId(0), PatchId(1)], NodeId(1)),
            Err(PatchError::DuplicateCompute { .. })
        ));
        assert!(computes
            .store_compute(ComputeKind::NonbondedSelf, &[PatchId(0)], NodeId(0))
            .is_ok());
        assert!(matches!(
            computes.store_compute(ComputeKind::NonbondedPair, &[PatchId(2), PatchId(2)], NodeId(0)),
            Err(PatchError::InvalidCompute { .. })
        ));
    }

    #[test]
    fn test_move_phases() {
        let shared = SharedComputeMap::new(ComputeMap::new());
        let cid = shared
            .write()
            .store_compute(ComputeKind::NonbondedSelf, &[PatchId(0)], NodeId(0))
            .unwrap();
        assert!(matches!(shared.write().commit_move(cid), Err(PatchError::NoPendingMove { .. })));

        shared.write().request_move(cid, NodeId(2)).unwrap();
        assert_eq!(shared.read().node(cid).unwrap(), NodeId(0));
        assert_eq!(shared.read().pending_moves(), vec![(cid, NodeId(2))]);

        assert_eq!(shared.write().commit_move(cid).unwrap(), NodeId(2));
        let map = shared.read();
        assert_eq!(map.node(cid).unwrap(), NodeId(2));
        assert!(map.record(cid).unwrap().move_to.is_none());
        assert_eq!(map.computes_on(NodeId(2)), vec![cid]);
    }
}
