//! Per-node owner of instantiated computes.

use crate::compute::{Compute, ComputeCapability, ComputeId, ComputeStats};
use crate::error::{PatchError, PatchResult};
use crate::lattice::Lattice;
use crate::patch::{Patch, PatchId, PositionSnapshot};
use crate::rendezvous::BoxUserId;
use patchwork_env::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Access to the patches (home or proxy) present on a node.
pub trait PatchLookup {
    fn patch(&self, id: PatchId) -> Option<&Patch>;
    fn patch_mut(&mut self, id: PatchId) -> Option<&mut Patch>;
}

#[derive(Debug, Clone, Copy)]
struct PatchHandles {
    patch: PatchId,
    positions: BoxUserId,
    forces: BoxUserId,
}

#[derive(Debug)]
struct Attached {
    compute: Compute,
    handles: Vec<PatchHandles>,
}

/// Work done by one batch of released computes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepLoad {
    pub computes: usize,
    pub interactions: u64,
    pub energy: f64,
}

#[derive(Debug)]
pub struct ComputeMgr {
    node: NodeId,
    attached: BTreeMap<ComputeId, Attached>,
    released: BTreeSet<ComputeId>,
}

impl ComputeMgr {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            attached: BTreeMap::new(),
            released: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }

    pub fn contains(&self, cid: ComputeId) -> bool {
        self.attached.contains_key(&cid)
    }

    pub fn ids(&self) -> Vec<ComputeId> {
        self.attached.keys().copied().collect()
    }

    pub fn get(&self, cid: ComputeId) -> Option<&Compute> {
        self.attached.get(&cid).map(|a| &a.compute)
    }

    /// Whether any attached compute reads `patch`.
    pub fn depends_on(&self, patch: PatchId) -> bool {
        self.attached
            .values()
            .any(|a| a.compute.patches().contains(&patch))
    }

    pub fn stats(&self, cid: ComputeId) -> Option<ComputeStats> {
        self.attached.get(&cid).map(|a| a.compute.stats())
    }

    /// Registers `compute` on the boxes of its patches and initializes it.
    /// Every input patch must already exist on this node.
    pub fn attach(&mut self, mut compute: Compute, patches: &mut dyn PatchLookup) -> PatchResult<()> {
        let mut handles = Vec::with_capacity(compute.patches().len());
        for pid in compute.patches() {
            let patch = patches.patch_mut(*pid).ok_or(PatchError::UnknownPatch(*pid))?;
            handles.push(PatchHandles {
                patch: *pid,
                positions: patch.register_position_pickup()?,
                forces: patch.register_force_deposit()?,
            });
        }
        compute.initialize();
        debug!(node = %self.node, cid = %compute.id(), kind = %compute.kind(), "compute attached");
        self.attached.insert(compute.id(), Attached { compute, handles });
        Ok(())
    }

    /// Fails unless `cid` has no box operation in flight and is not
    /// waiting to run.
    pub fn quiesce(&self, cid: ComputeId, patches: &dyn PatchLookup) -> PatchResult<()> {
        let attached = self.attached.get(&cid).ok_or(PatchError::UnknownCompute(cid))?;
        if self.released.contains(&cid) {
            return Err(PatchError::ComputeNotQuiescent(cid));
        }
        for h in &attached.handles {
            if let Some(patch) = patches.patch(h.patch) {
                if patch.has_pending(h.positions, h.forces) {
                    return Err(PatchError::ComputeNotQuiescent(cid));
                }
            }
        }
        Ok(())
    }

    /// Removes a quiescent compute from this node and returns its stats.
    pub fn detach(&mut self, cid: ComputeId, patches: &mut dyn PatchLookup) -> PatchResult<ComputeStats> {
        self.quiesce(cid, patches)?;
        let mut attached = self.attached.remove(&cid).ok_or(PatchError::UnknownCompute(cid))?;
        for h in &attached.handles {
            let patch = patches.patch_mut(h.patch).ok_or(PatchError::UnknownPatch(h.patch))?;
            patch.unregister_position_pickup(h.positions)?;
            patch.unregister_force_deposit(h.forces)?;
        }
        let stats = attached.compute.finalize();
        debug!(node = %self.node, %cid, steps = stats.steps, interactions = stats.interactions, "compute detached");
        Ok(stats)
    }

    pub fn release(&mut self, cids: impl IntoIterator<Item = ComputeId>) {
        self.released.extend(cids);
    }

    pub fn has_released(&self) -> bool {
        !self.released.is_empty()
    }

    /// Runs every released compute: open positions, evaluate, deposit
    /// forces, close both boxes.
    pub fn run_released(&mut self, patches: &mut dyn PatchLookup, lattice: &Lattice) -> PatchResult<StepLoad> {
        let mut load = StepLoad::default();
        for cid in std::mem::take(&mut self.released) {
            let attached = self.attached.get_mut(&cid).ok_or(PatchError::UnknownCompute(cid))?;

            let mut snapshots: Vec<PositionSnapshot> = Vec::with_capacity(attached.handles.len());
            for h in &attached.handles {
                let patch = patches.patch_mut(h.patch).ok_or(PatchError::UnknownPatch(h.patch))?;
                snapshots.push(patch.open_positions(h.positions)?);
            }
            let views: Vec<&[crate::atom::CompAtom]> = snapshots.iter().map(|s| s.as_slice()).collect();
            let output = attached.compute.compute(lattice, &views)?;

            let class = attached.compute.kind().force_class();
            for (h, forces) in attached.handles.iter().zip(&output.forces) {
                let patch = patches.patch_mut(h.patch).ok_or(PatchError::UnknownPatch(h.patch))?;
                patch.open_forces(h.forces)?.accumulate(class, forces);
                patch.close_forces(h.forces)?;
                patch.close_positions(h.positions)?;
            }

            load.computes += 1;
            load.interactions += output.interactions;
            load.energy += output.energy;
        }
        Ok(load)
    }
}
