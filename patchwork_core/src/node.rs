//! Node Runtime - one addressable node's share of the simulation.
//!
//! The runtime is sans-IO: it consumes [`PatchMessage`]s and returns an
//! [`Outbox`] of addressed replies. A driver owns the transport and the
//! step loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       NodeRuntime                        │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────────┐  │
//! │  │ HomePatch* │  │  ProxyMgr  │  │     ComputeMgr     │  │
//! │  │ (owns      │  │ (replicas  │  │ (computes placed   │  │
//! │  │  atoms)    │  │  of remote │  │  on this node)     │  │
//! │  └─────┬──────┘  │  patches)  │  └─────────┬──────────┘  │
//! │        │         └─────┬──────┘            │             │
//! │        └───── publish ─┴── ReadinessBarrier┘             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Step flow
//!
//! 1. `begin_step` registers every local compute with the barrier and
//!    publishes home patches (or sends a rebuilt spanning tree first).
//! 2. Published patches and received proxy data mark the barrier; released
//!    computes run and deposit forces.
//! 3. Drained proxies ship forces home; complete homes integrate and
//!    migrate.

use crate::atom::{AtomId, FullAtom};
use crate::compute::{Compute, ComputeId};
use crate::compute_mgr::{ComputeMgr, PatchLookup, StepLoad};
use crate::context::SimulationContext;
use crate::error::{PatchError, PatchResult};
use crate::home_patch::{HomePatch, HomePatchState};
use crate::messages::{Outbox, PatchMessage};
use crate::patch::{Patch, PatchId};
use crate::proxy::ProxyMgr;
use crate::sync::ReadinessBarrier;
use patchwork_env::NodeId;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Patches visible to computes on one node.
struct LocalPatches<'a> {
    homes: &'a mut BTreeMap<PatchId, HomePatch>,
    proxies: &'a mut ProxyMgr,
}

impl PatchLookup for LocalPatches<'_> {
    fn patch(&self, id: PatchId) -> Option<&Patch> {
        match self.homes.get(&id) {
            Some(home) => Some(home.patch()),
            None => self.proxies.get(id).map(|p| p.patch()),
        }
    }

    fn patch_mut(&mut self, id: PatchId) -> Option<&mut Patch> {
        if let Some(home) = self.homes.get_mut(&id) {
            return Some(home.patch_mut());
        }
        self.proxies.get_mut(id).map(|p| p.patch_mut())
    }
}

pub struct NodeRuntime {
    id: NodeId,
    ctx: SimulationContext,
    homes: BTreeMap<PatchId, HomePatch>,
    proxies: ProxyMgr,
    computes: ComputeMgr,
    barrier: ReadinessBarrier,
    step: u64,
    load: StepLoad,
}

impl NodeRuntime {
    pub fn new(id: NodeId, ctx: SimulationContext) -> Self {
        let capacity = ctx.config.sync_capacity;
        Self {
            id,
            ctx,
            homes: BTreeMap::new(),
            proxies: ProxyMgr::new(id),
            computes: ComputeMgr::new(id),
            barrier: ReadinessBarrier::new(capacity),
            step: 0,
            load: StepLoad::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    pub fn home_patches(&self) -> impl Iterator<Item = &HomePatch> {
        self.homes.values()
    }

    pub fn home_patch(&self, id: PatchId) -> Option<&HomePatch> {
        self.homes.get(&id)
    }

    fn home_mut(&mut self, id: PatchId) -> PatchResult<&mut HomePatch> {
        self.homes.get_mut(&id).ok_or(PatchError::UnknownPatch(id))
    }

    pub fn proxies(&self) -> &ProxyMgr {
        &self.proxies
    }

    pub fn computes(&self) -> &ComputeMgr {
        &self.computes
    }

    /// Work done so far in the current step.
    pub fn load(&self) -> StepLoad {
        self.load
    }

    pub fn num_atoms(&self) -> usize {
        self.homes.values().map(|h| h.num_atoms()).sum()
    }

    /// `(owner, atom)` for every atom homed on this node.
    pub fn ownership(&self) -> Vec<(PatchId, AtomId)> {
        self.homes
            .values()
            .flat_map(|h| h.atoms().iter().map(move |a| (h.id(), a.id)))
            .collect()
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.homes.values().map(HomePatch::kinetic_energy).sum()
    }

    pub fn margin_violations(&self) -> usize {
        self.homes.values().map(HomePatch::margin_violations).sum()
    }

    /// Creates the home patch `id` with its initial atoms.
    pub fn install_home_patch(&mut self, id: PatchId, atoms: Vec<FullAtom>) -> PatchResult<()> {
        let record = self.ctx.patch_map.record(id)?;
        if record.home != self.id {
            return Err(PatchError::InvalidState {
                patch: id,
                state: format!("homed on {}", record.home),
                op: "install on another node",
            });
        }
        let home = HomePatch::new(record, *self.ctx.patch_map.lattice(), atoms, self.ctx.config.clone());
        debug!(node = %self.id, patch = %id, atoms = home.num_atoms(), "home patch installed");
        self.homes.insert(id, home);
        Ok(())
    }

    /// Instantiates every compute the map assigns to this node.
    pub fn instantiate_assigned(&mut self) -> PatchResult<Outbox> {
        let assigned = self.ctx.compute_map.read().computes_on(self.id);
        let mut out = Vec::new();
        for cid in assigned {
            out.extend(self.instantiate(cid)?);
        }
        info!(node = %self.id, computes = self.computes.len(), proxies = self.proxies.len(), "computes instantiated");
        Ok(out)
    }

    /// Builds compute `cid` here, creating proxies for remote inputs.
    fn instantiate(&mut self, cid: ComputeId) -> PatchResult<Outbox> {
        if self.computes.contains(cid) {
            return Err(PatchError::InvalidCompute {
                cid,
                reason: format!("already attached on {}", self.id),
            });
        }
        let record = self.ctx.compute_map.read().record(cid)?.clone();
        let mut out = Vec::new();
        for pid in &record.patches {
            if self.homes.contains_key(pid) {
                continue;
            }
            let remote = self.ctx.patch_map.record(*pid)?;
            out.extend(self.proxies.ensure_proxy(*pid, remote.home, remote.extents));
        }

        let compute = Compute::new(
            cid,
            record.kind,
            record.patches.clone(),
            &self.ctx.kernel,
            self.ctx.long_range.as_ref(),
        )?;
        let mut patches = LocalPatches {
            homes: &mut self.homes,
            proxies: &mut self.proxies,
        };
        self.computes.attach(compute, &mut patches)?;
        Ok(out)
    }

    // ---- step driving ----------------------------------------------------

    /// Starts `step` on this node.
    pub fn begin_step(&mut self, step: u64) -> PatchResult<Outbox> {
        self.step = step;
        self.load = StepLoad::default();
        self.barrier.retire_before(step);

        for cid in self.computes.ids() {
            let deps = self
                .computes
                .get(cid)
                .map(|c| c.patches().to_vec())
                .unwrap_or_default();
            if self.barrier.register(cid, &deps, step)? {
                self.computes.release([cid]);
            }
        }

        let mut out = Vec::new();
        for home in self.homes.values_mut() {
            out.extend(home.publish(step, &self.ctx.topology)?);
            if home.state() == HomePatchState::AwaitingForces {
                let released = self.barrier.patch_ready(home.id(), step)?;
                self.computes.release(released);
            }
        }
        out.extend(self.pump()?);
        Ok(out)
    }

    /// Handles one message from `from`.
    pub fn handle(&mut self, from: NodeId, msg: PatchMessage) -> PatchResult<Outbox> {
        debug!(node = %self.id, %from, kind = msg.kind(), "handling message");
        let mut out = Vec::new();
        match msg {
            PatchMessage::RegisterProxy { patch, node } => {
                self.home_mut(patch)?.register_proxy(node)?;
            }
            PatchMessage::UnregisterProxy { patch, node } => {
                self.home_mut(patch)?.unregister_proxy(node)?;
            }
            PatchMessage::SpanningTree { tree } => {
                out.push(self.proxies.receive_tree(tree)?);
            }
            PatchMessage::SpanningTreeAck { patch, node, version } => {
                let home = self.homes.get_mut(&patch).ok_or(PatchError::UnknownPatch(patch))?;
                out.extend(home.receive_tree_ack(node, version)?);
                if home.state() == HomePatchState::AwaitingForces {
                    let released = self.barrier.patch_ready(patch, home.step())?;
                    self.computes.release(released);
                }
            }
            PatchMessage::ProxyData {
                patch,
                step,
                tree_version,
                positions,
            } => {
                out.extend(self.proxies.receive_positions(patch, step, tree_version, positions)?);
                let released = self.barrier.patch_ready(patch, step)?;
                self.computes.release(released);
            }
            PatchMessage::ProxyResults {
                patch,
                step,
                node,
                forces,
            } => {
                self.home_mut(patch)?.receive_results(node, step, &forces)?;
            }
            PatchMessage::MigrateAtoms(msg) => {
                self.home_mut(msg.dest)?.receive_migration(msg)?;
            }
            PatchMessage::InstantiateCompute { cid } => {
                out.extend(self.instantiate(cid)?);
                out.push((from, PatchMessage::ComputeInstantiated { cid, node: self.id }));
            }
            PatchMessage::ComputeInstantiated { cid, node } => {
                out.extend(self.complete_move(cid, node)?);
            }
        }
        out.extend(self.pump()?);
        Ok(out)
    }

    /// Runs whatever became runnable: released computes, drained proxies,
    /// homes with all forces in.
    fn pump(&mut self) -> PatchResult<Outbox> {
        let lattice = *self.ctx.patch_map.lattice();
        let dt = self.ctx.config.timestep;
        let mut out = Vec::new();

        loop {
            let mut progressed = false;

            if self.computes.has_released() {
                let mut patches = LocalPatches {
                    homes: &mut self.homes,
                    proxies: &mut self.proxies,
                };
                let load = self.computes.run_released(&mut patches, &lattice)?;
                self.load.computes += load.computes;
                self.load.interactions += load.interactions;
                self.load.energy += load.energy;
                progressed = true;
            }

            let results = self.proxies.collect_results()?;
            if !results.is_empty() {
                out.extend(results);
                progressed = true;
            }

            for home in self.homes.values_mut() {
                if !home.forces_complete() {
                    continue;
                }
                home.collect_forces()?;
                home.integrate(dt)?;
                if self.ctx.config.migrates_after(home.step()) {
                    let (messages, _report) = home.begin_migration()?;
                    for msg in messages {
                        let dest = self.ctx.patch_map.home_node(msg.dest)?;
                        out.push((dest, PatchMessage::MigrateAtoms(msg)));
                    }
                } else {
                    home.finish_step()?;
                }
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
        Ok(out)
    }

    /// Whether this node finished `step`: every home ready for the next
    /// step, no compute waiting or released, every proxy reported.
    pub fn is_settled(&self, step: u64) -> bool {
        self.homes
            .values()
            .all(|h| h.state() == HomePatchState::Ready && h.step() == step + 1)
            && !self.computes.has_released()
            && self.barrier.pending_for(step) == 0
            && self.proxies.settled_for(step)
    }

    /// Short description of what is still outstanding, for diagnostics.
    pub fn describe_pending(&self) -> String {
        let homes: Vec<String> = self
            .homes
            .values()
            .filter(|h| h.state() != HomePatchState::Ready)
            .map(|h| format!("{}:{}", h.id(), h.state()))
            .collect();
        format!(
            "{}: homes [{}], waiting computes {}, unsettled proxies {}",
            self.id,
            homes.join(", "),
            self.barrier.pending(),
            self.proxies.iter().filter(|p| !p.is_settled()).count()
        )
    }

    // ---- relocation ------------------------------------------------------

    /// Fails unless `cid` is idle on this node.
    pub fn quiesce_compute(&mut self, cid: ComputeId) -> PatchResult<()> {
        if self.barrier.is_waiting(cid) {
            return Err(PatchError::ComputeNotQuiescent(cid));
        }
        let patches = LocalPatches {
            homes: &mut self.homes,
            proxies: &mut self.proxies,
        };
        self.computes.quiesce(cid, &patches)
    }

    /// Source side of a relocation requested in the compute map: checks
    /// quiescence and asks the destination to instantiate.
    pub fn begin_move(&mut self, cid: ComputeId) -> PatchResult<Outbox> {
        let target = self
            .ctx
            .compute_map
            .read()
            .record(cid)?
            .move_to
            .ok_or(PatchError::NoPendingMove { cid })?;
        self.quiesce_compute(cid)?;
        if target == self.id {
            self.ctx.compute_map.write().commit_move(cid)?;
            return Ok(Vec::new());
        }
        info!(node = %self.id, %cid, %target, "relocating compute");
        Ok(vec![(target, PatchMessage::InstantiateCompute { cid })])
    }

    /// Destination confirmed: destroy the local copy, drop proxies nothing
    /// needs any more, and commit the new owner.
    fn complete_move(&mut self, cid: ComputeId, node: NodeId) -> PatchResult<Outbox> {
        let record = self.ctx.compute_map.read().record(cid)?.clone();
        let mut patches = LocalPatches {
            homes: &mut self.homes,
            proxies: &mut self.proxies,
        };
        self.computes.detach(cid, &mut patches)?;
        self.barrier.forget(cid);

        let mut out = Vec::new();
        for pid in &record.patches {
            if self.proxies.contains(*pid) && !self.computes.depends_on(*pid) {
                out.push(self.proxies.release_proxy(*pid)?);
            }
        }

        let committed = self.ctx.compute_map.write().commit_move(cid)?;
        if committed != node {
            return Err(PatchError::InvalidCompute {
                cid,
                reason: format!("instantiated on {node} but the map moved it to {committed}"),
            });
        }
        info!(node = %self.id, %cid, to = %node, "compute relocated");
        Ok(out)
    }

    // ---- checkpoints -----------------------------------------------------

    pub fn checkpoint(&mut self, tag: &str) -> PatchResult<()> {
        self.homes.values_mut().try_for_each(|h| h.checkpoint(tag))
    }

    pub fn revert(&mut self, tag: &str) -> PatchResult<()> {
        self.homes.values_mut().try_for_each(|h| h.revert(tag))
    }

    pub fn discard_checkpoint(&mut self, tag: &str) -> PatchResult<()> {
        self.homes.values_mut().try_for_each(|h| h.discard_checkpoint(tag))
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("id", &self.id)
            .field("step", &self.step)
            .field("homes", &self.homes.len())
            .field("proxies", &self.proxies.len())
            .field("computes", &self.computes.len())
            .finish()
    }
}
