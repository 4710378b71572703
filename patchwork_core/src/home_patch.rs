//! Home patches: the authoritative owners of particles.
//!
//! A home patch runs one step as an explicit state machine:
//!
//! ```text
//! Ready -> [AwaitingTreeAck] -> AwaitingForces -> Integrating -> [Migrating] -> Ready
//! ```
//!
//! `AwaitingTreeAck` is entered only when the proxy set changed since the
//! last broadcast. `Migrating` is entered only on migration steps; it ends
//! once every neighbor slot has delivered exactly one `MigrateAtoms` for the
//! step.

use crate::atom::{AtomId, CompAtom, ForceClass, ForceResults, FullAtom};
use crate::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
use crate::config::PatchConfig;
use crate::error::{PatchError, PatchResult};
use crate::lattice::Lattice;
use crate::messages::{MigrateAtoms, Outbox, PatchMessage};
use crate::patch::{Patch, PatchExtents, PatchId};
use crate::patch_map::{NeighborSlot, PatchRecord};
use crate::spanning_tree::SpanningTree;
use crate::topology::Topology;
use nalgebra::Vector3;
use patchwork_env::NodeId;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest scaled error tolerated when a periodic shift lands an image just
/// outside the receiving patch.
const WRAP_SLACK: f64 = 8.0 * f64::EPSILON;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomePatchState {
    /// Positions are consistent; next step not yet published
    Ready,
    /// New spanning tree sent, waiting for every proxy to acknowledge
    AwaitingTreeAck,
    /// Positions published, waiting for local and proxy forces
    AwaitingForces,
    /// Forces collected; integrate then migrate or finish
    Integrating,
    /// Outgoing atoms sent, waiting for every neighbor slot
    Migrating,
}

impl std::fmt::Display for HomePatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HomePatchState::Ready => "ready",
            HomePatchState::AwaitingTreeAck => "awaiting-tree-ack",
            HomePatchState::AwaitingForces => "awaiting-forces",
            HomePatchState::Integrating => "integrating",
            HomePatchState::Migrating => "migrating",
        };
        f.write_str(name)
    }
}

/// What one migration pass did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationReport {
    /// Atoms handed to neighbors
    pub leaving: usize,
    /// Atoms wrapped in place through a periodic face onto this patch
    pub wrapped: usize,
    /// Atoms found beyond the region grown by the margin
    pub margin_violations: usize,
}

pub struct HomePatch {
    patch: Patch,
    node: NodeId,
    lattice: Lattice,
    atoms: Vec<FullAtom>,
    neighbors: Vec<NeighborSlot>,
    config: PatchConfig,
    state: HomePatchState,
    step: u64,

    proxies: BTreeSet<NodeId>,
    tree: SpanningTree,
    tree_dirty: bool,
    pending_acks: BTreeSet<NodeId>,
    pending_results: BTreeSet<NodeId>,
    proxy_forces: Option<ForceResults>,

    settled: BTreeSet<u8>,
    early_deposits: Vec<MigrateAtoms>,
    margin_violations: usize,

    checkpoints: Box<dyn CheckpointStore>,
}

impl std::fmt::Debug for HomePatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomePatch")
            .field("id", &self.patch.id())
            .field("node", &self.node)
            .field("state", &self.state)
            .field("step", &self.step)
            .field("atoms", &self.atoms.len())
            .field("proxies", &self.proxies)
            .finish_non_exhaustive()
    }
}

impl HomePatch {
    pub fn new(record: &PatchRecord, lattice: Lattice, atoms: Vec<FullAtom>, config: PatchConfig) -> Self {
        Self {
            patch: Patch::new(record.id, record.extents),
            node: record.home,
            lattice,
            atoms,
            neighbors: record.neighbors.clone(),
            config,
            state: HomePatchState::Ready,
            step: 0,
            proxies: BTreeSet::new(),
            tree: SpanningTree::empty(record.id, record.home),
            tree_dirty: false,
            pending_acks: BTreeSet::new(),
            pending_results: BTreeSet::new(),
            proxy_forces: None,
            settled: BTreeSet::new(),
            early_deposits: Vec::new(),
            margin_violations: 0,
            checkpoints: Box::new(MemoryCheckpointStore::new()),
        }
    }

    /// Replaces the checkpoint backend.
    pub fn with_checkpoint_store(mut self, store: Box<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn id(&self) -> PatchId {
        self.patch.id()
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn state(&self) -> HomePatchState {
        self.state
    }

    /// Step being computed, or the next one to publish when `Ready`.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn extents(&self) -> &PatchExtents {
        self.patch.extents()
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn atoms(&self) -> &[FullAtom] {
        &self.atoms
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn proxies(&self) -> &BTreeSet<NodeId> {
        &self.proxies
    }

    pub fn tree(&self) -> &SpanningTree {
        &self.tree
    }

    /// Margin violations seen in the most recent step.
    pub fn margin_violations(&self) -> usize {
        self.margin_violations
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    pub fn patch_mut(&mut self) -> &mut Patch {
        &mut self.patch
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.atoms
            .iter()
            .map(|a| 0.5 * a.mass * a.velocity.norm_squared())
            .sum()
    }

    fn invalid(&self, op: &'static str) -> PatchError {
        PatchError::InvalidState {
            patch: self.id(),
            state: self.state.to_string(),
            op,
        }
    }

    // ---- proxies ---------------------------------------------------------

    pub fn register_proxy(&mut self, node: NodeId) -> PatchResult<()> {
        if self.proxies.contains(&node) {
            return Err(PatchError::DuplicateProxy { patch: self.id(), node });
        }
        if self.proxies.len() >= self.config.proxy_capacity {
            return Err(PatchError::CapacityExceeded {
                what: "proxy",
                capacity: self.config.proxy_capacity,
            });
        }
        self.proxies.insert(node);
        self.tree_dirty = true;
        debug!(patch = %self.id(), %node, proxies = self.proxies.len(), "proxy registered");
        Ok(())
    }

    pub fn unregister_proxy(&mut self, node: NodeId) -> PatchResult<()> {
        if self.pending_acks.contains(&node) || self.pending_results.contains(&node) {
            return Err(self.invalid("unregister a proxy it is waiting on"));
        }
        if !self.proxies.remove(&node) {
            return Err(PatchError::UnknownProxy { patch: self.id(), node });
        }
        self.tree_dirty = true;
        debug!(patch = %self.id(), %node, proxies = self.proxies.len(), "proxy unregistered");
        Ok(())
    }

    // ---- publication -----------------------------------------------------

    /// Starts `step`. Either broadcasts positions, or first sends a rebuilt
    /// spanning tree when the proxy set changed.
    pub fn publish(&mut self, step: u64, topology: &Topology) -> PatchResult<Outbox> {
        if self.state != HomePatchState::Ready {
            return Err(self.invalid("publish"));
        }
        if step != self.step {
            return Err(PatchError::StepMismatch {
                patch: self.id(),
                expected: self.step,
                got: step,
            });
        }

        if self.tree_dirty {
            let tree = SpanningTree::build(
                self.id(),
                self.node,
                &self.proxies,
                topology,
                self.config.tree_branching,
                self.tree.version + 1,
            );
            tree.validate(&self.proxies)?;
            self.tree = tree;
            self.tree_dirty = false;
            debug!(
                patch = %self.id(),
                version = self.tree.version,
                depth = self.tree.depth(),
                "spanning tree rebuilt"
            );

            if !self.proxies.is_empty() {
                self.pending_acks = self.proxies.clone();
                self.state = HomePatchState::AwaitingTreeAck;
                return Ok(self
                    .proxies
                    .iter()
                    .map(|node| (*node, PatchMessage::SpanningTree { tree: self.tree.clone() }))
                    .collect());
            }
        }

        self.broadcast()
    }

    pub fn receive_tree_ack(&mut self, node: NodeId, version: u64) -> PatchResult<Outbox> {
        if self.state != HomePatchState::AwaitingTreeAck {
            return Err(self.invalid("accept a tree acknowledgement"));
        }
        if version != self.tree.version {
            return Err(PatchError::StaleSpanningTree {
                patch: self.id(),
                expected: self.tree.version,
                got: version,
            });
        }
        if !self.pending_acks.remove(&node) {
            return Err(PatchError::UnknownProxy { patch: self.id(), node });
        }
        if self.pending_acks.is_empty() {
            self.broadcast()
        } else {
            Ok(Vec::new())
        }
    }

    fn broadcast(&mut self) -> PatchResult<Outbox> {
        let snapshot: Vec<CompAtom> = self.atoms.iter().map(FullAtom::comp_atom).collect();
        self.patch.publish(self.step, Arc::new(snapshot.clone()))?;
        self.pending_results = self.proxies.clone();
        self.proxy_forces = Some(ForceResults::zeroed(snapshot.len()));
        self.state = HomePatchState::AwaitingForces;

        let patch = self.id();
        let step = self.step;
        let tree_version = self.tree.version;
        debug!(%patch, step, atoms = snapshot.len(), proxies = self.proxies.len(), "positions published");
        Ok(self
            .tree
            .children_of(self.node)
            .iter()
            .map(|child| {
                (
                    *child,
                    PatchMessage::ProxyData {
                        patch,
                        step,
                        tree_version,
                        positions: snapshot.clone(),
                    },
                )
            })
            .collect())
    }

    // ---- forces ----------------------------------------------------------

    pub fn receive_results(&mut self, node: NodeId, step: u64, forces: &ForceResults) -> PatchResult<()> {
        if self.state != HomePatchState::AwaitingForces {
            return Err(self.invalid("accept proxy results"));
        }
        if step != self.step {
            return Err(PatchError::StepMismatch {
                patch: self.id(),
                expected: self.step,
                got: step,
            });
        }
        if !self.pending_results.remove(&node) {
            return Err(PatchError::UnknownProxy { patch: self.id(), node });
        }
        if forces.len() != self.atoms.len() {
            return Err(PatchError::ResultSizeMismatch {
                patch: self.id(),
                expected: self.atoms.len(),
                got: forces.len(),
            });
        }
        if let Some(acc) = self.proxy_forces.as_mut() {
            acc.merge(forces);
        }
        Ok(())
    }

    /// Local computes closed and every proxy reported.
    pub fn forces_complete(&self) -> bool {
        self.state == HomePatchState::AwaitingForces && self.patch.forces_done() && self.pending_results.is_empty()
    }

    /// Copies the summed forces onto the atoms.
    pub fn collect_forces(&mut self) -> PatchResult<()> {
        if !self.forces_complete() {
            return Err(self.invalid("collect forces"));
        }
        let mut total = self.patch.take_forces()?;
        if let Some(remote) = self.proxy_forces.take() {
            total.merge(&remote);
        }
        for (i, atom) in self.atoms.iter_mut().enumerate() {
            for class in ForceClass::ALL {
                atom.forces[class.index()] = total.class(class)[i];
            }
        }
        self.state = HomePatchState::Integrating;
        Ok(())
    }

    /// Kick-drift update of every atom.
    pub fn integrate(&mut self, dt: f64) -> PatchResult<()> {
        if self.state != HomePatchState::Integrating {
            return Err(self.invalid("integrate"));
        }
        for atom in &mut self.atoms {
            if atom.mass > 0.0 {
                let accel = atom.total_force() / atom.mass;
                atom.velocity += accel * dt;
            }
            atom.position += atom.velocity * dt;
        }
        Ok(())
    }

    /// Ends a non-migration step; atoms that left the region stay put.
    pub fn finish_step(&mut self) -> PatchResult<()> {
        if self.state != HomePatchState::Integrating {
            return Err(self.invalid("finish the step"));
        }
        let margin = self.scaled_margin();
        let extents = *self.extents();
        self.margin_violations = self
            .atoms
            .iter()
            .filter(|a| extents.violates_margin(&self.lattice.scale(&a.position), &margin))
            .count();
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        self.state = HomePatchState::Ready;
        self.step += 1;
    }

    // ---- migration -------------------------------------------------------

    fn scaled_margin(&self) -> Vector3<f64> {
        Vector3::repeat(self.config.margin).component_div(&self.lattice.lengths)
    }

    /// Periodic image of `p` that falls inside this patch, if any, together
    /// with its scaled coordinates. Axes that need no shift keep `p` bit for bit.
    fn wrap_into(&self, p: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
        let extents = self.extents();
        let mut p = *p;
        let mut s = self.lattice.scale(&p);
        for a in 0..3 {
            if !self.lattice.periodic[a] || !extents.center[a].is_finite() {
                continue;
            }
            let mut k = (s[a] - extents.center[a]).round();
            let t = s[a] - k;
            if t >= extents.max[a] && t - 1.0 >= extents.min[a] {
                k += 1.0;
            } else if t < extents.min[a] && t + 1.0 < extents.max[a] {
                k -= 1.0;
            }
            if k != 0.0 {
                s[a] -= k;
                p[a] -= k * self.lattice.lengths[a];
                // The shift itself may round the image just past a face
                if s[a] < extents.min[a] && extents.min[a] - s[a] <= WRAP_SLACK {
                    s[a] = extents.min[a];
                } else if s[a] >= extents.max[a] && s[a] - extents.max[a] <= WRAP_SLACK {
                    s[a] = f64::from_bits(extents.max[a].to_bits() - 1);
                }
            }
        }
        (p, s)
    }

    /// Sorts atoms that left the region into one message per neighbor slot
    /// (empty ones included) and enters `Migrating`.
    pub fn begin_migration(&mut self) -> PatchResult<(Vec<MigrateAtoms>, MigrationReport)> {
        if self.state != HomePatchState::Integrating {
            return Err(self.invalid("migrate"));
        }
        let extents = *self.extents();
        let margin = self.scaled_margin();
        let mut report = MigrationReport::default();
        let mut outgoing: BTreeMap<u8, Vec<FullAtom>> = BTreeMap::new();
        let mut staying = Vec::with_capacity(self.atoms.len());

        for mut atom in std::mem::take(&mut self.atoms) {
            let s = self.lattice.scale(&atom.position);
            if extents.violates_margin(&s, &margin) {
                report.margin_violations += 1;
            }
            let [dx, dy, dz] = extents.classify(&s);
            if dx == 0 && dy == 0 && dz == 0 {
                staying.push(atom);
                continue;
            }
            let direction = Lattice::index(dx, dy, dz);
            if self.neighbors.iter().any(|slot| slot.direction == direction) {
                report.leaving += 1;
                outgoing.entry(direction).or_default().push(atom);
            } else {
                let (wrapped, scaled) = self.wrap_into(&atom.position);
                if !extents.contains(&scaled) {
                    return Err(PatchError::DepositOutOfRegion {
                        patch: self.id(),
                        atom: atom.id,
                    });
                }
                atom.position = wrapped;
                report.wrapped += 1;
                staying.push(atom);
            }
        }
        self.atoms = staying;

        if report.leaving > self.config.migration_capacity {
            return Err(PatchError::CapacityExceeded {
                what: "migration buffer",
                capacity: self.config.migration_capacity,
            });
        }

        let messages: Vec<MigrateAtoms> = self
            .neighbors
            .iter()
            .map(|slot| MigrateAtoms {
                source: self.patch.id(),
                dest: slot.patch,
                direction: slot.direction,
                step: self.step,
                atoms: outgoing.remove(&slot.direction).unwrap_or_default(),
            })
            .collect();

        self.margin_violations = report.margin_violations;
        self.state = HomePatchState::Migrating;
        self.settled.clear();
        debug!(
            patch = %self.id(),
            step = self.step,
            leaving = report.leaving,
            wrapped = report.wrapped,
            margin_violations = report.margin_violations,
            "migration started"
        );

        for deposit in std::mem::take(&mut self.early_deposits) {
            self.apply_deposit(deposit)?;
        }
        self.try_settle();
        Ok((messages, report))
    }

    /// Accepts a neighbor's migration message. Messages that arrive before
    /// this patch starts migrating are held until it does.
    pub fn receive_migration(&mut self, msg: MigrateAtoms) -> PatchResult<()> {
        if msg.dest != self.id() {
            return Err(PatchError::MisaddressedDeposit {
                intended: msg.dest,
                actual: self.id(),
            });
        }
        let slot = Lattice::opposite(msg.direction);
        if !self
            .neighbors
            .iter()
            .any(|s| s.direction == slot && s.patch == msg.source)
        {
            return Err(PatchError::UnexpectedMigrationSource {
                patch: self.id(),
                source_patch: msg.source,
                direction: msg.direction,
            });
        }

        if self.state != HomePatchState::Migrating && msg.step + 1 == self.step {
            warn!(patch = %self.id(), source = %msg.source, step = msg.step, "duplicate migration after settle; skipped");
            return Ok(());
        }
        if msg.step != self.step {
            return Err(PatchError::StepMismatch {
                patch: self.id(),
                expected: self.step,
                got: msg.step,
            });
        }

        if self.state == HomePatchState::Migrating {
            self.apply_deposit(msg)?;
            self.try_settle();
        } else {
            self.early_deposits.push(msg);
        }
        Ok(())
    }

    fn apply_deposit(&mut self, msg: MigrateAtoms) -> PatchResult<()> {
        let slot = Lattice::opposite(msg.direction);
        if !self.settled.insert(slot) {
            warn!(patch = %self.id(), source = %msg.source, direction = msg.direction, "duplicate migration for settled slot; skipped");
            return Ok(());
        }
        if msg.atoms.is_empty() {
            return Ok(());
        }

        let extents = *self.extents();
        let mut ids: HashSet<AtomId> = self.atoms.iter().map(|a| a.id).collect();
        for mut atom in msg.atoms {
            let (wrapped, scaled) = self.wrap_into(&atom.position);
            if !extents.contains(&scaled) {
                return Err(PatchError::DepositOutOfRegion {
                    patch: self.id(),
                    atom: atom.id,
                });
            }
            atom.position = wrapped;
            if !ids.insert(atom.id) {
                return Err(PatchError::DuplicateAtom {
                    patch: self.id(),
                    atom: atom.id,
                });
            }
            self.atoms.push(atom);
        }
        Ok(())
    }

    fn try_settle(&mut self) {
        if self.state == HomePatchState::Migrating && self.settled.len() == self.neighbors.len() {
            debug!(patch = %self.id(), step = self.step, atoms = self.atoms.len(), "migration settled");
            self.advance();
        }
    }

    /// Neighbor slots still owed a message this migration.
    pub fn migration_remaining(&self) -> usize {
        match self.state {
            HomePatchState::Migrating => self.neighbors.len() - self.settled.len(),
            _ => 0,
        }
    }

    // ---- checkpoints -----------------------------------------------------

    pub fn checkpoint(&mut self, tag: &str) -> PatchResult<()> {
        if self.state != HomePatchState::Ready {
            return Err(self.invalid("checkpoint"));
        }
        self.checkpoints.store(
            tag,
            Checkpoint {
                lattice: self.lattice,
                atoms: self.atoms.clone(),
                step: self.step,
            },
        );
        info!(patch = %self.id(), tag, step = self.step, atoms = self.atoms.len(), "checkpoint stored");
        Ok(())
    }

    /// Restores atoms and lattice from `tag`. The step counter keeps going.
    pub fn revert(&mut self, tag: &str) -> PatchResult<()> {
        if self.state != HomePatchState::Ready {
            return Err(self.invalid("revert"));
        }
        let checkpoint = self.checkpoints.load(tag).ok_or_else(|| PatchError::UnknownCheckpoint {
            patch: self.id(),
            tag: tag.to_string(),
        })?;
        self.atoms = checkpoint.atoms;
        self.lattice = checkpoint.lattice;
        info!(patch = %self.id(), tag, from_step = checkpoint.step, "reverted to checkpoint");
        Ok(())
    }

    pub fn discard_checkpoint(&mut self, tag: &str) -> PatchResult<()> {
        self.checkpoints
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| PatchError::UnknownCheckpoint {
                patch: self.id(),
                tag: tag.to_string(),
            })
    }

    pub fn checkpoint_tags(&self) -> Vec<String> {
        self.checkpoints.tags()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_map::PatchMap;
    use approx::assert_relative_eq;

    fn two_patch_map() -> PatchMap {
        let lattice = Lattice::new(Vector3::zeros(), Vector3::new(20.0, 10.0, 10.0), [true; 3]);
        PatchMap::decompose(lattice, [2, 1, 1], 2)
    }

    fn home(map: &PatchMap, id: u32, atoms: Vec<FullAtom>) -> HomePatch {
        HomePatch::new(map.record(PatchId(id)).unwrap(), *map.lattice(), atoms, PatchConfig::default())
    }

    fn atom(id: u64, x: f64, vx: f64) -> FullAtom {
        FullAtom::new(AtomId(id), Vector3::new(x, 5.0, 5.0)).with_velocity(Vector3::new(vx, 0.0, 0.0))
    }

    /// Publishes with no proxies or computes, integrates and starts migrating.
    fn advance_to_migration(patch: &mut HomePatch, topo: &Topology) -> (Vec<MigrateAtoms>, MigrationReport) {
        let step = patch.step();
        assert!(patch.publish(step, topo).unwrap().is_empty());
        assert!(patch.forces_complete());
        patch.collect_forces().unwrap();
        patch.integrate(1.0).unwrap();
        patch.begin_migration().unwrap()
    }

    #[test]
    fn test_atom_crosses_to_neighbor() {
        let map = two_patch_map();
        let topo = Topology::uniform(1, 2);
        let mut p0 = home(&map, 0, vec![atom(1, 9.8, 0.5), atom(2, 2.0, 0.0)]);
        let mut p1 = home(&map, 1, vec![atom(3, 15.0, 0.0)]);

        let (out0, report) = advance_to_migration(&mut p0, &topo);
        let (out1, _) = advance_to_migration(&mut p1, &topo);
        assert_eq!(report.leaving, 1);
        assert_eq!(out0.len(), 18);
        let plus_x = Lattice::index(1, 0, 0);
        let carrying: Vec<_> = out0.iter().filter(|m| !m.atoms.is_empty()).collect();
        assert_eq!(carrying.len(), 1);
        assert_eq!(carrying[0].direction, plus_x);
        assert_eq!(carrying[0].dest, PatchId(1));

        for msg in out0 {
            p1.receive_migration(msg).unwrap();
        }
        for msg in out1 {
            p0.receive_migration(msg).unwrap();
        }
        assert_eq!(p0.state(), HomePatchState::Ready);
        assert_eq!(p1.state(), HomePatchState::Ready);
        assert_eq!(p0.step(), 1);
        assert_eq!(p0.num_atoms() + p1.num_atoms(), 3);
        let moved = p1.atoms().iter().find(|a| a.id == AtomId(1)).unwrap();
        assert_relative_eq!(moved.position.x, 10.3, epsilon = 1e-12);
    }

    #[test]
    fn test_periodic_crossing_is_wrapped_by_receiver() {
        let map = two_patch_map();
        let topo = Topology::uniform(1, 2);
        let mut p0 = home(&map, 0, vec![]);
        let mut p1 = home(&map, 1, vec![atom(7, 19.9, 0.4)]);
        let (out1, _) = advance_to_migration(&mut p1, &topo);
        advance_to_migration(&mut p0, &topo);
        for msg in out1 {
            p0.receive_migration(msg).unwrap();
        }
        let wrapped = &p0.atoms()[0];
        assert_relative_eq!(wrapped.position.x, 0.3, epsilon = 1e-9);
    }

    #[test]
    fn test_single_patch_wraps_locally() {
        let map = PatchMap::decompose(Lattice::cubic(10.0), [1, 1, 1], 1);
        let mut p = home(&map, 0, vec![atom(1, 9.9, 0.3)]);
        let (out, report) = advance_to_migration(&mut p, &Topology::uniform(1, 1));
        assert!(out.is_empty());
        assert_eq!(report.wrapped, 1);
        assert_eq!(p.state(), HomePatchState::Ready);
        assert_relative_eq!(p.atoms()[0].position.x, 0.2, epsilon = 1e-9);
    }

    #[test]
    fn test_deposits_before_migration_are_held() {
        let map = two_patch_map();
        let topo = Topology::uniform(1, 2);
        let mut p0 = home(&map, 0, vec![atom(1, 9.8, 0.5)]);
        let mut p1 = home(&map, 1, vec![]);

        let (out0, _) = advance_to_migration(&mut p0, &topo);
        p1.publish(0, &topo).unwrap();
        for msg in out0 {
            p1.receive_migration(msg).unwrap();
        }
        assert_eq!(p1.num_atoms(), 0);

        p1.collect_forces().unwrap();
        p1.integrate(1.0).unwrap();
        let (_out1, _) = p1.begin_migration().unwrap();
        assert_eq!(p1.num_atoms(), 1);
        assert_eq!(p1.state(), HomePatchState::Ready);
    }

    #[test]
    fn test_misaddressed_deposit_is_fatal() {
        let map = two_patch_map();
        let mut p0 = home(&map, 0, vec![]);
        let msg = MigrateAtoms {
            source: PatchId(1),
            dest: PatchId(1),
            direction: Lattice::index(-1, 0, 0),
            step: 0,
            atoms: vec![],
        };
        assert!(matches!(
            p0.receive_migration(msg),
            Err(PatchError::MisaddressedDeposit { intended: PatchId(1), actual: PatchId(0) })
        ));
    }

    #[test]
    fn test_non_neighbor_source_is_fatal() {
        let lattice = Lattice::new(Vector3::zeros(), Vector3::new(40.0, 10.0, 10.0), [true; 3]);
        let map = PatchMap::decompose(lattice, [4, 1, 1], 1);
        let mut p0 = home(&map, 0, vec![]);
        let msg = MigrateAtoms {
            source: PatchId(2),
            dest: PatchId(0),
            direction: Lattice::index(-1, 0, 0),
            step: 0,
            atoms: vec![],
        };
        assert!(matches!(
            p0.receive_migration(msg),
            Err(PatchError::UnexpectedMigrationSource { source_patch: PatchId(2), .. })
        ));
    }

    #[test]
    fn test_deposit_outside_region_is_fatal() {
        let lattice = Lattice::new(Vector3::zeros(), Vector3::new(40.0, 10.0, 10.0), [true; 3]);
        let map = PatchMap::decompose(lattice, [4, 1, 1], 1);
        let topo = Topology::uniform(1, 1);
        let mut p0 = home(&map, 0, vec![]);
        advance_to_migration(&mut p0, &topo);
        let msg = MigrateAtoms {
            source: PatchId(1),
            dest: PatchId(0),
            direction: Lattice::index(-1, 0, 0),
            step: 0,
            atoms: vec![atom(9, 27.0, 0.0)],
        };
        assert!(matches!(
            p0.receive_migration(msg),
            Err(PatchError::DepositOutOfRegion { atom: AtomId(9), .. })
        ));
    }

    #[test]
    fn test_duplicate_atom_and_duplicate_slot() {
        let map = two_patch_map();
        let topo = Topology::uniform(1, 2);
        let mut p1 = home(&map, 1, vec![atom(1, 12.0, 0.0)]);
        advance_to_migration(&mut p1, &topo);

        let mut msg = MigrateAtoms {
            source: PatchId(0),
            dest: PatchId(1),
            direction: Lattice::index(1, 0, 0),
            step: 0,
            atoms: vec![atom(2, 10.5, 0.0)],
        };
        p1.receive_migration(msg.clone()).unwrap();
        // Same slot again: skipped, nothing appended.
        p1.receive_migration(msg.clone()).unwrap();
        assert_eq!(p1.num_atoms(), 2);
        assert_eq!(p1.migration_remaining(), 17);

        msg.direction = Lattice::index(1, 1, 0);
        msg.atoms = vec![atom(1, 10.6, 0.0)];
        assert!(matches!(
            p1.receive_migration(msg),
            Err(PatchError::DuplicateAtom { atom: AtomId(1), .. })
        ));
    }

    #[test]
    fn test_duplicate_after_settle_is_skipped() {
        let map = two_patch_map();
        let topo = Topology::uniform(1, 2);
        let mut p0 = home(&map, 0, vec![atom(1, 9.8, 0.5)]);
        let mut p1 = home(&map, 1, vec![atom(2, 15.0, 0.0)]);

        let (out0, _) = advance_to_migration(&mut p0, &topo);
        let (out1, _) = advance_to_migration(&mut p1, &topo);
        let carrying = out0.iter().find(|m| !m.atoms.is_empty()).unwrap().clone();
        for msg in out0 {
            p1.receive_migration(msg).unwrap();
        }
        for msg in out1 {
            p0.receive_migration(msg).unwrap();
        }
        assert_eq!(p1.state(), HomePatchState::Ready);
        assert_eq!(p1.num_atoms(), 2);

        p1.receive_migration(carrying).unwrap();
        assert_eq!(p1.state(), HomePatchState::Ready);
        assert_eq!(p1.num_atoms(), 2);
        assert_eq!(p1.step(), 1);
        assert_eq!(p1.migration_remaining(), 0);
    }

    fn next_up(x: f64) -> f64 {
        if x >= 0.0 {
            f64::from_bits(x.to_bits() + 1)
        } else {
            f64::from_bits(x.to_bits() - 1)
        }
    }

    fn next_down(x: f64) -> f64 {
        -next_up(-x)
    }

    #[test]
    fn test_wrap_into_accepts_positions_one_ulp_from_faces() {
        for (origin, length, dims) in [(1.3, 10.0, 7u32), (-4.1, 3.7, 5), (0.25, 21.0, 3)] {
            let lattice = Lattice::new(
                Vector3::new(origin, 0.0, 0.0),
                Vector3::new(length, 10.0, 10.0),
                [true; 3],
            );
            let map = PatchMap::decompose(lattice, [dims, 1, 1], 1);
            for id in 0..dims {
                let p = home(&map, id, vec![]);
                let extents = *p.extents();
                for face in [extents.min.x, extents.max.x] {
                    let x0 = lattice.unscale(&Vector3::new(face, 0.5, 0.5)).x;
                    let mut below = x0;
                    let mut above = x0;
                    let mut xs = vec![x0];
                    for _ in 0..64 {
                        below = next_down(below);
                        above = next_up(above);
                        xs.push(below);
                        xs.push(above);
                    }
                    for x in xs {
                        let pos = Vector3::new(x, 5.0, 5.0);
                        if !extents.contains(&lattice.scale(&pos)) {
                            continue;
                        }
                        let (same, s) = p.wrap_into(&pos);
                        assert_eq!(same, pos, "patch {id} moved x {x}");
                        assert!(extents.contains(&s), "patch {id} rejected x {x}");

                        for image in [pos.x + length, pos.x - length] {
                            let (_, s) = p.wrap_into(&Vector3::new(image, 5.0, 5.0));
                            assert!(extents.contains(&s), "patch {id} rejected image {image} of x {x}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_migration_capacity() {
        let map = two_patch_map();
        let mut config = PatchConfig::default();
        config.migration_capacity = 1;
        let mut p0 = HomePatch::new(
            map.record(PatchId(0)).unwrap(),
            *map.lattice(),
            vec![atom(1, 9.9, 0.5), atom(2, 9.8, 0.5)],
            config,
        );
        p0.publish(0, &Topology::uniform(1, 2)).unwrap();
        p0.collect_forces().unwrap();
        p0.integrate(1.0).unwrap();
        assert!(matches!(
            p0.begin_migration(),
            Err(PatchError::CapacityExceeded { capacity: 1, .. })
        ));
    }

    #[test]
    fn test_proxy_protocol() {
        let map = two_patch_map();
        let topo = Topology::uniform(2, 2);
        let mut p0 = home(&map, 0, vec![atom(1, 3.0, 0.0), atom(2, 4.0, 0.0)]);

        p0.register_proxy(NodeId(1)).unwrap();
        p0.register_proxy(NodeId(2)).unwrap();
        assert!(matches!(
            p0.register_proxy(NodeId(1)),
            Err(PatchError::DuplicateProxy { .. })
        ));

        let trees = p0.publish(0, &topo).unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(p0.state(), HomePatchState::AwaitingTreeAck);
        assert!(matches!(
            p0.receive_tree_ack(NodeId(1), 0),
            Err(PatchError::StaleSpanningTree { expected: 1, got: 0, .. })
        ));
        assert!(p0.receive_tree_ack(NodeId(1), 1).unwrap().is_empty());
        let data = p0.receive_tree_ack(NodeId(2), 1).unwrap();
        let targets: Vec<NodeId> = data.iter().map(|(n, _)| *n).collect();
        assert_eq!(targets, vec![NodeId(1), NodeId(2)]);
        assert_eq!(p0.state(), HomePatchState::AwaitingForces);

        let mut forces = ForceResults::zeroed(2);
        forces.accumulate(ForceClass::Nonbonded, &[Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()]);
        assert!(matches!(
            p0.receive_results(NodeId(3), 0, &forces),
            Err(PatchError::UnknownProxy { node: NodeId(3), .. })
        ));
        p0.receive_results(NodeId(1), 0, &forces).unwrap();
        assert!(!p0.forces_complete());
        p0.receive_results(NodeId(2), 0, &forces).unwrap();
        assert!(p0.forces_complete());
        p0.collect_forces().unwrap();
        assert_eq!(p0.atoms()[0].forces[ForceClass::Nonbonded.index()], Vector3::new(2.0, 0.0, 0.0));

        // Same proxy set: the next step publishes without a tree round.
        p0.integrate(1.0).unwrap();
        p0.finish_step().unwrap();
        assert_eq!(p0.publish(1, &topo).unwrap().len(), 2);
        assert_eq!(p0.state(), HomePatchState::AwaitingForces);
        assert_eq!(p0.tree().version, 1);
    }

    #[test]
    fn test_unregister_unknown_proxy() {
        let map = two_patch_map();
        let mut p0 = home(&map, 0, vec![]);
        assert!(matches!(
            p0.unregister_proxy(NodeId(4)),
            Err(PatchError::UnknownProxy { .. })
        ));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let map = two_patch_map();
        let topo = Topology::uniform(1, 2);
        let mut p0 = home(&map, 0, vec![atom(1, 2.0, 0.5), atom(2, 4.0, -0.25)]);
        let before = p0.atoms().to_vec();
        p0.checkpoint("start").unwrap();

        p0.publish(0, &topo).unwrap();
        assert!(p0.checkpoint("mid").is_err());
        p0.collect_forces().unwrap();
        p0.integrate(1.0).unwrap();
        p0.finish_step().unwrap();
        assert_ne!(p0.atoms(), before.as_slice());

        p0.revert("start").unwrap();
        assert_eq!(p0.atoms(), before.as_slice());
        assert_eq!(p0.step(), 1);
        assert_eq!(p0.checkpoint_tags(), vec!["start".to_string()]);

        p0.discard_checkpoint("start").unwrap();
        assert!(matches!(p0.revert("start"), Err(PatchError::UnknownCheckpoint { .. })));
        assert!(p0.discard_checkpoint("start").is_err());
    }

    #[test]
    fn test_margin_violations_counted_without_migration() {
        let map = two_patch_map();
        let mut p0 = home(&map, 0, vec![atom(1, 9.0, 2.0), atom(2, 5.0, 0.0)]);
        p0.publish(0, &Topology::uniform(1, 2)).unwrap();
        p0.collect_forces().unwrap();
        p0.integrate(1.0).unwrap();
        p0.finish_step().unwrap();
        assert_eq!(p0.margin_violations(), 1);
        assert_eq!(p0.num_atoms(), 2);
    }
}
