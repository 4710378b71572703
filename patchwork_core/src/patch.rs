//! Base patch: a spatial cell and the two boxes it publishes through.
//!
//! Both [`crate::home_patch::HomePatch`] and [`crate::proxy::ProxyPatch`]
//! wrap a `Patch`. Computations never see which kind they talk to; they
//! register as users of the position box (read) and the force box (write).

use crate::atom::{CompAtom, ForceResults};
use crate::error::{PatchError, PatchResult};
use crate::rendezvous::{BoxEvent, BoxUserId, OwnerBox};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Patch identifier, unique within the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchId(pub u32);

impl PatchId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Region owned by a patch, in scaled coordinates.
///
/// The interval is half-open, `[min, max)`. Faces on the outside of a
/// non-periodic axis are infinite so nothing can leave through them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchExtents {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
    pub center: Vector3<f64>,
}

impl PatchExtents {
    /// Extents with the center at the midpoint.
    pub fn new(min: Vector3<f64>, max: Vector3<f64>) -> Self {
        Self {
            min,
            max,
            center: (min + max) * 0.5,
        }
    }

    /// Extents with an explicit center (required when a face is infinite).
    pub fn with_center(min: Vector3<f64>, max: Vector3<f64>, center: Vector3<f64>) -> Self {
        Self { min, max, center }
    }

    pub fn contains(&self, s: &Vector3<f64>) -> bool {
        (0..3).all(|a| s[a] >= self.min[a] && s[a] < self.max[a])
    }

    /// Per-axis offset of `s` relative to the region: -1 below, +1 at or
    /// above the upper face, 0 inside.
    pub fn classify(&self, s: &Vector3<f64>) -> [i32; 3] {
        let mut out = [0; 3];
        for a in 0..3 {
            out[a] = if s[a] < self.min[a] {
                -1
            } else if s[a] >= self.max[a] {
                1
            } else {
                0
            };
        }
        out
    }

    /// Whether `s` lies beyond the region grown by `margin` (scaled, per axis).
    pub fn violates_margin(&self, s: &Vector3<f64>, margin: &Vector3<f64>) -> bool {
        (0..3).any(|a| s[a] < self.min[a] - margin[a] || s[a] >= self.max[a] + margin[a])
    }
}

/// Published position snapshot; shared read-only between computes.
pub type PositionSnapshot = Arc<Vec<CompAtom>>;

/// Spatial cell plus its position/force rendezvous.
#[derive(Debug)]
pub struct Patch {
    id: PatchId,
    extents: PatchExtents,
    positions: OwnerBox<PositionSnapshot>,
    forces: OwnerBox<ForceResults>,
    step: Option<u64>,
    num_atoms: usize,
}

impl Patch {
    pub fn new(id: PatchId, extents: PatchExtents) -> Self {
        Self {
            id,
            extents,
            positions: OwnerBox::new(),
            forces: OwnerBox::new(),
            step: None,
            num_atoms: 0,
        }
    }

    pub fn id(&self) -> PatchId {
        self.id
    }

    pub fn extents(&self) -> &PatchExtents {
        &self.extents
    }

    /// Step of the most recent publication.
    pub fn step(&self) -> Option<u64> {
        self.step
    }

    /// Atom count of the most recent publication.
    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    pub fn register_position_pickup(&mut self) -> PatchResult<BoxUserId> {
        self.positions.register().map_err(|e| PatchError::boxed(self.id, e))
    }

    pub fn unregister_position_pickup(&mut self, user: BoxUserId) -> PatchResult<()> {
        self.positions.unregister(user).map_err(|e| PatchError::boxed(self.id, e))
    }

    pub fn register_force_deposit(&mut self) -> PatchResult<BoxUserId> {
        self.forces.register().map_err(|e| PatchError::boxed(self.id, e))
    }

    pub fn unregister_force_deposit(&mut self, user: BoxUserId) -> PatchResult<()> {
        self.forces.unregister(user).map_err(|e| PatchError::boxed(self.id, e))
    }

    /// Arms both boxes for `step`: positions with `snapshot`, forces with
    /// zeroed buffers of the same length.
    pub fn publish(&mut self, step: u64, snapshot: PositionSnapshot) -> PatchResult<()> {
        let len = snapshot.len();
        self.positions
            .arm(snapshot)
            .map_err(|e| PatchError::boxed(self.id, e))?;
        self.forces
            .arm(ForceResults::zeroed(len))
            .map_err(|e| PatchError::boxed(self.id, e))?;
        self.step = Some(step);
        self.num_atoms = len;
        Ok(())
    }

    pub fn open_positions(&mut self, user: BoxUserId) -> PatchResult<PositionSnapshot> {
        self.positions
            .open(user)
            .map(Arc::clone)
            .map_err(|e| PatchError::boxed(self.id, e))
    }

    pub fn close_positions(&mut self, user: BoxUserId) -> PatchResult<BoxEvent> {
        self.positions.close(user).map_err(|e| PatchError::boxed(self.id, e))
    }

    pub fn open_forces(&mut self, user: BoxUserId) -> PatchResult<&mut ForceResults> {
        let id = self.id;
        self.forces.open_mut(user).map_err(|e| PatchError::boxed(id, e))
    }

    pub fn close_forces(&mut self, user: BoxUserId) -> PatchResult<BoxEvent> {
        self.forces.close(user).map_err(|e| PatchError::boxed(self.id, e))
    }

    /// All force contributors closed for the current cycle.
    pub fn forces_done(&self) -> bool {
        self.forces.is_drained()
    }

    /// Reclaims the accumulated forces once every contributor closed.
    pub fn take_forces(&mut self) -> PatchResult<ForceResults> {
        self.forces.take().map_err(|e| PatchError::boxed(self.id, e))
    }

    /// Whether `user` still owes an open/close on either box.
    pub fn has_pending(&self, position_user: BoxUserId, force_user: BoxUserId) -> bool {
        self.positions.is_pending_for(position_user) || self.forces.is_pending_for(force_user)
    }

    pub fn num_position_users(&self) -> usize {
        self.positions.num_users()
    }

    pub fn num_force_users(&self) -> usize {
        self.forces.num_users()
    }
}
