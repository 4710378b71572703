//! Particle records and per-class force buffers.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Globally unique particle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AtomId(pub u64);

impl std::fmt::Display for AtomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Interaction class a force contribution belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForceClass {
    /// Local / bonded terms
    Normal,
    /// Short-range nonbonded terms
    Nonbonded,
    /// Long-range (reciprocal space) terms
    Slow,
}

impl ForceClass {
    pub const ALL: [ForceClass; 3] = [ForceClass::Normal, ForceClass::Nonbonded, ForceClass::Slow];

    pub fn index(self) -> usize {
        match self {
            ForceClass::Normal => 0,
            ForceClass::Nonbonded => 1,
            ForceClass::Slow => 2,
        }
    }
}

/// Authoritative particle state. Lives in exactly one home patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullAtom {
    pub id: AtomId,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    /// Accumulated forces, indexed by [`ForceClass::index`]
    pub forces: [Vector3<f64>; 3],
    pub mass: f64,
    pub charge: f64,
    pub type_id: u32,
}

impl FullAtom {
    /// Creates a unit-mass neutral atom at rest.
    pub fn new(id: AtomId, position: Vector3<f64>) -> Self {
        Self {
            id,
            position,
            velocity: Vector3::zeros(),
            forces: [Vector3::zeros(); 3],
            mass: 1.0,
            charge: 0.0,
            type_id: 0,
        }
    }

    pub fn with_velocity(mut self, velocity: Vector3<f64>) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_properties(mut self, mass: f64, charge: f64, type_id: u32) -> Self {
        self.mass = mass;
        self.charge = charge;
        self.type_id = type_id;
        self
    }

    /// Sum of all force classes.
    pub fn total_force(&self) -> Vector3<f64> {
        self.forces.iter().sum()
    }

    pub fn clear_forces(&mut self) {
        self.forces = [Vector3::zeros(); 3];
    }

    /// Read-only record published to computes and proxies.
    pub fn comp_atom(&self) -> CompAtom {
        CompAtom {
            id: self.id,
            position: self.position,
            charge: self.charge,
            type_id: self.type_id,
        }
    }
}

/// Position snapshot record handed to computations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompAtom {
    pub id: AtomId,
    pub position: Vector3<f64>,
    pub charge: f64,
    pub type_id: u32,
}

/// Per-class force buffers, index-aligned with a published position list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceResults {
    forces: [Vec<Vector3<f64>>; 3],
}

impl ForceResults {
    /// Zeroed buffers for `len` atoms.
    pub fn zeroed(len: usize) -> Self {
        Self {
            forces: [
                vec![Vector3::zeros(); len],
                vec![Vector3::zeros(); len],
                vec![Vector3::zeros(); len],
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.forces[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn class(&self, class: ForceClass) -> &[Vector3<f64>] {
        &self.forces[class.index()]
    }

    pub fn class_mut(&mut self, class: ForceClass) -> &mut [Vector3<f64>] {
        &mut self.forces[class.index()]
    }

    /// Adds `contribution` to the buffers of `class`.
    ///
    /// Panics in debug builds if lengths differ; callers size contributions
    /// from the same snapshot.
    pub fn accumulate(&mut self, class: ForceClass, contribution: &[Vector3<f64>]) {
        debug_assert_eq!(contribution.len(), self.len());
        for (dst, src) in self.forces[class.index()].iter_mut().zip(contribution) {
            *dst += src;
        }
    }

    /// Adds every class of `other` into `self`.
    pub fn merge(&mut self, other: &ForceResults) {
        for class in ForceClass::ALL {
            self.accumulate(class, other.class(class));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_results_merge() {
        let mut a = ForceResults::zeroed(2);
        let mut b = ForceResults::zeroed(2);
        a.accumulate(ForceClass::Nonbonded, &[Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()]);
        b.accumulate(ForceClass::Nonbonded, &[Vector3::new(2.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)]);
        b.accumulate(ForceClass::Slow, &[Vector3::new(0.0, 0.0, 3.0), Vector3::zeros()]);
        a.merge(&b);

        assert_eq!(a.class(ForceClass::Nonbonded)[0], Vector3::new(3.0, 0.0, 0.0));
        assert_eq!(a.class(ForceClass::Nonbonded)[1], Vector3::new(0.0, 1.0, 0.0));
        assert_eq!(a.class(ForceClass::Slow)[0], Vector3::new(0.0, 0.0, 3.0));
        assert!(a.class(ForceClass::Normal).iter().all(|f| *f == Vector3::zeros()));
    }

    #[test]
    fn test_total_force_sums_classes() {
        let mut atom = FullAtom::new(AtomId(1), Vector3::zeros());
        atom.forces[0] = Vector3::new(1.0, 0.0, 0.0);
        atom.forces[2] = Vector3::new(0.5, 0.0, 0.0);
        assert_eq!(atom.total_force(), Vector3::new(1.5, 0.0, 0.0));
        atom.clear_forces();
        assert_eq!(atom.total_force(), Vector3::zeros());
    }
}
