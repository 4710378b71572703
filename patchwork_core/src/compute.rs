//! Force computations over one or two patches.
//!
//! The set of compute kinds is closed. Numeric work is delegated to a
//! [`ForceKernel`] or [`LongRangeSolver`] supplied by the caller; this
//! module only handles dispatch, shape checks, and load statistics.

use crate::atom::{CompAtom, ForceClass};
use crate::error::{PatchError, PatchResult};
use crate::lattice::Lattice;
use crate::patch::PatchId;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputeId(pub u32);

impl std::fmt::Display for ComputeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Closed set of computation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComputeKind {
    /// Short-range interactions inside one patch
    NonbondedSelf,
    /// Short-range interactions between two neighboring patches
    NonbondedPair,
    /// Bonded terms of one patch
    BondedSelf,
    /// Long-range (slow) contribution for one patch
    LongRange,
}

impl ComputeKind {
    pub fn num_patches(self) -> usize {
        match self {
            ComputeKind::NonbondedPair => 2,
            _ => 1,
        }
    }

    /// Force class this kind deposits into.
    pub fn force_class(self) -> ForceClass {
        match self {
            ComputeKind::NonbondedSelf | ComputeKind::NonbondedPair => ForceClass::Nonbonded,
            ComputeKind::BondedSelf => ForceClass::Normal,
            ComputeKind::LongRange => ForceClass::Slow,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ComputeKind::NonbondedSelf => "nonbonded-self",
            ComputeKind::NonbondedPair => "nonbonded-pair",
            ComputeKind::BondedSelf => "bonded-self",
            ComputeKind::LongRange => "long-range",
        }
    }
}

impl std::fmt::Display for ComputeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Forces for each input patch (index-aligned with its positions), the
/// energy of the evaluation, and how many interactions were evaluated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KernelOutput {
    pub forces: Vec<Vec<Vector3<f64>>>,
    pub energy: f64,
    pub interactions: u64,
}

impl KernelOutput {
    /// Zero forces shaped like `patches`.
    pub fn zeroed(patches: &[&[CompAtom]]) -> Self {
        Self {
            forces: patches.iter().map(|p| vec![Vector3::zeros(); p.len()]).collect(),
            energy: 0.0,
            interactions: 0,
        }
    }
}

/// Short-range and bonded force evaluation.
pub trait ForceKernel: Send + Sync {
    /// Evaluates `kind` over `patches` (one entry for self kinds, two for
    /// pairs). Periodic images are resolved through `lattice`.
    fn evaluate(&self, kind: ComputeKind, lattice: &Lattice, patches: &[&[CompAtom]]) -> KernelOutput;
}

/// Long-range solver for one patch's atoms.
pub trait LongRangeSolver: Send + Sync {
    fn solve(&self, lattice: &Lattice, atoms: &[CompAtom]) -> KernelOutput;
}

/// Load statistics a balancing policy can read.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComputeStats {
    pub steps: u64,
    pub interactions: u64,
    pub energy: f64,
}

/// Lifecycle every compute goes through on the node that runs it.
pub trait ComputeCapability {
    /// Called once when the compute is attached to a node.
    fn initialize(&mut self);

    /// Evaluates one step over the opened position snapshots.
    fn compute(&mut self, lattice: &Lattice, positions: &[&[CompAtom]]) -> PatchResult<KernelOutput>;

    /// Called when the compute leaves the node; returns accumulated stats.
    fn finalize(&mut self) -> ComputeStats;
}

/// Numeric backend behind a compute.
#[derive(Clone)]
pub enum ComputeBackend {
    Kernel(Arc<dyn ForceKernel>),
    LongRange(Arc<dyn LongRangeSolver>),
}

impl std::fmt::Debug for ComputeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeBackend::Kernel(_) => f.write_str("Kernel"),
            ComputeBackend::LongRange(_) => f.write_str("LongRange"),
        }
    }
}

#[derive(Debug)]
pub struct Compute {
    id: ComputeId,
    kind: ComputeKind,
    patches: Vec<PatchId>,
    backend: ComputeBackend,
    stats: ComputeStats,
    initialized: bool,
}

impl Compute {
    /// Creates a compute, picking the backend its kind needs.
    pub fn new(
        id: ComputeId,
        kind: ComputeKind,
        patches: Vec<PatchId>,
        kernel: &Arc<dyn ForceKernel>,
        solver: Option<&Arc<dyn LongRangeSolver>>,
    ) -> PatchResult<Self> {
        if patches.len() != kind.num_patches() {
            return Err(PatchError::InvalidCompute {
                cid: id,
                reason: format!("{kind} needs {} patches, got {}", kind.num_patches(), patches.len()),
            });
        }
        let backend = match kind {
            ComputeKind::LongRange => match solver {
                Some(solver) => ComputeBackend::LongRange(Arc::clone(solver)),
                None => {
                    return Err(PatchError::InvalidCompute {
                        cid: id,
                        reason: "no long-range solver configured".to_string(),
                    })
                }
            },
            _ => ComputeBackend::Kernel(Arc::clone(kernel)),
        };
        Ok(Self {
            id,
            kind,
            patches,
            backend,
            stats: ComputeStats::default(),
            initialized: false,
        })
    }

    pub fn id(&self) -> ComputeId {
        self.id
    }

    pub fn kind(&self) -> ComputeKind {
        self.kind
    }

    pub fn patches(&self) -> &[PatchId] {
        &self.patches
    }

    pub fn stats(&self) -> ComputeStats {
        self.stats
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn check_shape(&self, positions: &[&[CompAtom]], output: &KernelOutput) -> PatchResult<()> {
        if output.forces.len() != positions.len() {
            return Err(PatchError::InvalidCompute {
                cid: self.id,
                reason: format!(
                    "kernel returned {} force lists for {} patches",
                    output.forces.len(),
                    positions.len()
                ),
            });
        }
        for ((pid, pos), forces) in self.patches.iter().zip(positions).zip(&output.forces) {
            if pos.len() != forces.len() {
                return Err(PatchError::ResultSizeMismatch {
                    patch: *pid,
                    expected: pos.len(),
                    got: forces.len(),
                });
            }
        }
        Ok(())
    }
}

impl ComputeCapability for Compute {
    fn initialize(&mut self) {
        self.stats = ComputeStats::default();
        self.initialized = true;
    }

    fn compute(&mut self, lattice: &Lattice, positions: &[&[CompAtom]]) -> PatchResult<KernelOutput> {
        if positions.len() != self.patches.len() {
            return Err(PatchError::InvalidCompute {
                cid: self.id,
                reason: format!("opened {} patches, expected {}", positions.len(), self.patches.len()),
            });
        }
        let output = match &self.backend {
            ComputeBackend::Kernel(kernel) => kernel.evaluate(self.kind, lattice, positions),
            ComputeBackend::LongRange(solver) => {
                let mut out = solver.solve(lattice, positions[0]);
                if out.forces.is_empty() {
                    out.forces.push(vec![Vector3::zeros(); positions[0].len()]);
                }
                out
            }
        };
        self.check_shape(positions, &output)?;
        self.stats.steps += 1;
        self.stats.interactions += output.interactions;
        self.stats.energy += output.energy;
        Ok(output)
    }

    fn finalize(&mut self) -> ComputeStats {
        self.initialized = false;
        self.stats
    }
}
