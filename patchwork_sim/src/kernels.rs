//! Reference force kernels.
//!
//! Just enough physics to make atoms move and cross patch faces. The
//! harness checks the replication and migration protocol, not the numbers.

use nalgebra::Vector3;
use patchwork_core::{CompAtom, ComputeKind, ForceKernel, KernelOutput, Lattice, LongRangeSolver};

/// Purely repulsive soft sphere: `U(r) = epsilon * (1 - r/cutoff)^2` for
/// `r < cutoff`.
#[derive(Debug, Clone, Copy)]
pub struct SoftSphereKernel {
    pub cutoff: f64,
    pub epsilon: f64,
}

impl SoftSphereKernel {
    pub fn new(cutoff: f64, epsilon: f64) -> Self {
        Self { cutoff, epsilon }
    }

    /// Energy and force on `a` for separation `d = a - b`, if within range.
    fn interact(&self, d: &Vector3<f64>) -> Option<(f64, Vector3<f64>)> {
        let r = d.norm();
        if r >= self.cutoff || r == 0.0 {
            return None;
        }
        let x = 1.0 - r / self.cutoff;
        let energy = self.epsilon * x * x;
        let magnitude = 2.0 * self.epsilon * x / self.cutoff;
        Some((energy, d * (magnitude / r)))
    }
}

impl ForceKernel for SoftSphereKernel {
    fn evaluate(&self, kind: ComputeKind, lattice: &Lattice, patches: &[&[CompAtom]]) -> KernelOutput {
        let mut out = KernelOutput::zeroed(patches);
        match (kind, patches) {
            (ComputeKind::NonbondedSelf, [atoms]) => {
                for i in 0..atoms.len() {
                    for j in (i + 1)..atoms.len() {
                        let d = lattice.delta(&atoms[i].position, &atoms[j].position);
                        if let Some((energy, force)) = self.interact(&d) {
                            out.forces[0][i] += force;
                            out.forces[0][j] -= force;
                            out.energy += energy;
                            out.interactions += 1;
                        }
                    }
                }
            }
            (ComputeKind::NonbondedPair, [first, second]) => {
                for (i, a) in first.iter().enumerate() {
                    for (j, b) in second.iter().enumerate() {
                        let d = lattice.delta(&a.position, &b.position);
                        if let Some((energy, force)) = self.interact(&d) {
                            out.forces[0][i] += force;
                            out.forces[1][j] -= force;
                            out.energy += energy;
                            out.interactions += 1;
                        }
                    }
                }
            }
            // No bond list in the harness; bonded computes deposit zeros.
            _ => {}
        }
        out
    }
}

/// Self-energy term of an Ewald sum. Contributes energy but no force, which
/// is enough to run slow-force computes through the protocol.
#[derive(Debug, Clone, Copy)]
pub struct EwaldSelfSolver {
    pub alpha: f64,
}

impl EwaldSelfSolver {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }
}

impl LongRangeSolver for EwaldSelfSolver {
    fn solve(&self, _lattice: &Lattice, atoms: &[CompAtom]) -> KernelOutput {
        let sum_q2: f64 = atoms.iter().map(|a| a.charge * a.charge).sum();
        let mut out = KernelOutput::zeroed(&[atoms]);
        out.energy = -self.alpha / std::f64::consts::PI.sqrt() * sum_q2;
        out.interactions = atoms.len() as u64;
        out
    }
}
