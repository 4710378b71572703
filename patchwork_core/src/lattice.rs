//! Orthorhombic periodic cell.
//!
//! Patches are laid out in *scaled* coordinates, where the cell spans
//! `[0, 1)` along every axis. Periodic axes wrap; non-periodic axes only use
//! the cell length as the decomposition scale.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Index of the identity transform (no shift along any axis).
pub const SELF_TRANSFORM: u8 = 13;

/// Number of transforms including the identity.
pub const NUM_TRANSFORMS: usize = 27;

/// Simulation cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    /// Corner of the cell (scaled coordinate zero)
    pub origin: Vector3<f64>,

    /// Edge lengths along x, y, z
    pub lengths: Vector3<f64>,

    /// Whether each axis wraps around
    pub periodic: [bool; 3],
}

impl Lattice {
    /// Creates a cell. Edge lengths must be positive.
    pub fn new(origin: Vector3<f64>, lengths: Vector3<f64>, periodic: [bool; 3]) -> Self {
        debug_assert!(lengths.iter().all(|l| *l > 0.0), "lattice lengths must be positive");
        Self {
            origin,
            lengths,
            periodic,
        }
    }

    /// Fully periodic cube anchored at the origin.
    pub fn cubic(length: f64) -> Self {
        Self::new(Vector3::zeros(), Vector3::repeat(length), [true; 3])
    }

    /// Maps a transformation triplet onto a single index in `0..27`.
    pub fn index(i: i32, j: i32, k: i32) -> u8 {
        (9 * (k + 1) + 3 * (j + 1) + (i + 1)) as u8
    }

    /// Inverse of [`Lattice::index`].
    pub fn offsets(index: u8) -> [i32; 3] {
        let index = index as i32;
        [index % 3 - 1, (index / 3) % 3 - 1, index / 9 - 1]
    }

    /// Index of the opposite transform.
    pub fn opposite(index: u8) -> u8 {
        26 - index
    }

    /// Cartesian to scaled coordinates.
    pub fn scale(&self, p: &Vector3<f64>) -> Vector3<f64> {
        (p - self.origin).component_div(&self.lengths)
    }

    /// Scaled to Cartesian coordinates.
    pub fn unscale(&self, s: &Vector3<f64>) -> Vector3<f64> {
        self.origin + s.component_mul(&self.lengths)
    }

    /// Returns the periodic image of `p` nearest to the scaled reference
    /// point `reference`. Non-periodic axes are left untouched.
    pub fn nearest(&self, p: &Vector3<f64>, reference: &Vector3<f64>) -> Vector3<f64> {
        let s = self.scale(p);
        let mut p = *p;
        for axis in 0..3 {
            if self.periodic[axis] && reference[axis].is_finite() {
                let k = (s[axis] - reference[axis]).round();
                if k != 0.0 {
                    p[axis] -= k * self.lengths[axis];
                }
            }
        }
        p
    }

    /// Shortest vector from `p2` to `p1` under the minimum-image convention.
    pub fn delta(&self, p1: &Vector3<f64>, p2: &Vector3<f64>) -> Vector3<f64> {
        let mut d = p1 - p2;
        for axis in 0..3 {
            if self.periodic[axis] {
                let l = self.lengths[axis];
                d[axis] -= l * (d[axis] / l).round();
            }
        }
        d
    }

}
