//! Decomposition registry: which patch covers which region, which node
//! owns it, and which patch sits in each of its 26 neighbor directions.
//!
//! Neighbors are stored as `(direction, PatchId)` slots in an arena rather
//! than as references between patches. A direction whose neighbor is the
//! patch itself (a periodic axis split into a single patch) has no slot;
//! atoms moving that way are wrapped locally.

use crate::error::{PatchError, PatchResult};
use crate::lattice::{Lattice, NUM_TRANSFORMS, SELF_TRANSFORM};
use crate::patch::{PatchExtents, PatchId};
use nalgebra::Vector3;
use patchwork_env::NodeId;
use serde::{Deserialize, Serialize};

/// One neighbor relation seen from the owning patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborSlot {
    /// Transform index of the direction toward the neighbor
    pub direction: u8,
    pub patch: PatchId,
}

/// Static per-patch data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub id: PatchId,
    pub grid: [u32; 3],
    pub extents: PatchExtents,
    pub home: NodeId,
    pub neighbors: Vec<NeighborSlot>,
}

impl PatchRecord {
    /// Neighbor in `direction`, if it is a slot.
    pub fn neighbor(&self, direction: u8) -> Option<PatchId> {
        self.neighbors
            .iter()
            .find(|slot| slot.direction == direction)
            .map(|slot| slot.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchMap {
    lattice: Lattice,
    dims: [u32; 3],
    records: Vec<PatchRecord>,
}

impl PatchMap {
    /// Splits `lattice` into `dims` patches, x fastest. Homes are assigned
    /// in contiguous blocks over `num_nodes` nodes.
    pub fn decompose(lattice: Lattice, dims: [u32; 3], num_nodes: usize) -> Self {
        let total = dims.iter().map(|d| *d as usize).product::<usize>();
        let nodes = num_nodes.max(1);
        Self::decompose_with(lattice, dims, |id, _| {
            NodeId((id.index() * nodes / total.max(1)) as u32)
        })
    }

    /// Splits `lattice` into `dims` patches with an explicit home assignment.
    pub fn decompose_with(
        lattice: Lattice,
        dims: [u32; 3],
        mut home_of: impl FnMut(PatchId, [u32; 3]) -> NodeId,
    ) -> Self {
        let dims = [dims[0].max(1), dims[1].max(1), dims[2].max(1)];
        let mut records = Vec::with_capacity((dims[0] * dims[1] * dims[2]) as usize);

        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let grid = [i, j, k];
                    let id = PatchId(Self::linear(&dims, grid));
                    records.push(PatchRecord {
                        id,
                        grid,
                        extents: Self::extents_for(&lattice, &dims, grid),
                        home: home_of(id, grid),
                        neighbors: Self::neighbors_for(&lattice, &dims, grid),
                    });
                }
            }
        }

        Self {
            lattice,
            dims,
            records,
        }
    }

    fn linear(dims: &[u32; 3], grid: [u32; 3]) -> u32 {
        grid[0] + dims[0] * (grid[1] + dims[1] * grid[2])
    }

    fn extents_for(lattice: &Lattice, dims: &[u32; 3], grid: [u32; 3]) -> PatchExtents {
        let mut min = Vector3::zeros();
        let mut max = Vector3::zeros();
        let mut center = Vector3::zeros();
        for a in 0..3 {
            let n = dims[a] as f64;
            let g = grid[a] as f64;
            min[a] = g / n;
            max[a] = (g + 1.0) / n;
            center[a] = (g + 0.5) / n;
            if !lattice.periodic[a] {
                if grid[a] == 0 {
                    min[a] = f64::NEG_INFINITY;
                }
                if grid[a] + 1 == dims[a] {
                    max[a] = f64::INFINITY;
                }
            }
        }
        PatchExtents::with_center(min, max, center)
    }

    fn neighbors_for(lattice: &Lattice, dims: &[u32; 3], grid: [u32; 3]) -> Vec<NeighborSlot> {
        let mut slots = Vec::new();
        'dirs: for direction in 0..NUM_TRANSFORMS as u8 {
            if direction == SELF_TRANSFORM {
                continue;
            }
            let offsets = Lattice::offsets(direction);
            let mut target = [0u32; 3];
            for a in 0..3 {
                let n = dims[a] as i64;
                let mut g = grid[a] as i64 + offsets[a] as i64;
                if g < 0 || g >= n {
                    if !lattice.periodic[a] {
                        continue 'dirs;
                    }
                    g = g.rem_euclid(n);
                }
                target[a] = g as u32;
            }
            if target == grid {
                continue;
            }
            slots.push(NeighborSlot {
                direction,
                patch: PatchId(Self::linear(dims, target)),
            });
        }
        slots
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    pub fn num_patches(&self) -> usize {
        self.records.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = PatchId> + '_ {
        self.records.iter().map(|r| r.id)
    }

    pub fn records(&self) -> &[PatchRecord] {
        &self.records
    }

    pub fn record(&self, id: PatchId) -> PatchResult<&PatchRecord> {
        self.records.get(id.index()).ok_or(PatchError::UnknownPatch(id))
    }

    pub fn home_node(&self, id: PatchId) -> PatchResult<NodeId> {
        self.record(id).map(|r| r.home)
    }

    pub fn extents(&self, id: PatchId) -> PatchResult<&PatchExtents> {
        self.record(id).map(|r| &r.extents)
    }

    pub fn neighbors(&self, id: PatchId) -> PatchResult<&[NeighborSlot]> {
        self.record(id).map(|r| r.neighbors.as_slice())
    }

    /// Patches whose home is `node`.
    pub fn patches_on(&self, node: NodeId) -> Vec<PatchId> {
        self.records
            .iter()
            .filter(|r| r.home == node)
            .map(|r| r.id)
            .collect()
    }

    /// Unordered neighbor pairs, each listed once with the lower id first.
    pub fn neighbor_pairs(&self) -> Vec<(PatchId, PatchId)> {
        let mut pairs: Vec<(PatchId, PatchId)> = self
            .records
            .iter()
            .flat_map(|r| {
                r.neighbors
                    .iter()
                    .filter(move |slot| slot.patch > r.id)
                    .map(move |slot| (r.id, slot.patch))
            })
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    /// Patch covering Cartesian position `p` (wrapped on periodic axes,
    /// clamped on the others).
    pub fn locate(&self, p: &Vector3<f64>) -> PatchId {
        let s = self.lattice.scale(p);
        let mut grid = [0u32; 3];
        for a in 0..3 {
            let n = self.dims[a] as i64;
            let cell = (s[a] * n as f64).floor() as i64;
            grid[a] = if self.lattice.periodic[a] {
                cell.rem_euclid(n) as u32
            } else {
                cell.clamp(0, n - 1) as u32
            };
        }
        PatchId(Self::linear(&self.dims, grid))
    }
}
