//! Patchwork Core - spatial decomposition for parallel N-body simulation.
//!
//! The simulation cell is split into patches. Each patch has exactly one
//! home (the authoritative owner of its particles) and any number of
//! proxies (read-only replicas on nodes that compute with it). This crate
//! provides:
//! 1. **Rendezvous boxes**: counted publish/consume handoff between a patch
//!    and the computes that read positions and deposit forces
//! 2. **Replication**: proxy registration and a node-aware spanning tree for
//!    broadcasting positions
//! 3. **Migration**: per-step handoff of particles that crossed a patch face,
//!    with conservation checks
//! 4. **Work placement**: a shared compute map with three-phase relocation and
//!    a per-node readiness barrier

pub mod atom;
pub mod checkpoint;
pub mod compute;
pub mod compute_map;
pub mod compute_mgr;
pub mod config;
pub mod context;
pub mod error;
pub mod home_patch;
pub mod lattice;
pub mod messages;
pub mod node;
pub mod ownership;
pub mod patch;
pub mod patch_map;
pub mod proxy;
pub mod rendezvous;
pub mod spanning_tree;
pub mod sync;
pub mod topology;

// Re-export key types for convenience
pub use atom::{AtomId, CompAtom, ForceClass, ForceResults, FullAtom};
pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
pub use compute::{ComputeCapability, ComputeId, ComputeKind, ComputeStats, ForceKernel, KernelOutput, LongRangeSolver};
pub use compute_map::{ComputeMap, ComputeRecord, ComputeSet, SharedComputeMap};
pub use config::PatchConfig;
pub use context::SimulationContext;
pub use error::{PatchError, PatchResult};
pub use home_patch::{HomePatch, HomePatchState, MigrationReport};
pub use lattice::Lattice;
pub use messages::{MigrateAtoms, Outbox, PatchMessage};
pub use node::NodeRuntime;
pub use ownership::verify_ownership;
pub use patch::{Patch, PatchExtents, PatchId};
pub use patch_map::{NeighborSlot, PatchMap, PatchRecord};
pub use rendezvous::{BoxError, BoxEvent, OwnerBox};
pub use spanning_tree::SpanningTree;
pub use topology::Topology;
