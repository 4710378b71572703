//! Patchwork Deterministic Simulation Harness
//!
//! Runs several Patchwork nodes inside one process so the replication and
//! migration protocol can be exercised end to end and repeated exactly.
//!
//! # Core Principle
//!
//! All sources of non-determinism are controlled:
//! - **Time**: a virtual clock that only moves between steps
//! - **Network**: one in-memory router, delivering in send order
//! - **Randomness**: initial positions and velocities derive from one seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimulationContext (PatchMap, ComputeMap, Topology)   │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────────┐          ┌────▼────────┐                   │
//! │  │ NodeRuntime │◄────────►│ NodeRuntime │     ...           │
//! │  │     N0      │  Router  │     N1      │                   │
//! │  └─────────────┘          └─────────────┘                   │
//! │       ▲                        ▲                            │
//! │  ┌────┴────────────────────────┴────┐                       │
//! │  │  Ownership check after each step │                       │
//! │  └──────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use patchwork_sim::{SimConfig, SimWorld};
//!
//! let mut world = SimWorld::new(SimConfig::default().with_seed(7))?;
//! world.setup().await?;
//! let reports = world.run(10).await?;
//! ```

mod context;
mod error;
mod kernels;
mod network;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use error::{SimError, SimResult};
pub use kernels::{EwaldSelfSolver, SoftSphereKernel};
pub use network::{NetworkMessage, NetworkStats, SimNetwork};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{NodeHandle, SimConfig, SimWorld, StepReport};
