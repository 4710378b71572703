//! Patchwork Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary that lets the patch/proxy
//! machinery in `patchwork_core` run unchanged inside the deterministic
//! **simulation** harness or any runtime that supplies a clock and a transport.
//!
//! # Core Concept
//!
//! Everything that crosses a node boundary or introduces non-determinism
//! is intercepted here:
//! - Time (`now()`, `sleep()`)
//! - Messages (`send()`, `recv()`, `try_recv()`)
//! - Randomness (`seed()`, `derive_rng()`)
//!
//! Delivery is assumed reliable and ordered per sender/receiver pair. The
//! layers above never retry.
//!
//! # Example
//!
//! ```ignore
//! use patchwork_env::{PatchworkContext, MessageTransport};
//!
//! async fn node_loop<Ctx: PatchworkContext, Net: MessageTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//! ) {
//!     while let Some((from, envelope)) = net.recv().await {
//!         dispatch(from, envelope);
//!     }
//! }
//! ```

mod context;
mod error;
mod network;
mod types;

pub use context::PatchworkContext;
pub use error::EnvError;
pub use network::MessageTransport;
pub use types::{Envelope, HostId, NodeId};
