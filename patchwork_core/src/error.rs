//! Protocol and consistency errors.
//!
//! Every variant names the invariant that was broken. None of them are
//! recoverable: the driver aborts the run with the diagnostic.

use crate::atom::AtomId;
use crate::compute::ComputeId;
use crate::patch::PatchId;
use crate::rendezvous::BoxError;
use patchwork_env::{EnvError, NodeId};
use thiserror::Error;

/// Fatal errors raised by the patch/proxy/migration machinery.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("box protocol violation on patch {patch}: {source}")]
    Box {
        patch: PatchId,
        #[source]
        source: BoxError,
    },

    #[error("duplicate atom {atom} deposited into patch {patch}")]
    DuplicateAtom { patch: PatchId, atom: AtomId },

    #[error("migration for patch {intended} delivered to patch {actual}")]
    MisaddressedDeposit { intended: PatchId, actual: PatchId },

    #[error("atom {atom} deposited into patch {patch} lies outside its region (moved more than one patch?)")]
    DepositOutOfRegion { patch: PatchId, atom: AtomId },

    #[error("patch {patch} received migration from {source_patch} via direction {direction}, which is not a neighbor slot")]
    UnexpectedMigrationSource {
        patch: PatchId,
        source_patch: PatchId,
        direction: u8,
    },

    #[error("particle count mismatch after migration: before {before}, after {after}")]
    ParticleCountMismatch { before: usize, after: usize },

    #[error("atom {atom} is owned by both {first} and {second}")]
    DuplicateOwnership {
        atom: AtomId,
        first: PatchId,
        second: PatchId,
    },

    #[error("proxy force for patch {patch} received from {node}, which holds no registered proxy")]
    UnknownProxy { patch: PatchId, node: NodeId },

    #[error("{node} registered a proxy for patch {patch} twice")]
    DuplicateProxy { patch: PatchId, node: NodeId },

    #[error("{node} received positions for patch {patch} but holds no proxy for it (lost registration)")]
    LostProxy { patch: PatchId, node: NodeId },

    #[error("patch {patch} broadcast on spanning tree version {got}, receiver knows version {expected}")]
    StaleSpanningTree {
        patch: PatchId,
        expected: u64,
        got: u64,
    },

    #[error("spanning tree for patch {patch} is malformed: {reason}")]
    MalformedTree { patch: PatchId, reason: String },

    #[error("{what} capacity of {capacity} exceeded")]
    CapacityExceeded { what: &'static str, capacity: usize },

    #[error("no checkpoint tagged {tag:?} on patch {patch}")]
    UnknownCheckpoint { patch: PatchId, tag: String },

    #[error("unknown patch {0}")]
    UnknownPatch(PatchId),

    #[error("unknown compute {0}")]
    UnknownCompute(ComputeId),

    #[error("a {kind} compute over patches {patches:?} already exists")]
    DuplicateCompute { kind: String, patches: Vec<PatchId> },

    #[error("compute {cid} is invalid: {reason}")]
    InvalidCompute { cid: ComputeId, reason: String },

    #[error("compute {0} still has box operations in flight")]
    ComputeNotQuiescent(ComputeId),

    #[error("compute {cid} has no pending move")]
    NoPendingMove { cid: ComputeId },

    #[error("patch {patch} already marked ready for step {step}")]
    DuplicateReady { patch: PatchId, step: u64 },

    #[error("patch {patch} cannot {op} in state {state}")]
    InvalidState {
        patch: PatchId,
        state: String,
        op: &'static str,
    },

    #[error("message for step {got} arrived while patch {patch} is at step {expected}")]
    StepMismatch {
        patch: PatchId,
        expected: u64,
        got: u64,
    },

    #[error("force results for patch {patch} have {got} entries, expected {expected}")]
    ResultSizeMismatch {
        patch: PatchId,
        expected: usize,
        got: usize,
    },

    #[error("message codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl PatchError {
    /// Wraps a box error with the patch it happened on.
    pub fn boxed(patch: PatchId, source: BoxError) -> Self {
        Self::Box { patch, source }
    }
}

pub type PatchResult<T> = Result<T, PatchError>;
