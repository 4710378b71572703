//! Harness errors.

use patchwork_core::{ComputeId, PatchError};
use patchwork_env::{EnvError, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error("step {step} did not settle after the network drained: {pending}")]
    Stalled { step: u64, pending: String },

    #[error("compute {cid} did not finish moving to {target}")]
    RelocationIncomplete { cid: ComputeId, target: NodeId },

    #[error("check failed: {0}")]
    Check(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type SimResult<T> = Result<T, SimError>;
