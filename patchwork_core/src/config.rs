//! Tunables supplied by the setup phase. The core never parses files.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Distance (Cartesian) an atom may stray past its patch before it
    /// counts as a margin violation
    pub margin: f64,

    /// Integration timestep
    pub timestep: f64,

    /// Migrate every `migration_period` steps (0 disables migration)
    pub migration_period: u64,

    /// Outgoing atoms per patch per migration
    pub migration_capacity: usize,

    /// Proxies per home patch
    pub proxy_capacity: usize,

    /// Computes pending in one node's readiness barrier
    pub sync_capacity: usize,

    /// Fan-out of the host-root level of spanning trees
    pub tree_branching: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            margin: 0.5,
            timestep: 1.0,
            migration_period: 1,
            migration_capacity: 4096,
            proxy_capacity: 256,
            sync_capacity: 4096,
            tree_branching: 4,
        }
    }
}

impl PatchConfig {
    /// Whether atoms migrate at the end of `step`.
    pub fn migrates_after(&self, step: u64) -> bool {
        self.migration_period > 0 && (step + 1) % self.migration_period == 0
    }
}
