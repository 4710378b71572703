//! Shared, read-mostly state every node runtime of one simulation needs.

use crate::compute::{ForceKernel, LongRangeSolver};
use crate::compute_map::SharedComputeMap;
use crate::config::PatchConfig;
use crate::patch_map::PatchMap;
use crate::topology::Topology;
use std::sync::Arc;

/// Explicit handle passed to each node instead of process-wide singletons.
#[derive(Clone)]
pub struct SimulationContext {
    pub patch_map: Arc<PatchMap>,
    pub compute_map: SharedComputeMap,
    pub topology: Arc<Topology>,
    pub config: PatchConfig,
    pub kernel: Arc<dyn ForceKernel>,
    pub long_range: Option<Arc<dyn LongRangeSolver>>,
}

impl SimulationContext {
    pub fn new(
        patch_map: PatchMap,
        compute_map: SharedComputeMap,
        topology: Topology,
        config: PatchConfig,
        kernel: Arc<dyn ForceKernel>,
    ) -> Self {
        Self {
            patch_map: Arc::new(patch_map),
            compute_map,
            topology: Arc::new(topology),
            config,
            kernel,
            long_range: None,
        }
    }

    pub fn with_long_range(mut self, solver: Arc<dyn LongRangeSolver>) -> Self {
        self.long_range = Some(solver);
        self
    }
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("patches", &self.patch_map.num_patches())
            .field("nodes", &self.topology.num_nodes())
            .field("config", &self.config)
            .field("long_range", &self.long_range.is_some())
            .finish()
    }
}
