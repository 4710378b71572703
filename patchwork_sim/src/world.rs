//! SimWorld - The simulation harness container.
//!
//! Owns one [`NodeRuntime`] per simulated node, a central router, and the
//! step loop. After every step the world checks that the run settled and
//! that every atom is owned by exactly one home patch.

use crate::context::SimContext;
use crate::error::{SimError, SimResult};
use crate::kernels::{EwaldSelfSolver, SoftSphereKernel};
use crate::network::{NetworkMessage, NetworkStats, SimNetwork};

use nalgebra::Vector3;
use patchwork_core::{
    verify_ownership, AtomId, ComputeId, ComputeMap, ComputeSet, ForceKernel, FullAtom, Lattice, NodeRuntime, Outbox,
    PatchConfig, PatchId, PatchMap, PatchMessage, SharedComputeMap, SimulationContext, Topology,
};
use patchwork_env::{EnvError, Envelope, MessageTransport, NodeId, PatchworkContext};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of simulated hosts
    pub hosts: u32,

    /// Nodes on each host
    pub nodes_per_host: u32,

    /// Patch grid dimensions
    pub dims: [u32; 3],

    /// Cell edge lengths
    pub cell: [f64; 3],

    /// Which axes wrap
    pub periodic: [bool; 3],

    /// Atoms placed uniformly at random by [`SimWorld::new`]
    pub num_atoms: usize,

    /// Standard deviation of each initial velocity component
    pub velocity_std: f64,

    /// Steps the CLI runs
    pub steps: u64,

    /// Soft-sphere cutoff
    pub cutoff: f64,

    /// Soft-sphere strength
    pub epsilon: f64,

    /// Ewald splitting parameter for long-range computes
    pub ewald_alpha: f64,

    /// Virtual time between steps (ms)
    pub step_pause_ms: u64,

    /// Which computes the decomposition creates
    pub computes: ComputeSet,

    /// Core tunables
    pub patch: PatchConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            hosts: 2,
            nodes_per_host: 2,
            dims: [3, 3, 3],
            cell: [24.0; 3],
            periodic: [true; 3],
            num_atoms: 200,
            velocity_std: 0.05,
            steps: 20,
            cutoff: 2.5,
            epsilon: 0.01,
            ewald_alpha: 0.3,
            step_pause_ms: 10,
            computes: ComputeSet::default(),
            patch: PatchConfig::default(),
        }
    }
}

impl SimConfig {
    /// Reads a JSON config; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> SimResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SimError::Config(format!("{}: {e}", path.display())))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| SimError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.hosts == 0 || self.nodes_per_host == 0 {
            return Err(SimError::Config("need at least one node".into()));
        }
        if self.dims.iter().any(|d| *d == 0) {
            return Err(SimError::Config(format!("patch grid {:?} has an empty axis", self.dims)));
        }
        if self.cell.iter().any(|l| *l <= 0.0) {
            return Err(SimError::Config(format!("cell {:?} must have positive edges", self.cell)));
        }
        if self.cutoff <= 0.0 || self.velocity_std < 0.0 {
            return Err(SimError::Config("cutoff must be positive and velocity spread non-negative".into()));
        }
        if self.patch.tree_branching == 0 {
            return Err(SimError::Config("tree branching must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_layout(mut self, hosts: u32, nodes_per_host: u32) -> Self {
        self.hosts = hosts;
        self.nodes_per_host = nodes_per_host;
        self
    }

    pub fn with_dims(mut self, dims: [u32; 3]) -> Self {
        self.dims = dims;
        self
    }

    pub fn with_cell(mut self, cell: [f64; 3], periodic: [bool; 3]) -> Self {
        self.cell = cell;
        self.periodic = periodic;
        self
    }

    pub fn with_atoms(mut self, num_atoms: usize) -> Self {
        self.num_atoms = num_atoms;
        self
    }

    pub fn with_steps(mut self, steps: u64) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_computes(mut self, computes: ComputeSet) -> Self {
        self.computes = computes;
        self
    }

    pub fn with_patch_config(mut self, patch: PatchConfig) -> Self {
        self.patch = patch;
        self
    }

    pub fn lattice(&self) -> Lattice {
        Lattice::new(Vector3::zeros(), Vector3::from(self.cell), self.periodic)
    }
}

/// What one step did, for logs and scenario checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepReport {
    pub step: u64,
    pub atoms: usize,
    /// Atoms whose owning patch changed
    pub migrated: usize,
    pub kinetic_energy: f64,
    pub potential_energy: f64,
    pub interactions: u64,
    pub messages: u64,
    pub bytes: u64,
    pub margin_violations: usize,
}

/// Handle to a simulated node.
pub struct NodeHandle {
    /// Node state machine
    pub runtime: NodeRuntime,

    /// Network interface for this node
    pub network: Arc<SimNetwork>,

    /// Sender to deliver envelopes to this node
    inbox_tx: mpsc::UnboundedSender<(NodeId, Envelope)>,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Shared maps and kernels every node sees
    shared: SimulationContext,

    /// Node handles, indexed by node id
    nodes: Vec<NodeHandle>,

    /// Central router receiver (all outgoing envelopes land here)
    router_rx: mpsc::UnboundedReceiver<NetworkMessage>,

    /// Traffic so far
    stats: NetworkStats,

    /// Atoms that must exist after every step
    expected_atoms: usize,

    /// Next step to run
    step: u64,
}

impl SimWorld {
    /// Creates a world with `config.num_atoms` atoms at random positions.
    pub fn new(config: SimConfig) -> SimResult<Self> {
        config.validate()?;
        let context = SimContext::shared(config.seed);
        let lattice = config.lattice();

        let mut pos_rng = context.derive_rng(0);
        let mut vel_rng = context.derive_rng(1);
        let velocity = Normal::new(0.0, config.velocity_std).map_err(|e| SimError::Config(e.to_string()))?;

        let atoms = (0..config.num_atoms as u64)
            .map(|id| {
                let scaled = Vector3::new(pos_rng.gen::<f64>(), pos_rng.gen::<f64>(), pos_rng.gen::<f64>());
                let v = Vector3::new(
                    velocity.sample(&mut vel_rng),
                    velocity.sample(&mut vel_rng),
                    velocity.sample(&mut vel_rng),
                );
                let charge = if id % 2 == 0 { 1.0 } else { -1.0 };
                FullAtom::new(AtomId(id), lattice.unscale(&scaled))
                    .with_velocity(v)
                    .with_properties(1.0, charge, 0)
            })
            .collect();

        Self::build(config, context, atoms)
    }

    /// Creates a world with explicitly placed atoms.
    pub fn with_atoms(config: SimConfig, atoms: Vec<FullAtom>) -> SimResult<Self> {
        config.validate()?;
        let context = SimContext::shared(config.seed);
        Self::build(config, context, atoms)
    }

    fn build(config: SimConfig, context: Arc<SimContext>, atoms: Vec<FullAtom>) -> SimResult<Self> {
        let lattice = config.lattice();
        let topology = Topology::uniform(config.hosts, config.nodes_per_host);
        let patch_map = PatchMap::decompose(lattice, config.dims, topology.num_nodes());
        let compute_map = ComputeMap::from_patch_map(&patch_map, config.computes)?;

        let kernel: Arc<dyn ForceKernel> = Arc::new(SoftSphereKernel::new(config.cutoff, config.epsilon));
        let mut shared = SimulationContext::new(
            patch_map,
            SharedComputeMap::new(compute_map),
            topology,
            config.patch.clone(),
            kernel,
        );
        if config.computes.long_range {
            shared = shared.with_long_range(Arc::new(EwaldSelfSolver::new(config.ewald_alpha)));
        }

        let expected_atoms = atoms.len();
        let mut by_patch: BTreeMap<PatchId, Vec<FullAtom>> = BTreeMap::new();
        for mut atom in atoms {
            atom.position = wrap_into_cell(&lattice, &atom.position);
            by_patch.entry(shared.patch_map.locate(&atom.position)).or_default().push(atom);
        }

        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let mut nodes = Vec::with_capacity(shared.topology.num_nodes());
        for id in shared.topology.nodes() {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let network = Arc::new(SimNetwork::new(id, router_tx.clone(), inbox_rx));
            let mut runtime = NodeRuntime::new(id, shared.clone());
            for pid in shared.patch_map.patches_on(id) {
                runtime.install_home_patch(pid, by_patch.remove(&pid).unwrap_or_default())?;
            }
            nodes.push(NodeHandle {
                runtime,
                network,
                inbox_tx,
            });
        }

        info!(
            seed = config.seed,
            nodes = nodes.len(),
            patches = shared.patch_map.num_patches(),
            computes = shared.compute_map.read().len(),
            atoms = expected_atoms,
            "world created"
        );

        Ok(Self {
            config,
            context,
            shared,
            nodes,
            router_rx,
            stats: NetworkStats::default(),
            expected_atoms,
            step: 0,
        })
    }

    /// Instantiates every compute on its assigned node and lets proxy
    /// registration settle.
    pub async fn setup(&mut self) -> SimResult<()> {
        for i in 0..self.nodes.len() {
            let out = self.nodes[i].runtime.instantiate_assigned()?;
            self.send_outbox(i, out).await?;
        }
        self.process_network().await?;
        self.verify()
    }

    /// Encodes and sends everything a node produced.
    async fn send_outbox(&mut self, from: usize, out: Outbox) -> SimResult<()> {
        let network = Arc::clone(&self.nodes[from].network);
        for (to, msg) in out {
            let envelope = msg.encode(self.step)?;
            self.stats.record(msg.kind(), envelope.size());
            network.send(to, envelope).await?;
        }
        Ok(())
    }

    /// Delivers messages until no node has anything left to say.
    pub async fn process_network(&mut self) -> SimResult<()> {
        loop {
            let mut delivered = 0usize;

            while let Ok(msg) = self.router_rx.try_recv() {
                let handle = self
                    .nodes
                    .get(msg.to.index())
                    .ok_or_else(|| EnvError::unreachable(msg.to))?;
                handle
                    .inbox_tx
                    .send((msg.from, msg.envelope))
                    .map_err(|_| EnvError::unreachable(msg.to))?;
            }

            for i in 0..self.nodes.len() {
                let network = Arc::clone(&self.nodes[i].network);
                while let Some((from, envelope)) = network.try_recv() {
                    let msg = PatchMessage::decode(&envelope)?;
                    let out = self.nodes[i].runtime.handle(from, msg)?;
                    self.send_outbox(i, out).await?;
                    delivered += 1;
                }
            }

            // Nothing handled means nothing new was sent either
            if delivered == 0 {
                return Ok(());
            }
        }
    }

    /// Runs one step on every node and checks the outcome.
    pub async fn step(&mut self) -> SimResult<StepReport> {
        let step = self.step;
        let before: HashMap<AtomId, PatchId> = self.ownership().into_iter().map(|(p, a)| (a, p)).collect();
        let (messages_before, bytes_before) = (self.stats.messages, self.stats.bytes);

        for i in 0..self.nodes.len() {
            let out = self.nodes[i].runtime.begin_step(step)?;
            self.send_outbox(i, out).await?;
        }
        self.process_network().await?;

        let pending: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.runtime.is_settled(step))
            .map(|n| n.runtime.describe_pending())
            .collect();
        if !pending.is_empty() {
            return Err(SimError::Stalled {
                step,
                pending: pending.join("; "),
            });
        }

        let owners = self.ownership();
        verify_ownership(owners.iter().copied(), self.expected_atoms)?;
        let migrated = owners
            .iter()
            .filter(|(patch, atom)| before.get(atom) != Some(patch))
            .count();

        let report = StepReport {
            step,
            atoms: owners.len(),
            migrated,
            kinetic_energy: self.nodes.iter().map(|n| n.runtime.kinetic_energy()).sum(),
            potential_energy: self.nodes.iter().map(|n| n.runtime.load().energy).sum(),
            interactions: self.nodes.iter().map(|n| n.runtime.load().interactions).sum(),
            messages: self.stats.messages - messages_before,
            bytes: self.stats.bytes - bytes_before,
            margin_violations: self.nodes.iter().map(|n| n.runtime.margin_violations()).sum(),
        };
        debug!(
            step,
            migrated,
            messages = report.messages,
            kinetic = report.kinetic_energy,
            potential = report.potential_energy,
            "step complete"
        );

        self.step += 1;
        self.context
            .sleep(Duration::from_millis(self.config.step_pause_ms))
            .await;
        Ok(report)
    }

    /// Runs `steps` steps, stopping at the first failure.
    pub async fn run(&mut self, steps: u64) -> SimResult<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(steps as usize);
        for _ in 0..steps {
            reports.push(self.step().await?);
        }
        if let Some(last) = reports.last() {
            info!(
                steps,
                atoms = last.atoms,
                messages = self.stats.messages,
                bytes = self.stats.bytes,
                "run complete"
            );
        }
        Ok(reports)
    }

    /// Moves compute `cid` to `target` between steps. A move that cannot
    /// start or be delivered is cancelled and the compute stays on its node.
    pub async fn relocate(&mut self, cid: ComputeId, target: NodeId) -> SimResult<()> {
        let source = {
            let mut map = self.shared.compute_map.write();
            let source = map.node(cid)?;
            map.request_move(cid, target)?;
            source
        };
        if let Err(err) = self.deliver_move(cid, source).await {
            warn!(%cid, %source, %target, error = %err, "relocation cancelled");
            self.shared.compute_map.write().cancel_move(cid)?;
            return Err(err);
        }

        let record = self.shared.compute_map.read().record(cid)?.clone();
        if record.node != target || record.move_to.is_some() {
            return Err(SimError::RelocationIncomplete { cid, target });
        }
        self.verify()
    }

    async fn deliver_move(&mut self, cid: ComputeId, source: NodeId) -> SimResult<()> {
        let handle = self
            .nodes
            .get_mut(source.index())
            .ok_or_else(|| EnvError::unreachable(source))?;
        let out = handle.runtime.begin_move(cid)?;
        self.send_outbox(source.index(), out).await?;
        self.process_network().await
    }

    pub fn checkpoint(&mut self, tag: &str) -> SimResult<()> {
        for node in &mut self.nodes {
            node.runtime.checkpoint(tag)?;
        }
        Ok(())
    }

    /// Restores every home patch from `tag` and rechecks ownership.
    pub fn revert(&mut self, tag: &str) -> SimResult<()> {
        for node in &mut self.nodes {
            node.runtime.revert(tag)?;
        }
        self.verify()
    }

    pub fn discard_checkpoint(&mut self, tag: &str) -> SimResult<()> {
        for node in &mut self.nodes {
            node.runtime.discard_checkpoint(tag)?;
        }
        Ok(())
    }

    fn verify(&self) -> SimResult<()> {
        verify_ownership(self.ownership(), self.expected_atoms)?;
        Ok(())
    }

    /// `(owner, atom)` across all nodes.
    pub fn ownership(&self) -> Vec<(PatchId, AtomId)> {
        self.nodes.iter().flat_map(|n| n.runtime.ownership()).collect()
    }

    /// Every atom, sorted by id.
    pub fn atoms(&self) -> Vec<FullAtom> {
        let mut atoms: Vec<FullAtom> = self
            .nodes
            .iter()
            .flat_map(|n| n.runtime.home_patches().flat_map(|h| h.atoms().iter().cloned()))
            .collect();
        atoms.sort_by_key(|a| a.id);
        atoms
    }

    /// Patch currently owning `atom`.
    pub fn owner_of(&self, atom: AtomId) -> Option<PatchId> {
        self.ownership().into_iter().find(|(_, a)| *a == atom).map(|(p, _)| p)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRuntime> {
        self.nodes.get(id.index()).map(|n| &n.runtime)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRuntime> {
        self.nodes.iter().map(|n| &n.runtime)
    }

    pub fn simulation(&self) -> &SimulationContext {
        &self.shared
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn expected_atoms(&self) -> usize {
        self.expected_atoms
    }

    /// Next step to run.
    pub fn current_step(&self) -> u64 {
        self.step
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Image of `p` inside the cell on periodic axes.
fn wrap_into_cell(lattice: &Lattice, p: &Vector3<f64>) -> Vector3<f64> {
    let mut s = lattice.scale(p);
    for a in 0..3 {
        if lattice.periodic[a] {
            s[a] -= s[a].floor();
            if s[a] >= 1.0 {
                s[a] = 0.0;
            }
        }
    }
    lattice.unscale(&s)
}
