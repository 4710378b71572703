//! Scenario runner - executes protocol scenarios against a SimWorld.

use crate::error::{SimError, SimResult};
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld, StepReport};

use nalgebra::Vector3;
use patchwork_core::{AtomId, ComputeKind, ComputeSet, FullAtom, PatchId};
use patchwork_env::NodeId;
use tracing::{info, warn};

/// Trajectories compared across runs must agree to this tolerance.
const TRAJECTORY_TOLERANCE: f64 = 1e-9;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Steps executed (replays included)
    pub steps: u64,

    /// Atoms at the end of the run
    pub final_atoms: usize,

    /// Messages sent
    pub messages: u64,

    /// Encoded bytes sent
    pub bytes: u64,

    /// Owner changes summed over all steps
    pub migrated: u64,

    /// Pair interactions evaluated
    pub interactions: u64,

    /// Largest margin-violation count seen in one step
    pub max_margin_violations: usize,

    /// Computes moved between nodes
    pub relocations: u64,
}

impl ScenarioMetrics {
    fn absorb(&mut self, reports: &[StepReport]) {
        for report in reports {
            self.steps += 1;
            self.final_atoms = report.atoms;
            self.messages += report.messages;
            self.bytes += report.bytes;
            self.migrated += report.migrated as u64;
            self.interactions += report.interactions;
            self.max_margin_violations = self.max_margin_violations.max(report.margin_violations);
        }
    }
}

/// Fails the scenario with `message` unless `condition` holds.
fn ensure(condition: bool, message: impl FnOnce() -> String) -> SimResult<()> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Check(message()))
    }
}

/// Largest position difference between two sorted atom lists.
fn max_deviation(a: &[FullAtom], b: &[FullAtom]) -> SimResult<f64> {
    ensure(a.len() == b.len(), || format!("atom counts differ: {} vs {}", a.len(), b.len()))?;
    let mut worst = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        ensure(x.id == y.id, || format!("atom order differs: {} vs {}", x.id, y.id))?;
        worst = worst.max((x.position - y.position).norm());
    }
    Ok(worst)
}

/// Runs protocol scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Steps for open-ended scenarios
    steps: u64,

    /// Starting point for scenarios that use a random gas
    base: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            steps: 20,
            base: SimConfig::default().with_seed(seed),
        }
    }

    /// Sets the number of steps.
    pub fn with_steps(mut self, steps: u64) -> Self {
        self.steps = steps.max(2);
        self
    }

    /// Replaces the base configuration (the runner's seed wins).
    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.base = config.with_seed(self.seed);
        self
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match scenario {
            ScenarioId::Crossing => self.run_crossing().await,
            ScenarioId::Conservation => self.run_conservation().await,
            ScenarioId::Relocation => self.run_relocation().await,
            ScenarioId::Checkpoint => self.run_checkpoint().await,
            ScenarioId::ProxyTree => self.run_proxy_tree().await,
            ScenarioId::PeriodicWrap => self.run_periodic_wrap().await,
            ScenarioId::FullComputeSet => self.run_full_compute_set().await,
        };

        match outcome {
            Ok(metrics) => {
                info!(
                    "Scenario {} passed: {} steps, {} messages",
                    scenario.name(),
                    metrics.steps,
                    metrics.messages
                );
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: true,
                    failure_reason: None,
                    metrics,
                }
            }
            Err(e) => {
                warn!("Scenario {} failed: {}", scenario.name(), e);
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    failure_reason: Some(e.to_string()),
                    metrics: ScenarioMetrics::default(),
                }
            }
        }
    }

    /// Two patches along x, one per host.
    fn two_patch_config(&self) -> SimConfig {
        SimConfig::default()
            .with_seed(self.seed)
            .with_layout(2, 1)
            .with_dims([2, 1, 1])
            .with_cell([20.0, 10.0, 10.0], [true; 3])
    }

    /// PW-001: one atom crosses from P0 into P1.
    async fn run_crossing(&self) -> SimResult<ScenarioMetrics> {
        let atom = FullAtom::new(AtomId(0), Vector3::new(9.8, 5.0, 5.0)).with_velocity(Vector3::new(0.5, 0.0, 0.0));
        let mut world = SimWorld::with_atoms(self.two_patch_config(), vec![atom])?;
        world.setup().await?;

        ensure(world.owner_of(AtomId(0)) == Some(PatchId(0)), || "atom should start in P0".into())?;
        let reports = world.run(1).await?;

        let owner = world.owner_of(AtomId(0));
        ensure(owner == Some(PatchId(1)), || format!("atom ended in {owner:?}, expected P1"))?;
        let x = world.atoms()[0].position.x;
        ensure((x - 10.3).abs() < TRAJECTORY_TOLERANCE, || format!("atom at x={x}, expected 10.3"))?;

        let mut metrics = ScenarioMetrics::default();
        metrics.absorb(&reports);
        Ok(metrics)
    }

    /// PW-002: random gas; the world verifies ownership every step.
    async fn run_conservation(&self) -> SimResult<ScenarioMetrics> {
        let mut world = SimWorld::new(self.base.clone())?;
        world.setup().await?;
        let reports = world.run(self.steps).await?;

        let mut metrics = ScenarioMetrics::default();
        metrics.absorb(&reports);
        ensure(metrics.final_atoms == world.expected_atoms(), || {
            format!("{} atoms left of {}", metrics.final_atoms, world.expected_atoms())
        })?;
        Ok(metrics)
    }

    /// PW-003: moving pair computes must not change the trajectory.
    async fn run_relocation(&self) -> SimResult<ScenarioMetrics> {
        let mut reference = SimWorld::new(self.base.clone())?;
        let mut moved = SimWorld::new(self.base.clone())?;
        reference.setup().await?;
        moved.setup().await?;

        let half = self.steps / 2;
        reference.run(half).await?;
        let mut metrics = ScenarioMetrics::default();
        metrics.absorb(&moved.run(half).await?);

        let nodes = moved.node_count() as u32;
        let pairs: Vec<_> = moved
            .simulation()
            .compute_map
            .read()
            .records()
            .iter()
            .filter(|r| r.kind == ComputeKind::NonbondedPair)
            .map(|r| (r.id, r.node))
            .take(6)
            .collect();
        for (cid, node) in pairs {
            let target = NodeId((node.0 + 1) % nodes);
            moved.relocate(cid, target).await?;
            metrics.relocations += 1;
        }

        reference.run(self.steps - half).await?;
        metrics.absorb(&moved.run(self.steps - half).await?);

        let deviation = max_deviation(&reference.atoms(), &moved.atoms())?;
        ensure(deviation < TRAJECTORY_TOLERANCE, || {
            format!("relocated run drifted by {deviation:e}")
        })?;
        Ok(metrics)
    }

    /// PW-004: revert restores the saved atoms and the replay repeats.
    async fn run_checkpoint(&self) -> SimResult<ScenarioMetrics> {
        let mut world = SimWorld::new(self.base.clone())?;
        world.setup().await?;
        let mut metrics = ScenarioMetrics::default();
        metrics.absorb(&world.run(2).await?);

        world.checkpoint("before")?;
        let saved = world.atoms();
        let span = self.steps / 2;
        metrics.absorb(&world.run(span).await?);
        let first = world.atoms();

        world.revert("before")?;
        ensure(max_deviation(&saved, &world.atoms())? == 0.0, || "revert did not restore positions".into())?;
        metrics.absorb(&world.run(span).await?);

        let deviation = max_deviation(&first, &world.atoms())?;
        ensure(deviation < TRAJECTORY_TOLERANCE, || format!("replay drifted by {deviation:e}"))?;

        world.discard_checkpoint("before")?;
        ensure(world.revert("before").is_err(), || "discarded checkpoint still restorable".into())?;
        Ok(metrics)
    }

    /// PW-005: every home's spanning tree covers exactly its proxies.
    async fn run_proxy_tree(&self) -> SimResult<ScenarioMetrics> {
        let config = self.base.clone().with_layout(3, 3).with_atoms(150);
        let mut world = SimWorld::new(config)?;
        world.setup().await?;
        let mut metrics = ScenarioMetrics::default();
        metrics.absorb(&world.run(self.steps.min(5)).await?);

        let mut trees = 0;
        for node in world.nodes() {
            for home in node.home_patches() {
                home.tree().validate(home.proxies())?;
                if !home.proxies().is_empty() {
                    trees += 1;
                }
            }
        }
        ensure(trees > 0, || "no home patch has proxies".into())?;
        Ok(metrics)
    }

    /// PW-006: leaving through a periodic face re-enters on the other side.
    async fn run_periodic_wrap(&self) -> SimResult<ScenarioMetrics> {
        let mut metrics = ScenarioMetrics::default();

        // One patch spanning the cell: the atom wraps without leaving it
        let single = SimConfig::default()
            .with_seed(self.seed)
            .with_layout(1, 1)
            .with_dims([1, 1, 1])
            .with_cell([10.0; 3], [true; 3]);
        let atom = FullAtom::new(AtomId(0), Vector3::new(9.9, 5.0, 5.0)).with_velocity(Vector3::new(0.3, 0.0, 0.0));
        let mut world = SimWorld::with_atoms(single, vec![atom])?;
        world.setup().await?;
        metrics.absorb(&world.run(1).await?);
        let x = world.atoms()[0].position.x;
        ensure((x - 0.2).abs() < TRAJECTORY_TOLERANCE, || format!("single patch: atom at x={x}, expected 0.2"))?;

        // Two patches: each atom crosses into the other one through the cell edge
        let atoms = vec![
            FullAtom::new(AtomId(0), Vector3::new(19.8, 5.0, 5.0)).with_velocity(Vector3::new(0.5, 0.0, 0.0)),
            FullAtom::new(AtomId(1), Vector3::new(0.1, 1.0, 1.0)).with_velocity(Vector3::new(-0.3, 0.0, 0.0)),
        ];
        let mut world = SimWorld::with_atoms(self.two_patch_config(), atoms)?;
        world.setup().await?;
        metrics.absorb(&world.run(1).await?);

        ensure(world.owner_of(AtomId(0)) == Some(PatchId(0)), || "atom #0 should wrap into P0".into())?;
        ensure(world.owner_of(AtomId(1)) == Some(PatchId(1)), || "atom #1 should wrap into P1".into())?;
        let atoms = world.atoms();
        ensure((atoms[0].position.x - 0.3).abs() < TRAJECTORY_TOLERANCE, || {
            format!("atom #0 at x={}, expected 0.3", atoms[0].position.x)
        })?;
        ensure((atoms[1].position.x - 19.8).abs() < TRAJECTORY_TOLERANCE, || {
            format!("atom #1 at x={}, expected 19.8", atoms[1].position.x)
        })?;
        Ok(metrics)
    }

    /// PW-007: bonded and long-range computes run through the same protocol.
    async fn run_full_compute_set(&self) -> SimResult<ScenarioMetrics> {
        let config = self.base.clone().with_computes(ComputeSet {
            nonbonded: true,
            bonded: true,
            long_range: true,
        });
        let alpha = config.ewald_alpha;
        let mut world = SimWorld::new(config)?;
        world.setup().await?;

        let kinds = |kind: ComputeKind| {
            world
                .simulation()
                .compute_map
                .read()
                .records()
                .iter()
                .filter(|r| r.kind == kind)
                .count()
        };
        let patches = world.simulation().patch_map.num_patches();
        ensure(kinds(ComputeKind::BondedSelf) == patches, || "one bonded compute per patch".into())?;
        ensure(kinds(ComputeKind::LongRange) == patches, || "one long-range compute per patch".into())?;

        let sum_q2: f64 = world.atoms().iter().map(|a| a.charge * a.charge).sum();
        let self_energy = -alpha / std::f64::consts::PI.sqrt() * sum_q2;

        let reports = world.run(self.steps.min(5)).await?;
        for report in &reports {
            // Soft-sphere energy is never negative, so the total sits at or
            // above the Ewald self term.
            ensure(report.potential_energy >= self_energy - 1e-9, || {
                format!("step {}: potential {} below self energy {}", report.step, report.potential_energy, self_energy)
            })?;
        }

        let mut metrics = ScenarioMetrics::default();
        metrics.absorb(&reports);
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crossing_passes() {
        let result = ScenarioRunner::new(42).run(ScenarioId::Crossing).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.steps, 1);
        assert_eq!(result.metrics.migrated, 1);
    }

    #[tokio::test]
    async fn test_periodic_wrap_passes() {
        let result = ScenarioRunner::new(7).run(ScenarioId::PeriodicWrap).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_max_deviation() {
        let a = vec![FullAtom::new(AtomId(0), Vector3::new(1.0, 0.0, 0.0))];
        let b = vec![FullAtom::new(AtomId(0), Vector3::new(1.0, 0.5, 0.0))];
        assert_eq!(max_deviation(&a, &b).unwrap(), 0.5);
        assert!(max_deviation(&a, &[]).is_err());
    }
}
