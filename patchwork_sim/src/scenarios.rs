//! Protocol scenarios for the simulation harness.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// PW-001: One atom crosses the face between two patches on two hosts
    Crossing,

    /// PW-002: Random gas, ownership verified after every step
    Conservation,

    /// PW-003: Pair computes relocated mid-run match an unmoved run
    Relocation,

    /// PW-004: Revert to a checkpoint and replay
    Checkpoint,

    /// PW-005: Spanning trees over many hosts cover every proxy
    ProxyTree,

    /// PW-006: Atoms leaving through periodic faces re-enter on the far side
    PeriodicWrap,

    /// PW-007: Bonded and long-range computes alongside nonbonded ones
    FullComputeSet,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Crossing,
            ScenarioId::Conservation,
            ScenarioId::Relocation,
            ScenarioId::Checkpoint,
            ScenarioId::ProxyTree,
            ScenarioId::PeriodicWrap,
            ScenarioId::FullComputeSet,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Crossing => "crossing",
            ScenarioId::Conservation => "conservation",
            ScenarioId::Relocation => "relocation",
            ScenarioId::Checkpoint => "checkpoint",
            ScenarioId::ProxyTree => "proxy_tree",
            ScenarioId::PeriodicWrap => "periodic_wrap",
            ScenarioId::FullComputeSet => "full_compute_set",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Crossing => "Atom at x=9.8 moving +0.5 ends up in the right-hand patch at x=10.3",
            ScenarioId::Conservation => "Random gas over 4 nodes, every atom owned exactly once after each step",
            ScenarioId::Relocation => "Move pair computes to other nodes mid-run, trajectories unchanged",
            ScenarioId::Checkpoint => "Checkpoint, run, revert, replay: same atoms and same trajectory",
            ScenarioId::ProxyTree => "9 nodes on 3 hosts, every home's tree covers exactly its proxies",
            ScenarioId::PeriodicWrap => "Atoms crossing periodic faces wrap, with one and two patches per axis",
            ScenarioId::FullComputeSet => "Self, pair, bonded and long-range computes in one run",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crossing" | "pw-001" => Ok(ScenarioId::Crossing),
            "conservation" | "pw-002" => Ok(ScenarioId::Conservation),
            "relocation" | "pw-003" => Ok(ScenarioId::Relocation),
            "checkpoint" | "pw-004" => Ok(ScenarioId::Checkpoint),
            "proxy_tree" | "proxytree" | "pw-005" => Ok(ScenarioId::ProxyTree),
            "periodic_wrap" | "periodicwrap" | "pw-006" => Ok(ScenarioId::PeriodicWrap),
            "full_compute_set" | "fullcomputeset" | "pw-007" => Ok(ScenarioId::FullComputeSet),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
