//! Chaos scenarios for the deterministic simulator.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SF-001: heavy jitter and skewed clocks; every view converges
    JitterStorm,

    /// SF-002: a crashed client is swept, a late joiner bootstraps around it
    GhostSweep,

    /// SF-003: concurrent optimistic placement repaired after the fact
    PlacementRace,

    /// SF-004: repositioning piled-up objects, then re-running it
    Resync,

    /// SF-005: lossy links and a relay outage with reconnect
    FlakyLink,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::JitterStorm,
            ScenarioId::GhostSweep,
            ScenarioId::PlacementRace,
            ScenarioId::Resync,
            ScenarioId::FlakyLink,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::JitterStorm => "jitter_storm",
            ScenarioId::GhostSweep => "ghost_sweep",
            ScenarioId::PlacementRace => "placement_race",
            ScenarioId::Resync => "resync",
            ScenarioId::FlakyLink => "flaky_link",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::JitterStorm => "0-400ms jitter with reordering and skewed clocks, verify every view converges",
            ScenarioId::GhostSweep => "Client crashes while presence says online, verify eviction and late-join bootstrap",
            ScenarioId::PlacementRace => "Writers plan against the same state, verify post-write repair leaves no overlaps",
            ScenarioId::Resync => "Objects piled at the origin, verify reposition clears overlaps and is idempotent",
            ScenarioId::FlakyLink => "15% loss plus a 6s relay outage, verify reconnect and complete rosters",
        }
    }

    /// Whether the scenario drives avatar sessions (as opposed to placement only).
    pub fn uses_sessions(&self) -> bool {
        matches!(
            self,
            ScenarioId::JitterStorm | ScenarioId::GhostSweep | ScenarioId::FlakyLink
        )
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
            "jitter_storm" | "jitterstorm" | "sf-001" => Ok(ScenarioId::JitterStorm),
            "ghost_sweep" | "ghostsweep" | "sf-002" => Ok(ScenarioId::GhostSweep),
            "placement_race" | "placementrace" | "sf-003" => Ok(ScenarioId::PlacementRace),
            "resync" | "sf-004" => Ok(ScenarioId::Resync),
            "flaky_link" | "flakylink" | "sf-005" => Ok(ScenarioId::FlakyLink),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("SF-003".parse::<ScenarioId>(), Ok(ScenarioId::PlacementRace));
        assert_eq!("FlakyLink".parse::<ScenarioId>(), Ok(ScenarioId::FlakyLink));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_serializes_as_name() {
        let json = serde_json::to_string(&ScenarioId::GhostSweep).unwrap();
        assert_eq!(json, "\"ghost_sweep\"");
    }
}
