//! Fit validation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// FIT-001: n tracks from one vertex in a 1.5 T field
    SingleVertex,

    /// FIT-002: two-vertex cascade with a fitted decay length
    Cascade,

    /// FIT-003: single vertex with zero field (straight tracks)
    StraightTracks,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SingleVertex,
            ScenarioId::Cascade,
            ScenarioId::StraightTracks,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SingleVertex => "single_vertex",
            ScenarioId::Cascade => "cascade",
            ScenarioId::StraightTracks => "straight_tracks",
        }
    }

    pub fn parse(name: &str) -> Option<ScenarioId> {
        match name {
            "single_vertex" => Some(ScenarioId::SingleVertex),
            "cascade" => Some(ScenarioId::Cascade),
            "straight_tracks" => Some(ScenarioId::StraightTracks),
            _ => None,
        }
    }

    /// Field used by this scenario, Tesla.
    pub fn bz(&self) -> f64 {
        match self {
            ScenarioId::StraightTracks => 0.0,
            _ => 1.5,
        }
    }
}
