//! treefit_sim - Deterministic validation harness for the fit engine.
//!
//! Generates synthetic decay events with known truth, smears them into
//! realistic track measurements, fits them with `treefit_core`, and
//! scores convergence, pulls and vertex residuals against thresholds.

use thiserror::Error;

pub mod exporter;
pub mod oracle;
pub mod runner;
pub mod scenarios;

pub use exporter::{EventRecord, SimExport};
pub use oracle::{CascadeEvent, GeneratedTrack, Oracle, SingleVertexEvent, TrackResolution};
pub use runner::{ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;

/// Errors of the simulation harness itself.
#[derive(Debug, Error)]
pub enum SimError {
    /// Event generation produced an unfittable trajectory.
    #[error("event generation failed: {0}")]
    Generation(#[from] treefit_core::FitError),

    /// Export serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Export file could not be written.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The CLI named a scenario that does not exist.
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
}
