//! JSON exporter for offline inspection of fit results.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

use treefit_core::{ErrCode, FitState, Fitter, NodeIndex};

use crate::runner::ScenarioResult;
use crate::SimError;

/// One fitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub converged: bool,
    /// Accumulated status flags, human-readable.
    pub status: String,
    pub chi_square: f64,
    pub ndf: i64,
    pub iterations: usize,
    /// True decay vertex [x, y, z], cm.
    pub vertex_truth: [f64; 3],
    /// Fitted decay vertex [x, y, z], cm; zero when the fit failed.
    pub vertex_fit: [f64; 3],
    /// Per-axis (fit - truth) / sigma; zero where the fitted variance
    /// is not positive.
    pub vertex_pull: [f64; 3],
}

impl EventRecord {
    pub fn from_fit(
        fitter: &Fitter,
        status: ErrCode,
        vertex_node: NodeIndex,
        vertex_truth: &nalgebra::Vector3<f64>,
    ) -> Self {
        let fitted = fitter
            .vertex_position(vertex_node)
            .unwrap_or_else(nalgebra::Vector3::zeros);
        let mut vertex_pull = [0.0; 3];
        if let Some(range) = fitter.tree().node(vertex_node).indices.pos {
            let variances = fitter.block_variances(range);
            for k in 0..3 {
                if variances[k] > 0.0 {
                    vertex_pull[k] = (fitted[k] - vertex_truth[k]) / variances[k].sqrt();
                }
            }
        }
        Self {
            converged: fitter.state() == FitState::Converged,
            status: status.to_string(),
            chi_square: fitter.chi_square(),
            ndf: fitter.ndf(),
            iterations: fitter.n_iterations(),
            vertex_truth: [vertex_truth.x, vertex_truth.y, vertex_truth.z],
            vertex_fit: [fitted.x, fitted.y, fitted.z],
            vertex_pull,
        }
    }
}

/// Whole-run export: per-event records plus the scenario summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,
    pub passed: bool,
    pub n_events: usize,
    pub n_converged: usize,
    pub vertex_rmse: f64,
    pub mean_chi2_per_ndf: f64,
    pub mean_abs_pull: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub events: Vec<EventRecord>,
}

impl SimExport {
    pub fn from_result(result: &ScenarioResult) -> Self {
        Self {
            scenario: result.scenario.name().to_string(),
            seed: result.seed,
            passed: result.passed,
            n_events: result.n_events,
            n_converged: result.n_converged,
            vertex_rmse: result.vertex_rmse,
            mean_chi2_per_ndf: result.mean_chi2_per_ndf,
            mean_abs_pull: result.mean_abs_pull,
            failure_reason: result.failure_reason.clone(),
            events: result.events.clone(),
        }
    }

    pub fn write_to_file(&self, path: &str) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_round_trips_through_json() {
        let export = SimExport {
            scenario: "single_vertex".to_string(),
            seed: 42,
            passed: true,
            n_events: 1,
            n_converged: 1,
            vertex_rmse: 0.003,
            mean_chi2_per_ndf: 1.1,
            mean_abs_pull: 0.8,
            failure_reason: None,
            events: vec![EventRecord {
                converged: true,
                status: "success".to_string(),
                chi_square: 1.2,
                ndf: 1,
                iterations: 4,
                vertex_truth: [0.1, 0.2, 0.3],
                vertex_fit: [0.11, 0.19, 0.31],
                vertex_pull: [0.5, -0.4, 0.6],
            }],
        };

        let json = serde_json::to_string(&export).unwrap();
        // The passing summary omits the failure field entirely.
        assert!(!json.contains("failure_reason"));
        let back: SimExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.events.len(), 1);
        assert_eq!(back.seed, 42);
    }
}
