//! treefit_core - Decay-Tree Vertex and Kinematic Fitting
//!
//! This library fits a whole reconstructed decay chain at once:
//! 1. **Global state**: every vertex, momentum and decay length of the
//!    tree lives in one shared vector with per-node index ranges
//! 2. **Sequential Kalman filter**: each node's constraints (5-parameter
//!    helix, momentum conservation, vertex geometry) are folded in one at
//!    a time with a Joseph-form covariance update
//! 3. **Iterated relinearization**: flight lengths and helix snapshots
//!    are re-derived against the moving vertex estimates until the
//!    chi-square stabilizes

pub mod composite;
pub mod errcode;
pub mod error;
pub mod fitparams;
pub mod fitter;
pub mod helix;
pub mod input;
pub mod particle;
pub mod projection;
pub mod reco_track;

// Re-export key types for convenience
pub use errcode::{ErrCode, Severity};
pub use error::FitError;
pub use fitparams::{FitParams, IndexRange, NodeIndices, StateLayout};
pub use fitter::{FitConfig, FitState, FitResult, Fitter};
pub use helix::HelixParameters;
pub use input::RecordedTrack;
pub use particle::{DecayTree, DecayTreeBuilder, NodeIndex, ParticleBase};
pub use projection::Projection;
pub use reco_track::RecoTrack;
