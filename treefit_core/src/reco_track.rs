//! Track-backed leaf node: seeds its momentum from the measured helix and
//! contributes the 5-parameter track constraint.
//!
//! The node keeps a small cache (flight length, predicted helix snapshot,
//! Jacobian) with an explicit lifecycle: the flight length is only valid
//! after it was derived from a mother position, and the snapshot is only
//! valid for the exact flight length and mother position it was computed
//! from. Re-deriving the flight invalidates the snapshot; projecting with
//! a stale cache self-heals by recomputing both.

use nalgebra::{DMatrix, Vector3};

use crate::errcode::ErrCode;
use crate::fitparams::{FitParams, IndexRange, NodeIndices};
use crate::fitter::FitConfig;
use crate::helix::{self, Matrix5, Matrix5x6, Vector5};
use crate::particle::{ParticleBase, TrackInput};
use crate::projection::Projection;

/// Validity of the per-node cache, in increasing order of completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// No flight length derived yet.
    Uninitialized,
    /// Flight length valid; helix snapshot and Jacobian stale.
    FlightKnown,
    /// Snapshot and Jacobian match the cached flight length and the
    /// mother position it was derived from.
    ParamsCached,
}

/// A reconstructed charged trajectory as a tree leaf.
pub struct RecoTrack {
    track: Box<dyn TrackInput>,
    indices: NodeIndices,
    mother_pos: Option<IndexRange>,
    bz: f64,
    charge: f64,
    momentum_scale: f64,
    /// Measured helix parameters, curvature already calibrated.
    measured: Vector5,
    /// Covariance of `measured`, calibrated consistently.
    weight: Matrix5,
    covariance_inflation: f64,
    flight: f64,
    predicted: Vector5,
    jacobian: Matrix5x6,
    cache: CacheState,
    dims: [usize; 1],
}

impl RecoTrack {
    pub fn new(
        track: Box<dyn TrackInput>,
        indices: NodeIndices,
        mother_pos: Option<IndexRange>,
        config: &FitConfig,
    ) -> Self {
        let charge = track.charge();
        let scale = track.momentum_scale();

        // Calibrate the measurement once: a curvature scale of s means the
        // trajectory's true momentum is s times the recorded one, i.e. the
        // recorded curvature (and its errors) shrink by s.
        let mut measured = track.helix_parameters().to_vector();
        let mut weight = track.helix_covariance();
        measured[2] /= scale;
        for i in 0..5 {
            weight[(2, i)] /= scale;
            weight[(i, 2)] /= scale;
        }

        Self {
            track,
            indices,
            mother_pos,
            bz: config.bz,
            charge,
            momentum_scale: scale,
            measured,
            weight,
            covariance_inflation: config.covariance_inflation,
            flight: 0.0,
            predicted: Vector5::zeros(),
            jacobian: Matrix5x6::zeros(),
            cache: CacheState::Uninitialized,
            dims: [5],
        }
    }

    /// Cached 2D arc length from the perigee to the mother vertex.
    pub fn flight_length(&self) -> f64 {
        self.flight
    }

    /// Derive the flight length from the mother's current position
    /// estimate and cache it, invalidating the helix snapshot.
    ///
    /// With no mother position available the flight defaults to zero and
    /// a warning is recorded; the fit continues from the perigee.
    pub fn update_flight_to_mother(&mut self, state: &FitParams) -> ErrCode {
        let mut status = ErrCode::SUCCESS;
        self.flight = match self.mother_pos {
            Some(range) => {
                let vertex = state.vector3(range);
                match self.track.arc_length_at_poca(vertex.x, vertex.y) {
                    Some(s) => s,
                    None => {
                        status |= ErrCode::POCA_FAILURE;
                        0.0
                    }
                }
            }
            None => {
                status |= ErrCode::POCA_FAILURE;
                0.0
            }
        };
        self.cache = CacheState::FlightKnown;
        status
    }

    /// Recompute the predicted 5-parameter snapshot and its Jacobian from
    /// the current (mother position, own momentum) state.
    pub fn update_params(&mut self, state: &FitParams) -> ErrCode {
        let mut status = ErrCode::SUCCESS;
        if self.cache == CacheState::Uninitialized {
            status |= self.update_flight_to_mother(state);
            if status.is_fatal() {
                return status;
            }
        }
        let pos = match self.mother_pos {
            Some(range) => state.vector3(range),
            None => return status | ErrCode::MISSING_INPUT,
        };
        let mom = match self.indices.mom {
            Some(range) => state.vector3(range),
            None => return status | ErrCode::MISSING_INPUT,
        };

        let helix = match helix::helix_from_vertex(&pos, &mom, self.charge, self.bz) {
            Ok((h, _)) => h,
            Err(_) => return status | ErrCode::DEGENERATE,
        };
        let jac = match helix::jacobian_to_cartesian(&pos, &mom, self.charge, self.bz) {
            Ok(j) => j,
            Err(_) => return status | ErrCode::DEGENERATE,
        };

        self.predicted = helix.to_vector();
        self.jacobian = jac;
        self.cache = CacheState::ParamsCached;
        status
    }

    fn seed_momentum(&self) -> Vector3<f64> {
        self.momentum_scale * self.track.momentum_at_arc_length(self.flight, self.bz)
    }
}

impl ParticleBase for RecoTrack {
    fn init_particle_with_mother(&mut self, state: &mut FitParams) -> ErrCode {
        let mut status = ErrCode::SUCCESS;
        if self.cache == CacheState::Uninitialized {
            status |= self.update_flight_to_mother(state);
            if status.is_fatal() {
                return status;
            }
        }
        let mom_range = match self.indices.mom {
            Some(range) => range,
            None => return status | ErrCode::BAD_SETUP,
        };
        let mom = self.seed_momentum();
        state.set_vector3(mom_range, &mom);
        status
    }

    /// A track without a vertex to anchor to has nothing to seed here.
    fn init_motherless_particle(&mut self, _state: &mut FitParams) -> ErrCode {
        ErrCode::SUCCESS
    }

    fn init_covariance(&self, state: &mut FitParams) -> ErrCode {
        let mom_range = match self.indices.mom {
            Some(range) => range,
            None => return ErrCode::BAD_SETUP,
        };
        let error = self.track.momentum_error();
        let mut status = ErrCode::SUCCESS;
        let cov = state.cov_mut();
        for k in 0..3 {
            let mut variance = error[(k, k)];
            if !variance.is_finite() || variance <= 0.0 {
                // Implausible provider estimate: fall back to 1 (GeV/c)^2
                // and record that the seed was overridden.
                variance = 1.0;
                status |= ErrCode::COVARIANCE_RESET;
            }
            let idx = mom_range.offset + k;
            cov[(idx, idx)] = variance * self.covariance_inflation;
        }
        status
    }

    fn constraint_dims(&self) -> &[usize] {
        &self.dims
    }

    fn project_constraint(
        &mut self,
        index: usize,
        state: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        if index != 0 {
            return ErrCode::BAD_SETUP;
        }
        let (pos_range, mom_range) = match (self.mother_pos, self.indices.mom) {
            (Some(p), Some(m)) => (p, m),
            _ => return ErrCode::MISSING_INPUT,
        };

        // Self-heal a stale cache; the snapshot must be a linearization at
        // the current state.
        let mut status = ErrCode::SUCCESS;
        if self.cache != CacheState::ParamsCached {
            status |= self.update_params(state);
            if status.is_fatal() {
                return status;
            }
        }

        // Residual: measured minus predicted, with the periodic azimuth
        // wrapped into (-pi, pi].
        let residual = projection.residual_mut();
        for row in 0..5 {
            residual[row] = self.measured[row] - self.predicted[row];
        }
        residual[1] = helix::wrap_angle(residual[1]);

        // Measurement covariance, lower triangle.
        for i in 0..5 {
            for j in 0..=i {
                projection.v_mut()[(i, j)] = self.weight[(i, j)];
            }
        }

        // The residual is measured - predicted(pos, mom), so its Jacobian
        // is the negated prediction Jacobian, split into the mother's
        // position columns and this node's momentum columns.
        let mut pos_block = DMatrix::zeros(5, 3);
        let mut mom_block = DMatrix::zeros(5, 3);
        for row in 0..5 {
            for col in 0..3 {
                pos_block[(row, col)] = -self.jacobian[(row, col)];
                mom_block[(row, col)] = -self.jacobian[(row, col + 3)];
            }
        }
        projection.set_h_block(pos_range, &pos_block);
        projection.set_h_block(mom_range, &mom_block);

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitparams::StateLayout;
    use crate::input::RecordedTrack;
    use approx::assert_relative_eq;

    const BZ: f64 = 1.5;

    struct Fixture {
        node: RecoTrack,
        params: FitParams,
        pos_range: IndexRange,
        mom_range: IndexRange,
    }

    fn fixture(pos: Vector3<f64>, mom: Vector3<f64>, charge: f64, bz: f64) -> Fixture {
        let mut layout = StateLayout::new();
        let pos_range = layout.reserve(3).unwrap();
        let mom_range = layout.reserve(3).unwrap();
        layout.seal();
        let params = FitParams::from_layout(&layout, 2).unwrap();

        let track =
            RecordedTrack::from_vertex(&pos, &mom, charge, bz, Matrix5::identity() * 1e-4)
                .unwrap();
        let config = FitConfig {
            bz,
            ..FitConfig::default()
        };
        let indices = NodeIndices {
            mom: Some(mom_range),
            ..NodeIndices::default()
        };
        let node = RecoTrack::new(Box::new(track), indices, Some(pos_range), &config);
        Fixture {
            node,
            params,
            pos_range,
            mom_range,
        }
    }

    #[test]
    fn test_motherless_init_is_a_silent_no_op() {
        let mut fx = fixture(
            Vector3::zeros(),
            Vector3::new(0.8, 0.3, 0.5),
            1.0,
            BZ,
        );
        let before = fx.params.par().clone();
        let status = fx.node.init_motherless_particle(&mut fx.params);
        assert!(status.is_success());
        assert_eq!(fx.params.par(), &before);
    }

    #[test]
    fn test_straight_track_through_origin_seeds_exact_momentum() {
        // Zero field, trajectory through the origin: the closest approach
        // to a mother seeded at the origin is the perigee itself, and the
        // seeded momentum reproduces the generated one exactly.
        let mom = Vector3::new(1.0, 0.0, 1.0);
        let mut fx = fixture(Vector3::zeros(), mom, 1.0, 0.0);

        let status = fx.node.update_flight_to_mother(&fx.params);
        assert!(status.is_success());
        assert_relative_eq!(fx.node.flight_length(), 0.0, epsilon = 1e-12);

        let status = fx.node.init_particle_with_mother(&mut fx.params);
        assert!(status.is_success());
        assert_relative_eq!(fx.params.vector3(fx.mom_range), mom, epsilon = 1e-12);
    }

    #[test]
    fn test_projection_residual_vanishes_at_truth() {
        // Seeding the state with the generating vertex and momentum must
        // give a (numerically) zero residual.
        let pos = Vector3::new(0.2, -0.1, 0.4);
        let mom = Vector3::new(0.7, 0.9, -0.3);
        let mut fx = fixture(pos, mom, 1.0, BZ);

        fx.params.set_vector3(fx.pos_range, &pos);
        fx.params.set_vector3(fx.mom_range, &mom);

        let mut proj = Projection::new(5, fx.params.dim());
        let status = fx.node.project_constraint(0, &fx.params, &mut proj);
        assert!(!status.is_fatal());
        assert!(proj.residual().norm() < 1e-9, "residual {:?}", proj.residual());
    }

    #[test]
    fn test_projection_jacobian_is_negated_prediction_jacobian() {
        let pos = Vector3::new(0.3, 0.1, -0.2);
        let mom = Vector3::new(-0.5, 1.1, 0.6);
        let mut fx = fixture(pos, mom, -1.0, BZ);

        fx.params.set_vector3(fx.pos_range, &pos);
        fx.params.set_vector3(fx.mom_range, &mom);

        let mut proj = Projection::new(5, fx.params.dim());
        assert!(!fx.node.project_constraint(0, &fx.params, &mut proj).is_fatal());

        let jac = helix::jacobian_to_cartesian(&pos, &mom, -1.0, BZ).unwrap();
        for row in 0..5 {
            for col in 0..3 {
                assert_relative_eq!(
                    proj.h()[(row, fx.pos_range.offset + col)],
                    -jac[(row, col)],
                    epsilon = 1e-12
                );
                assert_relative_eq!(
                    proj.h()[(row, fx.mom_range.offset + col)],
                    -jac[(row, col + 3)],
                    epsilon = 1e-12
                );
            }
        }
    }

    #[test]
    fn test_update_params_idempotent_for_fixed_mother() {
        let pos = Vector3::new(0.5, 0.2, 0.1);
        let mom = Vector3::new(0.9, -0.4, 0.7);
        let mut fx = fixture(pos, mom, 1.0, BZ);

        fx.params.set_vector3(fx.pos_range, &pos);
        fx.params.set_vector3(fx.mom_range, &mom);

        assert!(fx.node.update_flight_to_mother(&fx.params).is_success());
        let first_flight = fx.node.flight_length();
        assert!(fx.node.update_params(&fx.params).is_success());
        let first_predicted = fx.node.predicted;

        let first_jacobian = fx.node.jacobian;

        // Re-deriving against the same mother position is a pure function
        // of the state, so the caches come back bit-for-bit identical.
        assert!(fx.node.update_flight_to_mother(&fx.params).is_success());
        assert_eq!(fx.node.flight_length(), first_flight);
        assert!(fx.node.update_params(&fx.params).is_success());
        assert_eq!(fx.node.predicted, first_predicted);
        assert_eq!(fx.node.jacobian, first_jacobian);
    }

    #[test]
    fn test_flight_defaults_to_zero_without_mother() {
        let mut layout = StateLayout::new();
        let mom_range = layout.reserve(3).unwrap();
        layout.seal();
        let params = FitParams::from_layout(&layout, 1).unwrap();

        let track = RecordedTrack::from_vertex(
            &Vector3::zeros(),
            &Vector3::new(0.6, 0.4, 0.2),
            1.0,
            BZ,
            Matrix5::identity() * 1e-4,
        )
        .unwrap();
        let indices = NodeIndices {
            mom: Some(mom_range),
            ..NodeIndices::default()
        };
        let mut node = RecoTrack::new(Box::new(track), indices, None, &FitConfig::default());

        let status = node.update_flight_to_mother(&params);
        assert!(status.is_warning());
        assert!(status.contains(ErrCode::POCA_FAILURE));
        assert_eq!(node.flight_length(), 0.0);
    }

    #[test]
    fn test_degenerate_state_momentum_is_fatal() {
        let pos = Vector3::new(0.1, 0.0, 0.3);
        let mom = Vector3::new(0.8, 0.2, 0.4);
        let mut fx = fixture(pos, mom, 1.0, BZ);

        fx.params.set_vector3(fx.pos_range, &pos);
        // Iteration drove the momentum purely longitudinal: no curvature
        // direction, the candidate must be abandoned.
        fx.params.set_vector3(fx.mom_range, &Vector3::new(0.0, 0.0, 1.0));

        let status = fx.node.update_params(&fx.params);
        assert!(status.is_fatal());
        assert!(status.contains(ErrCode::DEGENERATE));
    }

    #[test]
    fn test_covariance_seed_is_inflated_diagonal() {
        let mut fx = fixture(
            Vector3::zeros(),
            Vector3::new(0.5, 0.5, 0.5),
            1.0,
            BZ,
        );
        let status = fx.node.init_covariance(&mut fx.params);
        assert!(status.is_success());

        let inflation = FitConfig::default().covariance_inflation;
        for k in 0..3 {
            let idx = fx.mom_range.offset + k;
            assert_relative_eq!(fx.params.cov()[(idx, idx)], 1e-4 * inflation);
        }
        // Position block untouched
        assert_eq!(fx.params.cov()[(fx.pos_range.offset, fx.pos_range.offset)], 0.0);
    }

    #[test]
    fn test_implausible_momentum_error_is_reset_with_warning() {
        let mut layout = StateLayout::new();
        let pos_range = layout.reserve(3).unwrap();
        let mom_range = layout.reserve(3).unwrap();
        layout.seal();
        let mut params = FitParams::from_layout(&layout, 2).unwrap();

        let mut track = RecordedTrack::from_vertex(
            &Vector3::zeros(),
            &Vector3::new(0.5, 0.5, 0.5),
            1.0,
            BZ,
            Matrix5::identity() * 1e-4,
        )
        .unwrap();
        track.momentum_error[(1, 1)] = -2.0;

        let indices = NodeIndices {
            mom: Some(mom_range),
            ..NodeIndices::default()
        };
        let node = RecoTrack::new(Box::new(track), indices, Some(pos_range), &FitConfig::default());

        let status = node.init_covariance(&mut params);
        assert!(status.is_warning());
        assert!(status.contains(ErrCode::COVARIANCE_RESET));
        let inflation = FitConfig::default().covariance_inflation;
        assert_eq!(params.cov()[(mom_range.offset + 1, mom_range.offset + 1)], inflation);
    }

    #[test]
    fn test_momentum_scale_calibrates_curvature_and_seed() {
        let pos = Vector3::zeros();
        let mom = Vector3::new(1.0, 0.0, 0.5);
        let mut track = RecordedTrack::from_vertex(
            &pos,
            &mom,
            1.0,
            BZ,
            Matrix5::identity() * 1e-4,
        )
        .unwrap();
        track.momentum_scale = 1.02;
        let raw_omega = track.helix.omega;

        let mut layout = StateLayout::new();
        let pos_range = layout.reserve(3).unwrap();
        let mom_range = layout.reserve(3).unwrap();
        layout.seal();
        let mut params = FitParams::from_layout(&layout, 2).unwrap();

        let config = FitConfig {
            bz: BZ,
            ..FitConfig::default()
        };
        let indices = NodeIndices {
            mom: Some(mom_range),
            ..NodeIndices::default()
        };
        let mut node = RecoTrack::new(Box::new(track), indices, Some(pos_range), &config);

        assert_relative_eq!(node.measured[2], raw_omega / 1.02, epsilon = 1e-15);

        // The seeded momentum is scaled up consistently, so the residual
        // at the seed stays (numerically) zero.
        assert!(node.init_particle_with_mother(&mut params).is_success());
        let seeded = params.vector3(mom_range);
        assert_relative_eq!(seeded, 1.02 * mom, epsilon = 1e-12);

        let mut proj = Projection::new(5, params.dim());
        assert!(!node.project_constraint(0, &params, &mut proj).is_fatal());
        assert!(proj.residual().norm() < 1e-9);
    }
}
