//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the generated event:
//! - True decay vertices and daughter momenta
//! - Helix parameterization of every charged daughter
//! - Measurement smearing with a seeded, reproducible RNG

use nalgebra::Vector3;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use treefit_core::helix::{self, Matrix5, MIN_TRANSVERSE_MOMENTUM};
use treefit_core::RecordedTrack;

use crate::SimError;

/// Gaussian resolutions applied to the five helix parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackResolution {
    /// Impact parameter resolution, cm.
    pub d0: f64,
    /// Azimuth resolution, rad.
    pub phi0: f64,
    /// Curvature resolution, 1/cm.
    pub omega: f64,
    /// Longitudinal impact resolution, cm.
    pub z0: f64,
    /// Dip tangent resolution.
    pub tan_lambda: f64,
}

impl Default for TrackResolution {
    fn default() -> Self {
        // Ballpark silicon-tracker numbers.
        Self {
            d0: 5e-3,
            phi0: 1e-3,
            omega: 1e-5,
            z0: 1e-2,
            tan_lambda: 1e-3,
        }
    }
}

impl TrackResolution {
    fn sigmas(&self) -> [f64; 5] {
        [self.d0, self.phi0, self.omega, self.z0, self.tan_lambda]
    }

    /// Diagonal 5x5 covariance consistent with the smearing.
    pub fn covariance(&self) -> Matrix5 {
        let mut cov = Matrix5::zeros();
        for (k, sigma) in self.sigmas().iter().enumerate() {
            cov[(k, k)] = sigma * sigma;
        }
        cov
    }
}

/// One generated charged daughter: the truth and its smeared measurement.
#[derive(Debug, Clone)]
pub struct GeneratedTrack {
    /// True momentum at the production vertex.
    pub truth_momentum: Vector3<f64>,
    /// Charge in units of e.
    pub charge: f64,
    /// The smeared measurement handed to the fit.
    pub record: RecordedTrack,
}

/// A decay at a single vertex.
#[derive(Debug, Clone)]
pub struct SingleVertexEvent {
    pub vertex: Vector3<f64>,
    pub tracks: Vec<GeneratedTrack>,
}

/// A two-vertex cascade: a primary decay producing one prompt track and
/// an intermediate that flies before decaying into two tracks.
#[derive(Debug, Clone)]
pub struct CascadeEvent {
    pub primary_vertex: Vector3<f64>,
    pub secondary_vertex: Vector3<f64>,
    /// True flight length of the intermediate.
    pub decay_length: f64,
    pub prompt_track: GeneratedTrack,
    pub secondary_tracks: Vec<GeneratedTrack>,
}

/// Deterministic event generator.
pub struct Oracle {
    rng: ChaCha8Rng,
    bz: f64,
    resolution: TrackResolution,
}

impl Oracle {
    pub fn new(seed: u64, bz: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            bz,
            resolution: TrackResolution::default(),
        }
    }

    pub fn bz(&self) -> f64 {
        self.bz
    }

    pub fn resolution(&self) -> &TrackResolution {
        &self.resolution
    }

    /// n tracks of alternating charge from one vertex near the origin.
    pub fn single_vertex_event(&mut self, n_tracks: usize) -> Result<SingleVertexEvent, SimError> {
        let vertex = self.sample_vertex();
        let mut tracks = Vec::with_capacity(n_tracks);
        for k in 0..n_tracks {
            let charge = if k % 2 == 0 { 1.0 } else { -1.0 };
            let momentum = self.sample_momentum();
            tracks.push(self.generate_track(&vertex, &momentum, charge)?);
        }
        Ok(SingleVertexEvent { vertex, tracks })
    }

    /// A primary vertex with one prompt track, plus an intermediate that
    /// flies along its momentum before decaying into two tracks. The
    /// generated topology satisfies the line-of-flight geometry exactly.
    pub fn cascade_event(&mut self) -> Result<CascadeEvent, SimError> {
        let primary_vertex = self.sample_vertex();
        let intermediate_momentum = self.sample_momentum() * 2.0;
        let p = intermediate_momentum.norm();
        let decay_length = self.rng.gen_range(0.2..1.0);
        let secondary_vertex = primary_vertex + decay_length * intermediate_momentum / p;

        // Split the intermediate momentum between two daughters so the
        // pair sums back exactly.
        let d1 = 0.5 * intermediate_momentum + self.sample_split();
        let d2 = intermediate_momentum - d1;

        let prompt_momentum = self.sample_momentum();
        Ok(CascadeEvent {
            primary_vertex,
            secondary_vertex,
            decay_length,
            prompt_track: self.generate_track(&primary_vertex, &prompt_momentum, -1.0)?,
            secondary_tracks: vec![
                self.generate_track(&secondary_vertex, &d1, 1.0)?,
                self.generate_track(&secondary_vertex, &d2, -1.0)?,
            ],
        })
    }

    /// Helix-parameterize the true trajectory, then smear each parameter
    /// with the configured Gaussian resolution.
    pub fn generate_track(
        &mut self,
        vertex: &Vector3<f64>,
        momentum: &Vector3<f64>,
        charge: f64,
    ) -> Result<GeneratedTrack, SimError> {
        let (truth_helix, _) = helix::helix_from_vertex(vertex, momentum, charge, self.bz)?;

        let mut smeared = truth_helix.to_vector();
        for (k, &sigma) in self.resolution.sigmas().iter().enumerate() {
            let delta: f64 = self.rng.sample(StandardNormal);
            smeared[k] += sigma * delta;
        }
        let smeared = helix::HelixParameters::from_vector(&smeared);

        let truth_pt = momentum.xy().norm();
        // In a vanishing field the smeared curvature carries no momentum
        // scale; fall back to the generated transverse momentum.
        let pt = helix::transverse_momentum(smeared.omega, charge, self.bz).unwrap_or(truth_pt);

        Ok(GeneratedTrack {
            truth_momentum: *momentum,
            charge,
            record: RecordedTrack {
                helix: smeared,
                covariance: self.resolution.covariance(),
                charge,
                pt,
                bz: self.bz,
                momentum_scale: 1.0,
                momentum_error: nalgebra::Matrix3::identity() * 1e-3,
            },
        })
    }

    fn sample_vertex(&mut self) -> Vector3<f64> {
        Vector3::new(
            self.rng.gen_range(-0.3..0.3),
            self.rng.gen_range(-0.3..0.3),
            self.rng.gen_range(-1.0..1.0),
        )
    }

    /// A momentum with a transverse component comfortably above the
    /// curvature-validity threshold.
    fn sample_momentum(&mut self) -> Vector3<f64> {
        loop {
            let mom = Vector3::new(
                self.rng.gen_range(-1.0..1.0),
                self.rng.gen_range(-1.0..1.0),
                self.rng.gen_range(-1.0..1.0),
            );
            if mom.xy().norm() > 0.2 + MIN_TRANSVERSE_MOMENTUM {
                return mom;
            }
        }
    }

    /// A small momentum imbalance for splitting a composite's momentum
    /// between two daughters.
    fn sample_split(&mut self) -> Vector3<f64> {
        Vector3::new(
            self.rng.gen_range(-0.1..0.1),
            self.rng.gen_range(-0.1..0.1),
            self.rng.gen_range(-0.1..0.1),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_event() {
        let mut a = Oracle::new(7, 1.5);
        let mut b = Oracle::new(7, 1.5);
        let ev_a = a.single_vertex_event(3).unwrap();
        let ev_b = b.single_vertex_event(3).unwrap();

        assert_eq!(ev_a.vertex, ev_b.vertex);
        for (ta, tb) in ev_a.tracks.iter().zip(&ev_b.tracks) {
            assert_eq!(ta.truth_momentum, tb.truth_momentum);
            assert_eq!(ta.record.helix, tb.record.helix);
        }
    }

    #[test]
    fn test_cascade_topology_is_consistent() {
        let mut oracle = Oracle::new(11, 1.5);
        let event = oracle.cascade_event().unwrap();

        // Secondary vertex lies on the line from the primary along the
        // summed daughter momentum.
        let total: Vector3<f64> = event
            .secondary_tracks
            .iter()
            .map(|t| t.truth_momentum)
            .sum();
        let displacement = event.secondary_vertex - event.primary_vertex;
        let expected = event.decay_length * total / total.norm();
        assert!((displacement - expected).norm() < 1e-12);
    }

    #[test]
    fn test_smearing_stays_near_truth() {
        let mut oracle = Oracle::new(3, 1.5);
        let vertex = Vector3::new(0.1, -0.2, 0.5);
        let momentum = Vector3::new(0.8, 0.4, 0.3);
        let track = oracle.generate_track(&vertex, &momentum, 1.0).unwrap();

        let (truth, _) = helix::helix_from_vertex(&vertex, &momentum, 1.0, 1.5).unwrap();
        let res = oracle.resolution().clone();
        // 6 sigma bounds; the deterministic seed keeps this stable.
        assert!((track.record.helix.d0 - truth.d0).abs() < 6.0 * res.d0);
        assert!((track.record.helix.phi0 - truth.phi0).abs() < 6.0 * res.phi0);
        assert!((track.record.helix.omega - truth.omega).abs() < 6.0 * res.omega);
    }
}
