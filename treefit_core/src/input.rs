//! Narrow read-only interfaces to the surrounding reconstruction
//! framework.
//!
//! The fit engine never owns detector data; it consumes a trajectory, a
//! field value, a momentum error estimate and a calibration scale through
//! the traits below. [`RecordedTrack`] is the concrete implementation used
//! by the synthetic-event harness and the tests.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::helix::{self, HelixParameters, Matrix5};

/// A reconstructed helix-parameterized trajectory.
///
/// All queries are read-only; the fit never mutates the backing track.
pub trait TrajectorySource {
    /// The five measured helix parameters.
    fn helix_parameters(&self) -> HelixParameters;

    /// The 5x5 covariance of the measured parameters.
    fn helix_covariance(&self) -> Matrix5;

    /// Electric charge of the particle, in units of e.
    fn charge(&self) -> f64;

    /// Momentum of the trajectory at a 2D arc length from the perigee.
    fn momentum_at_arc_length(&self, flight: f64, bz: f64) -> Vector3<f64>;

    /// 2D arc length at which the trajectory passes closest to a
    /// transverse point, if defined.
    fn arc_length_at_poca(&self, x: f64, y: f64) -> Option<f64>;
}

/// Magnetic field lookup. The fit samples it once, at the origin, and
/// treats the z component as uniform for the whole candidate.
pub trait FieldSource {
    fn bz_at_origin(&self) -> f64;
}

/// Momentum error estimate used for the rough seed covariance. Only the
/// diagonal of the 3x3 momentum block is consumed.
pub trait MomentumErrorSource {
    fn momentum_error(&self) -> Matrix3<f64>;
}

/// Calibration scale applied to the curvature parameter, read once at
/// node construction.
pub trait MomentumScaleSource {
    fn momentum_scale(&self) -> f64;
}

// ============================================================================
// CONCRETE TRACK RECORD
// ============================================================================

/// An owned snapshot of one reconstructed track, implementing every input
/// interface the fit engine needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTrack {
    /// Measured helix parameters at the perigee.
    pub helix: HelixParameters,
    /// 5x5 covariance of the measured parameters.
    pub covariance: Matrix5,
    /// Charge in units of e.
    pub charge: f64,
    /// Transverse momentum, stored explicitly so the record stays usable
    /// in a vanishing field where the curvature carries no magnitude.
    pub pt: f64,
    /// z component of the field at the origin, Tesla.
    pub bz: f64,
    /// Curvature calibration scale.
    pub momentum_scale: f64,
    /// Diagonal momentum error estimate, (GeV/c)^2.
    pub momentum_error: Matrix3<f64>,
}

impl RecordedTrack {
    /// Build a record from a trajectory's vertex-frame description.
    pub fn from_vertex(
        pos: &Vector3<f64>,
        mom: &Vector3<f64>,
        charge: f64,
        bz: f64,
        covariance: Matrix5,
    ) -> Result<Self, crate::error::FitError> {
        let (helix, _) = helix::helix_from_vertex(pos, mom, charge, bz)?;
        Ok(Self {
            helix,
            covariance,
            charge,
            pt: mom.xy().norm(),
            bz,
            momentum_scale: 1.0,
            momentum_error: Matrix3::identity() * 1e-4,
        })
    }
}

impl TrajectorySource for RecordedTrack {
    fn helix_parameters(&self) -> HelixParameters {
        self.helix
    }

    fn helix_covariance(&self) -> Matrix5 {
        self.covariance
    }

    fn charge(&self) -> f64 {
        self.charge
    }

    fn momentum_at_arc_length(&self, flight: f64, _bz: f64) -> Vector3<f64> {
        helix::momentum_at_arc_length(&self.helix, flight, self.pt)
    }

    fn arc_length_at_poca(&self, x: f64, y: f64) -> Option<f64> {
        helix::arc_length_at_poca(&self.helix, x, y)
    }
}

impl FieldSource for RecordedTrack {
    fn bz_at_origin(&self) -> f64 {
        self.bz
    }
}

impl MomentumErrorSource for RecordedTrack {
    fn momentum_error(&self) -> Matrix3<f64> {
        self.momentum_error
    }
}

impl MomentumScaleSource for RecordedTrack {
    fn momentum_scale(&self) -> f64 {
        self.momentum_scale
    }
}
