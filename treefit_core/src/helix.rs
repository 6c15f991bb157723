//! Stateless helix geometry for charged trajectories in a uniform field.
//!
//! Perigee parameterization `(d0, phi0, omega, z0, tan_lambda)` with the
//! field along +z. Units: lengths in cm, momenta in GeV/c, field in Tesla,
//! curvature omega in 1/cm. All functions here are pure conversions; the
//! only state lives in the tree nodes that call them.
//!
//! Conventions used throughout:
//!   - The perigee point is `(-d0 sin(phi0), d0 cos(phi0), z0)`.
//!   - `phi(s) = phi0 + omega * s` where `s` is the 2D (transverse) arc
//!     length measured from the perigee ("flight length").
//!   - `omega = C_LIGHT * charge * bz / pt`, so a positive particle in a
//!     positive field curves with positive omega.

use nalgebra::{SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::FitError;

/// 5-component helix parameter vector.
pub type Vector5 = SVector<f64, 5>;
/// 5x5 helix covariance.
pub type Matrix5 = SMatrix<f64, 5, 5>;
/// Jacobian of the 5 helix parameters w.r.t. (x, y, z, px, py, pz).
pub type Matrix5x6 = SMatrix<f64, 5, 6>;

/// Curvature constant: omega [1/cm] = C_LIGHT * q * B[T] / pt[GeV/c].
pub const C_LIGHT: f64 = 0.00299792458;

/// Below this transverse momentum (GeV/c) the curvature direction is
/// undefined and conversions refuse to proceed.
pub const MIN_TRANSVERSE_MOMENTUM: f64 = 1e-6;

/// Curvatures below this magnitude are treated as straight lines.
const OMEGA_EPS: f64 = 1e-12;

// ============================================================================
// HELIX PARAMETERS
// ============================================================================

/// The five perigee parameters of a charged trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HelixParameters {
    /// Signed transverse impact parameter.
    pub d0: f64,
    /// Azimuth of the momentum at the perigee.
    pub phi0: f64,
    /// Signed curvature, 1/cm.
    pub omega: f64,
    /// z coordinate of the perigee.
    pub z0: f64,
    /// Tangent of the dip angle, pz / pt.
    pub tan_lambda: f64,
}

impl HelixParameters {
    pub fn from_vector(v: &Vector5) -> Self {
        Self {
            d0: v[0],
            phi0: v[1],
            omega: v[2],
            z0: v[3],
            tan_lambda: v[4],
        }
    }

    pub fn to_vector(&self) -> Vector5 {
        Vector5::new(self.d0, self.phi0, self.omega, self.z0, self.tan_lambda)
    }

    /// Perigee point of the trajectory.
    pub fn perigee(&self) -> Vector3<f64> {
        Vector3::new(
            -self.d0 * self.phi0.sin(),
            self.d0 * self.phi0.cos(),
            self.z0,
        )
    }
}

// ============================================================================
// ANGLE WRAPPING
// ============================================================================

/// Wrap an angle into `(-pi, pi]`.
///
/// Used for the periodic phi0 residual: without wrapping, a measured and
/// a predicted azimuth straddling the +-pi boundary would produce a
/// spurious residual of nearly 2*pi.
pub fn wrap_angle(x: f64) -> f64 {
    let two_pi = 2.0 * PI;
    let mut r = x % two_pi;
    if r > PI {
        r -= two_pi;
    } else if r <= -PI {
        r += two_pi;
    }
    r
}

// ============================================================================
// VERTEX <-> HELIX CONVERSIONS
// ============================================================================

/// Compute the helix parameters of a trajectory passing through `pos`
/// with momentum `mom`, plus the 2D arc length of `pos` from the perigee.
///
/// Closed form, numerically stable for `omega -> 0` (straight line).
/// Fails for transverse momenta below [`MIN_TRANSVERSE_MOMENTUM`].
pub fn helix_from_vertex(
    pos: &Vector3<f64>,
    mom: &Vector3<f64>,
    charge: f64,
    bz: f64,
) -> Result<(HelixParameters, f64), FitError> {
    let pt = mom.xy().norm();
    if pt < MIN_TRANSVERSE_MOMENTUM {
        return Err(FitError::DegenerateTrajectory {
            pt,
            min: MIN_TRANSVERSE_MOMENTUM,
        });
    }

    let aq = C_LIGHT * charge * bz;
    let omega = aq / pt;
    let tan_lambda = mom.z / pt;
    let phi_p = mom.y.atan2(mom.x);
    let (sin_p, cos_p) = phi_p.sin_cos();

    // Coordinates of the vertex in the frame aligned with the momentum:
    // l along the transverse momentum direction, d along its +90 degree
    // rotation.
    let l = pos.x * cos_p + pos.y * sin_p;
    let d = -pos.x * sin_p + pos.y * cos_p;

    // zeta = (1 + omega*d)^2 + (omega*l)^2
    let u = d * d + l * l;
    let zeta = 1.0 + 2.0 * omega * d + omega * omega * u;
    let sqrt_zeta = zeta.sqrt();

    // Rationalized form of (sqrt(zeta) - 1) / omega, finite at omega = 0.
    let d0 = (2.0 * d + omega * u) / (1.0 + sqrt_zeta);

    // Arc angle from the perigee to the vertex.
    let chi = (omega * l).atan2(1.0 + omega * d);
    let phi0 = wrap_angle(phi_p - chi);

    let flight = if omega.abs() > OMEGA_EPS {
        chi / omega
    } else {
        l
    };
    let z0 = pos.z - tan_lambda * flight;

    Ok((
        HelixParameters {
            d0,
            phi0,
            omega,
            z0,
            tan_lambda,
        },
        flight,
    ))
}

/// Evaluate position and momentum on a helix at 2D arc length `flight`
/// from the perigee. `pt` fixes the momentum magnitude, which the five
/// parameters alone do not determine when the field vanishes.
pub fn vertex_from_helix(
    helix: &HelixParameters,
    flight: f64,
    pt: f64,
) -> (Vector3<f64>, Vector3<f64>) {
    let (sin0, cos0) = helix.phi0.sin_cos();
    let phi = helix.phi0 + helix.omega * flight;
    let (sin_f, cos_f) = phi.sin_cos();

    let (x, y) = if helix.omega.abs() > OMEGA_EPS {
        (
            -helix.d0 * sin0 + (sin_f - sin0) / helix.omega,
            helix.d0 * cos0 - (cos_f - cos0) / helix.omega,
        )
    } else {
        (
            -helix.d0 * sin0 + flight * cos0,
            helix.d0 * cos0 + flight * sin0,
        )
    };
    let z = helix.z0 + helix.tan_lambda * flight;

    let mom = Vector3::new(pt * cos_f, pt * sin_f, pt * helix.tan_lambda);
    (Vector3::new(x, y, z), mom)
}

/// Momentum on a helix at 2D arc length `flight` from the perigee.
pub fn momentum_at_arc_length(helix: &HelixParameters, flight: f64, pt: f64) -> Vector3<f64> {
    let phi = helix.phi0 + helix.omega * flight;
    let (sin_f, cos_f) = phi.sin_cos();
    Vector3::new(pt * cos_f, pt * sin_f, pt * helix.tan_lambda)
}

/// Transverse momentum implied by a measured curvature, if the field and
/// curvature allow it.
pub fn transverse_momentum(omega: f64, charge: f64, bz: f64) -> Option<f64> {
    if omega.abs() < OMEGA_EPS {
        return None;
    }
    let pt = C_LIGHT * charge * bz / omega;
    (pt.is_finite() && pt > 0.0).then_some(pt)
}

// ============================================================================
// POINT OF CLOSEST APPROACH
// ============================================================================

/// 2D arc length at which the trajectory passes closest to the transverse
/// point `(x, y)`. Deterministic closed form, not an iterative search.
///
/// Returns `None` when the point coincides with the helix axis, where
/// every azimuth is equally close.
pub fn arc_length_at_poca(helix: &HelixParameters, x: f64, y: f64) -> Option<f64> {
    let (sin0, cos0) = helix.phi0.sin_cos();

    if helix.omega.abs() <= OMEGA_EPS {
        // Straight line: project onto the direction of motion.
        let px = x + helix.d0 * sin0;
        let py = y - helix.d0 * cos0;
        return Some(px * cos0 + py * sin0);
    }

    // Circle center in the transverse plane.
    let rho = helix.d0 + 1.0 / helix.omega;
    let cx = -rho * sin0;
    let cy = rho * cos0;

    let dx = x - cx;
    let dy = y - cy;
    if dx.hypot(dy) < 1e-12 {
        return None;
    }

    // Azimuth of the closest point on the circle, then the shortest arc
    // back to the perigee.
    let sign = helix.omega.signum();
    let phi_t = (sign * dx).atan2(-sign * dy);
    Some(wrap_angle(phi_t - helix.phi0) / helix.omega)
}

// ============================================================================
// ANALYTIC JACOBIAN
// ============================================================================

/// Analytic 5x6 Jacobian of `(d0, phi0, omega, z0, tan_lambda)` with
/// respect to `(x, y, z, px, py, pz)`, evaluated at the given vertex.
///
/// Must be evaluated at the exact `(pos, mom, charge, bz)` used for the
/// corresponding prediction to remain a valid local linearization.
pub fn jacobian_to_cartesian(
    pos: &Vector3<f64>,
    mom: &Vector3<f64>,
    charge: f64,
    bz: f64,
) -> Result<Matrix5x6, FitError> {
    let pt = mom.xy().norm();
    if pt < MIN_TRANSVERSE_MOMENTUM {
        return Err(FitError::DegenerateTrajectory {
            pt,
            min: MIN_TRANSVERSE_MOMENTUM,
        });
    }

    let aq = C_LIGHT * charge * bz;
    let omega = aq / pt;
    let tan_lambda = mom.z / pt;
    let phi_p = mom.y.atan2(mom.x);
    let (sin_p, cos_p) = phi_p.sin_cos();

    let l = pos.x * cos_p + pos.y * sin_p;
    let d = -pos.x * sin_p + pos.y * cos_p;
    let u = d * d + l * l;
    let zeta = 1.0 + 2.0 * omega * d + omega * omega * u;
    let sqrt_zeta = zeta.sqrt();
    let chi = (omega * l).atan2(1.0 + omega * d);

    // --- partials of the parameters w.r.t. the frame coordinates ---

    // d0 = (2d + omega*u) / (1 + sqrt(zeta))
    let dd0_dd = (1.0 + omega * d) / sqrt_zeta;
    let dd0_dl = omega * l / sqrt_zeta;
    let denom = 1.0 + sqrt_zeta;
    let dd0_dom =
        (u * denom - (2.0 * d + omega * u) * (d + omega * u) / sqrt_zeta) / (denom * denom);

    // chi = atan2(omega*l, 1 + omega*d)
    let dchi_dl = omega * (1.0 + omega * d) / zeta;
    let dchi_dd = -omega * omega * l / zeta;
    let dchi_dom = l / zeta;

    // flight = chi / omega, with a series fallback near omega = 0 where
    // the direct quotient cancels catastrophically.
    let (flight, dfl_dom) = if omega.abs() > 1e-8 {
        let flight = chi / omega;
        (flight, (l / zeta - flight) / omega)
    } else {
        let w = 1.0 + omega * d;
        let flight = l / w - omega * omega * l * l * l / (3.0 * w * w * w);
        (flight, -l * d / (w * w) - 2.0 * omega * l * l * l / 3.0)
    };
    let dfl_dl = (1.0 + omega * d) / zeta;
    let dfl_dd = -omega * l / zeta;

    // --- chain rules into cartesian coordinates ---

    let dl_dx = cos_p;
    let dl_dy = sin_p;
    let dd_dx = -sin_p;
    let dd_dy = cos_p;

    let dphip_dpx = -sin_p / pt;
    let dphip_dpy = cos_p / pt;
    // l and d depend on phi_p: dl/dphi_p = d, dd/dphi_p = -l
    let dl_dpx = d * dphip_dpx;
    let dl_dpy = d * dphip_dpy;
    let dd_dpx = -l * dphip_dpx;
    let dd_dpy = -l * dphip_dpy;

    let dom_dpx = -omega * cos_p / pt;
    let dom_dpy = -omega * sin_p / pt;

    let dtl_dpx = -tan_lambda * cos_p / pt;
    let dtl_dpy = -tan_lambda * sin_p / pt;
    let dtl_dpz = 1.0 / pt;

    let mut jac = Matrix5x6::zeros();

    // Row 0: d0
    jac[(0, 0)] = dd0_dd * dd_dx + dd0_dl * dl_dx;
    jac[(0, 1)] = dd0_dd * dd_dy + dd0_dl * dl_dy;
    jac[(0, 3)] = dd0_dd * dd_dpx + dd0_dl * dl_dpx + dd0_dom * dom_dpx;
    jac[(0, 4)] = dd0_dd * dd_dpy + dd0_dl * dl_dpy + dd0_dom * dom_dpy;

    // Row 1: phi0 = phi_p - chi
    jac[(1, 0)] = -(dchi_dd * dd_dx + dchi_dl * dl_dx);
    jac[(1, 1)] = -(dchi_dd * dd_dy + dchi_dl * dl_dy);
    jac[(1, 3)] = dphip_dpx - (dchi_dd * dd_dpx + dchi_dl * dl_dpx + dchi_dom * dom_dpx);
    jac[(1, 4)] = dphip_dpy - (dchi_dd * dd_dpy + dchi_dl * dl_dpy + dchi_dom * dom_dpy);

    // Row 2: omega
    jac[(2, 3)] = dom_dpx;
    jac[(2, 4)] = dom_dpy;

    // Row 3: z0 = z - tan_lambda * flight
    jac[(3, 0)] = -tan_lambda * (dfl_dd * dd_dx + dfl_dl * dl_dx);
    jac[(3, 1)] = -tan_lambda * (dfl_dd * dd_dy + dfl_dl * dl_dy);
    jac[(3, 2)] = 1.0;
    jac[(3, 3)] = -tan_lambda * (dfl_dd * dd_dpx + dfl_dl * dl_dpx + dfl_dom * dom_dpx)
        - flight * dtl_dpx;
    jac[(3, 4)] = -tan_lambda * (dfl_dd * dd_dpy + dfl_dl * dl_dpy + dfl_dom * dom_dpy)
        - flight * dtl_dpy;

    // Row 4: tan_lambda
    jac[(4, 3)] = dtl_dpx;
    jac[(4, 4)] = dtl_dpy;
    jac[(4, 5)] = dtl_dpz;

    Ok(jac)
}
