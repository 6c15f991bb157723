//! The tree-walk driver: seeds the state, then folds every node's
//! constraints into the shared state with a sequential Kalman update until
//! the chi-square stabilizes.
//!
//! One iteration re-derives every track's flight length against the
//! current vertex estimates, then walks the tree in depth-first order
//! projecting each constraint and filtering it immediately. The update is
//! the Joseph form, which keeps the covariance symmetric positive
//! semi-definite under roundoff; the innovation matrix is decomposed with
//! Cholesky and a decomposition failure is fatal for the candidate.

use nalgebra::{Cholesky, DMatrix};
use serde::{Deserialize, Serialize};

use crate::errcode::ErrCode;
use crate::error::FitError;
use crate::fitparams::{FitParams, IndexRange};
use crate::input::FieldSource;
use crate::particle::{DecayTree, NodeIndex, ParticleBase, ParticleKind};
use crate::projection::Projection;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tunables of one fit. All defaults are in cm / GeV / Tesla.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    /// z component of the magnetic field at the origin.
    pub bz: f64,
    /// Iteration cap; exhausting it without converging fails the fit.
    pub max_iterations: usize,
    /// Relative chi-square change below which the fit has converged.
    pub chi_square_tolerance: f64,
    /// Relative state-change norm below which the fit has converged.
    pub state_tolerance: f64,
    /// Factor applied to a track's momentum error when seeding its
    /// covariance, so the seed barely constrains the first update.
    pub covariance_inflation: f64,
    /// Seed variance of a composite vertex coordinate, cm^2.
    pub position_seed_variance: f64,
    /// Seed variance of an unmeasured momentum component, (GeV/c)^2.
    pub momentum_seed_variance: f64,
    /// Seed variance of a decay length, cm^2.
    pub length_seed_variance: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            bz: 1.5,
            max_iterations: 10,
            chi_square_tolerance: 0.01,
            state_tolerance: 1e-4,
            covariance_inflation: 1000.0,
            position_seed_variance: 400.0,
            momentum_seed_variance: 25.0,
            length_seed_variance: 100.0,
        }
    }
}

impl FitConfig {
    /// Defaults with the field sampled once from the surrounding
    /// framework, z component at the origin.
    pub fn with_field(field: &dyn FieldSource) -> Self {
        Self {
            bz: field.bz_at_origin(),
            ..Self::default()
        }
    }
}

/// Lifecycle of one fit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitState {
    /// Constructed, state vector still zero.
    Unseeded,
    /// Seeding passes in progress.
    Seeding,
    /// Kalman iterations in progress.
    Iterating,
    /// Converged with a positive-definite covariance.
    Converged,
    /// Abandoned; see the status code for why.
    Failed,
}

/// Compact snapshot of a finished fit attempt.
///
/// Downstream consumers must check `status` before trusting the numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    pub state: FitState,
    pub status: ErrCode,
    pub chi_square: f64,
    pub ndf: i64,
    pub n_iterations: usize,
}

// ============================================================================
// FITTER
// ============================================================================

/// Owns one decay tree and its fit state through the whole fit lifecycle.
pub struct Fitter {
    tree: DecayTree,
    params: FitParams,
    config: FitConfig,
    state: FitState,
    status: ErrCode,
}

impl Fitter {
    pub fn new(tree: DecayTree, config: FitConfig) -> Result<Self, FitError> {
        let params = tree.make_fit_params()?;
        Ok(Self {
            tree,
            params,
            config,
            state: FitState::Unseeded,
            status: ErrCode::SUCCESS,
        })
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    /// Accumulated status flags over the whole attempt.
    pub fn status(&self) -> ErrCode {
        self.status
    }

    pub fn params(&self) -> &FitParams {
        &self.params
    }

    pub fn tree(&self) -> &DecayTree {
        &self.tree
    }

    pub fn chi_square(&self) -> f64 {
        self.params.chi_square()
    }

    pub fn ndf(&self) -> i64 {
        self.params.ndf()
    }

    pub fn n_iterations(&self) -> usize {
        self.params.n_iterations()
    }

    pub fn result(&self) -> FitResult {
        FitResult {
            state: self.state,
            status: self.status,
            chi_square: self.params.chi_square(),
            ndf: self.params.ndf(),
            n_iterations: self.params.n_iterations(),
        }
    }

    /// Fitted vertex position of a node, if it owns one.
    pub fn vertex_position(&self, node: NodeIndex) -> Option<nalgebra::Vector3<f64>> {
        self.tree
            .node(node)
            .indices
            .pos
            .map(|range| self.params.vector3(range))
    }

    /// Fitted momentum of a node, if it owns one.
    pub fn momentum(&self, node: NodeIndex) -> Option<nalgebra::Vector3<f64>> {
        self.tree
            .node(node)
            .indices
            .mom
            .map(|range| self.params.vector3(range))
    }

    /// Fitted decay length of a node, if it owns one.
    pub fn decay_length(&self, node: NodeIndex) -> Option<f64> {
        self.tree
            .node(node)
            .indices
            .len
            .map(|range| self.params.par()[range.offset])
    }

    /// Diagonal variance of a fitted block.
    pub fn block_variances(&self, range: IndexRange) -> Vec<f64> {
        (range.offset..range.end())
            .map(|k| self.params.cov()[(k, k)])
            .collect()
    }

    /// Run the whole fit: seeding, iteration, convergence and the final
    /// covariance validity check. Returns the accumulated status.
    pub fn fit(&mut self) -> ErrCode {
        self.state = FitState::Seeding;
        self.status = self.tree.seed(&mut self.params);
        if self.status.is_fatal() {
            self.state = FitState::Failed;
            return self.status;
        }
        self.status |= self.tree.init_covariances(&mut self.params);
        if self.status.is_fatal() {
            self.state = FitState::Failed;
            return self.status;
        }

        self.state = FitState::Iterating;
        let mut projection =
            Projection::new(self.tree.max_constraint_dim().max(1), self.params.dim());
        let mut prev_chi_square = f64::INFINITY;
        let mut converged = false;

        for _ in 0..self.config.max_iterations {
            let prev_par = self.params.par().clone();
            self.params.reset_chi_square();
            self.params.increment_iterations();

            // Each iteration refilters every constraint from the seed
            // covariance, with the improved state as linearization point.
            // Carrying the collapsed covariance over would make the exact
            // constraints' innovation singular on the second pass.
            self.params.cov_mut().fill(0.0);
            self.status |= self.tree.init_covariances(&mut self.params);
            if self.status.is_fatal() {
                self.state = FitState::Failed;
                return self.status;
            }

            let iteration_status = self.iterate_once(&mut projection);
            self.status |= iteration_status;
            if self.status.is_fatal() {
                self.state = FitState::Failed;
                return self.status;
            }
            self.params.symmetrize_covariance();

            let chi_square = self.params.chi_square();
            let delta_chi = (prev_chi_square - chi_square).abs();
            let relative = delta_chi / chi_square.abs().max(1.0);
            let delta_state =
                (self.params.par() - &prev_par).norm() / prev_par.norm().max(1.0);

            if self.params.n_iterations() > 1
                && (relative < self.config.chi_square_tolerance
                    || delta_state < self.config.state_tolerance)
            {
                converged = true;
                break;
            }
            prev_chi_square = chi_square;
        }

        if !converged {
            self.status |= ErrCode::NOT_CONVERGED;
            self.state = FitState::Failed;
            return self.status;
        }

        // The result is only usable if the final covariance is a valid
        // error matrix. Exact constraints leave zero-variance directions,
        // so the check allows a small diagonal tolerance: a genuinely
        // negative eigenvalue still fails it.
        let scale = (0..self.params.dim())
            .map(|k| self.params.cov()[(k, k)].abs())
            .fold(0.0f64, f64::max);
        let jitter = 1e-9 * (1.0 + scale);
        let mut checked = self.params.cov().clone();
        for k in 0..self.params.dim() {
            checked[(k, k)] += jitter;
        }
        if Cholesky::new(checked).is_none() {
            self.status |= ErrCode::INVERSION_ERROR;
            self.state = FitState::Failed;
            return self.status;
        }

        self.state = FitState::Converged;
        self.status
    }

    /// One full pass: refresh flight lengths, then project and filter
    /// every constraint in tree order.
    fn iterate_once(&mut self, projection: &mut Projection) -> ErrCode {
        let mut status = ErrCode::SUCCESS;
        let order = self.tree.walk_order().to_vec();

        for &idx in &order {
            if let ParticleKind::Track(track) = &mut self.tree.node_mut(idx).kind {
                status |= track.update_flight_to_mother(&self.params);
                if status.is_fatal() {
                    return status;
                }
            }
        }

        for &idx in &order {
            let n_constraints = self.tree.node(idx).kind.constraint_dims().len();
            for c in 0..n_constraints {
                let dim = self.tree.node(idx).kind.constraint_dims()[c];
                projection.resize(dim);
                status |= self
                    .tree
                    .node_mut(idx)
                    .kind
                    .project_constraint(c, &self.params, projection);
                if status.is_fatal() {
                    return status;
                }
                status |= kalman_update(&mut self.params, projection);
                if status.is_fatal() {
                    return status;
                }
            }
        }
        status
    }
}

// ============================================================================
// KALMAN UPDATE
// ============================================================================

/// Fold one projected constraint into the global state.
///
/// Gain from the Cholesky-decomposed innovation, state moved against the
/// residual, covariance updated in Joseph form so it stays symmetric
/// positive semi-definite even with an exact (zero-covariance) constraint.
fn kalman_update(params: &mut FitParams, projection: &Projection) -> ErrCode {
    let dim = projection.dim();
    let state_dim = params.dim();
    let h = projection.h().view((0, 0), (dim, state_dim)).clone_owned();
    let v = projection.v_symmetric();
    let residual = projection.residual().rows(0, dim).clone_owned();

    let ph_t = params.cov() * h.transpose();
    let mut innovation = &h * &ph_t + &v;
    // Guard against roundoff asymmetry before decomposing.
    for i in 0..dim {
        for j in 0..i {
            let mean = 0.5 * (innovation[(i, j)] + innovation[(j, i)]);
            innovation[(i, j)] = mean;
            innovation[(j, i)] = mean;
        }
    }

    let chol = match Cholesky::new(innovation) {
        Some(c) => c,
        None => return ErrCode::INVERSION_ERROR,
    };

    // Chi-square contribution of this constraint, with the pre-update
    // residual: r^T S^-1 r.
    let solved = chol.solve(&residual);
    let delta_chi = residual.dot(&solved);

    let gain = &ph_t * chol.inverse();
    let delta_state = &gain * &residual;

    let identity = DMatrix::identity(state_dim, state_dim);
    let i_kh = &identity - &gain * &h;
    let new_cov = &i_kh * params.cov() * i_kh.transpose() + &gain * &v * gain.transpose();

    *params.par_mut() -= delta_state;
    *params.cov_mut() = new_cov;
    params.add_chi_square(delta_chi, dim);
    ErrCode::SUCCESS
}
