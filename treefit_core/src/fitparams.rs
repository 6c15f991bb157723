//! The shared numeric state of one fit: state vector, covariance, and the
//! index bookkeeping that assigns disjoint slices of both to tree nodes.
//!
//! Every node reserves its parameter blocks from a [`StateLayout`] exactly
//! once, during tree construction. After the layout is sealed the offsets
//! are immutable configuration: a node never writes outside its assigned
//! ranges, and the union of all ranges covers the full state vector with
//! no overlap.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::FitError;

// ============================================================================
// INDEX BOOKKEEPING
// ============================================================================

/// A contiguous slice of the global state vector owned by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    /// First owned index.
    pub offset: usize,
    /// Number of owned parameters.
    pub len: usize,
}

impl IndexRange {
    /// One past the last owned index.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// The (optional) parameter blocks of a single tree node.
///
/// Leaves backed by a measured track own only a momentum block; an
/// internal vertex owns position and momentum and, when it has a mother,
/// a one-parameter flight length.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeIndices {
    /// Decay-vertex position block (3 parameters) if the node owns one.
    pub pos: Option<IndexRange>,
    /// Momentum block (3 parameters) if the node owns one.
    pub mom: Option<IndexRange>,
    /// Flight-length block (1 parameter) if the node owns one.
    pub len: Option<IndexRange>,
}

impl NodeIndices {
    /// Iterate over the ranges this node actually owns.
    pub fn ranges(&self) -> impl Iterator<Item = IndexRange> {
        [self.pos, self.mom, self.len].into_iter().flatten()
    }

    /// Total number of parameters owned by the node.
    pub fn dim(&self) -> usize {
        self.ranges().map(|r| r.len).sum()
    }
}

/// Allocator for state-vector index ranges.
///
/// Reservation is only legal while the layout is open; [`seal`](Self::seal)
/// fixes the total dimension for the lifetime of the fit.
#[derive(Debug, Clone, Default)]
pub struct StateLayout {
    next: usize,
    sealed: bool,
}

impl StateLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `dim` consecutive parameters and return their range.
    pub fn reserve(&mut self, dim: usize) -> Result<IndexRange, FitError> {
        if self.sealed {
            return Err(FitError::LayoutSealed(dim));
        }
        let range = IndexRange {
            offset: self.next,
            len: dim,
        };
        self.next += dim;
        Ok(range)
    }

    /// Freeze the layout; further reservations fail.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Total number of parameters reserved so far.
    pub fn dim(&self) -> usize {
        self.next
    }
}

// ============================================================================
// FIT PARAMETERS
// ============================================================================

/// The fit's single source of numerical truth.
///
/// Owns the dense state vector and its symmetric covariance, the running
/// chi-square, the iteration counter, and the per-node initialization
/// flags used for multi-pass seeding (a track's flight length cannot be
/// derived before its mother's position exists).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitParams {
    par: DVector<f64>,
    cov: DMatrix<f64>,
    initialized: Vec<bool>,
    chi_square: f64,
    n_constraints: usize,
    n_iterations: usize,
}

impl FitParams {
    /// Size state and covariance from a sealed layout.
    ///
    /// `n_nodes` dimensions the per-node initialization flags.
    pub fn from_layout(layout: &StateLayout, n_nodes: usize) -> Result<Self, FitError> {
        if !layout.is_sealed() {
            return Err(FitError::LayoutUnsealed);
        }
        let dim = layout.dim();
        Ok(Self {
            par: DVector::zeros(dim),
            cov: DMatrix::zeros(dim, dim),
            initialized: vec![false; n_nodes],
            chi_square: 0.0,
            n_constraints: 0,
            n_iterations: 0,
        })
    }

    /// Dimension of the state vector.
    pub fn dim(&self) -> usize {
        self.par.len()
    }

    /// Immutable view of the state vector.
    pub fn par(&self) -> &DVector<f64> {
        &self.par
    }

    /// Mutable view of the state vector.
    ///
    /// Callers must respect their assigned index ranges; no further
    /// bounds discipline is enforced here.
    pub fn par_mut(&mut self) -> &mut DVector<f64> {
        &mut self.par
    }

    /// Immutable view of the covariance matrix.
    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    /// Mutable view of the covariance matrix.
    pub fn cov_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.cov
    }

    /// Read a 3-component block of the state vector.
    pub fn vector3(&self, range: IndexRange) -> Vector3<f64> {
        debug_assert_eq!(range.len, 3);
        Vector3::new(
            self.par[range.offset],
            self.par[range.offset + 1],
            self.par[range.offset + 2],
        )
    }

    /// Write a 3-component block of the state vector.
    pub fn set_vector3(&mut self, range: IndexRange, value: &Vector3<f64>) {
        debug_assert_eq!(range.len, 3);
        self.par[range.offset] = value.x;
        self.par[range.offset + 1] = value.y;
        self.par[range.offset + 2] = value.z;
    }

    // ------------------------------------------------------------------
    // seeding bookkeeping
    // ------------------------------------------------------------------

    /// Mark a node's parameters as seeded.
    pub fn mark_initialized(&mut self, node: usize) {
        if let Some(flag) = self.initialized.get_mut(node) {
            *flag = true;
        }
    }

    /// True once a node's parameters have been seeded.
    pub fn is_initialized(&self, node: usize) -> bool {
        self.initialized.get(node).copied().unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // chi-square / iteration bookkeeping
    // ------------------------------------------------------------------

    /// Clear the chi-square accumulator at the start of an iteration.
    pub fn reset_chi_square(&mut self) {
        self.chi_square = 0.0;
        self.n_constraints = 0;
    }

    /// Fold one constraint's contribution into the running chi-square.
    pub fn add_chi_square(&mut self, dchisq: f64, n_constraints: usize) {
        self.chi_square += dchisq;
        self.n_constraints += n_constraints;
    }

    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    /// Degrees of freedom: accumulated constraint rows minus state size.
    pub fn ndf(&self) -> i64 {
        self.n_constraints as i64 - self.dim() as i64
    }

    pub fn increment_iterations(&mut self) {
        self.n_iterations += 1;
    }

    pub fn n_iterations(&self) -> usize {
        self.n_iterations
    }

    /// Copy the lower triangle into the upper one.
    ///
    /// The Kalman update writes the covariance symmetrically, but small
    /// asymmetries accumulate over iterations; the driver re-symmetrizes
    /// after each global update.
    pub fn symmetrize_covariance(&mut self) {
        let n = self.cov.nrows();
        for i in 0..n {
            for j in 0..i {
                let mean = 0.5 * (self.cov[(i, j)] + self.cov[(j, i)]);
                self.cov[(i, j)] = mean;
                self.cov[(j, i)] = mean;
            }
        }
    }
}
