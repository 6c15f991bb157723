//! Scratch buffer for one linearized constraint evaluation.
//!
//! A node fills the residual, its measurement covariance and the Jacobian
//! block(s) for the index ranges it touches; the driver folds the whole
//! thing into the global Kalman update and the buffer is reset for the
//! next constraint. No algorithmic logic lives here.

use nalgebra::{DMatrix, DVector};

use crate::fitparams::IndexRange;

/// Residual + measurement covariance + design matrix for one constraint.
///
/// The Jacobian is full-width (measurement dimension × state dimension)
/// but only the columns of the contributing node's (and its mother's)
/// reserved ranges are ever populated; everything else stays zero.
#[derive(Debug, Clone)]
pub struct Projection {
    /// Design matrix H, measurement rows × state columns.
    h: DMatrix<f64>,
    /// Residual vector r (measured minus predicted).
    residual: DVector<f64>,
    /// Measurement covariance V, written lower-triangular.
    v: DMatrix<f64>,
    /// Active measurement dimension (rows of `h` in use).
    dim: usize,
}

impl Projection {
    /// Allocate a projection for `dim` measurement rows over a state of
    /// `state_dim` parameters.
    pub fn new(dim: usize, state_dim: usize) -> Self {
        Self {
            h: DMatrix::zeros(dim, state_dim),
            residual: DVector::zeros(dim),
            v: DMatrix::zeros(dim, dim),
            dim,
        }
    }

    /// Measurement dimension of the constraint currently in the buffer.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// State dimension the design matrix maps from.
    pub fn state_dim(&self) -> usize {
        self.h.ncols()
    }

    /// Zero all entries, keeping the allocation.
    pub fn reset(&mut self) {
        self.h.fill(0.0);
        self.residual.fill(0.0);
        self.v.fill(0.0);
    }

    /// Shrink or grow the active measurement dimension, reallocating only
    /// when a constraint needs more rows than any before it.
    pub fn resize(&mut self, dim: usize) {
        if dim > self.h.nrows() {
            let state_dim = self.h.ncols();
            self.h = DMatrix::zeros(dim, state_dim);
            self.residual = DVector::zeros(dim);
            self.v = DMatrix::zeros(dim, dim);
        }
        self.dim = dim;
        self.reset();
    }

    // ------------------------------------------------------------------
    // accessors written by the producing node
    // ------------------------------------------------------------------

    pub fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    pub fn residual_mut(&mut self) -> &mut DVector<f64> {
        &mut self.residual
    }

    pub fn h(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn h_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.h
    }

    pub fn v(&self) -> &DMatrix<f64> {
        &self.v
    }

    pub fn v_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.v
    }

    // ------------------------------------------------------------------
    // block helpers addressed by reserved index ranges
    // ------------------------------------------------------------------

    /// Write a Jacobian block into the columns of `range`.
    ///
    /// `block` must have `self.dim()` rows and `range.len` columns.
    pub fn set_h_block(&mut self, range: IndexRange, block: &DMatrix<f64>) {
        self.h
            .view_mut((0, range.offset), (self.dim, range.len))
            .copy_from(block);
    }

    /// Add a Jacobian block into the columns of `range`.
    pub fn add_h_block(&mut self, range: IndexRange, block: &DMatrix<f64>) {
        let mut view = self.h.view_mut((0, range.offset), (self.dim, range.len));
        view += block;
    }

    /// Active rows of the measurement covariance, symmetrized from the
    /// lower triangle the producer filled.
    pub fn v_symmetric(&self) -> DMatrix<f64> {
        let mut v = DMatrix::zeros(self.dim, self.dim);
        for i in 0..self.dim {
            for j in 0..=i {
                v[(i, j)] = self.v[(i, j)];
                v[(j, i)] = self.v[(i, j)];
            }
        }
        v
    }
}
