//! Construction-time error types for the fit engine.
//!
//! Numeric failures *during* a fit are reported through
//! [`ErrCode`](crate::errcode::ErrCode); this module covers the things
//! that can go wrong while building a decay tree or its state layout,
//! before any iteration runs.

use thiserror::Error;

/// Errors raised while assembling a decay tree or its state layout.
#[derive(Debug, Clone, Error)]
pub enum FitError {
    /// An index range was requested after the layout was sealed.
    #[error("state layout is sealed; cannot reserve {0} more parameters")]
    LayoutSealed(usize),

    /// The layout was never sealed before sizing the fit parameters.
    #[error("state layout must be sealed before building fit parameters")]
    LayoutUnsealed,

    /// A node index does not exist in the tree.
    #[error("node index {0} out of range")]
    NodeOutOfRange(usize),

    /// A daughter was attached to a node that cannot have daughters.
    #[error("node kind {0} cannot own daughters")]
    LeafWithDaughters(&'static str),

    /// A tree was built without any fittable node.
    #[error("decay tree has no nodes")]
    EmptyTree,

    /// A tree must have exactly one motherless node.
    #[error("decay tree must have exactly one root, found {0}")]
    InvalidRoots(usize),

    /// Transverse momentum below the curvature-validity threshold.
    #[error("degenerate trajectory: transverse momentum {pt:.3e} GeV/c below {min:.3e}")]
    DegenerateTrajectory { pt: f64, min: f64 },
}
