//! Fit status codes with worst-wins merge semantics.
//!
//! Every node operation in the tree walk returns an [`ErrCode`] instead of
//! panicking or returning `Result`. The driver merges codes from the whole
//! tree so that a single fatal condition anywhere aborts the candidate's
//! fit, while warnings are recorded without stopping iteration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Coarse classification of an [`ErrCode`].
///
/// Ordering matters: `Success < Warning < Fatal`, so "worst of two"
/// is simply `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Operation completed and produced valid outputs.
    Success,
    /// Something needed correction (e.g. a covariance reset) but the
    /// fit can continue.
    Warning,
    /// The node cannot produce valid outputs; the fit must be abandoned.
    Fatal,
}

/// Bitmask status value describing the outcome of a fit operation.
///
/// Codes merge with bitwise OR, which preserves every flag seen anywhere
/// in the tree; the overall [`Severity`] is the worst severity among the
/// set flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrCode(u16);

impl ErrCode {
    /// Clean success, no flags set.
    pub const SUCCESS: ErrCode = ErrCode(0);

    // --- warnings (recoverable numeric corrections) ---

    /// A point-of-closest-approach computation had to fall back to a
    /// default flight length.
    pub const POCA_FAILURE: ErrCode = ErrCode(1 << 0);
    /// An implausible seed covariance was overridden.
    pub const COVARIANCE_RESET: ErrCode = ErrCode(1 << 1);

    // --- fatal conditions ---

    /// The tree topology or index layout is unusable.
    pub const BAD_SETUP: ErrCode = ErrCode(1 << 8);
    /// A required input (mother position, backing trajectory) is missing.
    pub const MISSING_INPUT: ErrCode = ErrCode(1 << 9);
    /// The innovation or final covariance could not be decomposed.
    pub const INVERSION_ERROR: ErrCode = ErrCode(1 << 10);
    /// The iteration cap was exhausted before convergence.
    pub const NOT_CONVERGED: ErrCode = ErrCode(1 << 11);
    /// A trajectory's transverse momentum is too small for its curvature
    /// direction to be defined.
    pub const DEGENERATE: ErrCode = ErrCode(1 << 12);

    const FATAL_MASK: u16 = 0xff00;

    /// Merge two codes, keeping every flag from both ("worst wins").
    #[inline]
    pub fn merge(self, other: ErrCode) -> ErrCode {
        ErrCode(self.0 | other.0)
    }

    /// True if no flag at all is set.
    #[inline]
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// True if any fatal flag is set.
    #[inline]
    pub fn is_fatal(self) -> bool {
        self.0 & Self::FATAL_MASK != 0
    }

    /// True if the code carries warnings but nothing fatal.
    #[inline]
    pub fn is_warning(self) -> bool {
        !self.is_success() && !self.is_fatal()
    }

    /// Worst severity among the set flags.
    pub fn severity(self) -> Severity {
        if self.is_fatal() {
            Severity::Fatal
        } else if self.is_success() {
            Severity::Success
        } else {
            Severity::Warning
        }
    }

    /// True if every flag of `flag` is set in `self`.
    #[inline]
    pub fn contains(self, flag: ErrCode) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl BitOr for ErrCode {
    type Output = ErrCode;

    fn bitor(self, rhs: ErrCode) -> ErrCode {
        self.merge(rhs)
    }
}

impl BitOrAssign for ErrCode {
    fn bitor_assign(&mut self, rhs: ErrCode) {
        *self = self.merge(rhs);
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "success");
        }
        let names = [
            (Self::POCA_FAILURE, "poca-failure"),
            (Self::COVARIANCE_RESET, "covariance-reset"),
            (Self::BAD_SETUP, "bad-setup"),
            (Self::MISSING_INPUT, "missing-input"),
            (Self::INVERSION_ERROR, "inversion-error"),
            (Self::NOT_CONVERGED, "not-converged"),
            (Self::DEGENERATE, "degenerate-trajectory"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}
