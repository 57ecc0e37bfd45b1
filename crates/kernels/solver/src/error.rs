//! Solver errors.
//!
//! # Error Categories
//!
//! - **Input errors**: [`SolveError::InvalidMatrix`], [`SolveError::DimensionMismatch`]
//! - **Numeric errors**: [`SolveError::Singular`], [`SolveError::NotPositiveDefinite`]
//! - **Usage errors**: [`SolveError::PhaseViolation`]
//!
//! Numeric failures are reported as they occur. A failed factorization is
//! never retried with another method; the caller chooses the back end.

use thiserror::Error;

use crate::session::SolvePhase;

/// Solver result type alias.
pub type Result<T> = std::result::Result<T, SolveError>;

/// Errors raised while building, reducing, factorizing or solving a system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    /// A compressed-row matrix violates its structural invariants.
    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    /// Operand sizes do not agree.
    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// What was being combined
        context: String,
        expected: usize,
        found: usize,
    },

    /// The system has no unique solution: an empty row or column, or a pivot
    /// below tolerance.
    #[error("singular system: {detail}")]
    Singular { detail: String },

    /// Cholesky factorization was requested for a matrix that is not
    /// symmetric positive definite.
    #[error("matrix is not symmetric positive definite: {detail}")]
    NotPositiveDefinite { detail: String },

    /// A session step was invoked out of order.
    #[error("solve session is {found:?}, expected {expected:?}")]
    PhaseViolation {
        expected: SolvePhase,
        found: SolvePhase,
    },
}
