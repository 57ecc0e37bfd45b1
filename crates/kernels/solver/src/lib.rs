//! Weft Solver
//!
//! Direct solves of the sparse systems produced by graph assemblies.
//!
//! # Overview
//!
//! - [`CsrMatrix`] - block compressed-row storage over a shared pattern
//! - [`BoundaryPartition`] - fixed/free split and elimination of fixed unknowns
//! - [`factorize`] / [`Factorized`] - LU and Cholesky through nalgebra
//! - [`solve_schur`] - two-set block systems by Schur-complement reduction
//! - [`SolveSession`] - the `Assembled -> BoundaryApplied -> Factorized -> Solved`
//!   state machine, with [`solve_direct`] running all of it
//!
//! The factorization method and pivot tolerance come from [`SolverConfig`],
//! which every solve receives explicitly.

pub mod backend;
pub mod boundary;
pub mod convert;
pub mod csr;
pub mod error;
pub mod schur;
pub mod session;

pub use backend::{factorize, Factorization, Factorized, SolverConfig};
pub use boundary::BoundaryPartition;
pub use csr::CsrMatrix;
pub use error::{Result, SolveError};
pub use schur::{solve_schur, SchurSolution, SchurSystem};
pub use session::{solve_direct, Boundary, SolvePhase, SolveSession};

/// Re-export of the linear algebra crate used at the solver boundary.
pub use nalgebra;
