//! Direct factorization back end.
//!
//! Factorizations are computed by nalgebra on the expanded scalar system.
//! The back end is chosen per solve through [`SolverConfig`]; there is no
//! process-wide solver state.
//!
//! # Singularity detection
//!
//! - a row or column without any nonzero entry is structurally singular and
//!   rejected before factorizing
//! - LU (partial pivoting) rejects a `U` diagonal entry whose magnitude is at
//!   most `pivot_tolerance` times the largest matrix entry
//! - Cholesky rejects non-symmetric input and reports nalgebra's failure on
//!   indefinite input as [`SolveError::NotPositiveDefinite`]

use nalgebra as na;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Result, SolveError};

/// Direct factorization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factorization {
    /// LU with partial pivoting, for general square systems.
    #[default]
    Lu,
    /// Cholesky, for symmetric positive-definite systems.
    Cholesky,
}

/// Solver configuration, passed explicitly to every solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub factorization: Factorization,
    /// Relative magnitude below which a pivot counts as zero
    pub pivot_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            factorization: Factorization::Lu,
            pivot_tolerance: 1e-12,
        }
    }
}

impl SolverConfig {
    pub fn cholesky() -> Self {
        Self {
            factorization: Factorization::Cholesky,
            ..Self::default()
        }
    }
}

/// A factorized square system.
#[derive(Debug, Clone)]
pub enum Factorized {
    Lu(na::LU<f64, na::Dyn, na::Dyn>),
    Cholesky(na::Cholesky<f64, na::Dyn>),
}

fn max_abs(matrix: &na::DMatrix<f64>) -> f64 {
    matrix.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}

/// Factorize a square matrix.
pub fn factorize(matrix: na::DMatrix<f64>, config: &SolverConfig) -> Result<Factorized> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return Err(SolveError::DimensionMismatch {
            context: "factorized matrix columns".to_string(),
            expected: n,
            found: matrix.ncols(),
        });
    }

    for i in 0..n {
        if matrix.row(i).iter().all(|v| *v == 0.0) {
            return Err(SolveError::Singular {
                detail: format!("row {i} is structurally zero"),
            });
        }
        if matrix.column(i).iter().all(|v| *v == 0.0) {
            return Err(SolveError::Singular {
                detail: format!("column {i} is structurally zero"),
            });
        }
    }

    let threshold = config.pivot_tolerance * max_abs(&matrix).max(1.0);
    let factors = match config.factorization {
        Factorization::Lu => {
            let lu = matrix.lu();
            let u = lu.u();
            for i in 0..n {
                let pivot = u[(i, i)];
                trace!(row = i, pivot, "lu pivot");
                if pivot.abs() <= threshold {
                    return Err(SolveError::Singular {
                        detail: format!("pivot {pivot:e} at row {i} is below tolerance"),
                    });
                }
            }
            Factorized::Lu(lu)
        }
        Factorization::Cholesky => {
            for i in 0..n {
                for j in (i + 1)..n {
                    if (matrix[(i, j)] - matrix[(j, i)]).abs() > threshold {
                        return Err(SolveError::NotPositiveDefinite {
                            detail: format!("entries ({i}, {j}) and ({j}, {i}) differ"),
                        });
                    }
                }
            }
            let cholesky = matrix.cholesky().ok_or_else(|| SolveError::NotPositiveDefinite {
                detail: "cholesky factorization failed".to_string(),
            })?;
            Factorized::Cholesky(cholesky)
        }
    };
    debug!(n, factorization = ?config.factorization, "system factorized");
    Ok(factors)
}

impl Factorized {
    /// Dimension of the factorized system.
    pub fn dim(&self) -> usize {
        match self {
            Factorized::Lu(lu) => lu.l().nrows(),
            Factorized::Cholesky(cholesky) => cholesky.l_dirty().nrows(),
        }
    }

    /// Solve for one right-hand side.
    pub fn solve(&self, rhs: &na::DVector<f64>) -> Result<na::DVector<f64>> {
        self.check_rows(rhs.len())?;
        match self {
            Factorized::Lu(lu) => lu.solve(rhs).ok_or_else(|| SolveError::Singular {
                detail: "lu solve failed".to_string(),
            }),
            Factorized::Cholesky(cholesky) => Ok(cholesky.solve(rhs)),
        }
    }

    /// Solve for every column of a right-hand-side matrix.
    pub fn solve_matrix(&self, rhs: &na::DMatrix<f64>) -> Result<na::DMatrix<f64>> {
        self.check_rows(rhs.nrows())?;
        match self {
            Factorized::Lu(lu) => lu.solve(rhs).ok_or_else(|| SolveError::Singular {
                detail: "lu solve failed".to_string(),
            }),
            Factorized::Cholesky(cholesky) => Ok(cholesky.solve(rhs)),
        }
    }

    fn check_rows(&self, found: usize) -> Result<()> {
        let expected = self.dim();
        if found != expected {
            return Err(SolveError::DimensionMismatch {
                context: "right-hand side".to_string(),
                expected,
                found,
            });
        }
        Ok(())
    }
}
