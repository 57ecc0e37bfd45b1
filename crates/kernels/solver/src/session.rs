//! Direct solve state machine.
//!
//! A [`SolveSession`] walks one system through
//!
//! ```text
//! Assembled -> BoundaryApplied -> Factorized -> Solved
//!                     |
//!                     +-> Failed   (singular, not positive definite)
//! ```
//!
//! Each step checks the current phase and fails with
//! [`SolveError::PhaseViolation`] when called out of order. A failed
//! factorization is final: the session stays [`SolvePhase::Failed`] and
//! there is no automatic retry with a different back end.

use nalgebra as na;
use tracing::{debug, info, warn};

use crate::backend::{factorize, Factorized, SolverConfig};
use crate::boundary::BoundaryPartition;
use crate::convert::{from_dense_vector, to_dense_vector};
use crate::csr::CsrMatrix;
use crate::error::{Result, SolveError};

/// Lifecycle phase of a [`SolveSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvePhase {
    /// Matrix and right-hand side are assembled.
    Assembled,
    /// Fixed unknowns are eliminated.
    BoundaryApplied,
    /// The reduced system is factorized.
    Factorized,
    /// The solution is available.
    Solved,
    /// Factorization failed; the session cannot continue.
    Failed,
}

/// One direct solve of `A x = b` with optional fixed unknowns.
#[derive(Debug)]
pub struct SolveSession {
    config: SolverConfig,
    phase: SolvePhase,
    matrix: na::DMatrix<f64>,
    rhs: na::DVector<f64>,
    partition: BoundaryPartition,
    values: na::DVector<f64>,
    reduced: Option<(na::DMatrix<f64>, na::DVector<f64>)>,
    factors: Option<Factorized>,
}

impl SolveSession {
    /// Start a session on an assembled system.
    pub fn new(matrix: &CsrMatrix, rhs: &[f64], config: SolverConfig) -> Result<Self> {
        let n = matrix.scalar_rows();
        if matrix.scalar_cols() != n {
            return Err(SolveError::DimensionMismatch {
                context: "system matrix columns".to_string(),
                expected: n,
                found: matrix.scalar_cols(),
            });
        }
        if rhs.len() != n {
            return Err(SolveError::DimensionMismatch {
                context: "right-hand side".to_string(),
                expected: n,
                found: rhs.len(),
            });
        }
        debug!(n, nnz = matrix.pattern().nnz(), block = %matrix.block(), "solve session started");
        Ok(Self {
            config,
            phase: SolvePhase::Assembled,
            matrix: matrix.to_dense(),
            rhs: to_dense_vector(rhs),
            partition: BoundaryPartition::all_free(n),
            values: na::DVector::zeros(n),
            reduced: None,
            factors: None,
        })
    }

    pub fn phase(&self) -> SolvePhase {
        self.phase
    }

    fn expect(&self, expected: SolvePhase) -> Result<()> {
        if self.phase != expected {
            return Err(SolveError::PhaseViolation {
                expected,
                found: self.phase,
            });
        }
        Ok(())
    }

    /// Eliminate fixed unknowns; `values` supplies a value for every unknown.
    pub fn apply_boundary(&mut self, partition: BoundaryPartition, values: &[f64]) -> Result<()> {
        self.expect(SolvePhase::Assembled)?;
        let values = to_dense_vector(values);
        let reduced = partition.reduce(&self.matrix, &self.rhs, &values)?;
        debug!(
            fixed = partition.fixed().len(),
            free = partition.free().len(),
            "boundary applied"
        );
        self.partition = partition;
        self.values = values;
        self.reduced = Some(reduced);
        self.phase = SolvePhase::BoundaryApplied;
        Ok(())
    }

    /// Factorize the reduced system.
    pub fn factorize(&mut self) -> Result<()> {
        self.expect(SolvePhase::BoundaryApplied)?;
        let Some((matrix, _)) = &self.reduced else {
            return Err(SolveError::PhaseViolation {
                expected: SolvePhase::BoundaryApplied,
                found: self.phase,
            });
        };
        if matrix.nrows() == 0 {
            debug!("every unknown is fixed; nothing to factorize");
            self.phase = SolvePhase::Factorized;
            return Ok(());
        }
        match factorize(matrix.clone(), &self.config) {
            Ok(factors) => {
                self.factors = Some(factors);
                self.phase = SolvePhase::Factorized;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "factorization failed");
                self.phase = SolvePhase::Failed;
                Err(err)
            }
        }
    }

    /// Solve and return the full solution, fixed values included.
    pub fn solve(&mut self) -> Result<Vec<f64>> {
        self.expect(SolvePhase::Factorized)?;
        let free_values = match (&self.factors, &self.reduced) {
            (Some(factors), Some((_, rhs))) => factors.solve(rhs)?,
            _ => na::DVector::zeros(0),
        };
        let full = self.partition.scatter(&free_values, &self.values)?;
        self.phase = SolvePhase::Solved;
        info!(
            n = full.len(),
            fixed = self.partition.fixed().len(),
            factorization = ?self.config.factorization,
            "system solved"
        );
        Ok(from_dense_vector(&full))
    }
}

/// Boundary specification for [`solve_direct`]: per-element fixed marker and
/// a value for every scalar unknown.
#[derive(Debug, Clone, Copy)]
pub struct Boundary<'a> {
    pub marker: &'a [bool],
    pub values: &'a [f64],
}

/// Run a full session: boundary, factorization, solve.
pub fn solve_direct(
    matrix: &CsrMatrix,
    rhs: &[f64],
    boundary: Option<Boundary<'_>>,
    config: &SolverConfig,
) -> Result<Vec<f64>> {
    let mut session = SolveSession::new(matrix, rhs, config.clone())?;
    let n = matrix.scalar_rows();
    match boundary {
        Some(boundary) => {
            if boundary.marker.len() != matrix.pattern().rows() {
                return Err(SolveError::DimensionMismatch {
                    context: "boundary marker".to_string(),
                    expected: matrix.pattern().rows(),
                    found: boundary.marker.len(),
                });
            }
            let partition = BoundaryPartition::from_marker(boundary.marker, matrix.block().rows());
            session.apply_boundary(partition, boundary.values)?;
        }
        None => {
            session.apply_boundary(BoundaryPartition::all_free(n), &vec![0.0; n])?;
        }
    }
    session.factorize()?;
    session.solve()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Path v0 - v1 - v2 with per-edge kernel `M = [[2, 5], [1, 1]]`.
    fn path_lu() -> CsrMatrix {
        CsrMatrix::from_triplets(
            3,
            3,
            &[
                (0, 0, 2.0),
                (0, 1, 5.0),
                (1, 0, 1.0),
                (1, 1, 1.0),
                (1, 1, 2.0),
                (1, 2, 5.0),
                (2, 1, 1.0),
                (2, 2, 1.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_session_phases() {
        let mut session =
            SolveSession::new(&path_lu(), &[10.0, 20.0, 30.0], SolverConfig::default()).unwrap();
        assert_eq!(session.phase(), SolvePhase::Assembled);

        let err = session.factorize().unwrap_err();
        assert_eq!(
            err,
            SolveError::PhaseViolation {
                expected: SolvePhase::BoundaryApplied,
                found: SolvePhase::Assembled
            }
        );

        session
            .apply_boundary(
                BoundaryPartition::from_marker(&[true, false, false], 1),
                &[-40.0, 0.0, 0.0],
            )
            .unwrap();
        assert_eq!(session.phase(), SolvePhase::BoundaryApplied);
        session.factorize().unwrap();
        let x = session.solve().unwrap();
        assert_eq!(session.phase(), SolvePhase::Solved);

        for (got, expected) in x.iter().zip([-40.0, 45.0, -15.0]) {
            assert!((got - expected).abs() < 1e-9, "{got} != {expected}");
        }
        assert!(session.solve().is_err());
    }

    #[test]
    fn test_singular_factorization_fails_session() {
        let singular = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 1.0)])
            .unwrap();
        let mut session = SolveSession::new(&singular, &[1.0, 1.0], SolverConfig::default()).unwrap();
        session
            .apply_boundary(BoundaryPartition::all_free(2), &[0.0, 0.0])
            .unwrap();

        assert!(matches!(session.factorize(), Err(SolveError::Singular { .. })));
        assert_eq!(session.phase(), SolvePhase::Failed);
        assert!(matches!(
            session.solve(),
            Err(SolveError::PhaseViolation { found: SolvePhase::Failed, .. })
        ));
    }

    #[test]
    fn test_all_fixed_returns_values() {
        let x = solve_direct(
            &path_lu(),
            &[1.0, 2.0, 3.0],
            Some(Boundary {
                marker: &[true, true, true],
                values: &[7.0, 8.0, 9.0],
            }),
            &SolverConfig::default(),
        )
        .unwrap();
        assert_eq!(x, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_rhs_length_checked() {
        let err = SolveSession::new(&path_lu(), &[1.0], SolverConfig::default()).unwrap_err();
        assert!(matches!(err, SolveError::DimensionMismatch { .. }));
    }
}
