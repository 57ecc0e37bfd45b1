//! Schur-complement reduction of two-set block systems.
//!
//! Solves
//!
//! ```text
//! [ K  C^T ] [x_p]   [f_p]
//! [ C  D   ] [x_d] = [f_d]
//! ```
//!
//! where `K` is over the primary set and `C` couples the derived set (rows)
//! to the primary set (columns).
//!
//! # Elimination order
//!
//! - **`D` given**: the derived unknowns are eliminated first,
//!   `(K - C^T D^-1 C) x_p = f_p - C^T D^-1 f_d`, then
//!   `x_d = D^-1 (f_d - C x_p)`.
//! - **no `D`** (saddle point, e.g. Lagrange multipliers): `K` is eliminated,
//!   `(C K^-1 C^T) x_d = C K^-1 f_p - f_d`, then
//!   `x_p = K^-1 (f_p - C^T x_d)`.
//!
//! Every factorization uses the caller's [`SolverConfig`].

use nalgebra as na;
use tracing::debug;

use crate::backend::{factorize, SolverConfig};
use crate::error::{Result, SolveError};

/// Operands of a two-set block system, as expanded scalar matrices.
#[derive(Debug, Clone, Copy)]
pub struct SchurSystem<'a> {
    pub primary: &'a na::DMatrix<f64>,
    pub coupling: &'a na::DMatrix<f64>,
    pub derived: Option<&'a na::DMatrix<f64>>,
    pub rhs_primary: &'a na::DVector<f64>,
    pub rhs_derived: &'a na::DVector<f64>,
}

/// Solution of a block system.
#[derive(Debug, Clone, PartialEq)]
pub struct SchurSolution {
    pub primary: na::DVector<f64>,
    pub derived: na::DVector<f64>,
}

fn expect_dim(context: &str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(SolveError::DimensionMismatch {
            context: context.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

impl SchurSystem<'_> {
    fn check(&self) -> Result<(usize, usize)> {
        let n = self.primary.nrows();
        let m = self.coupling.nrows();
        expect_dim("primary block columns", n, self.primary.ncols())?;
        expect_dim("coupling block columns", n, self.coupling.ncols())?;
        expect_dim("primary right-hand side", n, self.rhs_primary.len())?;
        expect_dim("derived right-hand side", m, self.rhs_derived.len())?;
        if let Some(d) = self.derived {
            expect_dim("derived block rows", m, d.nrows())?;
            expect_dim("derived block columns", m, d.ncols())?;
        }
        Ok((n, m))
    }
}

/// Solve a two-set block system by Schur-complement reduction.
pub fn solve_schur(system: SchurSystem<'_>, config: &SolverConfig) -> Result<SchurSolution> {
    let (n, m) = system.check()?;
    let c = system.coupling;
    let ct = c.transpose();

    let solution = match system.derived {
        Some(d) => {
            let d_factors = factorize(d.clone(), config)?;
            let d_inv_c = d_factors.solve_matrix(c)?;
            let d_inv_f = d_factors.solve(system.rhs_derived)?;

            let complement = system.primary - &ct * d_inv_c;
            let rhs = system.rhs_primary - &ct * d_inv_f;
            let primary = factorize(complement, config)?.solve(&rhs)?;
            let derived = d_factors.solve(&(system.rhs_derived - c * &primary))?;
            SchurSolution { primary, derived }
        }
        None => {
            let k_factors = factorize(system.primary.clone(), config)?;
            let k_inv_ct = k_factors.solve_matrix(&ct)?;
            let k_inv_f = k_factors.solve(system.rhs_primary)?;

            let complement = c * k_inv_ct;
            let rhs = c * k_inv_f - system.rhs_derived;
            let derived = factorize(complement, config)?.solve(&rhs)?;
            let primary = k_factors.solve(&(system.rhs_primary - &ct * &derived))?;
            SchurSolution { primary, derived }
        }
    };

    debug!(
        primary = n,
        derived = m,
        eliminated = if system.derived.is_some() { "derived" } else { "primary" },
        "schur solve complete"
    );
    Ok(solution)
}
