//! Fixed/free partition of a linear system.
//!
//! Elements marked fixed keep their supplied values. Eliminating them from
//! `A x = b` leaves the reduced system
//!
//! ```text
//! A_UU x_U = b_U - A_UF x_F
//! ```
//!
//! over the free unknowns `U`. The result is identical to pinning each fixed
//! row to the identity with the fixed value on the right-hand side, without
//! the extra rows.

use nalgebra as na;

use crate::error::{Result, SolveError};

/// Partition of scalar unknowns into fixed and free, in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryPartition {
    fixed: Vec<usize>,
    free: Vec<usize>,
}

impl BoundaryPartition {
    /// Partition from a per-element marker; each element covers `block_rows`
    /// consecutive scalar unknowns.
    pub fn from_marker(marker: &[bool], block_rows: usize) -> Self {
        let mut fixed = Vec::new();
        let mut free = Vec::new();
        for (element, &is_fixed) in marker.iter().enumerate() {
            let rows = element * block_rows..(element + 1) * block_rows;
            if is_fixed {
                fixed.extend(rows);
            } else {
                free.extend(rows);
            }
        }
        Self { fixed, free }
    }

    /// Every unknown free.
    pub fn all_free(n: usize) -> Self {
        Self {
            fixed: Vec::new(),
            free: (0..n).collect(),
        }
    }

    pub fn fixed(&self) -> &[usize] {
        &self.fixed
    }

    pub fn free(&self) -> &[usize] {
        &self.free
    }

    /// Total number of scalar unknowns.
    pub fn len(&self) -> usize {
        self.fixed.len() + self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when nothing is fixed.
    pub fn is_trivial(&self) -> bool {
        self.fixed.is_empty()
    }

    /// Form `A_UU` and `b_U - A_UF x_F`.
    ///
    /// `values` holds a value for every unknown; only fixed entries are read.
    pub fn reduce(
        &self,
        matrix: &na::DMatrix<f64>,
        rhs: &na::DVector<f64>,
        values: &na::DVector<f64>,
    ) -> Result<(na::DMatrix<f64>, na::DVector<f64>)> {
        let n = self.len();
        for (context, found) in [
            ("boundary matrix rows", matrix.nrows()),
            ("boundary matrix columns", matrix.ncols()),
            ("boundary right-hand side", rhs.len()),
            ("boundary values", values.len()),
        ] {
            if found != n {
                return Err(SolveError::DimensionMismatch {
                    context: context.to_string(),
                    expected: n,
                    found,
                });
            }
        }

        let reduced = matrix.select_rows(&self.free).select_columns(&self.free);
        let mut reduced_rhs = rhs.select_rows(&self.free);
        if !self.is_trivial() {
            let coupling = matrix.select_rows(&self.free).select_columns(&self.fixed);
            let fixed_values = values.select_rows(&self.fixed);
            reduced_rhs -= coupling * fixed_values;
        }
        Ok((reduced, reduced_rhs))
    }

    /// Combine free-unknown results with the fixed values into a full solution.
    pub fn scatter(
        &self,
        free_values: &na::DVector<f64>,
        values: &na::DVector<f64>,
    ) -> Result<na::DVector<f64>> {
        if free_values.len() != self.free.len() {
            return Err(SolveError::DimensionMismatch {
                context: "free solution".to_string(),
                expected: self.free.len(),
                found: free_values.len(),
            });
        }
        if values.len() != self.len() {
            return Err(SolveError::DimensionMismatch {
                context: "boundary values".to_string(),
                expected: self.len(),
                found: values.len(),
            });
        }
        let mut full = na::DVector::zeros(self.len());
        for &k in &self.fixed {
            full[k] = values[k];
        }
        for (&k, &v) in self.free.iter().zip(free_values.iter()) {
            full[k] = v;
        }
        Ok(full)
    }
}
