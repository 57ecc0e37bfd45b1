//! Block compressed-row matrices.
//!
//! A [`CsrMatrix`] pairs a shared [`SparsityPattern`] with one value block
//! per stored entry. Blocks are laid out contiguously in pattern order and
//! row-major inside each block, so the scalar value of block `p` at
//! `(a, b)` lives at `p * block.len() + a * block.cols() + b`.
//!
//! Scalar matrices are the special case `block == BlockShape::Scalar`.

use std::sync::Arc;

use nalgebra as na;

use weft_foundation::{BlockShape, SearchStrategy, SparsityPattern};

use crate::error::{Result, SolveError};

/// Sparse matrix of fixed-shape blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    pattern: Arc<SparsityPattern>,
    values: Vec<f64>,
    block: BlockShape,
}

impl CsrMatrix {
    /// Wrap a pattern and its values, checking both.
    pub fn new(pattern: Arc<SparsityPattern>, values: Vec<f64>, block: BlockShape) -> Result<Self> {
        pattern
            .validate()
            .map_err(|e| SolveError::InvalidMatrix(e.to_string()))?;
        let expected = pattern.nnz() * block.len();
        if values.len() != expected {
            return Err(SolveError::DimensionMismatch {
                context: "matrix values".to_string(),
                expected,
                found: values.len(),
            });
        }
        Ok(Self {
            pattern,
            values,
            block,
        })
    }

    /// All-zero matrix over a pattern.
    pub fn zeros(pattern: Arc<SparsityPattern>, block: BlockShape) -> Self {
        let values = vec![0.0; pattern.nnz() * block.len()];
        Self {
            pattern,
            values,
            block,
        }
    }

    /// Scalar matrix from `(row, col, value)` triplets; repeated coordinates are summed.
    pub fn from_triplets(rows: usize, cols: usize, triplets: &[(usize, usize, f64)]) -> Result<Self> {
        if let Some(&(i, j, _)) = triplets.iter().find(|(i, j, _)| *i >= rows || *j >= cols) {
            return Err(SolveError::InvalidMatrix(format!(
                "triplet ({i}, {j}) outside a {rows}x{cols} matrix"
            )));
        }
        let pattern = SparsityPattern::from_coordinates(
            rows,
            cols,
            triplets.iter().map(|&(i, j, _)| (i, j)).collect(),
        );
        let mut values = vec![0.0; pattern.nnz()];
        for &(i, j, v) in triplets {
            if let Some(p) = pattern.locate(i, j, SearchStrategy::Binary) {
                values[p] += v;
            }
        }
        Ok(Self {
            pattern: Arc::new(pattern),
            values,
            block: BlockShape::Scalar,
        })
    }

    /// Scalar matrix holding the nonzero entries of a dense matrix.
    pub fn from_dense(dense: &na::DMatrix<f64>) -> Self {
        let mut triplets = Vec::new();
        for i in 0..dense.nrows() {
            for j in 0..dense.ncols() {
                let v = dense[(i, j)];
                if v != 0.0 {
                    triplets.push((i, j, v));
                }
            }
        }
        let pattern = SparsityPattern::from_coordinates(
            dense.nrows(),
            dense.ncols(),
            triplets.iter().map(|&(i, j, _)| (i, j)).collect(),
        );
        Self {
            pattern: Arc::new(pattern),
            values: triplets.into_iter().map(|(_, _, v)| v).collect(),
            block: BlockShape::Scalar,
        }
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn block(&self) -> BlockShape {
        self.block
    }

    /// Rows after expanding every block.
    pub fn scalar_rows(&self) -> usize {
        self.pattern.rows() * self.block.rows()
    }

    /// Columns after expanding every block.
    pub fn scalar_cols(&self) -> usize {
        self.pattern.cols() * self.block.cols()
    }

    /// Block stored at `(row, col)`, if the pattern holds it.
    pub fn get(&self, row: usize, col: usize) -> Option<&[f64]> {
        let len = self.block.len();
        self.pattern
            .locate(row, col, SearchStrategy::Binary)
            .map(|p| &self.values[p * len..(p + 1) * len])
    }

    /// Expand into a dense nalgebra matrix.
    pub fn to_dense(&self) -> na::DMatrix<f64> {
        crate::convert::to_dense_matrix(self)
    }
}
