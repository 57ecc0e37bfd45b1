//! Conversions between block storage and nalgebra.
//!
//! The factorization back end works on expanded scalar matrices; blocks are
//! unrolled so that block `(i, j)` of shape `r x c` covers scalar rows
//! `i*r..(i+1)*r` and columns `j*c..(j+1)*c`.

use nalgebra as na;

use crate::csr::CsrMatrix;

/// Expand a block-sparse matrix into a dense scalar matrix.
pub fn to_dense_matrix(matrix: &CsrMatrix) -> na::DMatrix<f64> {
    let block = matrix.block();
    let (br, bc, len) = (block.rows(), block.cols(), block.len());
    let mut dense = na::DMatrix::zeros(matrix.scalar_rows(), matrix.scalar_cols());
    let values = matrix.values();
    for (i, j, p) in matrix.pattern().iter() {
        for a in 0..br {
            for b in 0..bc {
                dense[(i * br + a, j * bc + b)] += values[p * len + a * bc + b];
            }
        }
    }
    dense
}

/// Flat block vector (blocks concatenated) as a nalgebra vector.
pub fn to_dense_vector(values: &[f64]) -> na::DVector<f64> {
    na::DVector::from_column_slice(values)
}

/// nalgebra vector back to flat block storage.
pub fn from_dense_vector(vector: &na::DVector<f64>) -> Vec<f64> {
    vector.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use weft_foundation::{BlockShape, SparsityPattern};

    use super::*;

    #[test]
    fn test_block_expansion() {
        let pattern = Arc::new(SparsityPattern::from_coordinates(2, 2, vec![(0, 1), (1, 0)]));
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let m = CsrMatrix::new(pattern, values, BlockShape::Matrix(2, 2)).unwrap();
        let dense = to_dense_matrix(&m);

        assert_eq!(dense.nrows(), 4);
        assert_eq!(dense[(0, 2)], 1.0);
        assert_eq!(dense[(1, 3)], 4.0);
        assert_eq!(dense[(2, 0)], 5.0);
        assert_eq!(dense[(3, 1)], 8.0);
        assert_eq!(dense[(0, 0)], 0.0);
    }

    #[test]
    fn test_vector_roundtrip() {
        let v = vec![1.0, -2.0, 3.5];
        assert_eq!(from_dense_vector(&to_dense_vector(&v)), v);
    }
}
