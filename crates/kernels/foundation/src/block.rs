//! Block shapes of tensor components.
//!
//! Every system-scale tensor stores one block per index tuple. Blocks are
//! float scalars, vectors or matrices; nothing of higher rank is modelled.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Shape of a single tensor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockShape {
    /// A single float.
    Scalar,
    /// A column vector of the given length.
    Vector(usize),
    /// A row-major matrix with the given rows and columns.
    Matrix(usize, usize),
}

impl BlockShape {
    /// Number of floats stored per block.
    pub fn len(self) -> usize {
        match self {
            BlockShape::Scalar => 1,
            BlockShape::Vector(n) => n,
            BlockShape::Matrix(r, c) => r * c,
        }
    }

    /// True for zero-sized blocks (`vector[0]`), which are never useful.
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Tensor rank of the block (0, 1 or 2).
    pub fn rank(self) -> usize {
        match self {
            BlockShape::Scalar => 0,
            BlockShape::Vector(_) => 1,
            BlockShape::Matrix(_, _) => 2,
        }
    }

    /// Rows of the block when laid out in a block-sparse matrix.
    pub fn rows(self) -> usize {
        match self {
            BlockShape::Scalar => 1,
            BlockShape::Vector(n) => n,
            BlockShape::Matrix(r, _) => r,
        }
    }

    /// Columns of the block when laid out in a block-sparse matrix.
    pub fn cols(self) -> usize {
        match self {
            BlockShape::Scalar | BlockShape::Vector(_) => 1,
            BlockShape::Matrix(_, c) => c,
        }
    }

    /// Shape of the blocked product `self * rhs`, or `None` when the
    /// operands do not conform.
    ///
    /// Scalars scale anything; matrix-vector and matrix-matrix products
    /// follow linear algebra; two vectors contract to their inner product.
    pub fn product(self, rhs: BlockShape) -> Option<BlockShape> {
        match (self, rhs) {
            (BlockShape::Scalar, other) | (other, BlockShape::Scalar) => Some(other),
            (BlockShape::Vector(a), BlockShape::Vector(b)) if a == b => Some(BlockShape::Scalar),
            (BlockShape::Matrix(r, k), BlockShape::Vector(n)) if k == n => {
                Some(BlockShape::Vector(r))
            }
            (BlockShape::Vector(n), BlockShape::Matrix(k, c)) if n == k => {
                Some(BlockShape::Vector(c))
            }
            (BlockShape::Matrix(r, k), BlockShape::Matrix(k2, c)) if k == k2 => {
                Some(BlockShape::Matrix(r, c))
            }
            _ => None,
        }
    }

    /// Shape of an elementwise sum; both sides must agree.
    pub fn sum(self, rhs: BlockShape) -> Option<BlockShape> {
        (self == rhs).then_some(self)
    }
}

impl fmt::Display for BlockShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockShape::Scalar => write!(f, "float"),
            BlockShape::Vector(n) => write!(f, "vector[{n}]"),
            BlockShape::Matrix(r, c) => write!(f, "matrix[{r},{c}]"),
        }
    }
}
