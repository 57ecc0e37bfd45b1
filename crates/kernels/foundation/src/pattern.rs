//! Sparsity patterns in compressed-row form.
//!
//! A pattern records *which* `(row, col)` locations of a matrix are stored,
//! without the values. Patterns are derived from topologies and are the only
//! structure lowered code consults to find a sparse entry.
//!
//! # Invariants
//!
//! - `row_offsets.len() == rows + 1`, starting at 0 and non-decreasing
//! - column indices within a row are strictly ascending (hence distinct)
//! - every column index is `< cols`
//!
//! Construction from coordinates sorts and deduplicates, so the pattern is a
//! deterministic function of the coordinate *set*, independent of the order
//! in which coordinates were produced.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Violations of the compressed-row invariants.
///
/// These are internal-consistency errors: a pattern handed to lowered code
/// or to a solver is assumed valid, so they indicate an upstream bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// The row offset array has the wrong length.
    #[error("row offsets must have length {expected}, found {found}")]
    OffsetsLength {
        /// `rows + 1`
        expected: usize,
        /// Actual length
        found: usize,
    },

    /// The first offset is not zero or the last does not match the column count.
    #[error("row offsets must start at 0 and end at {nnz}")]
    OffsetsBounds {
        /// Number of stored column indices
        nnz: usize,
    },

    /// Row offsets decrease at the given row.
    #[error("row offsets decrease at row {row}")]
    DecreasingOffsets {
        /// Row whose end precedes its start
        row: usize,
    },

    /// Column indices of a row are not strictly ascending.
    #[error("columns of row {row} are not strictly ascending at column {col}")]
    UnsortedColumns {
        /// Offending row
        row: usize,
        /// First out-of-order column
        col: usize,
    },

    /// A column index is outside the matrix.
    #[error("column {col} in row {row} is out of bounds for {cols} columns")]
    ColumnOutOfBounds {
        /// Offending row
        row: usize,
        /// Offending column
        col: usize,
        /// Column count of the pattern
        cols: usize,
    },
}

/// How lowered code searches a row for a column index.
///
/// Both are correct because columns are sorted; binary search wins on long
/// rows, linear search on the short rows typical of graph stencils.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Binary search over the sorted row.
    #[default]
    Binary,
    /// Forward scan, stopping at the first column not below the target.
    Linear,
}

/// Compressed-row sparsity pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityPattern {
    rows: usize,
    cols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
}

impl SparsityPattern {
    /// Build a pattern from raw offset and index arrays, checking every invariant.
    pub fn from_offsets_and_indices(
        rows: usize,
        cols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
    ) -> Result<Self, PatternError> {
        let pattern = Self {
            rows,
            cols,
            row_offsets,
            col_indices,
        };
        pattern.validate()?;
        Ok(pattern)
    }

    /// Build a pattern from `(row, col)` coordinates.
    ///
    /// Coordinates may arrive in any order and may repeat; duplicates collapse
    /// into a single stored entry.
    ///
    /// # Panics
    ///
    /// Panics if a coordinate lies outside `rows x cols`.
    pub fn from_coordinates(rows: usize, cols: usize, mut coordinates: Vec<(usize, usize)>) -> Self {
        coordinates.sort_unstable();
        coordinates.dedup();

        let mut row_offsets = Vec::with_capacity(rows + 1);
        let mut col_indices = Vec::with_capacity(coordinates.len());
        row_offsets.push(0);

        let mut current_row = 0;
        for (i, j) in coordinates {
            assert!(i < rows && j < cols, "coordinate ({i}, {j}) out of bounds");
            while i > current_row {
                row_offsets.push(col_indices.len());
                current_row += 1;
            }
            col_indices.push(j);
        }
        // Fill out offsets for remaining empty rows
        while row_offsets.len() < rows + 1 {
            row_offsets.push(col_indices.len());
        }

        Self {
            rows,
            cols,
            row_offsets,
            col_indices,
        }
    }

    /// Square pattern holding only the diagonal.
    pub fn diagonal(n: usize) -> Self {
        Self {
            rows: n,
            cols: n,
            row_offsets: (0..=n).collect(),
            col_indices: (0..n).collect(),
        }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    /// Row offset array (length `rows + 1`).
    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    /// Column index array (length `nnz`).
    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    /// Positions of a row's entries in the column/value arrays.
    pub fn row_range(&self, row: usize) -> Range<usize> {
        self.row_offsets[row]..self.row_offsets[row + 1]
    }

    /// Sorted column indices of a row.
    pub fn row(&self, row: usize) -> &[usize] {
        &self.col_indices[self.row_range(row)]
    }

    /// Position of `(row, col)` in the value array, or `None` when the entry
    /// is not part of the pattern (including out-of-range rows).
    pub fn locate(&self, row: usize, col: usize, strategy: SearchStrategy) -> Option<usize> {
        if row >= self.rows {
            return None;
        }
        let range = self.row_range(row);
        let columns = &self.col_indices[range.clone()];
        let local = match strategy {
            SearchStrategy::Binary => columns.binary_search(&col).ok(),
            SearchStrategy::Linear => {
                let mut found = None;
                for (k, &c) in columns.iter().enumerate() {
                    if c >= col {
                        if c == col {
                            found = Some(k);
                        }
                        break;
                    }
                }
                found
            }
        };
        local.map(|k| range.start + k)
    }

    /// True if `(row, col)` is stored.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.locate(row, col, SearchStrategy::Binary).is_some()
    }

    /// Iterate `(row, col, position)` in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        (0..self.rows).flat_map(move |row| {
            self.row_range(row)
                .map(move |pos| (row, self.col_indices[pos], pos))
        })
    }

    /// The transposed pattern (`cols x rows`).
    pub fn transpose(&self) -> Self {
        let coordinates = self.iter().map(|(i, j, _)| (j, i)).collect();
        Self::from_coordinates(self.cols, self.rows, coordinates)
    }

    /// Check the compressed-row invariants.
    pub fn validate(&self) -> Result<(), PatternError> {
        if self.row_offsets.len() != self.rows + 1 {
            return Err(PatternError::OffsetsLength {
                expected: self.rows + 1,
                found: self.row_offsets.len(),
            });
        }
        let nnz = self.col_indices.len();
        if self.row_offsets[0] != 0 || self.row_offsets[self.rows] != nnz {
            return Err(PatternError::OffsetsBounds { nnz });
        }
        for row in 0..self.rows {
            let (start, end) = (self.row_offsets[row], self.row_offsets[row + 1]);
            if end < start {
                return Err(PatternError::DecreasingOffsets { row });
            }
            if end > nnz {
                return Err(PatternError::OffsetsBounds { nnz });
            }
            let columns = &self.col_indices[start..end];
            for (k, &col) in columns.iter().enumerate() {
                if col >= self.cols {
                    return Err(PatternError::ColumnOutOfBounds {
                        row,
                        col,
                        cols: self.cols,
                    });
                }
                if k > 0 && columns[k - 1] >= col {
                    return Err(PatternError::UnsortedColumns { row, col });
                }
            }
        }
        Ok(())
    }
}

/// Merge-style intersection of two sorted column lists.
///
/// Yields `(col, left_index, right_index)` in ascending column order, where
/// the indices are offsets into the two input slices. Runs in
/// `O(left.len() + right.len())`.
pub struct MergeIntersection<'a> {
    left: &'a [usize],
    right: &'a [usize],
    i: usize,
    j: usize,
}

impl<'a> MergeIntersection<'a> {
    /// Intersect two ascending column lists.
    pub fn new(left: &'a [usize], right: &'a [usize]) -> Self {
        Self {
            left,
            right,
            i: 0,
            j: 0,
        }
    }
}

impl Iterator for MergeIntersection<'_> {
    type Item = (usize, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while self.i < self.left.len() && self.j < self.right.len() {
            let (a, b) = (self.left[self.i], self.right[self.j]);
            match a.cmp(&b) {
                std::cmp::Ordering::Less => self.i += 1,
                std::cmp::Ordering::Greater => self.j += 1,
                std::cmp::Ordering::Equal => {
                    let item = (a, self.i, self.j);
                    self.i += 1;
                    self.j += 1;
                    return Some(item);
                }
            }
        }
        None
    }
}
