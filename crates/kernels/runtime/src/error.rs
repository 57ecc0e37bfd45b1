//! Runtime errors for executing lowered programs.
//!
//! # Error Categories
//!
//! - **Binding errors**: [`Error::UnboundSet`], [`Error::UnboundField`],
//!   [`Error::UnboundVariable`], [`Error::BindingMismatch`], [`Error::Topology`]
//! - **Execution errors**: [`Error::SparseWriteMiss`], [`Error::IndexOutOfBounds`],
//!   [`Error::TypeMismatch`], [`Error::UnloweredConstruct`]
//! - **Solve errors**: [`Error::Solve`]
//!
//! An error aborts the invocation. Field writes staged before the failure
//! are discarded, so the bindings keep their previous contents.

use thiserror::Error;

use weft_foundation::{FieldId, SetId, TopologyError, VarId};
use weft_solver::SolveError;

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while executing a lowered function.
#[derive(Debug, Error)]
pub enum Error {
    /// The function declares a set that the caller did not bind.
    #[error("set not bound: {0}")]
    UnboundSet(SetId),

    /// A field was read that the caller did not bind.
    #[error("field not bound: {set}.{field}")]
    UnboundField {
        /// Set owning the field
        set: SetId,
        /// Missing field
        field: FieldId,
    },

    /// A variable was read before anything bound it.
    #[error("variable not bound: {0}")]
    UnboundVariable(VarId),

    /// Bound data does not have the size the declaration requires.
    #[error("binding mismatch for {what}: expected {expected}, found {found}")]
    BindingMismatch {
        /// What was being checked
        what: String,
        /// Size required by the declaration
        expected: usize,
        /// Size of the bound data
        found: usize,
    },

    /// Relation endpoints could not be turned into a topology.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// A sparse write addressed an entry outside the buffer's pattern.
    ///
    /// Lowering guarantees this cannot happen for a consistent program, so
    /// reaching it means the storage table and the bindings disagree.
    #[error("sparse write to '{buffer}' missed its pattern")]
    SparseWriteMiss {
        /// Buffer being written
        buffer: VarId,
    },

    /// A dense access or element index fell outside its extent.
    #[error("index {index} out of bounds for {what} of length {len}")]
    IndexOutOfBounds {
        /// What was being indexed
        what: String,
        /// Offending index
        index: i64,
        /// Extent of the indexed object
        len: usize,
    },

    /// An operand had the wrong kind of value.
    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Where the mismatch occurred
        context: String,
        /// Expected value kind
        expected: String,
        /// Value kind found
        found: String,
    },

    /// A symbolic construct survived lowering.
    #[error("unlowered construct: {0}")]
    UnloweredConstruct(String),

    /// The linear solver rejected the system.
    #[error(transparent)]
    Solve(#[from] SolveError),
}
