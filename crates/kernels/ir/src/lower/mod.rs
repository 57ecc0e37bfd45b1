//! IR Lowering
//!
//! This module rewrites a typed [`Func`] into storage-aware loop code.
//!
//! # Overview
//!
//! Lowering runs three passes in a fixed order, each a pure rewrite
//! `Func -> Func` that consumes its input and returns a fully formed
//! replacement:
//!
//! 1. **Assembly lowering** ([`lower_assemblies`]): graph assemblies become
//!    a zeroing of every target followed by one element loop that
//!    accumulates kernel contributions
//! 2. **Index-expression lowering** ([`lower_index_expressions`]): tensor
//!    contractions become loop nests driven by the operands' storage
//! 3. **Tensor-access lowering** ([`lower_tensor_accesses`]): symbolic
//!    element reads and writes become loads, stores and pattern searches
//!
//! The storage table ([`infer_storage`](crate::infer_storage)) is computed
//! once before the first pass and shared read-only by all three.
//!
//! # Usage
//!
//! ```ignore
//! let lowered = lower(&func, &LowerOptions::default())?;
//! for (var, storage) in &lowered.storages {
//!     println!("{var}: {storage}");
//! }
//! ```
//!
//! # Errors
//!
//! Lowering fails with [`LowerError`]. Configuration errors describe an
//! inconsistent program (conflicting topologies, writes outside a sparsity
//! pattern, shape mismatches). Internal-consistency errors indicate a pass
//! left work undone and are never expected from a valid program.

pub(crate) mod assemblies;
mod index_expressions;
mod tensor_access;
pub(crate) mod terms;
pub(crate) mod typing;


use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use weft_foundation::{FieldId, SearchStrategy, SetId, VarId};

use crate::storage::{infer_storage, TensorStorages};
use crate::Func;

pub use assemblies::lower_assemblies;
pub use index_expressions::lower_index_expressions;
pub use tensor_access::lower_tensor_accesses;

/// Errors that can occur during storage inference and lowering.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LowerError {
    /// A variable is indexed by two topologies that induce different patterns.
    #[error("variable '{var}' is indexed by conflicting topologies {first} and {second}")]
    ConflictingTopology {
        var: VarId,
        first: String,
        second: String,
    },

    /// A topology cannot induce the row and column sets of a variable.
    #[error("topology {topology} cannot index variable '{var}' of type {ty}")]
    IncompatibleTopology {
        var: VarId,
        topology: String,
        ty: String,
    },

    /// An index ranges over a different domain than the dimension it indexes.
    #[error("index '{index}' in {context} ranges over {found}, expected {expected}")]
    IndexDomainMismatch {
        context: String,
        index: String,
        expected: String,
        found: String,
    },

    /// An assembly writes a location its target's pattern cannot be shown to contain.
    #[error("assembly over '{set}' writes '{target}' at ({row}, {col}), outside pattern {pattern}")]
    PatternIncomplete {
        target: VarId,
        set: SetId,
        row: String,
        col: String,
        pattern: String,
    },

    /// A sparse destination would need entries outside its pattern.
    #[error("cannot write '{target}' with pattern {pattern}: {reason}")]
    PatternMismatch {
        target: VarId,
        pattern: String,
        reason: String,
    },

    /// Block shapes do not conform.
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    /// An index expression violates the summation convention.
    #[error("malformed index expression for '{var}': {reason}")]
    MalformedIndexExpression { var: VarId, reason: String },

    /// An assembly kernel overwrites its target instead of accumulating.
    #[error("assembly kernel assigns to '{target}' instead of accumulating into it")]
    NonAccumulatingWrite { target: VarId },

    /// A set is used but not declared.
    #[error("unknown set: {0}")]
    UnknownSet(SetId),

    /// A field is used but not declared on its set.
    #[error("set '{set}' has no field '{field}'")]
    UnknownField { set: SetId, field: FieldId },

    /// A variable is used but not declared.
    #[error("unknown variable: {0}")]
    UnknownVariable(VarId),

    /// The construct is outside what the passes accept.
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// A tensor variable has no storage descriptor.
    #[error("no storage descriptor for '{0}'")]
    MissingStorage(VarId),

    /// A symbolic construct survived lowering.
    #[error("unlowered construct remains after lowering: {0}")]
    UnloweredAccess(String),
}

impl LowerError {
    /// True for errors caused by the input program, false for internal
    /// consistency failures of the passes.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            LowerError::MissingStorage(_) | LowerError::UnloweredAccess(_)
        )
    }
}

/// Result type for lowering.
pub type Result<T> = std::result::Result<T, LowerError>;

/// Options controlling lowering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowerOptions {
    /// How sparse rows are searched for a column
    pub search: SearchStrategy,
}

/// A lowered function together with the storage table it was lowered against.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredFunc {
    pub func: Func,
    pub storages: TensorStorages,
}

/// Lower a function, inferring storage first.
///
/// This is the main entry point. It computes the storage table with
/// [`infer_storage`] and runs the three passes in order.
pub fn lower(func: &Func, options: &LowerOptions) -> Result<LoweredFunc> {
    let storages = infer_storage(func)?;
    lower_with_storages(func, storages, options)
}

/// Lower a function against an already computed storage table.
pub fn lower_with_storages(
    func: &Func,
    storages: TensorStorages,
    options: &LowerOptions,
) -> Result<LoweredFunc> {
    info!(
        func = %func.id,
        tensors = storages.len(),
        search = ?options.search,
        "lowering function"
    );

    let lowered = lower_assemblies(func.clone(), &storages)?;
    let lowered = lower_index_expressions(lowered, &storages)?;
    let lowered = lower_tensor_accesses(lowered, &storages, options)?;

    info!(func = %func.id, statements = lowered.body.len(), "lowering complete");
    Ok(LoweredFunc {
        func: lowered,
        storages,
    })
}
