//! Weft IR - typed graph tensor programs and their lowering
//!
//! Lowers assemblies over graph relations and tensor index expressions into
//! explicit, storage-aware loop code.
//!
//! Pipeline: Func -> storage table -> assemblies -> index expressions ->
//! tensor accesses -> lowered Func

pub mod builder;
mod lower;
mod storage;
mod types;
mod validate;

pub use lower::{
    lower, lower_assemblies, lower_index_expressions, lower_tensor_accesses, lower_with_storages,
    LowerError, LowerOptions, LoweredFunc,
};
pub use storage::{infer_storage, infer_storage_with, StorageKind, TensorStorage, TensorStorages};
pub use types::*;
pub use validate::{validate, LowerWarning, WarningCode};

/// Bool field marking fixed elements of a solve's governing set.
pub const BOUNDARY_MARKER_FIELD: &str = "fixed";
