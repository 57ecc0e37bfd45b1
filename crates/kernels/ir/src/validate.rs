//! IR Validation and Warning Generation
//!
//! This module checks a function for issues that do not prevent lowering but
//! usually indicate a mistake in the program.
//!
//! # Overview
//!
//! Validation runs before or after lowering (it only reads the input
//! function) and checks for:
//!
//! - **Unused assembly targets**: tensors assembled but never read, solved or
//!   returned
//! - **Dense system matrices**: a solve whose matrix ended up with dense
//!   storage although it is indexed by sets
//! - **Boundary conditions**: marker fields that are missing, not boolean, or
//!   declared on a set other than the rows of the solved system
//!
//! # Warning vs Error
//!
//! Warnings never stop lowering. A dense system matrix still solves
//! correctly, it only costs quadratic memory; a missing marker field means
//! nothing is eliminated at execution.
//!
//! # Usage
//!
//! ```ignore
//! for warning in validate(&func) {
//!     eprintln!("[{:?}] {}: {}", warning.code, warning.entity, warning.message);
//! }
//! ```

use indexmap::IndexSet;
use tracing::warn;

use weft_foundation::VarId;

use crate::storage::{infer_storage, StorageKind};
use crate::{DirectSolve, Expr, FieldType, Func, IndexDomain, SolveStmt, Stmt};

/// A warning about a potential issue in a function.
#[derive(Debug, Clone, PartialEq)]
pub struct LowerWarning {
    /// Warning code for filtering
    pub code: WarningCode,
    /// Human-readable message
    pub message: String,
    /// The variable or set this warning relates to
    pub entity: String,
}

/// Warning codes for categorization and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningCode {
    /// An assembly target is never read, solved, written to a field or returned.
    UnusedAssemblyTarget,

    /// A solve's system matrix has dense storage.
    ///
    /// Happens when nothing ties the matrix to a relation, e.g. it is only
    /// filled by an index expression over dense operands.
    DenseSystemMatrix,

    /// A boundary condition names a set other than the rows of its matrix.
    BoundaryMarkerMismatch,

    /// A boundary marker field is not declared as a boolean field.
    MissingBoundaryMarker,
}

/// Validate a function and return any warnings.
///
/// Warnings are also logged via `tracing::warn!`.
pub fn validate(func: &Func) -> Vec<LowerWarning> {
    let mut warnings = Vec::new();

    check_unused_targets(func, &mut warnings);
    check_solves(func, &mut warnings);

    for warning in &warnings {
        warn!(
            code = ?warning.code,
            entity = %warning.entity,
            "{}",
            warning.message
        );
    }

    warnings
}

/// Variables read anywhere in the function, including solve operands and results.
fn used_variables(func: &Func) -> IndexSet<VarId> {
    let mut used: IndexSet<VarId> = func.results.iter().map(|v| v.id.clone()).collect();
    for stmt in &func.body {
        stmt.walk(&mut |s| {
            for expr in s.exprs() {
                expr.walk(&mut |e| match e {
                    Expr::Var(var) => {
                        used.insert(var.clone());
                    }
                    Expr::TensorRead(access) => {
                        used.insert(access.tensor.clone());
                    }
                    Expr::Indexed(indexed) => {
                        used.insert(indexed.tensor.clone());
                    }
                    _ => {}
                });
            }
            match s {
                Stmt::FieldWrite { value, .. } => {
                    used.insert(value.clone());
                }
                Stmt::Solve(SolveStmt::Direct(direct)) => {
                    used.insert(direct.matrix.clone());
                    used.insert(direct.rhs.clone());
                    if let Some(boundary) = &direct.boundary {
                        used.insert(boundary.values.clone());
                    }
                }
                Stmt::Solve(SolveStmt::Schur(schur)) => {
                    used.insert(schur.primary.clone());
                    used.insert(schur.coupling.clone());
                    used.extend(schur.derived.iter().cloned());
                    used.insert(schur.rhs_primary.clone());
                    used.insert(schur.rhs_derived.clone());
                }
                _ => {}
            }
        });
    }
    used
}

fn check_unused_targets(func: &Func, warnings: &mut Vec<LowerWarning>) {
    let used = used_variables(func);
    for stmt in &func.body {
        let Stmt::Assemble(assembly) = stmt else {
            continue;
        };
        for target in &assembly.targets {
            if !used.contains(target) {
                warnings.push(LowerWarning {
                    code: WarningCode::UnusedAssemblyTarget,
                    message: format!(
                        "'{target}' is assembled over '{}' but never used",
                        assembly.set
                    ),
                    entity: target.to_string(),
                });
            }
        }
    }
}

fn check_solves(func: &Func, warnings: &mut Vec<LowerWarning>) {
    // Storage failures are lowering errors; validation only reports what it can see
    let storages = infer_storage(func).unwrap_or_default();

    for stmt in &func.body {
        let Stmt::Solve(solve) = stmt else {
            continue;
        };
        let matrices: Vec<&VarId> = match solve {
            SolveStmt::Direct(direct) => {
                check_boundary(func, direct, warnings);
                vec![&direct.matrix]
            }
            SolveStmt::Schur(schur) => {
                let mut matrices = vec![&schur.primary, &schur.coupling];
                matrices.extend(schur.derived.as_ref());
                matrices
            }
        };

        for matrix in matrices {
            let system_scale = func
                .tensor_type(matrix)
                .is_some_and(|t| t.dims.iter().any(|d| matches!(d, IndexDomain::Set(_))));
            let dense = storages
                .get(matrix)
                .is_some_and(|s| s.kind == StorageKind::Dense);
            if system_scale && dense {
                warnings.push(LowerWarning {
                    code: WarningCode::DenseSystemMatrix,
                    message: format!(
                        "system matrix '{matrix}' has dense storage; assemble it over a relation to make it sparse"
                    ),
                    entity: matrix.to_string(),
                });
            }
        }
    }
}

fn check_boundary(func: &Func, direct: &DirectSolve, warnings: &mut Vec<LowerWarning>) {
    let Some(boundary) = &direct.boundary else {
        return;
    };

    let row_set = func
        .tensor_type(&direct.matrix)
        .and_then(|t| t.dims.first())
        .and_then(|d| match d {
            IndexDomain::Set(set) => Some(set),
            IndexDomain::Dense(_) => None,
        });
    if row_set != Some(&boundary.set) {
        warnings.push(LowerWarning {
            code: WarningCode::BoundaryMarkerMismatch,
            message: format!(
                "boundary marker on '{}' but '{}' has rows on {}",
                boundary.set,
                direct.matrix,
                row_set.map_or_else(|| "a dense extent".to_string(), |s| format!("'{s}'"))
            ),
            entity: boundary.set.to_string(),
        });
    }

    let marker = func
        .set(&boundary.set)
        .and_then(|decl| decl.fields.get(&boundary.marker));
    if marker != Some(&FieldType::Bool) {
        warnings.push(LowerWarning {
            code: WarningCode::MissingBoundaryMarker,
            message: format!(
                "'{}.{}' is not declared as a bool field; no unknowns will be fixed",
                boundary.set, boundary.marker
            ),
            entity: format!("{}.{}", boundary.set, boundary.marker),
        });
    }
}
