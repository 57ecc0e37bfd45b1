//! Tensor-access lowering.
//!
//! Resolves every symbolic element access against the storage table:
//!
//! | storage      | read                         | write                          |
//! |--------------|------------------------------|--------------------------------|
//! | dense        | `Load` at a row-major offset | `Store` at the same offset     |
//! | sparse       | `SparseLoad` at a position   | `SparseStore` at a position    |
//! | system none  | register `Var`               | `Assign` / `Accumulate`        |
//!
//! Sparse positions come from the enclosing pattern loop when index-expression
//! lowering recorded one, otherwise from a `Locate` search of the row. A
//! located read that misses reads zero; a located write that misses fails at
//! execution.
//!
//! After the rewrite no symbolic construct may remain; anything left is an
//! [`LowerError::UnloweredAccess`].

use tracing::debug;

use weft_foundation::VarId;

use crate::storage::{StorageKind, TensorStorage, TensorStorages};
use crate::{BinaryOp, Expr, Func, IndexDomain, Literal, SolveStmt, Stmt, TensorAccess};

use super::{LowerError, LowerOptions, Result};

/// Replace symbolic tensor reads and writes with memory operations.
pub fn lower_tensor_accesses(
    mut func: Func,
    storages: &TensorStorages,
    options: &LowerOptions,
) -> Result<Func> {
    let lowering = AccessLowering {
        func: &func,
        storages,
        options,
    };
    let body = lowering.lower_body(&func.body)?;
    func.body = body;

    ensure_lowered(&func.body)?;
    debug!(func = %func.id, "tensor accesses lowered");
    Ok(func)
}

struct AccessLowering<'a> {
    func: &'a Func,
    storages: &'a TensorStorages,
    options: &'a LowerOptions,
}

impl AccessLowering<'_> {
    fn storage(&self, var: &VarId) -> Result<&TensorStorage> {
        self.storages
            .get(var)
            .ok_or_else(|| LowerError::MissingStorage(var.clone()))
    }

    fn lower_body(&self, body: &[Stmt]) -> Result<Vec<Stmt>> {
        body.iter().map(|stmt| self.lower_stmt(stmt)).collect()
    }

    fn lower_stmt(&self, stmt: &Stmt) -> Result<Stmt> {
        Ok(match stmt {
            Stmt::Assign { var, value } => Stmt::Assign {
                var: var.clone(),
                value: self.lower_expr(value)?,
            },
            Stmt::Accumulate { var, value } => Stmt::Accumulate {
                var: var.clone(),
                value: self.lower_expr(value)?,
            },
            Stmt::TensorWrite {
                access,
                value,
                accumulate,
            } => self.lower_write(access, self.lower_expr(value)?, *accumulate)?,
            Stmt::ForElements { set, element, body } => Stmt::ForElements {
                set: set.clone(),
                element: element.clone(),
                body: self.lower_body(body)?,
            },
            Stmt::ForRange { var, extent, body } => Stmt::ForRange {
                var: var.clone(),
                extent: extent.clone(),
                body: self.lower_body(body)?,
            },
            Stmt::ForPattern {
                pattern,
                row,
                col,
                position,
                body,
            } => Stmt::ForPattern {
                pattern: pattern.clone(),
                row: row.clone(),
                col: col.clone(),
                position: position.clone(),
                body: self.lower_body(body)?,
            },
            Stmt::ForRow {
                pattern,
                row,
                col,
                position,
                body,
            } => Stmt::ForRow {
                pattern: pattern.clone(),
                row: self.lower_expr(row)?,
                col: col.clone(),
                position: position.clone(),
                body: self.lower_body(body)?,
            },
            Stmt::ForIntersect {
                left,
                right,
                left_row,
                right_row,
                col,
                left_position,
                right_position,
                body,
            } => Stmt::ForIntersect {
                left: left.clone(),
                right: right.clone(),
                left_row: self.lower_expr(left_row)?,
                right_row: self.lower_expr(right_row)?,
                col: col.clone(),
                left_position: left_position.clone(),
                right_position: right_position.clone(),
                body: self.lower_body(body)?,
            },
            Stmt::Zero(var) => {
                self.storage(var)?;
                stmt.clone()
            }
            Stmt::Solve(solve) => {
                self.check_solve(solve)?;
                stmt.clone()
            }
            Stmt::FieldWrite { value, .. } => {
                self.storage(value)?;
                stmt.clone()
            }
            Stmt::Assemble(_) => {
                return Err(LowerError::UnloweredAccess(
                    "assembly reached tensor-access lowering".to_string(),
                ))
            }
            Stmt::Store { .. } | Stmt::SparseStore { .. } => stmt.clone(),
        })
    }

    fn check_solve(&self, solve: &SolveStmt) -> Result<()> {
        let (matrices, vectors): (Vec<&VarId>, Vec<&VarId>) = match solve {
            SolveStmt::Direct(direct) => {
                let mut vectors = vec![&direct.rhs, &direct.result];
                if let Some(boundary) = &direct.boundary {
                    vectors.push(&boundary.values);
                }
                (vec![&direct.matrix], vectors)
            }
            SolveStmt::Schur(schur) => {
                let mut matrices = vec![&schur.primary, &schur.coupling];
                matrices.extend(schur.derived.as_ref());
                (
                    matrices,
                    vec![
                        &schur.rhs_primary,
                        &schur.rhs_derived,
                        &schur.result_primary,
                        &schur.result_derived,
                    ],
                )
            }
        };
        for var in vectors {
            self.storage(var)?;
        }
        for var in matrices {
            if self.storage(var)?.kind == StorageKind::SystemNone {
                return Err(LowerError::UnsupportedConstruct(format!(
                    "solve with register '{var}' as system matrix"
                )));
            }
        }
        Ok(())
    }

    fn lower_write(&self, access: &TensorAccess, value: Expr, accumulate: bool) -> Result<Stmt> {
        let storage = self.storage(&access.tensor)?;
        let buffer = access.tensor.clone();
        Ok(match &storage.kind {
            StorageKind::Dense => Stmt::Store {
                offset: self.dense_offset(access, storage)?,
                buffer,
                value,
                accumulate,
            },
            StorageKind::Sparse(_) => Stmt::SparseStore {
                position: self.sparse_position(access, storage)?,
                buffer,
                value,
                accumulate,
                block: storage.block,
            },
            StorageKind::SystemNone if accumulate => Stmt::Accumulate { var: buffer, value },
            StorageKind::SystemNone => Stmt::Assign { var: buffer, value },
        })
    }

    fn lower_read(&self, access: &TensorAccess) -> Result<Expr> {
        let storage = self.storage(&access.tensor)?;
        let buffer = access.tensor.clone();
        Ok(match &storage.kind {
            StorageKind::Dense => Expr::Load {
                offset: Box::new(self.dense_offset(access, storage)?),
                buffer,
                block: storage.block,
            },
            StorageKind::Sparse(_) => Expr::SparseLoad {
                position: Box::new(self.sparse_position(access, storage)?),
                buffer,
                block: storage.block,
            },
            StorageKind::SystemNone => Expr::Var(buffer),
        })
    }

    /// Row-major float offset of a dense access.
    fn dense_offset(&self, access: &TensorAccess, storage: &TensorStorage) -> Result<Expr> {
        let tensor = self
            .func
            .tensor_type(&access.tensor)
            .ok_or_else(|| LowerError::UnknownVariable(access.tensor.clone()))?;
        if access.indices.len() != tensor.rank() {
            return Err(LowerError::UnloweredAccess(format!(
                "access to '{}' with {} indices",
                access.tensor,
                access.indices.len()
            )));
        }

        let mut offset: Option<Expr> = None;
        for (index, dim) in access.indices.iter().zip(&tensor.dims) {
            let index = self.lower_expr(index)?;
            offset = Some(match offset {
                None => index,
                Some(outer) => {
                    let extent = match dim {
                        IndexDomain::Set(set) => Expr::SetSize(set.clone()),
                        IndexDomain::Dense(n) => Expr::Literal(Literal::Int(*n as i64)),
                    };
                    Expr::binary(BinaryOp::Add, Expr::binary(BinaryOp::Mul, outer, extent), index)
                }
            });
        }

        let offset = offset.unwrap_or(Expr::Literal(Literal::Int(0)));
        let block_len = storage.block.len();
        Ok(if block_len == 1 {
            offset
        } else {
            Expr::binary(
                BinaryOp::Mul,
                offset,
                Expr::Literal(Literal::Int(block_len as i64)),
            )
        })
    }

    fn sparse_position(&self, access: &TensorAccess, storage: &TensorStorage) -> Result<Expr> {
        if let Some(position) = &access.position {
            return Ok(Expr::Var(position.clone()));
        }
        let (Some(pattern), [row, col]) = (storage.pattern(), access.indices.as_slice()) else {
            return Err(LowerError::UnloweredAccess(format!(
                "sparse access to '{}' with {} indices",
                access.tensor,
                access.indices.len()
            )));
        };
        Ok(Expr::Locate {
            pattern: pattern.clone(),
            row: Box::new(self.lower_expr(row)?),
            col: Box::new(self.lower_expr(col)?),
            search: self.options.search,
        })
    }

    fn lower_expr(&self, expr: &Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::TensorRead(access) => self.lower_read(access)?,
            Expr::Binary { op, lhs, rhs } => {
                Expr::binary(*op, self.lower_expr(lhs)?, self.lower_expr(rhs)?)
            }
            Expr::Neg(inner) => Expr::Neg(Box::new(self.lower_expr(inner)?)),
            Expr::EndpointOf { set, element, slot } => Expr::EndpointOf {
                set: set.clone(),
                element: Box::new(self.lower_expr(element)?),
                slot: *slot,
            },
            Expr::FieldLoad {
                set,
                field,
                element,
            } => Expr::FieldLoad {
                set: set.clone(),
                field: field.clone(),
                element: Box::new(self.lower_expr(element)?),
            },
            Expr::Locate {
                pattern,
                row,
                col,
                search,
            } => Expr::Locate {
                pattern: pattern.clone(),
                row: Box::new(self.lower_expr(row)?),
                col: Box::new(self.lower_expr(col)?),
                search: *search,
            },
            Expr::Load {
                buffer,
                offset,
                block,
            } => Expr::Load {
                buffer: buffer.clone(),
                offset: Box::new(self.lower_expr(offset)?),
                block: *block,
            },
            Expr::SparseLoad {
                buffer,
                position,
                block,
            } => Expr::SparseLoad {
                buffer: buffer.clone(),
                position: Box::new(self.lower_expr(position)?),
                block: *block,
            },
            Expr::Literal(_)
            | Expr::Var(_)
            | Expr::Field { .. }
            | Expr::SetSize(_)
            | Expr::Endpoint { .. }
            | Expr::ElementField { .. }
            | Expr::Index(_)
            | Expr::Indexed(_) => expr.clone(),
        })
    }
}

/// Fail if any symbolic construct survived lowering.
fn ensure_lowered(body: &[Stmt]) -> Result<()> {
    let mut leftover: Option<String> = None;
    for stmt in body {
        stmt.walk(&mut |s| {
            if leftover.is_some() {
                return;
            }
            match s {
                Stmt::TensorWrite { access, .. } => {
                    leftover = Some(format!("tensor write to '{}'", access.tensor));
                }
                Stmt::Assemble(assembly) => {
                    leftover = Some(format!("assembly over '{}'", assembly.set));
                }
                _ => {
                    for expr in s.exprs() {
                        expr.walk(&mut |e| {
                            if leftover.is_some() {
                                return;
                            }
                            leftover = match e {
                                Expr::TensorRead(access) => {
                                    Some(format!("tensor read of '{}'", access.tensor))
                                }
                                Expr::Index(_) | Expr::Indexed(_) => {
                                    Some("index expression".to_string())
                                }
                                Expr::Endpoint { endpoints, .. } => {
                                    Some(format!("kernel endpoint reference '{endpoints}'"))
                                }
                                Expr::ElementField { element, field } => {
                                    Some(format!("kernel field reference '{element}.{field}'"))
                                }
                                _ => None,
                            };
                        });
                    }
                }
            }
        });
    }
    match leftover {
        Some(what) => Err(LowerError::UnloweredAccess(what)),
        None => Ok(()),
    }
}
