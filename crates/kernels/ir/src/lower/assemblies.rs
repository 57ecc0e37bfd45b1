//! Assembly lowering.
//!
//! An assembly `targets = map kernel over S reduce +` becomes:
//!
//! ```text
//! zero(target)                      // first assembly into each target only
//! for e in S {                      // topology insertion order
//!     <kernel body>                 // endpoints and fields resolved through S
//! }
//! ```
//!
//! Kernel writes stay symbolic (`TensorWrite`) and are resolved against
//! storage by tensor-access lowering. Everything that can be checked
//! statically is checked here: every write accumulates, index domains match
//! the target dimensions, block shapes agree, and every location written to
//! a sparse target lies inside its pattern.
//!
//! Several assemblies into the same target are summed: only the first one
//! zeroes it.

use indexmap::IndexSet;
use tracing::debug;

use weft_foundation::{SetId, VarId};

use crate::storage::{StorageKind, TensorStorages};
use crate::{
    Assembly, Expr, Func, IndexDomain, Kernel, PatternRef, SetDecl, Stmt, TensorAccess,
    TopologyRef, Type,
};

use super::typing::TypeEnv;
use super::{LowerError, Result};

/// What an assembly write index ranges over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexRole {
    /// The current element of the source set.
    Element,
    /// Endpoint `slot` of the current element.
    Endpoint(usize),
}

/// Classify an assembly write index.
pub(crate) fn index_role(index: &Expr, kernel: &Kernel) -> Option<IndexRole> {
    match index {
        Expr::Var(var) if var == &kernel.element.id => Some(IndexRole::Element),
        Expr::Endpoint { endpoints, slot }
            if kernel.endpoints.as_ref().is_some_and(|e| &e.id == endpoints) =>
        {
            Some(IndexRole::Endpoint(*slot))
        }
        _ => None,
    }
}

/// Pattern that a write at `(row, col)` over the elements of `set` ranges over.
pub(crate) fn induced_pattern(set: &SetDecl, row: IndexRole, col: IndexRole) -> Option<PatternRef> {
    let relation = TopologyRef::Relation(set.id.clone());
    match (row, col, &set.endpoints) {
        (IndexRole::Element, IndexRole::Element, _) => Some(PatternRef::diagonal(set.id.clone())),
        (IndexRole::Endpoint(_), IndexRole::Endpoint(_), Some(ep)) => {
            Some(PatternRef::square(set.id.clone(), ep.set.clone()))
        }
        (IndexRole::Element, IndexRole::Endpoint(_), Some(ep)) => Some(PatternRef {
            topology: relation,
            rows: set.id.clone(),
            cols: ep.set.clone(),
        }),
        (IndexRole::Endpoint(_), IndexRole::Element, Some(ep)) => Some(PatternRef {
            topology: relation,
            rows: ep.set.clone(),
            cols: set.id.clone(),
        }),
        _ => None,
    }
}

/// True if every `(row, col)` written over `set` is provably in `pattern`.
fn covers(pattern: &PatternRef, set: &SetDecl, row: IndexRole, col: IndexRole) -> bool {
    // Square patterns always hold their diagonal
    if row == col && pattern.rows == pattern.cols {
        return true;
    }
    match &pattern.topology {
        TopologyRef::Relation(relation) if relation == &set.id => {
            induced_pattern(set, row, col).as_ref() == Some(pattern)
        }
        TopologyRef::Relation(_) | TopologyRef::Diagonal(_) => false,
    }
}

fn describe(role: IndexRole, set: &SetId) -> String {
    match role {
        IndexRole::Element => format!("element of {set}"),
        IndexRole::Endpoint(slot) => format!("endpoint {slot} of {set}"),
    }
}

/// Lower every assembly statement of a function into element loops.
pub fn lower_assemblies(mut func: Func, storages: &TensorStorages) -> Result<Func> {
    let body = std::mem::take(&mut func.body);
    let mut zeroed: IndexSet<VarId> = IndexSet::new();
    let mut lowered = Vec::with_capacity(body.len());

    for stmt in body {
        match stmt {
            Stmt::Assemble(assembly) => {
                lower_assembly(&func, &assembly, storages, &mut zeroed, &mut lowered)?
            }
            other => {
                if other.children().iter().any(|s| matches!(s, Stmt::Assemble(_))) {
                    return Err(LowerError::UnsupportedConstruct(
                        "nested assembly".to_string(),
                    ));
                }
                lowered.push(other)
            }
        }
    }

    func.body = lowered;
    Ok(func)
}

fn lower_assembly(
    func: &Func,
    assembly: &Assembly,
    storages: &TensorStorages,
    zeroed: &mut IndexSet<VarId>,
    out: &mut Vec<Stmt>,
) -> Result<()> {
    let set = func
        .set(&assembly.set)
        .ok_or_else(|| LowerError::UnknownSet(assembly.set.clone()))?;
    let kernel = &assembly.kernel;

    if kernel.element.ty != Type::Element(set.id.clone()) {
        return Err(LowerError::UnsupportedConstruct(format!(
            "kernel element '{}' of type {} in assembly over '{}'",
            kernel.element.id, kernel.element.ty, set.id
        )));
    }
    if let Some(endpoints) = &kernel.endpoints {
        if !set.is_relation() || endpoints.ty != Type::Endpoints(set.id.clone()) {
            return Err(LowerError::UnsupportedConstruct(format!(
                "kernel endpoints '{}' of type {} in assembly over '{}'",
                endpoints.id, endpoints.ty, set.id
            )));
        }
    }
    for target in &assembly.targets {
        func.tensor_type(target)
            .ok_or_else(|| LowerError::UnknownVariable(target.clone()))?;
        if !storages.contains_key(target) {
            return Err(LowerError::MissingStorage(target.clone()));
        }
    }

    let mut env = TypeEnv::new(func);
    env.bind(kernel.element.id.clone(), kernel.element.ty.clone());
    if let Some(endpoints) = &kernel.endpoints {
        env.bind(endpoints.id.clone(), endpoints.ty.clone());
    }

    let mut lowering = KernelLowering {
        assembly,
        set,
        storages,
        env,
    };
    let body = lowering.lower_body(&kernel.body)?;

    for target in &assembly.targets {
        if zeroed.insert(target.clone()) {
            out.push(Stmt::Zero(target.clone()));
        } else {
            debug!(target = %target, set = %set.id, "summing into previously assembled target");
        }
    }
    debug!(
        set = %set.id,
        targets = assembly.targets.len(),
        statements = body.len(),
        "assembly lowered"
    );
    out.push(Stmt::ForElements {
        set: set.id.clone(),
        element: kernel.element.id.clone(),
        body,
    });
    Ok(())
}

struct KernelLowering<'a> {
    assembly: &'a Assembly,
    set: &'a SetDecl,
    storages: &'a TensorStorages,
    env: TypeEnv<'a>,
}

impl KernelLowering<'_> {
    fn lower_body(&mut self, body: &[Stmt]) -> Result<Vec<Stmt>> {
        body.iter().map(|stmt| self.lower_stmt(stmt)).collect()
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<Stmt> {
        match stmt {
            Stmt::Assign { var, value } | Stmt::Accumulate { var, value } => {
                let ty = self.env.type_of(value)?;
                if matches!(ty, Type::Tensor(_)) {
                    return Err(LowerError::UnsupportedConstruct(format!(
                        "kernel local '{var}' bound to a tensor"
                    )));
                }
                let value = self.rewrite(value)?;
                if let Stmt::Assign { .. } = stmt {
                    self.env.bind(var.clone(), ty);
                    Ok(Stmt::Assign {
                        var: var.clone(),
                        value,
                    })
                } else {
                    self.env.lookup(var)?;
                    Ok(Stmt::Accumulate {
                        var: var.clone(),
                        value,
                    })
                }
            }
            Stmt::TensorWrite {
                access,
                value,
                accumulate,
            } => self.lower_write(access, value, *accumulate),
            other => Err(LowerError::UnsupportedConstruct(format!(
                "statement in assembly kernel: {other:?}"
            ))),
        }
    }

    fn lower_write(&mut self, access: &TensorAccess, value: &Expr, accumulate: bool) -> Result<Stmt> {
        let target = &access.tensor;
        if !self.assembly.targets.contains(target) {
            return Err(LowerError::UnsupportedConstruct(format!(
                "assembly kernel writes '{target}', which is not one of its targets"
            )));
        }
        if !accumulate {
            return Err(LowerError::NonAccumulatingWrite {
                target: target.clone(),
            });
        }

        let tensor = self.env.tensor(target)?;
        if access.indices.len() != tensor.rank() {
            return Err(LowerError::IndexDomainMismatch {
                context: format!("assembly write to '{target}'"),
                index: format!("{} indices", access.indices.len()),
                expected: format!("rank {}", tensor.rank()),
                found: format!("rank {}", access.indices.len()),
            });
        }

        let mut roles = Vec::with_capacity(access.indices.len());
        for (k, (index, dim)) in access.indices.iter().zip(&tensor.dims).enumerate() {
            let role = index_role(index, &self.assembly.kernel).ok_or_else(|| {
                LowerError::UnsupportedConstruct(format!(
                    "assembly write index #{k} of '{target}' is neither the element nor one of its endpoints"
                ))
            })?;
            let domain = match self.env.type_of(index)? {
                Type::Element(set) => IndexDomain::Set(set),
                other => {
                    return Err(LowerError::UnsupportedConstruct(format!(
                        "assembly write index of type {other}"
                    )))
                }
            };
            if &domain != dim {
                return Err(LowerError::IndexDomainMismatch {
                    context: format!("assembly write to '{target}'"),
                    index: describe(role, &self.set.id),
                    expected: dim.to_string(),
                    found: domain.to_string(),
                });
            }
            roles.push(role);
        }

        let block = self.env.block_of(value, &format!("contribution to '{target}'"))?;
        if block != tensor.block {
            return Err(LowerError::ShapeMismatch {
                context: format!("contribution to '{target}'"),
                expected: tensor.block.to_string(),
                found: block.to_string(),
            });
        }

        let storage = self
            .storages
            .get(target)
            .ok_or_else(|| LowerError::MissingStorage(target.clone()))?;
        if let StorageKind::Sparse(pattern) = &storage.kind {
            let (row, col) = (roles[0], roles[1]);
            if !covers(pattern, self.set, row, col) {
                return Err(LowerError::PatternIncomplete {
                    target: target.clone(),
                    set: self.set.id.clone(),
                    row: describe(row, &self.set.id),
                    col: describe(col, &self.set.id),
                    pattern: pattern.to_string(),
                });
            }
        }

        let indices = access
            .indices
            .iter()
            .map(|index| self.rewrite(index))
            .collect::<Result<Vec<_>>>()?;
        Ok(Stmt::TensorWrite {
            access: TensorAccess {
                tensor: target.clone(),
                indices,
                position: None,
            },
            value: self.rewrite(value)?,
            accumulate: true,
        })
    }

    /// Resolve endpoint and field references through the source set.
    fn rewrite(&self, expr: &Expr) -> Result<Expr> {
        let element = || Box::new(Expr::Var(self.assembly.kernel.element.id.clone()));
        Ok(match expr {
            Expr::Endpoint { slot, .. } => Expr::EndpointOf {
                set: self.set.id.clone(),
                element: element(),
                slot: *slot,
            },
            Expr::ElementField { element: var, field } => {
                if var != &self.assembly.kernel.element.id {
                    return Err(LowerError::UnsupportedConstruct(format!(
                        "field access on '{var}', which is not the kernel element"
                    )));
                }
                Expr::FieldLoad {
                    set: self.set.id.clone(),
                    field: field.clone(),
                    element: element(),
                }
            }
            Expr::TensorRead(access) => {
                if self.assembly.targets.contains(&access.tensor) {
                    return Err(LowerError::UnsupportedConstruct(format!(
                        "assembly kernel reads its own target '{}'",
                        access.tensor
                    )));
                }
                Expr::TensorRead(TensorAccess {
                    tensor: access.tensor.clone(),
                    indices: access
                        .indices
                        .iter()
                        .map(|i| self.rewrite(i))
                        .collect::<Result<_>>()?,
                    position: access.position.clone(),
                })
            }
            Expr::Binary { op, lhs, rhs } => {
                Expr::binary(*op, self.rewrite(lhs)?, self.rewrite(rhs)?)
            }
            Expr::Neg(inner) => Expr::Neg(Box::new(self.rewrite(inner)?)),
            Expr::EndpointOf { set, element, slot } => Expr::EndpointOf {
                set: set.clone(),
                element: Box::new(self.rewrite(element)?),
                slot: *slot,
            },
            Expr::FieldLoad {
                set,
                field,
                element,
            } => Expr::FieldLoad {
                set: set.clone(),
                field: field.clone(),
                element: Box::new(self.rewrite(element)?),
            },
            Expr::Literal(_) | Expr::Var(_) | Expr::SetSize(_) => expr.clone(),
            other => {
                return Err(LowerError::UnsupportedConstruct(format!(
                    "expression in assembly kernel: {other:?}"
                )))
            }
        })
    }
}
