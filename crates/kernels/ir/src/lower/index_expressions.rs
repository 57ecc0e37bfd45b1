//! Index-expression lowering.
//!
//! A contraction `A = (i,j) B(i,k) * C(k,j) + ...` becomes one loop nest per
//! signed product term, accumulating into the destination after it has been
//! zeroed.
//!
//! # Loop construction
//!
//! Free indices are iterated first:
//!
//! - sparse destination: one [`Stmt::ForPattern`] over its pattern; operands
//!   on the same pattern reuse the destination position
//! - otherwise: a [`Stmt::ForRange`] per free index
//!
//! Then each summed index, in order of first appearance:
//!
//! - no sparse operand has it as column with its row already bound: a dense
//!   [`Stmt::ForRange`] over the index domain
//! - one such operand: a [`Stmt::ForRow`] over that operand's row, so dense
//!   operands are indexed by the sparse column instead of being iterated
//! - two such operands: a [`Stmt::ForIntersect`], merging both sorted rows in
//!   linear time
//!
//! Every operand read and the destination write stay symbolic
//! ([`Expr::TensorRead`], [`Stmt::TensorWrite`]), carrying a known pattern
//! position where a loop provides one.
//!
//! # Checks
//!
//! - every summed index appears exactly twice per term, every free index at
//!   least once, and all occurrences agree on their domain
//! - block shapes of each product conform to the destination block
//! - a sparse destination only receives terms masked by an operand whose
//!   pattern lies inside the destination pattern (no fill-in)

use indexmap::IndexMap;
use tracing::debug;

use weft_foundation::{BlockShape, VarId};

use crate::storage::{StorageKind, TensorStorage, TensorStorages};
use crate::{
    BinaryOp, Expr, Func, IndexDomain, IndexExpr, IndexVar, IndexedTensor, PatternRef, Stmt,
    TensorAccess, TensorType,
};

use super::terms::{expand_terms, Factor, Term};
use super::typing::TypeEnv;
use super::{LowerError, Result};

/// Lower every tensor assignment from an index expression into loop nests.
pub fn lower_index_expressions(mut func: Func, storages: &TensorStorages) -> Result<Func> {
    let body = std::mem::take(&mut func.body);
    let mut names = FreshNames::default();
    let mut lowered = Vec::with_capacity(body.len());

    for stmt in body {
        match stmt {
            Stmt::Assign {
                var,
                value: Expr::Index(ie),
            } => {
                let contraction = Contraction::new(&func, storages, &var, &ie)?;
                contraction.lower(&mut names, &mut lowered)?;
            }
            other => {
                if contains_index_expr(&other) {
                    return Err(LowerError::UnsupportedConstruct(
                        "index expression outside a tensor assignment".to_string(),
                    ));
                }
                lowered.push(other);
            }
        }
    }

    func.body = lowered;
    Ok(func)
}

fn contains_index_expr(stmt: &Stmt) -> bool {
    let mut found = false;
    stmt.walk(&mut |s| {
        found |= s
            .exprs()
            .iter()
            .any(|e| e.any(|x| matches!(x, Expr::Index(_) | Expr::Indexed(_))));
    });
    found
}

/// Generator of loop and position variable names.
///
/// `%` never occurs in source identifiers, so generated names cannot
/// collide with program variables.
#[derive(Default)]
struct FreshNames {
    counter: usize,
}

impl FreshNames {
    fn var(&mut self, base: &str) -> VarId {
        self.counter += 1;
        VarId::new(format!("{base}%{}", self.counter))
    }
}

/// One loop of a term's nest, outermost first.
enum LoopHeader {
    Range {
        var: VarId,
        extent: IndexDomain,
    },
    Pattern {
        pattern: PatternRef,
        row: VarId,
        col: VarId,
        position: VarId,
    },
    Row {
        pattern: PatternRef,
        row: Expr,
        col: VarId,
        position: VarId,
    },
    Intersect {
        left: PatternRef,
        right: PatternRef,
        left_row: Expr,
        right_row: Expr,
        col: VarId,
        left_position: VarId,
        right_position: VarId,
    },
}

impl LoopHeader {
    fn wrap(self, body: Vec<Stmt>) -> Stmt {
        match self {
            LoopHeader::Range { var, extent } => Stmt::ForRange { var, extent, body },
            LoopHeader::Pattern {
                pattern,
                row,
                col,
                position,
            } => Stmt::ForPattern {
                pattern,
                row,
                col,
                position,
                body,
            },
            LoopHeader::Row {
                pattern,
                row,
                col,
                position,
            } => Stmt::ForRow {
                pattern,
                row,
                col,
                position,
                body,
            },
            LoopHeader::Intersect {
                left,
                right,
                left_row,
                right_row,
                col,
                left_position,
                right_position,
            } => Stmt::ForIntersect {
                left,
                right,
                left_row,
                right_row,
                col,
                left_position,
                right_position,
                body,
            },
        }
    }
}

/// A checked tensor assignment `dst = index expression`.
struct Contraction<'a> {
    storages: &'a TensorStorages,
    dst: &'a VarId,
    dst_storage: &'a TensorStorage,
    free: &'a [IndexVar],
    /// Product terms with their summed indices, in order of first appearance
    terms: Vec<(Term, Vec<IndexVar>)>,
}

impl<'a> Contraction<'a> {
    fn new(
        func: &'a Func,
        storages: &'a TensorStorages,
        dst: &'a VarId,
        ie: &'a IndexExpr,
    ) -> Result<Self> {
        let env = TypeEnv::new(func);
        let tensor = env.tensor(dst)?;
        let dst_storage = storages
            .get(dst)
            .ok_or_else(|| LowerError::MissingStorage(dst.clone()))?;

        if ie.free.len() != tensor.rank() {
            return Err(LowerError::MalformedIndexExpression {
                var: dst.clone(),
                reason: format!(
                    "{} free indices for a rank-{} destination",
                    ie.free.len(),
                    tensor.rank()
                ),
            });
        }
        for (k, (index, dim)) in ie.free.iter().zip(&tensor.dims).enumerate() {
            if &index.domain != dim {
                return Err(LowerError::IndexDomainMismatch {
                    context: format!("destination '{dst}'"),
                    index: index.name.clone(),
                    expected: dim.to_string(),
                    found: index.domain.to_string(),
                });
            }
            if ie.free[..k].iter().any(|other| other.name == index.name) {
                return Err(LowerError::MalformedIndexExpression {
                    var: dst.clone(),
                    reason: format!("free index '{}' repeated", index.name),
                });
            }
        }

        let mut contraction = Self {
            storages,
            dst,
            dst_storage,
            free: &ie.free,
            terms: Vec::new(),
        };
        for term in expand_terms(&ie.body)? {
            let bound = contraction.check_term(&env, tensor, &term)?;
            contraction.terms.push((term, bound));
        }
        Ok(contraction)
    }

    fn pattern_of(&self, tensor: &VarId) -> Option<&'a PatternRef> {
        self.storages.get(tensor).and_then(TensorStorage::pattern)
    }

    fn indexed_by_free(&self, operand: &IndexedTensor) -> bool {
        operand.indices.len() == self.free.len()
            && operand
                .indices
                .iter()
                .zip(self.free)
                .all(|(a, b)| a.name == b.name)
    }

    fn malformed(&self, reason: String) -> LowerError {
        LowerError::MalformedIndexExpression {
            var: self.dst.clone(),
            reason,
        }
    }

    /// Validate one term and return its summed indices.
    fn check_term(&self, env: &TypeEnv<'_>, tensor: &TensorType, term: &Term) -> Result<Vec<IndexVar>> {
        let mut seen: IndexMap<String, (IndexDomain, usize)> = IndexMap::new();
        let mut block: Option<BlockShape> = None;

        for factor in &term.factors {
            let factor_block = match factor {
                Factor::Tensor(operand) => {
                    let operand_type = env.tensor(&operand.tensor)?;
                    if operand.indices.len() != operand_type.rank() {
                        return Err(self.malformed(format!(
                            "'{}' has rank {} but is indexed by {} indices",
                            operand.tensor,
                            operand_type.rank(),
                            operand.indices.len()
                        )));
                    }
                    for (index, dim) in operand.indices.iter().zip(&operand_type.dims) {
                        if &index.domain != dim {
                            return Err(LowerError::IndexDomainMismatch {
                                context: format!("operand '{}'", operand.tensor),
                                index: index.name.clone(),
                                expected: dim.to_string(),
                                found: index.domain.to_string(),
                            });
                        }
                        match seen.get_mut(&index.name) {
                            Some((domain, count)) => {
                                if domain != &index.domain {
                                    return Err(LowerError::IndexDomainMismatch {
                                        context: format!("contraction into '{}'", self.dst),
                                        index: index.name.clone(),
                                        expected: domain.to_string(),
                                        found: index.domain.to_string(),
                                    });
                                }
                                *count += 1;
                            }
                            None => {
                                seen.insert(index.name.clone(), (index.domain.clone(), 1));
                            }
                        }
                    }
                    operand_type.block
                }
                Factor::Scalar(expr) => env.block_of(expr, "index expression coefficient")?,
            };
            block = Some(match block {
                None => factor_block,
                Some(acc) => acc.product(factor_block).ok_or_else(|| LowerError::ShapeMismatch {
                    context: format!("product in contraction into '{}'", self.dst),
                    expected: acc.to_string(),
                    found: factor_block.to_string(),
                })?,
            });
        }

        let block = block.ok_or_else(|| self.malformed("empty product term".to_string()))?;
        if block != tensor.block {
            return Err(LowerError::ShapeMismatch {
                context: format!("contraction into '{}'", self.dst),
                expected: tensor.block.to_string(),
                found: block.to_string(),
            });
        }

        for index in self.free {
            match seen.get(&index.name) {
                None => {
                    return Err(self.malformed(format!(
                        "free index '{}' does not appear in every term",
                        index.name
                    )))
                }
                Some((domain, _)) if domain != &index.domain => {
                    return Err(LowerError::IndexDomainMismatch {
                        context: format!("contraction into '{}'", self.dst),
                        index: index.name.clone(),
                        expected: index.domain.to_string(),
                        found: domain.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        let mut bound = Vec::new();
        for (name, (domain, count)) in &seen {
            if self.free.iter().any(|f| &f.name == name) {
                continue;
            }
            if *count != 2 {
                return Err(self.malformed(format!(
                    "summed index '{name}' appears {count} times, expected exactly twice"
                )));
            }
            bound.push(IndexVar::new(name.clone(), domain.clone()));
        }

        if let StorageKind::Sparse(pattern) = &self.dst_storage.kind {
            let masked = term.tensors().any(|(_, operand)| {
                self.indexed_by_free(operand)
                    && self
                        .pattern_of(&operand.tensor)
                        .is_some_and(|p| p.is_subset_of(pattern))
            });
            if !masked {
                let reason = match term.tensors().find(|(_, operand)| {
                    self.indexed_by_free(operand) && self.pattern_of(&operand.tensor).is_some()
                }) {
                    Some((_, operand)) => format!(
                        "operand '{}' is stored on a pattern that is not contained in the destination's",
                        operand.tensor
                    ),
                    None => "a term has no sparse operand restricted to the destination pattern"
                        .to_string(),
                };
                return Err(LowerError::PatternMismatch {
                    target: self.dst.clone(),
                    pattern: pattern.to_string(),
                    reason,
                });
            }
        }

        Ok(bound)
    }

    fn lower(&self, names: &mut FreshNames, out: &mut Vec<Stmt>) -> Result<()> {
        out.push(Stmt::Zero(self.dst.clone()));
        for (term, bound) in &self.terms {
            out.push(self.lower_term(names, term, bound)?);
        }
        debug!(
            dst = %self.dst,
            terms = self.terms.len(),
            storage = %self.dst_storage,
            "index expression lowered"
        );
        Ok(())
    }

    fn lower_term(&self, names: &mut FreshNames, term: &Term, bound: &[IndexVar]) -> Result<Stmt> {
        let mut bindings: IndexMap<String, Expr> = IndexMap::new();
        let mut positions: IndexMap<usize, VarId> = IndexMap::new();
        let mut headers = Vec::new();
        let mut dst_position = None;

        match &self.dst_storage.kind {
            StorageKind::Sparse(pattern) => {
                let row = names.var(&self.free[0].name);
                let col = names.var(&self.free[1].name);
                let position = names.var(&format!("{}.pos", self.dst));
                bindings.insert(self.free[0].name.clone(), Expr::Var(row.clone()));
                bindings.insert(self.free[1].name.clone(), Expr::Var(col.clone()));
                for (k, operand) in term.tensors() {
                    if self.indexed_by_free(operand) && self.pattern_of(&operand.tensor) == Some(pattern) {
                        positions.insert(k, position.clone());
                    }
                }
                dst_position = Some(position.clone());
                headers.push(LoopHeader::Pattern {
                    pattern: pattern.clone(),
                    row,
                    col,
                    position,
                });
            }
            StorageKind::Dense | StorageKind::SystemNone => {
                for index in self.free {
                    let var = names.var(&index.name);
                    bindings.insert(index.name.clone(), Expr::Var(var.clone()));
                    headers.push(LoopHeader::Range {
                        var,
                        extent: index.domain.clone(),
                    });
                }
            }
        }

        for index in bound {
            let var = names.var(&index.name);
            let drivers: Vec<(usize, &IndexedTensor, &PatternRef)> = term
                .tensors()
                .filter(|(k, _)| !positions.contains_key(k))
                .filter_map(|(k, operand)| {
                    let pattern = self.pattern_of(&operand.tensor)?;
                    let drives = operand.indices.len() == 2
                        && operand.indices[1].name == index.name
                        && operand.indices[0].name != index.name
                        && bindings.contains_key(&operand.indices[0].name);
                    drives.then_some((k, operand, pattern))
                })
                .collect();

            match drivers.as_slice() {
                [] => headers.push(LoopHeader::Range {
                    var: var.clone(),
                    extent: index.domain.clone(),
                }),
                [(k, operand, pattern)] => {
                    let position = names.var(&format!("{}.pos", operand.tensor));
                    headers.push(LoopHeader::Row {
                        pattern: (*pattern).clone(),
                        row: binding(&bindings, &operand.indices[0].name)?,
                        col: var.clone(),
                        position: position.clone(),
                    });
                    positions.insert(*k, position);
                }
                [(kl, left, left_pattern), (kr, right, right_pattern), ..] => {
                    let left_position = names.var(&format!("{}.pos", left.tensor));
                    let right_position = names.var(&format!("{}.pos", right.tensor));
                    headers.push(LoopHeader::Intersect {
                        left: (*left_pattern).clone(),
                        right: (*right_pattern).clone(),
                        left_row: binding(&bindings, &left.indices[0].name)?,
                        right_row: binding(&bindings, &right.indices[0].name)?,
                        col: var.clone(),
                        left_position: left_position.clone(),
                        right_position: right_position.clone(),
                    });
                    positions.insert(*kl, left_position);
                    positions.insert(*kr, right_position);
                }
            }
            bindings.insert(index.name.clone(), Expr::Var(var));
        }

        let mut value: Option<Expr> = None;
        for (k, factor) in term.factors.iter().enumerate() {
            let factor = match factor {
                Factor::Tensor(operand) => Expr::TensorRead(TensorAccess {
                    tensor: operand.tensor.clone(),
                    indices: operand
                        .indices
                        .iter()
                        .map(|i| binding(&bindings, &i.name))
                        .collect::<Result<_>>()?,
                    position: positions.get(&k).cloned(),
                }),
                Factor::Scalar(expr) => expr.clone(),
            };
            value = Some(match value {
                None => factor,
                Some(acc) => Expr::binary(BinaryOp::Mul, acc, factor),
            });
        }
        let value = value.ok_or_else(|| self.malformed("empty product term".to_string()))?;
        let value = if term.negated {
            Expr::Neg(Box::new(value))
        } else {
            value
        };

        let write = Stmt::TensorWrite {
            access: TensorAccess {
                tensor: self.dst.clone(),
                indices: self
                    .free
                    .iter()
                    .map(|i| binding(&bindings, &i.name))
                    .collect::<Result<_>>()?,
                position: dst_position,
            },
            value,
            accumulate: true,
        };

        let mut stmt = write;
        for header in headers.into_iter().rev() {
            stmt = header.wrap(vec![stmt]);
        }
        Ok(stmt)
    }
}

fn binding(bindings: &IndexMap<String, Expr>, name: &str) -> Result<Expr> {
    bindings
        .get(name)
        .cloned()
        .ok_or_else(|| LowerError::UnsupportedConstruct(format!("unbound index '{name}'")))
}
