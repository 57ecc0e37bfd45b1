//! Storage descriptor table.
//!
//! Every tensor variable of a function gets exactly one [`TensorStorage`]
//! describing its physical layout. The table is computed once, before
//! lowering, and is read-only afterwards.
//!
//! # Inference rules
//!
//! - rank 0: [`StorageKind::SystemNone`], a single register
//! - rank 1: [`StorageKind::Dense`]
//! - rank 2: [`StorageKind::Sparse`] when the tensor's indices range over a
//!   graph relation, otherwise [`StorageKind::Dense`]
//!
//! Rank-2 evidence comes from two places:
//!
//! - **Assemblies**: a kernel write `A(r, c) += ...` over set `S` induces the
//!   pattern that `(r, c)` ranges over: endpoint/endpoint gives the square
//!   relation pattern, element/endpoint the incidence pattern, and
//!   element/element the diagonal of `S`.
//! - **Index expressions**: `A(i,j) = ...` is sparse when every product term
//!   has a sparse operand indexed exactly by `(i,j)`; the operand's pattern
//!   masks the term. This propagation iterates to a fixpoint, so statement
//!   order does not matter.
//!
//! A square relation pattern contains the diagonal of its set, so diagonal
//! evidence merges into relation evidence. Any other disagreement is a
//! [`LowerError::ConflictingTopology`].

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

use weft_foundation::{BlockShape, VarId};

use crate::lower::assemblies::{index_role, induced_pattern};
use crate::lower::terms::expand_terms;
use crate::lower::{LowerError, Result};
use crate::{Expr, Func, IndexDomain, PatternRef, Stmt, TensorType, TopologyRef};

/// Physical layout of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    /// Contiguous row-major blocks over the full index range.
    Dense,
    /// Compressed-row blocks over a topology-induced pattern.
    Sparse(PatternRef),
    /// No system storage; the tensor lives in a register.
    SystemNone,
}

/// Storage descriptor of one tensor variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorStorage {
    pub kind: StorageKind,
    /// Block stored per index tuple
    pub block: BlockShape,
}

impl TensorStorage {
    pub fn dense(block: BlockShape) -> Self {
        Self {
            kind: StorageKind::Dense,
            block,
        }
    }

    pub fn sparse(pattern: PatternRef, block: BlockShape) -> Self {
        Self {
            kind: StorageKind::Sparse(pattern),
            block,
        }
    }

    pub fn system_none(block: BlockShape) -> Self {
        Self {
            kind: StorageKind::SystemNone,
            block,
        }
    }

    /// Sparsity pattern of a sparse tensor.
    pub fn pattern(&self) -> Option<&PatternRef> {
        match &self.kind {
            StorageKind::Sparse(p) => Some(p),
            StorageKind::Dense | StorageKind::SystemNone => None,
        }
    }
}

impl fmt::Display for TensorStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StorageKind::Dense => write!(f, "dense({})", self.block),
            StorageKind::Sparse(p) => write!(f, "sparse({}, {})", p, self.block),
            StorageKind::SystemNone => write!(f, "register({})", self.block),
        }
    }
}

/// Storage descriptors by variable, in declaration order.
pub type TensorStorages = IndexMap<VarId, TensorStorage>;

/// Infer the storage of every tensor variable of a function.
pub fn infer_storage(func: &Func) -> Result<TensorStorages> {
    infer_storage_with(func, TensorStorages::new())
}

/// Infer storage, with explicit descriptors for some variables.
///
/// Seeded descriptors are taken as given (after a consistency check) and
/// are never widened by evidence from the function body.
pub fn infer_storage_with(func: &Func, seed: TensorStorages) -> Result<TensorStorages> {
    let tensors: IndexMap<VarId, &TensorType> = func
        .variables()
        .filter_map(|v| v.ty.as_tensor().map(|t| (v.id.clone(), t)))
        .collect();

    for (var, storage) in &seed {
        let tensor = tensors
            .get(var)
            .ok_or_else(|| LowerError::UnknownVariable(var.clone()))?;
        if storage.block != tensor.block {
            return Err(LowerError::ShapeMismatch {
                context: format!("storage of '{var}'"),
                expected: tensor.block.to_string(),
                found: storage.block.to_string(),
            });
        }
        if let StorageKind::Sparse(pattern) = &storage.kind {
            check_induces(func, var, pattern, tensor)?;
        }
    }

    let mut inference = Inference {
        func,
        tensors: &tensors,
        seed: &seed,
        fixed: IndexSet::new(),
        patterns: IndexMap::new(),
    };
    inference.collect_assembly_evidence()?;
    inference.propagate_index_expressions()?;

    let mut storages = TensorStorages::new();
    for (var, tensor) in &tensors {
        let storage = if let Some(seeded) = seed.get(var) {
            seeded.clone()
        } else {
            match tensor.rank() {
                0 => TensorStorage::system_none(tensor.block),
                1 => TensorStorage::dense(tensor.block),
                _ => match inference.patterns.get(var) {
                    Some(pattern) => TensorStorage::sparse(pattern.clone(), tensor.block),
                    None => TensorStorage::dense(tensor.block),
                },
            }
        };
        debug!(var = %var, storage = %storage, "storage inferred");
        storages.insert(var.clone(), storage);
    }
    Ok(storages)
}

struct Inference<'a> {
    func: &'a Func,
    tensors: &'a IndexMap<VarId, &'a TensorType>,
    seed: &'a TensorStorages,
    /// Variables whose pattern comes from assemblies; index expressions do
    /// not widen them
    fixed: IndexSet<VarId>,
    patterns: IndexMap<VarId, PatternRef>,
}

impl Inference<'_> {
    fn pattern_of(&self, var: &VarId) -> Option<&PatternRef> {
        match self.seed.get(var) {
            Some(storage) => storage.pattern(),
            None => self.patterns.get(var),
        }
    }

    fn collect_assembly_evidence(&mut self) -> Result<()> {
        let (func, tensors) = (self.func, self.tensors);
        for stmt in &func.body {
            let Stmt::Assemble(assembly) = stmt else {
                continue;
            };
            let decl = func
                .set(&assembly.set)
                .ok_or_else(|| LowerError::UnknownSet(assembly.set.clone()))?;

            let mut writes = Vec::new();
            for kernel_stmt in &assembly.kernel.body {
                kernel_stmt.walk(&mut |s| {
                    if let Stmt::TensorWrite { access, .. } = s {
                        writes.push(access.clone());
                    }
                });
            }

            for access in writes {
                if self.seed.contains_key(&access.tensor) || access.indices.len() != 2 {
                    continue;
                }
                let Some(tensor) = tensors.get(&access.tensor) else {
                    continue;
                };
                let roles = (
                    index_role(&access.indices[0], &assembly.kernel),
                    index_role(&access.indices[1], &assembly.kernel),
                );
                let (Some(row), Some(col)) = roles else {
                    continue;
                };
                let Some(pattern) = induced_pattern(decl, row, col) else {
                    continue;
                };
                check_induces(func, &access.tensor, &pattern, tensor)?;
                trace!(var = %access.tensor, pattern = %pattern, "assembly evidence");
                self.merge(&access.tensor, pattern)?;
                self.fixed.insert(access.tensor.clone());
            }
        }
        Ok(())
    }

    fn propagate_index_expressions(&mut self) -> Result<()> {
        let (func, tensors) = (self.func, self.tensors);
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            for stmt in &func.body {
                let Stmt::Assign {
                    var,
                    value: Expr::Index(ie),
                } = stmt
                else {
                    continue;
                };
                if self.seed.contains_key(var) || self.fixed.contains(var) || ie.free.len() != 2 {
                    continue;
                }
                let Some(tensor) = tensors.get(var) else {
                    continue;
                };
                // Malformed bodies are reported by index-expression lowering
                let Ok(terms) = expand_terms(&ie.body) else {
                    continue;
                };

                let mut mask: Option<PatternRef> = None;
                let mut masked = true;
                for term in &terms {
                    let term_masks: Vec<PatternRef> = term
                        .tensors()
                        .filter(|(_, t)| {
                            t.indices.len() == 2
                                && t.indices[0].name == ie.free[0].name
                                && t.indices[1].name == ie.free[1].name
                        })
                        .filter_map(|(_, t)| self.pattern_of(&t.tensor).cloned())
                        .collect();
                    let Some(term_mask) = term_masks
                        .iter()
                        .find(|p| matches!(p.topology, TopologyRef::Diagonal(_)))
                        .or_else(|| term_masks.first())
                    else {
                        masked = false;
                        break;
                    };
                    mask = Some(match mask {
                        None => term_mask.clone(),
                        Some(current) => merge_patterns(var, &current, term_mask)?,
                    });
                }

                if let (true, Some(mask)) = (masked, mask) {
                    if self.patterns.get(var) != Some(&mask) {
                        check_induces(func, var, &mask, tensor)?;
                        trace!(var = %var, pattern = %mask, "index expression evidence");
                        self.merge(var, mask)?;
                        changed = true;
                    }
                }
            }
            if !changed {
                debug!(rounds, "storage propagation reached fixpoint");
                return Ok(());
            }
        }
    }

    fn merge(&mut self, var: &VarId, pattern: PatternRef) -> Result<()> {
        let merged = match self.patterns.get(var) {
            None => pattern,
            Some(current) => merge_patterns(var, current, &pattern)?,
        };
        self.patterns.insert(var.clone(), merged);
        Ok(())
    }
}

/// Combine two pieces of pattern evidence for one variable.
fn merge_patterns(var: &VarId, a: &PatternRef, b: &PatternRef) -> Result<PatternRef> {
    if a.is_subset_of(b) {
        Ok(b.clone())
    } else if b.is_subset_of(a) {
        Ok(a.clone())
    } else {
        Err(LowerError::ConflictingTopology {
            var: var.clone(),
            first: a.to_string(),
            second: b.to_string(),
        })
    }
}

/// Check that a pattern can index the rows and columns of a tensor.
fn check_induces(func: &Func, var: &VarId, pattern: &PatternRef, tensor: &TensorType) -> Result<()> {
    let incompatible = || LowerError::IncompatibleTopology {
        var: var.clone(),
        topology: pattern.to_string(),
        ty: crate::Type::Tensor(tensor.clone()).to_string(),
    };

    let dims_match = tensor.dims
        == [
            IndexDomain::Set(pattern.rows.clone()),
            IndexDomain::Set(pattern.cols.clone()),
        ];
    if !dims_match {
        return Err(incompatible());
    }

    match &pattern.topology {
        TopologyRef::Diagonal(set) => {
            if &pattern.rows != set || &pattern.cols != set {
                return Err(incompatible());
            }
        }
        TopologyRef::Relation(relation) => {
            let decl = func
                .set(relation)
                .ok_or_else(|| LowerError::UnknownSet(relation.clone()))?;
            let endpoint_set = &decl.endpoints.as_ref().ok_or_else(incompatible)?.set;
            let valid = (&pattern.rows == endpoint_set && &pattern.cols == endpoint_set)
                || (&pattern.rows == relation && &pattern.cols == endpoint_set)
                || (&pattern.rows == endpoint_set && &pattern.cols == relation);
            if !valid {
                return Err(incompatible());
            }
        }
    }
    Ok(())
}
