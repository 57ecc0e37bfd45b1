//! Per-execution topology storage.
//!
//! Each invocation builds its own [`ExecutionTopology`] from the bindings:
//! one [`Topology`] per relation set in a [`TopologyArena`], and the
//! sparsity patterns the lowered code refers to by [`PatternRef`]. Nothing
//! is retained once the invocation returns.
//!
//! Pattern resolution for `Relation(R)` with endpoints in `V`:
//!
//! | rows | cols | pattern |
//! |------|------|---------|
//! | `V`  | `V`  | square endpoint pattern, diagonal included |
//! | `R`  | `V`  | incidence |
//! | `V`  | `R`  | transposed incidence |
//!
//! `Diagonal(S)` resolves to the identity pattern of `S`.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use weft_foundation::{SetId, SparsityPattern, Topology, TopologyArena};
use weft_ir::{Expr, Func, PatternRef, Stmt, TensorStorages, TopologyRef};

use crate::bindings::Bindings;
use crate::error::{Error, Result};

/// Topologies and resolved patterns of one invocation.
#[derive(Debug, Default)]
pub struct ExecutionTopology {
    arena: TopologyArena,
    set_sizes: IndexMap<SetId, usize>,
    patterns: IndexMap<PatternRef, Arc<SparsityPattern>>,
}

impl ExecutionTopology {
    /// Build topologies for every set the function declares.
    pub fn build(func: &Func, bindings: &Bindings) -> Result<Self> {
        let mut topology = Self::default();
        for decl in func.sets.values() {
            topology
                .set_sizes
                .insert(decl.id.clone(), bindings.set(&decl.id)?.len());
        }
        for decl in func.sets.values() {
            let Some(endpoints) = &decl.endpoints else {
                continue;
            };
            let data = bindings.set(&decl.id)?;
            let tuples = data
                .endpoints()
                .map(|e| e.tuples.clone())
                .unwrap_or_default();
            let count = topology.set_len(&endpoints.set)?;
            let relation = Topology::new(
                decl.id.clone(),
                endpoints.set.clone(),
                count,
                endpoints.arity,
                tuples,
            )?;
            let id = topology.arena.insert(relation)?;
            debug!(relation = %decl.id, %id, elements = data.len(), "topology built");
        }
        Ok(topology)
    }

    /// Resolve every pattern named by the storage table or the lowered body.
    pub fn prepare(&mut self, func: &Func, storages: &TensorStorages) -> Result<()> {
        let mut refs: Vec<PatternRef> = storages
            .values()
            .filter_map(|s| s.pattern().cloned())
            .collect();
        for stmt in &func.body {
            stmt.walk(&mut |s| {
                match s {
                    Stmt::ForPattern { pattern, .. } | Stmt::ForRow { pattern, .. } => {
                        refs.push(pattern.clone())
                    }
                    Stmt::ForIntersect { left, right, .. } => {
                        refs.push(left.clone());
                        refs.push(right.clone());
                    }
                    _ => {}
                }
                for expr in s.exprs() {
                    expr.walk(&mut |e| {
                        if let Expr::Locate { pattern, .. } = e {
                            refs.push(pattern.clone());
                        }
                    });
                }
            });
        }
        for pattern in refs {
            if !self.patterns.contains_key(&pattern) {
                let resolved = Arc::new(self.build_pattern(&pattern)?);
                debug!(%pattern, nnz = resolved.nnz(), "pattern resolved");
                self.patterns.insert(pattern, resolved);
            }
        }
        Ok(())
    }

    pub fn set_len(&self, set: &SetId) -> Result<usize> {
        self.set_sizes
            .get(set)
            .copied()
            .ok_or_else(|| Error::UnboundSet(set.clone()))
    }

    /// Topology of a relation set.
    pub fn topology(&self, relation: &SetId) -> Result<&Topology> {
        self.arena
            .by_relation(relation)
            .ok_or_else(|| Error::UnboundSet(relation.clone()))
    }

    pub fn arena(&self) -> &TopologyArena {
        &self.arena
    }

    /// A resolved pattern, building it on the spot if [`prepare`](Self::prepare)
    /// did not see it.
    pub fn pattern(&self, pattern: &PatternRef) -> Result<Arc<SparsityPattern>> {
        match self.patterns.get(pattern) {
            Some(resolved) => Ok(Arc::clone(resolved)),
            None => Ok(Arc::new(self.build_pattern(pattern)?)),
        }
    }

    fn build_pattern(&self, pattern: &PatternRef) -> Result<SparsityPattern> {
        let unresolvable = |expected: String| Error::TypeMismatch {
            context: format!("pattern {pattern}"),
            expected,
            found: format!("rows '{}', columns '{}'", pattern.rows, pattern.cols),
        };
        match &pattern.topology {
            TopologyRef::Diagonal(set) => {
                if &pattern.rows != set || &pattern.cols != set {
                    return Err(unresolvable(format!("rows and columns on '{set}'")));
                }
                Ok(SparsityPattern::diagonal(self.set_len(set)?))
            }
            TopologyRef::Relation(relation) => {
                let topology = self.topology(relation)?;
                let endpoint_set = topology.endpoint_set();
                if &pattern.rows == endpoint_set && &pattern.cols == endpoint_set {
                    Ok(topology.square_pattern())
                } else if &pattern.rows == relation && &pattern.cols == endpoint_set {
                    Ok(topology.incidence_pattern())
                } else if &pattern.rows == endpoint_set && &pattern.cols == relation {
                    Ok(topology.incidence_pattern().transpose())
                } else {
                    Err(unresolvable(format!(
                        "rows and columns drawn from '{relation}' and '{endpoint_set}'"
                    )))
                }
            }
        }
    }
}
