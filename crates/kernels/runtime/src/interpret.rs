//! Reference interpreter for lowered functions.
//!
//! Executes the loop and memory nodes produced by [`weft_ir::lower`]
//! directly against [`Bindings`]. It stands in for a code generator: every
//! lowered construct has one straightforward meaning here, which makes the
//! output of the lowering passes observable in tests.
//!
//! # Execution
//!
//! 1. Check the bindings against the function's declarations
//! 2. Build the topologies and resolve every referenced pattern
//! 3. Allocate one buffer per tensor variable, laid out as its storage
//!    descriptor says (dense, block-CSR, or a register)
//! 4. Run the body
//! 5. Commit staged field writes and return the result variables
//!
//! Field writes are staged and only reach the bindings when the whole body
//! succeeded; a failed solve leaves every field untouched. Reads of a field
//! during the invocation see the values bound at entry.

use std::ops::Range;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, trace};

use weft_foundation::{BlockShape, FieldId, MergeIntersection, SetId, SparsityPattern, VarId};
use weft_ir::{
    BinaryOp, DirectSolve, Expr, FieldType, Func, IndexDomain, Literal, LoweredFunc, SchurSolve,
    SolveStmt, StorageKind, Stmt, TensorStorages, Type,
};
use weft_solver::convert::{from_dense_vector, to_dense_vector};
use weft_solver::{solve_direct, solve_schur, Boundary, CsrMatrix, SchurSystem, SolverConfig};

use crate::bindings::{Bindings, FieldData};
use crate::error::{Error, Result};
use crate::topology::ExecutionTopology;
use crate::value::{BlockValue, Value};

// ============================================================================
// Buffers and results
// ============================================================================

/// Contents of one tensor variable.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    /// Row-major blocks over the full index range.
    Dense { block: BlockShape, values: Vec<f64> },
    /// Block-CSR over a resolved pattern.
    Sparse(CsrMatrix),
    /// A single block.
    Register(BlockValue),
}

impl TensorValue {
    /// Stored floats, in storage order.
    pub fn values(&self) -> &[f64] {
        match self {
            TensorValue::Dense { values, .. } => values,
            TensorValue::Sparse(matrix) => matrix.values(),
            TensorValue::Register(block) => block.data(),
        }
    }

    pub fn block(&self) -> BlockShape {
        match self {
            TensorValue::Dense { block, .. } => *block,
            TensorValue::Sparse(matrix) => matrix.block(),
            TensorValue::Register(block) => block.shape(),
        }
    }

    pub fn as_csr(&self) -> Option<&CsrMatrix> {
        match self {
            TensorValue::Sparse(matrix) => Some(matrix),
            _ => None,
        }
    }

    fn values_mut(&mut self) -> &mut [f64] {
        match self {
            TensorValue::Dense { values, .. } => values,
            TensorValue::Sparse(matrix) => matrix.values_mut(),
            TensorValue::Register(block) => block.data_mut(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TensorValue::Dense { .. } => "dense tensor",
            TensorValue::Sparse(_) => "sparse tensor",
            TensorValue::Register(_) => "register",
        }
    }
}

/// Final values of a function's result variables.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    values: IndexMap<VarId, TensorValue>,
}

impl ExecutionResult {
    pub fn get(&self, var: &str) -> Option<&TensorValue> {
        self.values.get(var)
    }

    /// Stored floats of a result.
    pub fn values(&self, var: &str) -> Option<&[f64]> {
        self.get(var).map(TensorValue::values)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VarId, &TensorValue)> {
        self.values.iter()
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Execute a lowered function.
///
/// On success the function's field writes are applied to `bindings`; on
/// failure `bindings` is unchanged.
pub fn execute(
    lowered: &LoweredFunc,
    bindings: &mut Bindings,
    config: &SolverConfig,
) -> Result<ExecutionResult> {
    let func = &lowered.func;
    info!(func = %func.id, "executing");
    bindings.check(func)?;

    let mut topology = ExecutionTopology::build(func, bindings)?;
    topology.prepare(func, &lowered.storages)?;

    let (result, staged) = {
        let mut interpreter =
            Interpreter::new(func, &lowered.storages, bindings, topology, config)?;
        interpreter.exec_block(&func.body)?;
        (interpreter.results()?, interpreter.staged)
    };

    for (set, field, data) in staged {
        debug!(%set, %field, "field committed");
        bindings.store_field(&set, field, data)?;
    }
    info!(func = %func.id, results = result.values.len(), "execution complete");
    Ok(result)
}

struct Interpreter<'a> {
    func: &'a Func,
    bindings: &'a Bindings,
    topology: ExecutionTopology,
    config: &'a SolverConfig,
    buffers: IndexMap<VarId, TensorValue>,
    locals: IndexMap<VarId, Value>,
    staged: Vec<(SetId, FieldId, FieldData)>,
}

impl<'a> Interpreter<'a> {
    fn new(
        func: &'a Func,
        storages: &'a TensorStorages,
        bindings: &'a Bindings,
        topology: ExecutionTopology,
        config: &'a SolverConfig,
    ) -> Result<Self> {
        let mut interpreter = Self {
            func,
            bindings,
            topology,
            config,
            buffers: IndexMap::new(),
            locals: IndexMap::new(),
            staged: Vec::new(),
        };

        for param in &func.params {
            if param.ty.as_tensor().is_some() {
                return Err(Error::TypeMismatch {
                    context: format!("parameter '{}'", param.id),
                    expected: "block, int or bool".to_string(),
                    found: param.ty.to_string(),
                });
            }
            let value = bindings
                .param(&param.id)
                .cloned()
                .ok_or_else(|| Error::UnboundVariable(param.id.clone()))?;
            interpreter.locals.insert(param.id.clone(), value);
        }

        for var in func.locals.iter().chain(&func.results) {
            let Type::Tensor(tensor) = &var.ty else {
                continue;
            };
            let storage = storages.get(&var.id).ok_or_else(|| {
                Error::UnloweredConstruct(format!("tensor '{}' has no storage", var.id))
            })?;
            let buffer = match &storage.kind {
                StorageKind::Dense => {
                    let mut len = storage.block.len();
                    for dim in &tensor.dims {
                        len *= interpreter.extent(dim)?;
                    }
                    TensorValue::Dense {
                        block: storage.block,
                        values: vec![0.0; len],
                    }
                }
                StorageKind::Sparse(pattern) => TensorValue::Sparse(CsrMatrix::zeros(
                    interpreter.topology.pattern(pattern)?,
                    storage.block,
                )),
                StorageKind::SystemNone => TensorValue::Register(BlockValue::zeros(storage.block)),
            };
            trace!(var = %var.id, kind = buffer.kind(), len = buffer.values().len(), "buffer allocated");
            interpreter.buffers.insert(var.id.clone(), buffer);
        }
        Ok(interpreter)
    }

    fn extent(&self, domain: &IndexDomain) -> Result<usize> {
        match domain {
            IndexDomain::Set(set) => self.topology.set_len(set),
            IndexDomain::Dense(n) => Ok(*n),
        }
    }

    fn buffer(&self, var: &VarId) -> Result<&TensorValue> {
        self.buffers
            .get(var)
            .ok_or_else(|| Error::UnboundVariable(var.clone()))
    }

    fn buffer_mut(&mut self, var: &VarId) -> Result<&mut TensorValue> {
        self.buffers
            .get_mut(var)
            .ok_or_else(|| Error::UnboundVariable(var.clone()))
    }

    fn results(&self) -> Result<ExecutionResult> {
        let mut values = IndexMap::new();
        for var in &self.func.results {
            let value = match (self.buffers.get(&var.id), self.locals.get(&var.id)) {
                (Some(buffer), _) => buffer.clone(),
                (None, Some(Value::Block(block))) => TensorValue::Register(block.clone()),
                (None, Some(other)) => {
                    return Err(Error::TypeMismatch {
                        context: format!("result '{}'", var.id),
                        expected: "tensor or float block".to_string(),
                        found: other.to_string(),
                    })
                }
                (None, None) => return Err(Error::UnboundVariable(var.id.clone())),
            };
            values.insert(var.id.clone(), value);
        }
        Ok(ExecutionResult { values })
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn bind_index(&mut self, var: &VarId, index: usize) {
        self.locals.insert(var.clone(), Value::Int(index as i64));
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign { var, value } => self.assign(var, value, false),
            Stmt::Accumulate { var, value } => self.assign(var, value, true),

            Stmt::ForElements { set, element, body } => {
                for e in 0..self.topology.set_len(set)? {
                    self.bind_index(element, e);
                    self.exec_block(body)?;
                }
                Ok(())
            }
            Stmt::ForRange { var, extent, body } => {
                for i in 0..self.extent(extent)? {
                    self.bind_index(var, i);
                    self.exec_block(body)?;
                }
                Ok(())
            }
            Stmt::ForPattern {
                pattern,
                row,
                col,
                position,
                body,
            } => {
                let pattern = self.topology.pattern(pattern)?;
                for (i, j, k) in pattern.iter() {
                    self.bind_index(row, i);
                    self.bind_index(col, j);
                    self.bind_index(position, k);
                    self.exec_block(body)?;
                }
                Ok(())
            }
            Stmt::ForRow {
                pattern: pattern_ref,
                row,
                col,
                position,
                body,
            } => {
                let pattern = self.topology.pattern(pattern_ref)?;
                let row = self.pattern_row(&pattern, row, &pattern_ref.to_string())?;
                let cols = pattern.row(row).to_vec();
                for (k, j) in pattern.row_range(row).zip(cols) {
                    self.bind_index(col, j);
                    self.bind_index(position, k);
                    self.exec_block(body)?;
                }
                Ok(())
            }
            Stmt::ForIntersect {
                left: left_ref,
                right: right_ref,
                left_row,
                right_row,
                col,
                left_position,
                right_position,
                body,
            } => {
                let left = self.topology.pattern(left_ref)?;
                let right = self.topology.pattern(right_ref)?;
                let lr = self.pattern_row(&left, left_row, &left_ref.to_string())?;
                let rr = self.pattern_row(&right, right_row, &right_ref.to_string())?;
                let (left_start, right_start) = (left.row_range(lr).start, right.row_range(rr).start);
                let hits: Vec<_> = MergeIntersection::new(left.row(lr), right.row(rr)).collect();
                for (j, li, ri) in hits {
                    self.bind_index(col, j);
                    self.bind_index(left_position, left_start + li);
                    self.bind_index(right_position, right_start + ri);
                    self.exec_block(body)?;
                }
                Ok(())
            }

            Stmt::Zero(var) => {
                let buffer = self.buffer_mut(var)?;
                buffer.values_mut().iter_mut().for_each(|v| *v = 0.0);
                trace!(%var, "zeroed");
                Ok(())
            }
            Stmt::Store {
                buffer,
                offset,
                value,
                accumulate,
            } => {
                let offset = self.eval(offset)?.as_int("dense store offset")?;
                let value = self.eval(value)?.into_block("dense store")?;
                let target = self.buffer_mut(buffer)?;
                let kind = target.kind();
                let TensorValue::Dense { block, values } = target else {
                    return Err(Error::TypeMismatch {
                        context: format!("store to '{buffer}'"),
                        expected: "dense tensor".to_string(),
                        found: kind.to_string(),
                    });
                };
                check_block(buffer, *block, &value)?;
                let slot = block_slot(values, offset, block.len(), buffer)?;
                write_block(slot, value.data(), *accumulate);
                Ok(())
            }
            Stmt::SparseStore {
                buffer,
                position,
                value,
                accumulate,
                block,
            } => {
                let position = match self.eval(position)? {
                    Value::Miss => {
                        return Err(Error::SparseWriteMiss {
                            buffer: buffer.clone(),
                        })
                    }
                    other => other.as_int("sparse store position")?,
                };
                let value = self.eval(value)?.into_block("sparse store")?;
                check_block(buffer, *block, &value)?;
                let target = self.buffer_mut(buffer)?;
                let kind = target.kind();
                let TensorValue::Sparse(matrix) = target else {
                    return Err(Error::TypeMismatch {
                        context: format!("sparse store to '{buffer}'"),
                        expected: "sparse tensor".to_string(),
                        found: kind.to_string(),
                    });
                };
                let offset = position_offset(position, *block);
                let slot = block_slot(matrix.values_mut(), offset, block.len(), buffer)?;
                write_block(slot, value.data(), *accumulate);
                Ok(())
            }
            Stmt::FieldWrite { set, field, value } => self.stage_field(set, field, value),
            Stmt::Solve(SolveStmt::Direct(solve)) => self.solve_direct(solve),
            Stmt::Solve(SolveStmt::Schur(solve)) => self.solve_schur(solve),

            Stmt::TensorWrite { access, .. } => Err(Error::UnloweredConstruct(format!(
                "tensor write to '{}'",
                access.tensor
            ))),
            Stmt::Assemble(assembly) => Err(Error::UnloweredConstruct(format!(
                "assembly over '{}'",
                assembly.set
            ))),
        }
    }

    fn pattern_row(&self, pattern: &SparsityPattern, row: &Expr, name: &str) -> Result<usize> {
        self.eval(row)?
            .as_index(&format!("row of {name}"), pattern.rows())
    }

    fn assign(&mut self, var: &VarId, value: &Expr, accumulate: bool) -> Result<()> {
        if self.buffers.contains_key(var) {
            return self.assign_buffer(var, value, accumulate);
        }
        let value = self.eval(value)?;
        let value = match (accumulate, self.locals.get(var)) {
            (true, Some(current)) => current.add(&value)?,
            (true, None) => return Err(Error::UnboundVariable(var.clone())),
            (false, _) => value,
        };
        self.locals.insert(var.clone(), value);
        Ok(())
    }

    fn assign_buffer(&mut self, var: &VarId, value: &Expr, accumulate: bool) -> Result<()> {
        let source: Vec<f64> = match value {
            Expr::Field { set, field } => match self.bindings.field(set, field)? {
                FieldData::Float { values, .. } => values.clone(),
                FieldData::Bool(_) => {
                    return Err(Error::TypeMismatch {
                        context: format!("field '{set}.{field}' assigned to '{var}'"),
                        expected: "float field".to_string(),
                        found: "bool".to_string(),
                    })
                }
            },
            Expr::Var(other) if self.buffers.contains_key(other) => {
                self.buffer(other)?.values().to_vec()
            }
            _ => self.eval(value)?.into_block(&format!("assignment to '{var}'"))?.into_data(),
        };
        let target = self.buffer_mut(var)?;
        let values = target.values_mut();
        if values.len() != source.len() {
            return Err(Error::BindingMismatch {
                what: format!("assignment to '{var}'"),
                expected: values.len(),
                found: source.len(),
            });
        }
        write_block(values, &source, accumulate);
        Ok(())
    }

    fn stage_field(&mut self, set: &SetId, field: &FieldId, value: &VarId) -> Result<()> {
        if let Some(FieldType::Bool) = self.func.set(set).and_then(|d| d.fields.get(field)) {
            return Err(Error::TypeMismatch {
                context: format!("field write to '{set}.{field}'"),
                expected: "float field".to_string(),
                found: "bool".to_string(),
            });
        }
        let n = self.topology.set_len(set)?;
        let TensorValue::Dense { block, values } = self.buffer(value)? else {
            return Err(Error::TypeMismatch {
                context: format!("field write from '{value}'"),
                expected: "dense tensor".to_string(),
                found: self.buffer(value)?.kind().to_string(),
            });
        };
        if values.len() != n * block.len() {
            return Err(Error::BindingMismatch {
                what: format!("field write to '{set}.{field}'"),
                expected: n,
                found: values.len() / block.len().max(1),
            });
        }
        let data = FieldData::Float {
            block: *block,
            values: values.clone(),
        };
        debug!(%set, %field, from = %value, "field write staged");
        self.staged.push((set.clone(), field.clone(), data));
        Ok(())
    }

    // ========================================================================
    // Solves
    // ========================================================================

    /// A system matrix as block-CSR; dense matrices get a full pattern.
    fn system_matrix(&self, var: &VarId) -> Result<CsrMatrix> {
        match self.buffer(var)? {
            TensorValue::Sparse(matrix) => Ok(matrix.clone()),
            TensorValue::Dense { block, values } => {
                let dims = self
                    .func
                    .tensor_type(var)
                    .map(|t| t.dims.as_slice())
                    .unwrap_or_default();
                let [rows, cols] = dims else {
                    return Err(Error::TypeMismatch {
                        context: format!("system matrix '{var}'"),
                        expected: "rank-2 tensor".to_string(),
                        found: format!("rank {}", dims.len()),
                    });
                };
                let (rows, cols) = (self.extent(rows)?, self.extent(cols)?);
                let coordinates = (0..rows).flat_map(|i| (0..cols).map(move |j| (i, j))).collect();
                let pattern = SparsityPattern::from_coordinates(rows, cols, coordinates);
                Ok(CsrMatrix::new(Arc::new(pattern), values.clone(), *block)?)
            }
            other => Err(Error::TypeMismatch {
                context: format!("system matrix '{var}'"),
                expected: "sparse or dense tensor".to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    fn vector_values(&self, var: &VarId) -> Result<&[f64]> {
        match self.buffer(var)? {
            TensorValue::Dense { values, .. } => Ok(values),
            other => Err(Error::TypeMismatch {
                context: format!("solve vector '{var}'"),
                expected: "dense tensor".to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    fn write_solution(&mut self, var: &VarId, solution: Vec<f64>) -> Result<()> {
        let target = self.buffer_mut(var)?;
        let kind = target.kind();
        let TensorValue::Dense { values, .. } = target else {
            return Err(Error::TypeMismatch {
                context: format!("solve result '{var}'"),
                expected: "dense tensor".to_string(),
                found: kind.to_string(),
            });
        };
        if values.len() != solution.len() {
            return Err(Error::BindingMismatch {
                what: format!("solve result '{var}'"),
                expected: values.len(),
                found: solution.len(),
            });
        }
        *values = solution;
        Ok(())
    }

    fn solve_direct(&mut self, solve: &DirectSolve) -> Result<()> {
        let matrix = self.system_matrix(&solve.matrix)?;
        let rhs = self.vector_values(&solve.rhs)?.to_vec();

        let mut boundary = None;
        if let Some(bc) = &solve.boundary {
            match self.bindings.set(&bc.set)?.field(&bc.marker) {
                Some(FieldData::Bool(flags)) => {
                    let values = self.vector_values(&bc.values)?.to_vec();
                    boundary = Some((flags.clone(), values));
                }
                Some(_) => {
                    return Err(Error::TypeMismatch {
                        context: format!("boundary marker '{}.{}'", bc.set, bc.marker),
                        expected: "bool".to_string(),
                        found: "float".to_string(),
                    })
                }
                None => debug!(set = %bc.set, marker = %bc.marker, "marker not bound; no elimination"),
            }
        }

        debug!(
            matrix = %solve.matrix,
            rows = matrix.scalar_rows(),
            nnz = matrix.pattern().nnz(),
            fixed = boundary.as_ref().map_or(0, |(flags, _)| flags.iter().filter(|f| **f).count()),
            "direct solve"
        );
        let solution = solve_direct(
            &matrix,
            &rhs,
            boundary.as_ref().map(|(marker, values)| Boundary { marker, values }),
            self.config,
        )?;
        self.write_solution(&solve.result, solution)
    }

    fn solve_schur(&mut self, solve: &SchurSolve) -> Result<()> {
        let primary = self.system_matrix(&solve.primary)?.to_dense();
        let coupling = self.system_matrix(&solve.coupling)?.to_dense();
        let derived = match &solve.derived {
            Some(var) => Some(self.system_matrix(var)?.to_dense()),
            None => None,
        };
        let rhs_primary = to_dense_vector(self.vector_values(&solve.rhs_primary)?);
        let rhs_derived = to_dense_vector(self.vector_values(&solve.rhs_derived)?);

        debug!(
            primary = %solve.primary,
            coupling = %solve.coupling,
            derived = solve.derived.is_some(),
            "schur solve"
        );
        let solution = solve_schur(
            SchurSystem {
                primary: &primary,
                coupling: &coupling,
                derived: derived.as_ref(),
                rhs_primary: &rhs_primary,
                rhs_derived: &rhs_derived,
            },
            self.config,
        )?;
        self.write_solution(&solve.result_primary, from_dense_vector(&solution.primary))?;
        self.write_solution(&solve.result_derived, from_dense_vector(&solution.derived))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(Literal::Float(v)) => Ok(Value::scalar(*v)),
            Expr::Literal(Literal::Int(i)) => Ok(Value::Int(*i)),
            Expr::Literal(Literal::Bool(b)) => Ok(Value::Bool(*b)),
            Expr::Literal(Literal::Block(shape, data)) => {
                Ok(Value::Block(BlockValue::new(*shape, data.clone())?))
            }
            Expr::Var(var) => match (self.locals.get(var), self.buffers.get(var)) {
                (Some(value), _) => Ok(value.clone()),
                (None, Some(TensorValue::Register(block))) => Ok(Value::Block(block.clone())),
                (None, Some(other)) => Err(Error::TypeMismatch {
                    context: format!("read of '{var}'"),
                    expected: "local or register".to_string(),
                    found: other.kind().to_string(),
                }),
                (None, None) => Err(Error::UnboundVariable(var.clone())),
            },

            Expr::EndpointOf { set, element, slot } => {
                let topology = self.topology.topology(set)?;
                let e = self
                    .eval(element)?
                    .as_index(&format!("element of '{set}'"), topology.len())?;
                topology
                    .endpoint(e, *slot)
                    .map(|v| Value::Int(v as i64))
                    .ok_or_else(|| Error::IndexOutOfBounds {
                        what: format!("endpoint slot of '{set}'"),
                        index: *slot as i64,
                        len: topology.arity(),
                    })
            }
            Expr::FieldLoad {
                set,
                field,
                element,
            } => {
                let n = self.topology.set_len(set)?;
                let e = self
                    .eval(element)?
                    .as_index(&format!("element of '{set}'"), n)?;
                match self.bindings.field(set, field)? {
                    FieldData::Float { block, values } => {
                        let len = block.len();
                        let data = values.get(e * len..(e + 1) * len).ok_or_else(|| {
                            Error::IndexOutOfBounds {
                                what: format!("field '{set}.{field}'"),
                                index: e as i64,
                                len: values.len() / len.max(1),
                            }
                        })?;
                        Ok(Value::Block(BlockValue::new(*block, data.to_vec())?))
                    }
                    FieldData::Bool(flags) => flags.get(e).map(|f| Value::Bool(*f)).ok_or_else(|| {
                        Error::IndexOutOfBounds {
                            what: format!("field '{set}.{field}'"),
                            index: e as i64,
                            len: flags.len(),
                        }
                    }),
                }
            }
            Expr::Field { set, field } => Err(Error::TypeMismatch {
                context: format!("field '{set}.{field}' in an expression"),
                expected: "element value".to_string(),
                found: "whole field".to_string(),
            }),

            Expr::Binary { op, lhs, rhs } => {
                let (lhs, rhs) = (self.eval(lhs)?, self.eval(rhs)?);
                match op {
                    BinaryOp::Add => lhs.add(&rhs),
                    BinaryOp::Sub => lhs.sub(&rhs),
                    BinaryOp::Mul => lhs.mul(&rhs),
                    BinaryOp::Div => lhs.div(&rhs),
                }
            }
            Expr::Neg(inner) => self.eval(inner)?.neg(),

            Expr::SetSize(set) => Ok(Value::Int(self.topology.set_len(set)? as i64)),
            Expr::Locate {
                pattern,
                row,
                col,
                search,
            } => {
                let pattern = self.topology.pattern(pattern)?;
                let row = self.eval(row)?.as_int("locate row")?;
                let col = self.eval(col)?.as_int("locate column")?;
                let hit = match (usize::try_from(row), usize::try_from(col)) {
                    (Ok(row), Ok(col)) => pattern.locate(row, col, *search),
                    _ => None,
                };
                Ok(hit.map_or(Value::Miss, |p| Value::Int(p as i64)))
            }
            Expr::Load {
                buffer,
                offset,
                block,
            } => {
                let offset = self.eval(offset)?.as_int("dense load offset")?;
                let values = self.buffer(buffer)?.values();
                let data = read_slot(values, offset, block.len(), buffer)?;
                Ok(Value::Block(BlockValue::new(*block, data.to_vec())?))
            }
            Expr::SparseLoad {
                buffer,
                position,
                block,
            } => match self.eval(position)? {
                Value::Miss => Ok(Value::Block(BlockValue::zeros(*block))),
                position => {
                    let position = position.as_int("sparse load position")?;
                    let values = self.buffer(buffer)?.values();
                    let offset = position_offset(position, *block);
                    let data = read_slot(values, offset, block.len(), buffer)?;
                    Ok(Value::Block(BlockValue::new(*block, data.to_vec())?))
                }
            },

            Expr::Endpoint { endpoints, .. } => Err(Error::UnloweredConstruct(format!(
                "kernel endpoint of '{endpoints}'"
            ))),
            Expr::ElementField { element, field } => Err(Error::UnloweredConstruct(format!(
                "kernel field '{field}' of '{element}'"
            ))),
            Expr::Index(_) => Err(Error::UnloweredConstruct("index expression".to_string())),
            Expr::Indexed(indexed) => Err(Error::UnloweredConstruct(format!(
                "indexed operand '{}'",
                indexed.tensor
            ))),
            Expr::TensorRead(access) => Err(Error::UnloweredConstruct(format!(
                "tensor read of '{}'",
                access.tensor
            ))),
        }
    }
}

// ============================================================================
// Block slots
// ============================================================================

fn check_block(buffer: &VarId, expected: BlockShape, value: &BlockValue) -> Result<()> {
    if value.shape() != expected {
        return Err(Error::TypeMismatch {
            context: format!("write to '{buffer}'"),
            expected: expected.to_string(),
            found: value.shape().to_string(),
        });
    }
    Ok(())
}

/// Float range of one block starting at float offset `start`.
fn slot_range(len: usize, start: i64, block_len: usize, buffer: &VarId) -> Result<Range<usize>> {
    usize::try_from(start)
        .ok()
        .map(|s| s..s + block_len)
        .filter(|r| r.end <= len)
        .ok_or_else(|| Error::IndexOutOfBounds {
            what: format!("buffer '{buffer}'"),
            index: start,
            len,
        })
}

fn read_slot<'v>(values: &'v [f64], start: i64, block_len: usize, buffer: &VarId) -> Result<&'v [f64]> {
    let range = slot_range(values.len(), start, block_len, buffer)?;
    Ok(&values[range])
}

fn block_slot<'v>(
    values: &'v mut [f64],
    start: i64,
    block_len: usize,
    buffer: &VarId,
) -> Result<&'v mut [f64]> {
    let range = slot_range(values.len(), start, block_len, buffer)?;
    Ok(&mut values[range])
}

/// Float offset of the block at a pattern position.
fn position_offset(position: i64, block: BlockShape) -> i64 {
    position.saturating_mul(block.len() as i64)
}

fn write_block(slot: &mut [f64], data: &[f64], accumulate: bool) {
    for (dst, src) in slot.iter_mut().zip(data) {
        if accumulate {
            *dst += src;
        } else {
            *dst = *src;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_foundation::SearchStrategy;
    use weft_ir::builder::{accumulate, element_field, endpoint, field, int, lit, FuncBuilder};
    use weft_ir::{lower, LowerOptions, PatternRef, SetDecl, TensorStorage, TensorType};
    use weft_solver::SolveError;

    use crate::bindings::SetData;

    fn graph() -> FuncBuilder {
        FuncBuilder::new("test")
            .set(
                SetDecl::new("V")
                    .with_field("u", FieldType::Float(BlockShape::Scalar))
                    .with_field("v", FieldType::Float(BlockShape::Scalar)),
            )
            .set(SetDecl::relation("E", "V", 2).with_field("w", FieldType::Float(BlockShape::Scalar)))
    }

    fn path() -> Bindings {
        Bindings::new()
            .with_set("V", SetData::new(3).with_scalars("u", vec![1.0, 2.0, 3.0]))
            .with_set(
                "E",
                SetData::relation(2, vec![0, 1, 1, 2]).with_scalars("w", vec![2.0, 1.0]),
            )
    }

    fn matrix() -> TensorType {
        TensorType::matrix("V", "V", BlockShape::Scalar)
    }

    fn vector() -> TensorType {
        TensorType::vector("V", BlockShape::Scalar)
    }

    fn sparse_probe(body: Vec<Stmt>) -> LoweredFunc {
        let mut builder = graph()
            .local("A", matrix())
            .result("r", TensorType::scalar(BlockShape::Scalar));
        for stmt in body {
            builder = builder.stmt(stmt);
        }
        let mut storages = TensorStorages::new();
        storages.insert(
            "A".into(),
            TensorStorage::sparse(PatternRef::square("E", "V"), BlockShape::Scalar),
        );
        storages.insert("r".into(), TensorStorage::system_none(BlockShape::Scalar));
        LoweredFunc {
            func: builder.build(),
            storages,
        }
    }

    fn locate(row: i64, col: i64) -> Expr {
        Expr::Locate {
            pattern: PatternRef::square("E", "V"),
            row: Box::new(int(row)),
            col: Box::new(int(col)),
            search: SearchStrategy::Binary,
        }
    }

    fn sparse_load(row: i64, col: i64) -> Expr {
        Expr::SparseLoad {
            buffer: "A".into(),
            position: Box::new(locate(row, col)),
            block: BlockShape::Scalar,
        }
    }

    #[test]
    fn test_assembly_sums_edge_contributions() {
        let func = graph()
            .result("A", matrix())
            .assemble(&["A"], "E", |k| {
                let w = element_field(k, "w");
                vec![
                    accumulate("A", vec![endpoint(k, 0), endpoint(k, 0)], w.clone()),
                    accumulate("A", vec![endpoint(k, 1), endpoint(k, 1)], w.clone()),
                    accumulate("A", vec![endpoint(k, 0), endpoint(k, 1)], -w.clone()),
                    accumulate("A", vec![endpoint(k, 1), endpoint(k, 0)], -w),
                ]
            })
            .build();
        let lowered = lower(&func, &LowerOptions::default()).unwrap();
        let result = execute(&lowered, &mut path(), &SolverConfig::default()).unwrap();

        let a = result.get("A").and_then(TensorValue::as_csr).unwrap().to_dense();
        let expected = [[2.0, -2.0, 0.0], [-2.0, 3.0, -1.0], [0.0, -1.0, 1.0]];
        for (i, row) in expected.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                assert!((a[(i, j)] - v).abs() < 1e-12, "A[{i},{j}] = {}", a[(i, j)]);
            }
        }
    }

    #[test]
    fn test_field_write_committed_after_success() {
        let func = graph()
            .local("x", vector())
            .assign("x", field("V", "u"))
            .field_write("V", "v", "x")
            .build();
        let lowered = lower(&func, &LowerOptions::default()).unwrap();
        let mut bindings = path();
        execute(&lowered, &mut bindings, &SolverConfig::default()).unwrap();

        assert_eq!(
            bindings.field(&"V".into(), &"v".into()).unwrap(),
            &FieldData::scalars(vec![1.0, 2.0, 3.0])
        );
    }

    #[test]
    fn test_failed_solve_discards_field_writes() {
        let func = graph()
            .local("A", matrix())
            .local("b", vector())
            .local("x", vector())
            .assign("b", field("V", "u"))
            .field_write("V", "v", "b")
            .assemble(&["A"], "E", |k| {
                vec![accumulate("A", vec![endpoint(k, 0), endpoint(k, 1)], lit(0.0))]
            })
            .solve(SolveStmt::Direct(DirectSolve {
                matrix: "A".into(),
                rhs: "b".into(),
                result: "x".into(),
                boundary: None,
            }))
            .build();
        let lowered = lower(&func, &LowerOptions::default()).unwrap();
        let mut bindings = path();
        let err = execute(&lowered, &mut bindings, &SolverConfig::default()).unwrap_err();

        assert!(matches!(err, Error::Solve(SolveError::Singular { .. })));
        assert!(matches!(
            bindings.field(&"V".into(), &"v".into()),
            Err(Error::UnboundField { .. })
        ));
    }

    #[test]
    fn test_sparse_write_miss_is_fatal() {
        let lowered = sparse_probe(vec![Stmt::SparseStore {
            buffer: "A".into(),
            position: locate(0, 2),
            value: lit(1.0),
            accumulate: true,
            block: BlockShape::Scalar,
        }]);
        let err = execute(&lowered, &mut path(), &SolverConfig::default()).unwrap_err();
        assert!(matches!(err, Error::SparseWriteMiss { buffer } if buffer == "A"));
    }

    #[test]
    fn test_sparse_read_miss_is_zero() {
        let lowered = sparse_probe(vec![
            Stmt::SparseStore {
                buffer: "A".into(),
                position: locate(0, 1),
                value: lit(5.0),
                accumulate: false,
                block: BlockShape::Scalar,
            },
            Stmt::Assign {
                var: "r".into(),
                value: sparse_load(0, 1) + sparse_load(0, 2),
            },
        ]);
        let result = execute(&lowered, &mut path(), &SolverConfig::default()).unwrap();
        assert_eq!(result.values("r"), Some(&[5.0][..]));
    }

    #[test]
    fn test_dense_offset_out_of_bounds() {
        let lowered = LoweredFunc {
            func: graph()
                .result("x", vector())
                .stmt(Stmt::Store {
                    buffer: "x".into(),
                    offset: int(3),
                    value: lit(1.0),
                    accumulate: false,
                })
                .build(),
            storages: [(VarId::from("x"), TensorStorage::dense(BlockShape::Scalar))]
                .into_iter()
                .collect(),
        };
        let err = execute(&lowered, &mut path(), &SolverConfig::default()).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfBounds { index: 3, len: 3, .. }));
    }

    #[test]
    fn test_unlowered_assembly_rejected() {
        let func = graph()
            .local("A", matrix())
            .assemble(&["A"], "E", |k| {
                vec![accumulate("A", vec![endpoint(k, 0), endpoint(k, 1)], lit(1.0))]
            })
            .build();
        let storages = weft_ir::infer_storage(&func).unwrap();
        let err = execute(
            &LoweredFunc { func, storages },
            &mut path(),
            &SolverConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnloweredConstruct(_)));
    }

    #[test]
    fn test_unbound_relation_rejected() {
        let lowered = lower(&graph().build(), &LowerOptions::default()).unwrap();
        let mut bindings = Bindings::new().with_set("V", SetData::new(3));
        let err = execute(&lowered, &mut bindings, &SolverConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UnboundSet(set) if set == "E"));
    }
}
