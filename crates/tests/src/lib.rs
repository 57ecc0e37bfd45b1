//! Integration test harness for weft.
//!
//! This crate provides utilities for end-to-end testing of the full
//! pipeline: Build IR → Lower → Execute → Verify.
//!
//! Fixtures describe a vertex set `V` and an edge relation `E` over it:
//!
//! - `V` fields: `b` (right-hand side), `x0` (values of fixed unknowns),
//!   `fixed` (boundary marker), `x` (solution written back)
//! - `E` field: `a` (per-edge weight)

use weft_foundation::{BlockShape, FieldId, SetId};
use weft_ir::builder::{accumulate, element_field, endpoint, field, lit, FuncBuilder};
use weft_ir::{
    lower, BoundaryCondition, DirectSolve, FieldType, Func, LowerOptions, LoweredFunc, SetDecl,
    SolveStmt, TensorType, BOUNDARY_MARKER_FIELD,
};
use weft_runtime::{execute, Bindings, ExecutionResult, FieldData, SetData};
use weft_solver::SolverConfig;

/// Test harness running one lowered function against its bindings.
pub struct TestHarness {
    lowered: LoweredFunc,
    bindings: Bindings,
    config: SolverConfig,
    result: Option<ExecutionResult>,
}

impl TestHarness {
    /// Lower `func` with default options.
    ///
    /// # Panics
    ///
    /// Panics if lowering fails.
    pub fn new(func: &Func, bindings: Bindings) -> Self {
        let lowered = match lower(func, &LowerOptions::default()) {
            Ok(lowered) => lowered,
            Err(err) => panic!("lowering failed: {err}"),
        };
        Self {
            lowered,
            bindings,
            config: SolverConfig::default(),
            result: None,
        }
    }

    pub fn with_config(mut self, config: SolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn lowered(&self) -> &LoweredFunc {
        &self.lowered
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Execute once.
    ///
    /// # Panics
    ///
    /// Panics if execution fails.
    pub fn run(&mut self) -> &mut Self {
        if let Err(err) = self.try_run() {
            panic!("execution failed: {err}");
        }
        self
    }

    /// Execute once, returning the runtime error instead of panicking.
    pub fn try_run(&mut self) -> weft_runtime::Result<()> {
        let result = execute(&self.lowered, &mut self.bindings, &self.config)?;
        self.result = Some(result);
        Ok(())
    }

    /// Stored floats of a result variable from the last run.
    ///
    /// # Panics
    ///
    /// Panics if nothing ran or the variable is not a result.
    pub fn values(&self, var: &str) -> Vec<f64> {
        self.result
            .as_ref()
            .and_then(|r| r.values(var))
            .unwrap_or_else(|| panic!("no result '{var}'"))
            .to_vec()
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        self.result.as_ref()
    }

    /// Current values of a float field.
    ///
    /// # Panics
    ///
    /// Panics if the field is unbound or boolean.
    pub fn field(&self, set: &str, field: &str) -> Vec<f64> {
        match self.bindings.field(&SetId::from(set), &FieldId::from(field)) {
            Ok(FieldData::Float { values, .. }) => values.clone(),
            other => panic!("no float field {set}.{field}: {other:?}"),
        }
    }
}

/// Assert two float slices agree entry by entry.
pub fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len(), "length of {actual:?}");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < tol, "entry {i}: {a} != {e} (all: {actual:?})");
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Vertex set with the solve fields.
pub fn vertex_set(block: BlockShape) -> SetDecl {
    SetDecl::new("V")
        .with_field("b", FieldType::Float(block))
        .with_field("x0", FieldType::Float(block))
        .with_field(BOUNDARY_MARKER_FIELD, FieldType::Bool)
        .with_field("x", FieldType::Float(block))
}

/// Edge relation over `V` with a scalar weight.
pub fn edge_set() -> SetDecl {
    SetDecl::relation("E", "V", 2).with_field("a", FieldType::Float(BlockShape::Scalar))
}

/// Bindings for an arbitrary graph with per-edge weights `a`.
pub fn graph_bindings(vertices: SetData, edges: &[(usize, usize)], weights: &[f64]) -> Bindings {
    let tuples = edges.iter().flat_map(|&(p, q)| [p, q]).collect();
    Bindings::new().with_set("V", vertices).with_set(
        "E",
        SetData::relation(2, tuples).with_scalars("a", weights.to_vec()),
    )
}

/// Bindings for the path `0 - 1 - ... - n`, one edge per weight.
pub fn path_bindings(vertices: SetData, weights: &[f64]) -> Bindings {
    let edges: Vec<(usize, usize)> = (0..weights.len()).map(|i| (i, i + 1)).collect();
    graph_bindings(vertices, &edges, weights)
}

/// Scalar vertex data: right-hand side `b`, and fixed vertices with their values.
///
/// The marker field is bound only when something is fixed.
pub fn vertex_data(rhs: &[f64], fixed: &[(usize, f64)]) -> SetData {
    let mut x0 = vec![0.0; rhs.len()];
    let mut marker = vec![false; rhs.len()];
    for &(v, value) in fixed {
        x0[v] = value;
        marker[v] = true;
    }
    let data = SetData::new(rhs.len())
        .with_scalars("b", rhs.to_vec())
        .with_scalars("x0", x0);
    if fixed.is_empty() {
        data
    } else {
        data.with_flags(BOUNDARY_MARKER_FIELD, marker)
    }
}

/// `A x = b` with `A` assembled from a scaled 2x2 kernel per edge:
/// `A(e_p, e_q) += a(e) * kernel[p][q]`.
///
/// Fixed vertices keep `x0`; the solution is written to the field `x`.
pub fn edge_system(kernel: [[f64; 2]; 2]) -> Func {
    let matrix = TensorType::matrix("V", "V", BlockShape::Scalar);
    let vector = TensorType::vector("V", BlockShape::Scalar);
    FuncBuilder::new("edge_system")
        .set(vertex_set(BlockShape::Scalar))
        .set(edge_set())
        .local("A", matrix)
        .local("b", vector.clone())
        .local("x0", vector.clone())
        .result("x", vector)
        .assemble(&["A"], "E", |k| {
            let mut body = Vec::new();
            for (p, row) in kernel.iter().enumerate() {
                for (q, value) in row.iter().enumerate() {
                    body.push(accumulate(
                        "A",
                        vec![endpoint(k, p), endpoint(k, q)],
                        lit(*value) * element_field(k, "a"),
                    ));
                }
            }
            body
        })
        .assign("b", field("V", "b"))
        .assign("x0", field("V", "x0"))
        .solve(SolveStmt::Direct(DirectSolve {
            matrix: "A".into(),
            rhs: "b".into(),
            result: "x".into(),
            boundary: Some(BoundaryCondition {
                set: "V".into(),
                marker: BOUNDARY_MARKER_FIELD.into(),
                values: "x0".into(),
            }),
        }))
        .field_write("V", "x", "x")
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_data_marks_fixed() {
        let data = vertex_data(&[1.0, 2.0], &[(1, 7.0)]);
        assert_eq!(
            data.field(&"x0".into()),
            Some(&FieldData::scalars(vec![0.0, 7.0]))
        );
        assert_eq!(
            data.field(&BOUNDARY_MARKER_FIELD.into()),
            Some(&FieldData::Bool(vec![false, true]))
        );
        assert!(vertex_data(&[1.0], &[])
            .field(&BOUNDARY_MARKER_FIELD.into())
            .is_none());
    }

    #[test]
    fn test_path_bindings_chain_edges() {
        let bindings = path_bindings(SetData::new(3), &[2.0, 1.0]);
        let edges = bindings.set(&"E".into()).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges.endpoints().unwrap().tuples, vec![0, 1, 1, 2]);
    }
}
