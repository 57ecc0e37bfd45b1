//! End-to-end solve scenarios.
//!
//! Each test builds an IR program, lowers it, executes it and compares the
//! solution with known values or a dense nalgebra reference.

use nalgebra as na;

use weft_foundation::BlockShape;
use weft_ir::builder::{
    accumulate, block_lit, element, element_field, endpoint, field, index_expr, index_var, indexed,
    lit, FuncBuilder,
};
use weft_ir::{
    DirectSolve, FieldType, SchurSolve, SetDecl, SolveStmt, StorageKind, TensorType,
    BOUNDARY_MARKER_FIELD,
};
use weft_runtime::{Error, SetData};
use weft_solver::{SolveError, SolverConfig};
use weft_tests::{
    assert_close, edge_set, edge_system, graph_bindings, path_bindings, vertex_data, vertex_set,
    TestHarness,
};

// ============================================================================
// Scalar path systems
// ============================================================================

#[test]
fn test_weighted_path_without_boundary() {
    let func = edge_system([[5.0, 1.0], [1.0, 5.0]]);
    let bindings = path_bindings(vertex_data(&[2.0, 1.0, 4.0], &[]), &[2.0, 1.0]);

    let mut harness = TestHarness::new(&func, bindings);
    harness.run();

    let expected = [0.202777777777778, -0.013888888888889, 0.802777777777778];
    assert_close(&harness.values("x"), &expected, 1e-12);
    assert_close(&harness.field("V", "x"), &expected, 1e-12);
}

#[test]
fn test_fixed_vertex_lu() {
    let func = edge_system([[2.0, 5.0], [1.0, 1.0]]);
    let bindings = path_bindings(vertex_data(&[10.0, 20.0, 30.0], &[(0, -40.0)]), &[1.0, 1.0]);

    let mut harness = TestHarness::new(&func, bindings);
    harness.run();

    assert_close(&harness.values("x"), &[-40.0, 45.0, -15.0], 1e-9);
}

#[test]
fn test_fixed_vertex_cholesky() {
    let func = edge_system([[5.0 / 30.0, 3.0 / 30.0], [3.0 / 30.0, 2.0 / 30.0]]);
    let bindings = path_bindings(vertex_data(&[1.0, 1.0, 1.0], &[(0, 20.0)]), &[1.0, 1.0]);

    let mut harness = TestHarness::new(&func, bindings).with_config(SolverConfig::cholesky());
    harness.run();

    assert_close(&harness.values("x"), &[20.0, -30.0, 60.0], 1e-9);
}

#[test]
fn test_cholesky_rejects_nonsymmetric_system() {
    let func = edge_system([[2.0, 5.0], [1.0, 1.0]]);
    let bindings = path_bindings(vertex_data(&[10.0, 20.0, 30.0], &[]), &[1.0, 1.0]);

    let mut harness = TestHarness::new(&func, bindings).with_config(SolverConfig::cholesky());
    let err = harness.try_run().unwrap_err();
    assert!(matches!(
        err,
        Error::Solve(SolveError::NotPositiveDefinite { .. })
    ));
}

#[test]
fn test_singular_system_leaves_fields_untouched() {
    // A pure graph Laplacian has constant vectors in its kernel
    let func = edge_system([[1.0, -1.0], [-1.0, 1.0]]);
    let vertices = vertex_data(&[1.0, 0.0, -1.0], &[]).with_scalars("x", vec![9.0, 9.0, 9.0]);
    let bindings = path_bindings(vertices, &[1.0, 1.0]);

    let mut harness = TestHarness::new(&func, bindings);
    let err = harness.try_run().unwrap_err();
    assert!(matches!(err, Error::Solve(SolveError::Singular { .. })));
    assert_eq!(harness.field("V", "x"), vec![9.0, 9.0, 9.0]);
}

#[test]
fn test_fixing_laplacian_vertex_regularizes() {
    let func = edge_system([[1.0, -1.0], [-1.0, 1.0]]);
    let bindings = path_bindings(vertex_data(&[0.0, 0.0, 1.0], &[(0, 2.0)]), &[1.0, 1.0]);

    let mut harness = TestHarness::new(&func, bindings);
    harness.run();

    // free rows: 2 x1 - x2 = x0, x2 - x1 = 1
    assert_close(&harness.values("x"), &[2.0, 3.0, 4.0], 1e-9);
}

#[test]
fn test_system_matrix_is_sparse() {
    let func = edge_system([[5.0, 1.0], [1.0, 5.0]]);
    let harness = TestHarness::new(&func, path_bindings(vertex_data(&[0.0; 3], &[]), &[1.0, 1.0]));
    let storage = &harness.lowered().storages["A"];
    assert!(matches!(storage.kind, StorageKind::Sparse(_)));
}

// ============================================================================
// Blocked systems
// ============================================================================

const DIAG_BLOCK: [f64; 4] = [4.0, 1.0, 1.0, 3.0];
const OFF_BLOCK: [f64; 4] = [-1.0, 0.0, 0.0, -1.0];

fn blocked_system() -> weft_ir::Func {
    let block = BlockShape::Matrix(2, 2);
    let vector = TensorType::vector("V", BlockShape::Vector(2));
    FuncBuilder::new("blocked")
        .set(vertex_set(BlockShape::Vector(2)))
        .set(edge_set())
        .local("K", TensorType::matrix("V", "V", block))
        .local("f", vector.clone())
        .result("u", vector)
        .assemble(&["K"], "E", |k| {
            let a = element_field(k, "a");
            let diag = block_lit(block, &DIAG_BLOCK);
            let off = block_lit(block, &OFF_BLOCK);
            vec![
                accumulate("K", vec![endpoint(k, 0), endpoint(k, 0)], a.clone() * diag.clone()),
                accumulate("K", vec![endpoint(k, 1), endpoint(k, 1)], a.clone() * diag),
                accumulate("K", vec![endpoint(k, 0), endpoint(k, 1)], a.clone() * off.clone()),
                accumulate("K", vec![endpoint(k, 1), endpoint(k, 0)], a * off),
            ]
        })
        .assign("f", field("V", "b"))
        .solve(SolveStmt::Direct(DirectSolve {
            matrix: "K".into(),
            rhs: "f".into(),
            result: "u".into(),
            boundary: None,
        }))
        .build()
}

/// Dense expansion of the blocked assembly.
fn blocked_reference(n: usize, edges: &[(usize, usize)], weights: &[f64]) -> na::DMatrix<f64> {
    let mut k = na::DMatrix::zeros(2 * n, 2 * n);
    for (&(p, q), &a) in edges.iter().zip(weights) {
        for (r, c, block) in [(p, p, DIAG_BLOCK), (q, q, DIAG_BLOCK), (p, q, OFF_BLOCK), (q, p, OFF_BLOCK)] {
            for i in 0..2 {
                for j in 0..2 {
                    k[(2 * r + i, 2 * c + j)] += a * block[2 * i + j];
                }
            }
        }
    }
    k
}

#[test]
fn test_blocked_system_matches_dense_reference() {
    let edges = [(0, 1), (1, 2), (2, 3), (0, 2)];
    let weights = [1.0, 2.0, 0.5, 1.5];
    let rhs = [1.0, -2.0, 0.5, 3.0, -1.0, 0.0, 2.0, 1.0];
    let vertices = SetData::new(4).with_blocks("b", BlockShape::Vector(2), rhs.to_vec());

    let mut harness = TestHarness::new(&blocked_system(), graph_bindings(vertices, &edges, &weights));
    harness.run();

    let k = blocked_reference(4, &edges, &weights);
    let expected = k.lu().solve(&na::DVector::from_column_slice(&rhs)).unwrap();
    assert_close(&harness.values("u"), expected.as_slice(), 1e-10);
}

#[test]
fn test_blocked_matrix_keeps_block_layout() {
    let edges = [(0, 1)];
    let vertices = SetData::new(2).with_blocks("b", BlockShape::Vector(2), vec![1.0; 4]);
    let func = FuncBuilder::new("blocked_probe")
        .set(vertex_set(BlockShape::Vector(2)))
        .set(edge_set())
        .result("K", TensorType::matrix("V", "V", BlockShape::Matrix(2, 2)))
        .assemble(&["K"], "E", |k| {
            vec![accumulate(
                "K",
                vec![endpoint(k, 0), endpoint(k, 1)],
                element_field(k, "a") * block_lit(BlockShape::Matrix(2, 2), &OFF_BLOCK),
            )]
        })
        .build();

    let mut harness = TestHarness::new(&func, graph_bindings(vertices, &edges, &[3.0]));
    harness.run();

    let k = harness.result().and_then(|r| r.get("K")).and_then(|t| t.as_csr()).unwrap();
    assert_eq!(k.block(), BlockShape::Matrix(2, 2));
    assert_eq!(k.get(0, 1), Some(&[-3.0, 0.0, 0.0, -3.0][..]));
    assert_eq!(k.get(1, 0), Some(&[0.0, 0.0, 0.0, 0.0][..]));
}

// ============================================================================
// Rectangular incidence systems
// ============================================================================

#[test]
fn test_incidence_matrices_and_products() {
    let edges = [(0, 1), (1, 2), (0, 2), (2, 3)];
    let weights = [1.0, 2.0, 3.0, 4.0];
    let u = [1.0, -1.0, 2.0, 0.5];

    let e = index_var("e", "E");
    let v = index_var("v", "V");
    let func = FuncBuilder::new("incidence")
        .set(vertex_set(BlockShape::Scalar).with_field("u", FieldType::Float(BlockShape::Scalar)))
        .set(edge_set())
        .result("B", TensorType::matrix("E", "V", BlockShape::Scalar))
        .result("Bt", TensorType::matrix("V", "E", BlockShape::Scalar))
        .local("x", TensorType::vector("V", BlockShape::Scalar))
        .local("w", TensorType::vector("E", BlockShape::Scalar))
        .result("grad", TensorType::vector("E", BlockShape::Scalar))
        .result("div", TensorType::vector("V", BlockShape::Scalar))
        .assemble(&["B", "Bt"], "E", |k| {
            vec![
                accumulate("B", vec![element(k), endpoint(k, 0)], lit(-1.0)),
                accumulate("B", vec![element(k), endpoint(k, 1)], lit(1.0)),
                accumulate("Bt", vec![endpoint(k, 0), element(k)], lit(-1.0)),
                accumulate("Bt", vec![endpoint(k, 1), element(k)], lit(1.0)),
            ]
        })
        .assign("x", field("V", "u"))
        .assign("w", field("E", "a"))
        .assign(
            "grad",
            index_expr(&[&e], indexed("B", &[&e, &v]) * indexed("x", &[&v])),
        )
        .assign(
            "div",
            index_expr(&[&v], indexed("Bt", &[&v, &e]) * indexed("w", &[&e])),
        )
        .build();

    let vertices = SetData::new(4).with_scalars("u", u.to_vec());
    let mut harness = TestHarness::new(&func, graph_bindings(vertices, &edges, &weights));
    harness.run();

    let mut b = na::DMatrix::<f64>::zeros(4, 4);
    for (i, &(p, q)) in edges.iter().enumerate() {
        b[(i, p)] -= 1.0;
        b[(i, q)] += 1.0;
    }
    let result = harness.result().unwrap();
    let b_csr = result.get("B").and_then(|t| t.as_csr()).unwrap();
    assert_eq!((b_csr.pattern().rows(), b_csr.pattern().cols()), (4, 4));
    assert_eq!(b_csr.to_dense(), b);
    let bt_csr = result.get("Bt").and_then(|t| t.as_csr()).unwrap();
    assert_eq!(bt_csr.to_dense(), b.transpose());

    let grad = &b * na::DVector::from_column_slice(&u);
    assert_close(&harness.values("grad"), grad.as_slice(), 1e-12);
    let div = b.transpose() * na::DVector::from_column_slice(&weights);
    assert_close(&harness.values("div"), div.as_slice(), 1e-12);
}

// ============================================================================
// Schur complement
// ============================================================================

fn saddle_program(with_derived: bool) -> weft_ir::Func {
    let scalar = BlockShape::Scalar;
    let mut builder = FuncBuilder::new("saddle")
        .set(
            SetDecl::new("V")
                .with_field("f", FieldType::Float(scalar))
                .with_field("x", FieldType::Float(scalar)),
        )
        .set(edge_set())
        .set(
            SetDecl::relation("D", "V", 1)
                .with_field("g", FieldType::Float(scalar))
                .with_field("d", FieldType::Float(scalar)),
        )
        .local("K", TensorType::matrix("V", "V", scalar))
        .local("C", TensorType::matrix("D", "V", scalar))
        .local("fp", TensorType::vector("V", scalar))
        .local("fd", TensorType::vector("D", scalar))
        .result("xp", TensorType::vector("V", scalar))
        .result("xd", TensorType::vector("D", scalar))
        .assemble(&["K"], "E", |k| {
            vec![
                accumulate("K", vec![endpoint(k, 0), endpoint(k, 0)], lit(1.0)),
                accumulate("K", vec![endpoint(k, 1), endpoint(k, 1)], lit(1.0)),
                accumulate("K", vec![endpoint(k, 0), endpoint(k, 1)], lit(0.5)),
                accumulate("K", vec![endpoint(k, 1), endpoint(k, 0)], lit(0.5)),
            ]
        })
        .assemble(&["C"], "D", |k| {
            vec![accumulate("C", vec![element(k), endpoint(k, 0)], lit(1.0))]
        });
    if with_derived {
        builder = builder
            .local("M", TensorType::matrix("D", "D", scalar))
            .assemble(&["M"], "D", |k| {
                vec![accumulate("M", vec![element(k), element(k)], lit(-2.0))]
            });
    }
    builder
        .assign("fp", field("V", "f"))
        .assign("fd", field("D", "g"))
        .solve(SolveStmt::Schur(SchurSolve {
            primary: "K".into(),
            coupling: "C".into(),
            derived: with_derived.then(|| "M".into()),
            rhs_primary: "fp".into(),
            rhs_derived: "fd".into(),
            result_primary: "xp".into(),
            result_derived: "xd".into(),
        }))
        .field_write("V", "x", "xp")
        .field_write("D", "d", "xd")
        .build()
}

fn saddle_bindings() -> weft_runtime::Bindings {
    path_bindings(
        SetData::new(3).with_scalars("f", vec![10.0, 20.0, 30.0]),
        &[1.0, 1.0],
    )
    .with_set(
        "D",
        SetData::subset(vec![0, 2]).with_scalars("g", vec![100.0, -100.0]),
    )
}

#[test]
fn test_saddle_point_pins_subset() {
    let mut harness = TestHarness::new(&saddle_program(false), saddle_bindings());
    harness.run();

    assert_close(&harness.values("xp"), &[100.0, 10.0, -100.0], 1e-9);
    assert_close(&harness.values("xd"), &[-95.0, 125.0], 1e-9);
    assert_close(&harness.field("D", "d"), &[-95.0, 125.0], 1e-9);
}

#[test]
fn test_schur_with_derived_block_matches_full_system() {
    let mut harness = TestHarness::new(&saddle_program(true), saddle_bindings());
    harness.run();

    let full = na::DMatrix::from_row_slice(
        5,
        5,
        &[
            1.0, 0.5, 0.0, 1.0, 0.0, //
            0.5, 2.0, 0.5, 0.0, 0.0, //
            0.0, 0.5, 1.0, 0.0, 1.0, //
            1.0, 0.0, 0.0, -2.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, -2.0,
        ],
    );
    let rhs = na::DVector::from_column_slice(&[10.0, 20.0, 30.0, 100.0, -100.0]);
    let x = full.lu().solve(&rhs).unwrap();

    assert_close(&harness.values("xp"), &x.as_slice()[..3], 1e-9);
    assert_close(&harness.values("xd"), &x.as_slice()[3..], 1e-9);
}
