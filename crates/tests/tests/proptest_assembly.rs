//! Property tests for assembly lowering and sparse access.

use nalgebra as na;
use proptest::prelude::*;

use weft_foundation::{BlockShape, SearchStrategy, SparsityPattern};
use weft_ir::builder::{accumulate, element_field, endpoint, lit, FuncBuilder};
use weft_ir::{
    infer_storage_with, lower_with_storages, FieldType, Func, LowerError, LowerOptions, PatternRef,
    SetDecl, TensorStorage, TensorStorages, TensorType,
};
use weft_runtime::SetData;
use weft_solver::CsrMatrix;
use weft_tests::{edge_set, graph_bindings, TestHarness};

const KERNEL: [[f64; 2]; 2] = [[3.0, -1.0], [-2.0, 4.0]];

/// `A(e_p, e_q) += a(e) * KERNEL[p][q]`, returned as a result.
fn kernel_assembly() -> Func {
    FuncBuilder::new("kernel_assembly")
        .set(SetDecl::new("V"))
        .set(edge_set())
        .result("A", TensorType::matrix("V", "V", BlockShape::Scalar))
        .assemble(&["A"], "E", |k| {
            let mut body = Vec::new();
            for (p, row) in KERNEL.iter().enumerate() {
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
        .build()
}

fn dense_reference(n: usize, edges: &[(usize, usize, f64)]) -> na::DMatrix<f64> {
    let mut a = na::DMatrix::zeros(n, n);
    for &(p, q, w) in edges {
        let ends = [p, q];
        for (i, row) in KERNEL.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                a[(ends[i], ends[j])] += value * w;
            }
        }
    }
    a
}

fn assembled(n: usize, edges: &[(usize, usize, f64)]) -> CsrMatrix {
    let pairs: Vec<(usize, usize)> = edges.iter().map(|&(p, q, _)| (p, q)).collect();
    let weights: Vec<f64> = edges.iter().map(|&(_, _, w)| w).collect();
    let bindings = graph_bindings(SetData::new(n), &pairs, &weights);

    let mut harness = TestHarness::new(&kernel_assembly(), bindings);
    harness.run();
    harness
        .result()
        .and_then(|r| r.get("A"))
        .and_then(|t| t.as_csr())
        .cloned()
        .unwrap_or_else(|| panic!("A is not sparse"))
}

/// Vertex count with a list of weighted edges between distinct vertices.
fn weighted_graph() -> impl Strategy<Value = (usize, Vec<(usize, usize, f64)>)> {
    (2usize..8).prop_flat_map(|n| {
        let edge = (0..n, 1..n, -5.0f64..5.0).prop_map(move |(p, shift, w)| (p, (p + shift) % n, w));
        (Just(n), prop::collection::vec(edge, 1..12))
    })
}

proptest! {
    #[test]
    fn test_assembly_matches_dense_reference((n, edges) in weighted_graph()) {
        let a = assembled(n, &edges);
        let expected = dense_reference(n, &edges);
        let dense = a.to_dense();
        for i in 0..n {
            for j in 0..n {
                prop_assert!(
                    (dense[(i, j)] - expected[(i, j)]).abs() < 1e-10,
                    "entry ({}, {}): {} != {}", i, j, dense[(i, j)], expected[(i, j)]
                );
            }
        }
    }

    #[test]
    fn test_assembly_is_independent_of_edge_order(
        (n, edges, shuffled) in weighted_graph()
            .prop_flat_map(|(n, edges)| (Just(n), Just(edges.clone()), Just(edges).prop_shuffle()))
    ) {
        let a = assembled(n, &edges);
        let b = assembled(n, &shuffled);
        prop_assert_eq!(a.pattern(), b.pattern());
        for (x, y) in a.values().iter().zip(b.values()) {
            prop_assert!((x - y).abs() < 1e-10);
        }
    }

    #[test]
    fn test_write_outside_seeded_diagonal_rejected(p in 0usize..3, q in 0usize..3) {
        let func = FuncBuilder::new("seeded")
            .set(SetDecl::new("V"))
            .set(SetDecl::relation("T", "V", 3).with_field("a", FieldType::Float(BlockShape::Scalar)))
            .local("A", TensorType::matrix("V", "V", BlockShape::Scalar))
            .assemble(&["A"], "T", |k| {
                vec![accumulate("A", vec![endpoint(k, p), endpoint(k, q)], element_field(k, "a"))]
            })
            .build();
        let mut seed = TensorStorages::new();
        seed.insert(
            "A".into(),
            TensorStorage::sparse(PatternRef::diagonal("V"), BlockShape::Scalar),
        );
        let storages = infer_storage_with(&func, seed).unwrap();
        let result = lower_with_storages(&func, storages, &LowerOptions::default());

        if p == q {
            prop_assert!(result.is_ok(), "diagonal write rejected: {:?}", result.err());
        } else {
            let is_incomplete = matches!(result, Err(LowerError::PatternIncomplete { .. }));
            prop_assert!(is_incomplete);
        }
    }

    #[test]
    fn test_locate_misses_holes_and_reads_zero(
        coordinates in prop::collection::vec((0usize..6, 0usize..6), 0..20),
        row in 0usize..6,
        col in 0usize..6,
    ) {
        let pattern = SparsityPattern::from_coordinates(6, 6, coordinates.clone());
        let present = coordinates.contains(&(row, col));

        for strategy in [SearchStrategy::Binary, SearchStrategy::Linear] {
            let position = pattern.locate(row, col, strategy);
            prop_assert_eq!(position.is_some(), present);
            if let Some(position) = position {
                prop_assert_eq!(pattern.col_indices()[position], col);
                prop_assert!(pattern.row_range(row).contains(&position));
            }
        }

        let values = (0..pattern.nnz()).map(|k| k as f64 + 1.0).collect();
        let matrix = CsrMatrix::new(pattern.into(), values, BlockShape::Scalar).unwrap();
        let dense = matrix.to_dense();
        prop_assert_eq!(matrix.get(row, col).is_some(), present);
        prop_assert_eq!(dense[(row, col)] != 0.0, present);
    }
}
