//! Property tests for the sparse solver: boundary elimination and Schur
//! reduction against dense nalgebra factorizations.

use nalgebra as na;
use proptest::prelude::*;

use weft_solver::convert::from_dense_vector;
use weft_solver::{solve_direct, solve_schur, Boundary, CsrMatrix, SchurSystem, SolverConfig};

/// A strictly diagonally dominant matrix, nonsingular by construction.
fn dominant_matrix(n: usize, entries: &[f64]) -> na::DMatrix<f64> {
    let mut m = na::DMatrix::from_row_slice(n, n, entries);
    for i in 0..n {
        let off: f64 = (0..n).filter(|&j| j != i).map(|j| m[(i, j)].abs()).sum();
        m[(i, i)] = off + 1.0 + m[(i, i)].abs();
    }
    m
}

/// `B^T B + I`, symmetric positive definite.
fn spd_matrix(n: usize, entries: &[f64]) -> na::DMatrix<f64> {
    let b = na::DMatrix::from_row_slice(n, n, entries);
    b.transpose() * &b + na::DMatrix::identity(n, n)
}

fn assert_vectors_close(actual: &[f64], expected: &[f64], tol: f64) -> Result<(), TestCaseError> {
    prop_assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        prop_assert!((a - e).abs() < tol * (1.0 + e.abs()), "entry {}: {} != {}", i, a, e);
    }
    Ok(())
}

/// Square system: dimension, row-major entries, right-hand side, marker and
/// fixed values.
#[allow(clippy::type_complexity)]
fn boundary_system() -> impl Strategy<Value = (usize, Vec<f64>, Vec<f64>, Vec<bool>, Vec<f64>)> {
    (1usize..7).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::vec(-3.0f64..3.0, n * n),
            prop::collection::vec(-10.0f64..10.0, n),
            prop::collection::vec(any::<bool>(), n),
            prop::collection::vec(-10.0f64..10.0, n),
        )
    })
}

proptest! {
    #[test]
    fn test_elimination_matches_pinned_rows(
        (n, entries, rhs, marker, values) in boundary_system()
    ) {
        let k = dominant_matrix(n, &entries);
        let matrix = CsrMatrix::from_dense(&k);
        let boundary = Boundary { marker: &marker, values: &values };
        let solved = solve_direct(&matrix, &rhs, Some(boundary), &SolverConfig::default()).unwrap();

        // Replace every fixed row with an identity row pinned to its value
        let mut pinned = k.clone();
        let mut pinned_rhs = na::DVector::from_column_slice(&rhs);
        for i in (0..n).filter(|&i| marker[i]) {
            pinned.row_mut(i).fill(0.0);
            pinned[(i, i)] = 1.0;
            pinned_rhs[i] = values[i];
        }
        let expected = pinned.lu().solve(&pinned_rhs).unwrap();

        assert_vectors_close(&solved, &from_dense_vector(&expected), 1e-9)?;
        for i in (0..n).filter(|&i| marker[i]) {
            prop_assert_eq!(solved[i], values[i]);
        }
    }

    #[test]
    fn test_cholesky_agrees_with_lu_on_spd(
        (n, entries, rhs, marker, values) in boundary_system()
    ) {
        let k = spd_matrix(n, &entries);
        let matrix = CsrMatrix::from_dense(&k);
        let boundary = Boundary { marker: &marker, values: &values };
        let lu = solve_direct(&matrix, &rhs, Some(boundary), &SolverConfig::default()).unwrap();
        let cholesky = solve_direct(&matrix, &rhs, Some(boundary), &SolverConfig::cholesky()).unwrap();
        assert_vectors_close(&cholesky, &lu, 1e-8)?;
    }

    #[test]
    fn test_schur_matches_full_factorization(
        n in 2usize..6,
        m in 1usize..3,
        k_entries in prop::collection::vec(-2.0f64..2.0, 36),
        c_entries in prop::collection::vec(-1.0f64..1.0, 18),
        d_diagonal in prop::collection::vec(0.5f64..4.0, 2),
        rhs in prop::collection::vec(-10.0f64..10.0, 8),
        with_derived in any::<bool>(),
    ) {
        let k = spd_matrix(n, &k_entries[..n * n]);
        // Full row rank: identity on the leading block plus a perturbation
        let mut c = na::DMatrix::from_row_slice(m, n, &c_entries[..m * n]) * 0.25;
        for i in 0..m {
            c[(i, i)] += 2.0;
        }
        let d = na::DMatrix::from_diagonal(&na::DVector::from_iterator(
            m,
            d_diagonal.iter().take(m).map(|v| -v),
        ));
        let f = na::DVector::from_column_slice(&rhs[..n]);
        let g = na::DVector::from_column_slice(&rhs[n..n + m]);

        let solution = solve_schur(
            SchurSystem {
                primary: &k,
                coupling: &c,
                derived: with_derived.then_some(&d),
                rhs_primary: &f,
                rhs_derived: &g,
            },
            &SolverConfig::default(),
        )
        .unwrap();

        let mut full = na::DMatrix::zeros(n + m, n + m);
        full.view_mut((0, 0), (n, n)).copy_from(&k);
        full.view_mut((0, n), (n, m)).copy_from(&c.transpose());
        full.view_mut((n, 0), (m, n)).copy_from(&c);
        if with_derived {
            full.view_mut((n, n), (m, m)).copy_from(&d);
        }
        let mut full_rhs = na::DVector::zeros(n + m);
        full_rhs.rows_mut(0, n).copy_from(&f);
        full_rhs.rows_mut(n, m).copy_from(&g);
        let expected = full.lu().solve(&full_rhs).unwrap();

        assert_vectors_close(solution.primary.as_slice(), &expected.as_slice()[..n], 1e-8)?;
        assert_vectors_close(solution.derived.as_slice(), &expected.as_slice()[n..], 1e-8)?;
    }
}
