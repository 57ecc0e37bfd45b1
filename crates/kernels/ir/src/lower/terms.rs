//! Expansion of index-expression bodies into signed product terms.
//!
//! `A(i,j) * (x(j) - 2.0 * y(j))` expands to `A(i,j) x(j)` and
//! `-(A(i,j) 2.0 y(j))`. Factor order is preserved because block products
//! do not commute.

use crate::{BinaryOp, Expr, IndexedTensor, Literal};

use super::{LowerError, Result};

/// One factor of a product term.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Factor {
    /// An indexed tensor operand.
    Tensor(IndexedTensor),
    /// An index-free block expression (literal, parameter, ...).
    Scalar(Expr),
}

/// A signed product of factors.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Term {
    pub negated: bool,
    pub factors: Vec<Factor>,
}

impl Term {
    /// Indexed operands with their factor positions.
    pub(crate) fn tensors(&self) -> impl Iterator<Item = (usize, &IndexedTensor)> {
        self.factors.iter().enumerate().filter_map(|(k, f)| match f {
            Factor::Tensor(t) => Some((k, t)),
            Factor::Scalar(_) => None,
        })
    }
}

fn has_indexed(expr: &Expr) -> bool {
    expr.any(|e| matches!(e, Expr::Indexed(_)))
}

/// Expand an index-expression body into a sum of product terms.
pub(crate) fn expand_terms(expr: &Expr) -> Result<Vec<Term>> {
    if !has_indexed(expr) {
        return Ok(vec![Term {
            negated: false,
            factors: vec![Factor::Scalar(expr.clone())],
        }]);
    }
    match expr {
        Expr::Indexed(t) => Ok(vec![Term {
            negated: false,
            factors: vec![Factor::Tensor(t.clone())],
        }]),
        Expr::Neg(inner) => Ok(negate(expand_terms(inner)?)),
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::Add => {
                let mut terms = expand_terms(lhs)?;
                terms.extend(expand_terms(rhs)?);
                Ok(terms)
            }
            BinaryOp::Sub => {
                let mut terms = expand_terms(lhs)?;
                terms.extend(negate(expand_terms(rhs)?));
                Ok(terms)
            }
            BinaryOp::Mul => {
                let left = expand_terms(lhs)?;
                let right = expand_terms(rhs)?;
                let mut terms = Vec::with_capacity(left.len() * right.len());
                for l in &left {
                    for r in &right {
                        let mut factors = l.factors.clone();
                        factors.extend(r.factors.iter().cloned());
                        terms.push(Term {
                            negated: l.negated ^ r.negated,
                            factors,
                        });
                    }
                }
                Ok(terms)
            }
            BinaryOp::Div => {
                if has_indexed(rhs) {
                    return Err(LowerError::UnsupportedConstruct(
                        "division by an indexed tensor".to_string(),
                    ));
                }
                let reciprocal = Expr::binary(
                    BinaryOp::Div,
                    Expr::Literal(Literal::Float(1.0)),
                    (**rhs).clone(),
                );
                let mut terms = expand_terms(lhs)?;
                for term in &mut terms {
                    term.factors.push(Factor::Scalar(reciprocal.clone()));
                }
                Ok(terms)
            }
        },
        other => Err(LowerError::UnsupportedConstruct(format!(
            "indexed tensor inside {other:?}"
        ))),
    }
}

fn negate(mut terms: Vec<Term>) -> Vec<Term> {
    for term in &mut terms {
        term.negated = !term.negated;
    }
    terms
}
