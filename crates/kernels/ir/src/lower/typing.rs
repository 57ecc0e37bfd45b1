//! Expression typing used by the lowering checks.
//!
//! Only what the passes need is checked: block shapes of arithmetic, the
//! sets that element expressions range over, and index domains of tensor
//! reads.

use indexmap::IndexMap;

use weft_foundation::{BlockShape, FieldId, SetId, VarId};

use crate::{BinaryOp, Expr, FieldType, Func, IndexDomain, Literal, TensorType, Type};

use super::{LowerError, Result};

/// Variable types in scope while checking an expression.
pub(crate) struct TypeEnv<'a> {
    func: &'a Func,
    locals: IndexMap<VarId, Type>,
}

impl<'a> TypeEnv<'a> {
    pub(crate) fn new(func: &'a Func) -> Self {
        Self {
            func,
            locals: IndexMap::new(),
        }
    }

    /// Bring a local into scope, shadowing any declaration.
    pub(crate) fn bind(&mut self, var: VarId, ty: Type) {
        self.locals.insert(var, ty);
    }

    pub(crate) fn lookup(&self, var: &VarId) -> Result<&Type> {
        self.locals
            .get(var)
            .or_else(|| self.func.var_type(var))
            .ok_or_else(|| LowerError::UnknownVariable(var.clone()))
    }

    /// Type of an expression.
    pub(crate) fn type_of(&self, expr: &Expr) -> Result<Type> {
        match expr {
            Expr::Literal(Literal::Float(_)) => Ok(Type::float()),
            Expr::Literal(Literal::Int(_)) => Ok(Type::Int),
            Expr::Literal(Literal::Bool(_)) => Ok(Type::Bool),
            Expr::Literal(Literal::Block(shape, values)) => {
                if values.len() != shape.len() {
                    return Err(LowerError::ShapeMismatch {
                        context: "block literal".to_string(),
                        expected: format!("{} values", shape.len()),
                        found: format!("{} values", values.len()),
                    });
                }
                Ok(Type::Block(*shape))
            }
            Expr::Var(var) => self.lookup(var).cloned(),
            Expr::Endpoint { endpoints, slot } => {
                let relation = match self.lookup(endpoints)? {
                    Type::Endpoints(set) => set,
                    other => {
                        return Err(LowerError::UnsupportedConstruct(format!(
                            "endpoint lookup through '{endpoints}' of type {other}"
                        )))
                    }
                };
                self.endpoint_set(relation, *slot)
            }
            Expr::EndpointOf { set, element, slot } => {
                self.expect_int_or_element(element)?;
                self.endpoint_set(set, *slot)
            }
            Expr::ElementField { element, field } => {
                let set = match self.lookup(element)? {
                    Type::Element(set) => set.clone(),
                    other => {
                        return Err(LowerError::UnsupportedConstruct(format!(
                            "field access on '{element}' of type {other}"
                        )))
                    }
                };
                self.field_type(&set, field)
            }
            Expr::FieldLoad {
                set,
                field,
                element,
            } => {
                self.expect_int_or_element(element)?;
                self.field_type(set, field)
            }
            Expr::Field { set, field } => match self.field_type(set, field)? {
                Type::Block(block) => Ok(Type::Tensor(TensorType::vector(
                    set.clone(),
                    block,
                ))),
                _ => Err(LowerError::UnsupportedConstruct(format!(
                    "field '{set}.{field}' is not a float field"
                ))),
            },
            Expr::Binary { op, lhs, rhs } => {
                let l = self.type_of(lhs)?;
                let r = self.type_of(rhs)?;
                binary_type(*op, &l, &r)
            }
            Expr::Neg(inner) => match self.type_of(inner)? {
                ty @ (Type::Block(_) | Type::Int) => Ok(ty),
                other => Err(LowerError::ShapeMismatch {
                    context: "negation".to_string(),
                    expected: "float block or int".to_string(),
                    found: other.to_string(),
                }),
            },
            Expr::Index(_) | Expr::Indexed(_) => Err(LowerError::UnsupportedConstruct(
                "index expression outside a tensor assignment".to_string(),
            )),
            Expr::TensorRead(access) => {
                let tensor = self.tensor(&access.tensor)?;
                if access.indices.len() != tensor.dims.len() {
                    return Err(LowerError::IndexDomainMismatch {
                        context: format!("read of '{}'", access.tensor),
                        index: format!("{} indices", access.indices.len()),
                        expected: format!("rank {}", tensor.dims.len()),
                        found: format!("rank {}", access.indices.len()),
                    });
                }
                for (k, (index, dim)) in access.indices.iter().zip(&tensor.dims).enumerate() {
                    match (self.type_of(index)?, dim) {
                        (Type::Element(set), IndexDomain::Set(expected)) if &set == expected => {}
                        (Type::Int, _) => {}
                        (found, _) => {
                            return Err(LowerError::IndexDomainMismatch {
                                context: format!("read of '{}'", access.tensor),
                                index: format!("#{k}"),
                                expected: dim.to_string(),
                                found: found.to_string(),
                            })
                        }
                    }
                }
                Ok(Type::Block(tensor.block))
            }
            Expr::SetSize(set) => {
                self.func
                    .set(set)
                    .ok_or_else(|| LowerError::UnknownSet(set.clone()))?;
                Ok(Type::Int)
            }
            Expr::Locate { .. } => Ok(Type::Int),
            Expr::Load { block, .. } | Expr::SparseLoad { block, .. } => Ok(Type::Block(*block)),
        }
    }

    /// Block shape of an expression, failing for non-float values.
    pub(crate) fn block_of(&self, expr: &Expr, context: &str) -> Result<BlockShape> {
        match self.type_of(expr)? {
            Type::Block(block) => Ok(block),
            other => Err(LowerError::ShapeMismatch {
                context: context.to_string(),
                expected: "float block".to_string(),
                found: other.to_string(),
            }),
        }
    }

    /// Declared tensor type of a variable.
    pub(crate) fn tensor(&self, var: &VarId) -> Result<&'a TensorType> {
        match self.func.var_type(var) {
            Some(Type::Tensor(t)) => Ok(t),
            Some(other) => Err(LowerError::UnsupportedConstruct(format!(
                "'{var}' of type {other} used as a tensor"
            ))),
            None => Err(LowerError::UnknownVariable(var.clone())),
        }
    }

    fn endpoint_set(&self, relation: &SetId, slot: usize) -> Result<Type> {
        let decl = self
            .func
            .set(relation)
            .ok_or_else(|| LowerError::UnknownSet(relation.clone()))?;
        let endpoints = decl.endpoints.as_ref().ok_or_else(|| {
            LowerError::UnsupportedConstruct(format!("set '{relation}' has no endpoints"))
        })?;
        if slot >= endpoints.arity {
            return Err(LowerError::UnsupportedConstruct(format!(
                "endpoint slot {slot} of '{relation}' with arity {}",
                endpoints.arity
            )));
        }
        Ok(Type::Element(endpoints.set.clone()))
    }

    fn field_type(&self, set: &SetId, field: &FieldId) -> Result<Type> {
        let decl = self
            .func
            .set(set)
            .ok_or_else(|| LowerError::UnknownSet(set.clone()))?;
        match decl.fields.get(field) {
            Some(FieldType::Float(block)) => Ok(Type::Block(*block)),
            Some(FieldType::Bool) => Ok(Type::Bool),
            None => Err(LowerError::UnknownField {
                set: set.clone(),
                field: field.clone(),
            }),
        }
    }

    fn expect_int_or_element(&self, expr: &Expr) -> Result<()> {
        match self.type_of(expr)? {
            Type::Int | Type::Element(_) => Ok(()),
            other => Err(LowerError::UnsupportedConstruct(format!(
                "element index of type {other}"
            ))),
        }
    }
}

/// Result type of a binary operation.
pub(crate) fn binary_type(op: BinaryOp, lhs: &Type, rhs: &Type) -> Result<Type> {
    let mismatch = || LowerError::ShapeMismatch {
        context: format!("{op:?}"),
        expected: lhs.to_string(),
        found: rhs.to_string(),
    };
    match (lhs, rhs) {
        (Type::Int, Type::Int) => Ok(Type::Int),
        (Type::Block(l), Type::Block(r)) => {
            let shape = match op {
                BinaryOp::Add | BinaryOp::Sub => l.sum(*r),
                BinaryOp::Mul => l.product(*r),
                BinaryOp::Div => (*r == BlockShape::Scalar).then_some(*l),
            };
            shape.map(Type::Block).ok_or_else(mismatch)
        }
        _ => Err(mismatch()),
    }
}
