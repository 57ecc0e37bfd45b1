//! Construction helpers for IR functions.
//!
//! There is no surface syntax in this workspace; programs are built directly
//! as IR. [`FuncBuilder`] declares sets and variables and appends statements,
//! and the free functions build the expression forms that appear in kernels
//! and index expressions.
//!
//! ```ignore
//! let func = FuncBuilder::new("laplace")
//!     .set(SetDecl::new("V"))
//!     .set(SetDecl::relation("E", "V", 2))
//!     .local("A", TensorType::matrix("V", "V", BlockShape::Scalar))
//!     .assemble(&["A"], "E", |k| {
//!         vec![accumulate("A", vec![endpoint(k, 0), endpoint(k, 1)], lit(-1.0))]
//!     })
//!     .build();
//! ```

use std::ops::{Add, Div, Mul, Neg, Sub};

use weft_foundation::{BlockShape, FieldId, FuncId, SetId, VarId};

use crate::{
    Assembly, BinaryOp, Expr, Func, IndexDomain, IndexExpr, IndexVar, IndexedTensor, Kernel,
    Literal, ReductionOp, SetDecl, SolveStmt, Stmt, TensorAccess, TensorType, Type, Var,
};

/// Kernel-local names handed to an assembly body.
#[derive(Debug, Clone)]
pub struct KernelVars {
    pub element: VarId,
    pub endpoints: Option<VarId>,
}

/// Incremental builder for a [`Func`].
#[derive(Debug, Clone)]
pub struct FuncBuilder {
    func: Func,
}

impl FuncBuilder {
    pub fn new(id: impl Into<FuncId>) -> Self {
        Self {
            func: Func {
                id: id.into(),
                sets: Default::default(),
                params: Vec::new(),
                locals: Vec::new(),
                results: Vec::new(),
                body: Vec::new(),
            },
        }
    }

    pub fn set(mut self, decl: SetDecl) -> Self {
        self.func.sets.insert(decl.id.clone(), decl);
        self
    }

    pub fn param(mut self, id: impl Into<VarId>, ty: Type) -> Self {
        self.func.params.push(Var::new(id, ty));
        self
    }

    pub fn local(mut self, id: impl Into<VarId>, ty: TensorType) -> Self {
        self.func.locals.push(Var::new(id, Type::Tensor(ty)));
        self
    }

    pub fn result(mut self, id: impl Into<VarId>, ty: TensorType) -> Self {
        self.func.results.push(Var::new(id, Type::Tensor(ty)));
        self
    }

    pub fn stmt(mut self, stmt: Stmt) -> Self {
        self.func.body.push(stmt);
        self
    }

    /// `var = value`.
    pub fn assign(self, var: impl Into<VarId>, value: Expr) -> Self {
        self.stmt(Stmt::Assign {
            var: var.into(),
            value,
        })
    }

    /// Sum-reduce the kernel built by `body` over every element of `set`.
    ///
    /// The kernel element is named `{set}.e` and, for relations, the endpoint
    /// tuple `{set}.ep`. Sets must be declared before they are assembled over.
    pub fn assemble(
        mut self,
        targets: &[&str],
        set: impl Into<SetId>,
        body: impl FnOnce(&KernelVars) -> Vec<Stmt>,
    ) -> Self {
        let set = set.into();
        let is_relation = self.func.set(&set).is_some_and(SetDecl::is_relation);
        let vars = KernelVars {
            element: VarId::new(format!("{set}.e")),
            endpoints: is_relation.then(|| VarId::new(format!("{set}.ep"))),
        };
        let kernel = Kernel {
            element: Var::new(vars.element.clone(), Type::Element(set.clone())),
            endpoints: vars
                .endpoints
                .as_ref()
                .map(|id| Var::new(id.clone(), Type::Endpoints(set.clone()))),
            body: body(&vars),
        };
        self.func.body.push(Stmt::Assemble(Assembly {
            targets: targets.iter().map(|t| VarId::from(*t)).collect(),
            set,
            kernel,
            reduction: ReductionOp::Sum,
        }));
        self
    }

    pub fn solve(self, solve: SolveStmt) -> Self {
        self.stmt(Stmt::Solve(solve))
    }

    /// Copy a rank-1 tensor into a field.
    pub fn field_write(
        self,
        set: impl Into<SetId>,
        field: impl Into<FieldId>,
        value: impl Into<VarId>,
    ) -> Self {
        self.stmt(Stmt::FieldWrite {
            set: set.into(),
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn build(self) -> Func {
        self.func
    }
}

// ============================================================================
// Expressions
// ============================================================================

pub fn var(id: impl Into<VarId>) -> Expr {
    Expr::Var(id.into())
}

pub fn lit(value: f64) -> Expr {
    Expr::Literal(Literal::Float(value))
}

pub fn int(value: i64) -> Expr {
    Expr::Literal(Literal::Int(value))
}

/// Row-major vector or matrix constant.
pub fn block_lit(shape: BlockShape, values: &[f64]) -> Expr {
    Expr::Literal(Literal::Block(shape, values.to_vec()))
}

/// Endpoint `slot` of the current kernel element.
///
/// Over a set without endpoints this refers through the element itself,
/// which lowering rejects.
pub fn endpoint(kernel: &KernelVars, slot: usize) -> Expr {
    let endpoints = kernel
        .endpoints
        .clone()
        .unwrap_or_else(|| kernel.element.clone());
    Expr::Endpoint { endpoints, slot }
}

/// The current kernel element.
pub fn element(kernel: &KernelVars) -> Expr {
    Expr::Var(kernel.element.clone())
}

/// Field of the current kernel element.
pub fn element_field(kernel: &KernelVars, field: impl Into<FieldId>) -> Expr {
    Expr::ElementField {
        element: kernel.element.clone(),
        field: field.into(),
    }
}

/// A whole field as a rank-1 tensor.
pub fn field(set: impl Into<SetId>, field: impl Into<FieldId>) -> Expr {
    Expr::Field {
        set: set.into(),
        field: field.into(),
    }
}

/// Symbolic element read `tensor(indices)`.
pub fn read(tensor: impl Into<VarId>, indices: Vec<Expr>) -> Expr {
    Expr::TensorRead(TensorAccess {
        tensor: tensor.into(),
        indices,
        position: None,
    })
}

/// Kernel contribution `tensor(indices) += value`.
pub fn accumulate(tensor: impl Into<VarId>, indices: Vec<Expr>, value: Expr) -> Stmt {
    Stmt::TensorWrite {
        access: TensorAccess {
            tensor: tensor.into(),
            indices,
            position: None,
        },
        value,
        accumulate: true,
    }
}

pub fn index_var(name: &str, set: impl Into<SetId>) -> IndexVar {
    IndexVar::new(name, IndexDomain::Set(set.into()))
}

/// Indexed operand `tensor(i, j, ...)` of an index expression.
pub fn indexed(tensor: impl Into<VarId>, indices: &[&IndexVar]) -> Expr {
    Expr::Indexed(IndexedTensor {
        tensor: tensor.into(),
        indices: indices.iter().map(|i| (*i).clone()).collect(),
    })
}

/// Index expression `(free) body`.
pub fn index_expr(free: &[&IndexVar], body: Expr) -> Expr {
    Expr::Index(IndexExpr {
        free: free.iter().map(|i| (*i).clone()).collect(),
        body: Box::new(body),
    })
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Add, self, rhs)
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Sub, self, rhs)
    }
}

impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Mul, self, rhs)
    }
}

impl Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Div, self, rhs)
    }
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}
