//! IR types
//!
//! These types represent a typed graph tensor program before and after
//! lowering. The same node set covers both forms: high-level nodes
//! (assemblies, index expressions, symbolic tensor accesses) are rewritten
//! by the lowering passes into loop and memory nodes (element loops,
//! pattern loops, loads and stores).
//!
//! # Overview
//!
//! - [`Func`] - one function: declared sets, variables and a statement body
//! - [`Type`] / [`TensorType`] - value types, tensors indexed by sets
//! - [`Expr`] / [`Stmt`] - expression and statement trees
//! - [`PatternRef`] / [`TopologyRef`] - compile-time names of sparsity
//!   patterns, resolved to concrete arrays only at execution

use std::fmt;

use indexmap::IndexMap;

use weft_foundation::{BlockShape, FieldId, FuncId, SearchStrategy, SetId, VarId};

// ============================================================================
// Types
// ============================================================================

/// Extent of one tensor dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexDomain {
    /// Ranges over the elements of a set; extent known at execution.
    Set(SetId),
    /// Compile-time extent.
    Dense(usize),
}

impl fmt::Display for IndexDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexDomain::Set(set) => write!(f, "{set}"),
            IndexDomain::Dense(n) => write!(f, "{n}"),
        }
    }
}

/// A system-scale tensor: outer dimensions over sets, one block per index tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    /// Outer dimensions (rank 0, 1 or 2)
    pub dims: Vec<IndexDomain>,
    /// Block stored at each index tuple
    pub block: BlockShape,
}

impl TensorType {
    /// Rank-0 tensor (a single block).
    pub fn scalar(block: BlockShape) -> Self {
        Self {
            dims: Vec::new(),
            block,
        }
    }

    /// Rank-1 tensor over a set.
    pub fn vector(set: impl Into<SetId>, block: BlockShape) -> Self {
        Self {
            dims: vec![IndexDomain::Set(set.into())],
            block,
        }
    }

    /// Rank-2 tensor over two sets.
    pub fn matrix(rows: impl Into<SetId>, cols: impl Into<SetId>, block: BlockShape) -> Self {
        Self {
            dims: vec![IndexDomain::Set(rows.into()), IndexDomain::Set(cols.into())],
            block,
        }
    }

    /// Number of outer dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

/// Type of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Float block (scalar, vector or matrix).
    Block(BlockShape),
    /// Integer, used for element indices, loop counters and offsets.
    Int,
    /// Boolean.
    Bool,
    /// System-scale tensor.
    Tensor(TensorType),
    /// An element of the given set, bound by an assembly kernel.
    Element(SetId),
    /// The endpoint tuple of an element of the given relation set.
    Endpoints(SetId),
}

impl Type {
    /// Float scalar.
    pub fn float() -> Self {
        Type::Block(BlockShape::Scalar)
    }

    /// Tensor type, if this is one.
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Block(b) => write!(f, "{b}"),
            Type::Int => write!(f, "int"),
            Type::Bool => write!(f, "bool"),
            Type::Tensor(t) => {
                write!(f, "tensor[")?;
                for (i, d) in t.dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]({})", t.block)
            }
            Type::Element(set) => write!(f, "element({set})"),
            Type::Endpoints(set) => write!(f, "endpoints({set})"),
        }
    }
}

/// A typed variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub id: VarId,
    pub ty: Type,
}

impl Var {
    pub fn new(id: impl Into<VarId>, ty: Type) -> Self {
        Self { id: id.into(), ty }
    }
}

// ============================================================================
// Sets
// ============================================================================

/// Type of a per-element field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Float block per element.
    Float(BlockShape),
    /// Boolean flag per element (boundary markers).
    Bool,
}

/// Endpoint declaration of a relation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDecl {
    /// Set the endpoints index into
    pub set: SetId,
    /// Endpoints per element (1 for subsets)
    pub arity: usize,
}

/// Declaration of a set visible to a function.
#[derive(Debug, Clone, PartialEq)]
pub struct SetDecl {
    pub id: SetId,
    /// `Some` for relation sets (edges, neighbours, subsets)
    pub endpoints: Option<EndpointDecl>,
    /// Declared fields, in declaration order
    pub fields: IndexMap<FieldId, FieldType>,
}

impl SetDecl {
    /// A plain set with no endpoints.
    pub fn new(id: impl Into<SetId>) -> Self {
        Self {
            id: id.into(),
            endpoints: None,
            fields: IndexMap::new(),
        }
    }

    /// A relation whose elements connect `arity` elements of `endpoint_set`.
    pub fn relation(id: impl Into<SetId>, endpoint_set: impl Into<SetId>, arity: usize) -> Self {
        Self {
            id: id.into(),
            endpoints: Some(EndpointDecl {
                set: endpoint_set.into(),
                arity,
            }),
            fields: IndexMap::new(),
        }
    }

    /// Declare a field.
    pub fn with_field(mut self, field: impl Into<FieldId>, ty: FieldType) -> Self {
        self.fields.insert(field.into(), ty);
        self
    }

    /// True for relation sets.
    pub fn is_relation(&self) -> bool {
        self.endpoints.is_some()
    }
}

// ============================================================================
// Functions
// ============================================================================

/// A function: the unit of lowering.
#[derive(Debug, Clone, PartialEq)]
pub struct Func {
    pub id: FuncId,
    /// Sets the function is bound against, in declaration order
    pub sets: IndexMap<SetId, SetDecl>,
    /// Scalar parameters supplied by the caller
    pub params: Vec<Var>,
    /// Function-level variables
    pub locals: Vec<Var>,
    /// Variables whose final values are returned to the caller
    pub results: Vec<Var>,
    pub body: Vec<Stmt>,
}

impl Func {
    /// All declared variables: parameters, locals, then results.
    pub fn variables(&self) -> impl Iterator<Item = &Var> {
        self.params
            .iter()
            .chain(self.locals.iter())
            .chain(self.results.iter())
    }

    /// Declared type of a variable.
    pub fn var_type(&self, id: &VarId) -> Option<&Type> {
        self.variables().find(|v| &v.id == id).map(|v| &v.ty)
    }

    /// Declared tensor type of a variable.
    pub fn tensor_type(&self, id: &VarId) -> Option<&TensorType> {
        self.var_type(id).and_then(Type::as_tensor)
    }

    /// Declaration of a set.
    pub fn set(&self, id: &SetId) -> Option<&SetDecl> {
        self.sets.get(id)
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Literal values.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Float(f64),
    Int(i64),
    Bool(bool),
    /// Vector or matrix constant, row-major.
    Block(BlockShape, Vec<f64>),
}

/// Binary operators over blocks and integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// An index variable of an index expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexVar {
    pub name: String,
    pub domain: IndexDomain,
}

impl IndexVar {
    pub fn new(name: impl Into<String>, domain: IndexDomain) -> Self {
        Self {
            name: name.into(),
            domain,
        }
    }
}

/// A tensor operand of an index expression, e.g. `A(i,j)`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedTensor {
    pub tensor: VarId,
    pub indices: Vec<IndexVar>,
}

/// A tensor-algebra expression: free indices name the result dimensions,
/// every other index in the body is summed.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexExpr {
    pub free: Vec<IndexVar>,
    pub body: Box<Expr>,
}

/// A symbolic element access `tensor(indices)`.
///
/// `position` is set when the access is known to hit a specific entry of
/// the tensor's sparsity pattern (the position variable of an enclosing
/// pattern loop).
#[derive(Debug, Clone, PartialEq)]
pub struct TensorAccess {
    pub tensor: VarId,
    pub indices: Vec<Expr>,
    pub position: Option<VarId>,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Var(VarId),

    // --- assembly kernel forms ---
    /// Endpoint `slot` of the kernel's current element.
    Endpoint { endpoints: VarId, slot: usize },
    /// Field of the kernel's current element.
    ElementField { element: VarId, field: FieldId },

    // --- lowered element forms ---
    /// Endpoint `slot` of an element of a relation set, via its topology.
    EndpointOf {
        set: SetId,
        element: Box<Expr>,
        slot: usize,
    },
    /// Field value of one element.
    FieldLoad {
        set: SetId,
        field: FieldId,
        element: Box<Expr>,
    },
    /// Whole field as a rank-1 tensor over its set.
    Field { set: SetId, field: FieldId },

    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Neg(Box<Expr>),

    // --- tensor algebra ---
    Index(IndexExpr),
    Indexed(IndexedTensor),
    TensorRead(TensorAccess),

    // --- memory forms ---
    /// Number of elements of a set.
    SetSize(SetId),
    /// Position of `(row, col)` in a sparsity pattern; misses produce no position.
    Locate {
        pattern: PatternRef,
        row: Box<Expr>,
        col: Box<Expr>,
        search: SearchStrategy,
    },
    /// Dense block read at a float offset.
    Load {
        buffer: VarId,
        offset: Box<Expr>,
        block: BlockShape,
    },
    /// Sparse block read at a pattern position; a miss reads zero.
    SparseLoad {
        buffer: VarId,
        position: Box<Expr>,
        block: BlockShape,
    },
}

impl Expr {
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Visit this expression and all sub-expressions, parents first.
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::EndpointOf { element, .. } | Expr::FieldLoad { element, .. } => element.walk(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Neg(inner) => inner.walk(f),
            Expr::Index(ie) => ie.body.walk(f),
            Expr::TensorRead(access) => access.indices.iter().for_each(|e| e.walk(f)),
            Expr::Locate { row, col, .. } => {
                row.walk(f);
                col.walk(f);
            }
            Expr::Load { offset, .. } => offset.walk(f),
            Expr::SparseLoad { position, .. } => position.walk(f),
            Expr::Literal(_)
            | Expr::Var(_)
            | Expr::Endpoint { .. }
            | Expr::ElementField { .. }
            | Expr::Field { .. }
            | Expr::Indexed(_)
            | Expr::SetSize(_) => {}
        }
    }

    /// True if any sub-expression satisfies `pred`.
    pub fn any(&self, mut pred: impl FnMut(&Expr) -> bool) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= pred(e));
        found
    }
}

// ============================================================================
// Statements
// ============================================================================

/// Reduction operator of an assembly. Only sums are reorder-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReductionOp {
    #[default]
    Sum,
}

/// Per-element body of an assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    /// Current element, of type `Element(set)`
    pub element: Var,
    /// Endpoint tuple of the current element, for relation sets
    pub endpoints: Option<Var>,
    pub body: Vec<Stmt>,
}

/// Graph assembly: run the kernel once per element of `set` and sum every
/// contribution into the targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub targets: Vec<VarId>,
    pub set: SetId,
    pub kernel: Kernel,
    pub reduction: ReductionOp,
}

/// Boundary elimination of a direct solve.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryCondition {
    /// Governing set (rows of the system)
    pub set: SetId,
    /// Bool field marking fixed elements
    pub marker: FieldId,
    /// Rank-1 tensor holding the values of fixed unknowns
    pub values: VarId,
}

/// `matrix * result = rhs`, optionally with fixed unknowns eliminated.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectSolve {
    pub matrix: VarId,
    pub rhs: VarId,
    pub result: VarId,
    pub boundary: Option<BoundaryCondition>,
}

/// Block system `[[K, C^T], [C, D]] [x_p; x_d] = [f_p; f_d]`.
///
/// `coupling` is `C`, with rows on the derived set and columns on the
/// primary set. A missing `derived` block means `D = 0` (saddle point).
#[derive(Debug, Clone, PartialEq)]
pub struct SchurSolve {
    pub primary: VarId,
    pub coupling: VarId,
    pub derived: Option<VarId>,
    pub rhs_primary: VarId,
    pub rhs_derived: VarId,
    pub result_primary: VarId,
    pub result_derived: VarId,
}

/// Linear solves.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveStmt {
    Direct(DirectSolve),
    Schur(SchurSolve),
}

/// Statement tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Bind a local, or fill a tensor from a field or index expression.
    Assign { var: VarId, value: Expr },
    /// `var += value` on a local or register.
    Accumulate { var: VarId, value: Expr },
    /// Symbolic element write.
    TensorWrite {
        access: TensorAccess,
        value: Expr,
        accumulate: bool,
    },
    Assemble(Assembly),

    // --- loops ---
    /// Every element of a set, in topology insertion order.
    ForElements {
        set: SetId,
        element: VarId,
        body: Vec<Stmt>,
    },
    /// `0..extent`.
    ForRange {
        var: VarId,
        extent: IndexDomain,
        body: Vec<Stmt>,
    },
    /// Every stored entry of a pattern, row-major.
    ForPattern {
        pattern: PatternRef,
        row: VarId,
        col: VarId,
        position: VarId,
        body: Vec<Stmt>,
    },
    /// Stored entries of one pattern row, ascending columns.
    ForRow {
        pattern: PatternRef,
        row: Expr,
        col: VarId,
        position: VarId,
        body: Vec<Stmt>,
    },
    /// Columns present in a row of both patterns, ascending.
    ForIntersect {
        left: PatternRef,
        right: PatternRef,
        left_row: Expr,
        right_row: Expr,
        col: VarId,
        left_position: VarId,
        right_position: VarId,
        body: Vec<Stmt>,
    },

    // --- storage ---
    /// Reset a tensor to the additive identity.
    Zero(VarId),
    /// Copy a rank-1 tensor into a field of its set.
    FieldWrite {
        set: SetId,
        field: FieldId,
        value: VarId,
    },
    Solve(SolveStmt),
    /// Dense block write at a float offset.
    Store {
        buffer: VarId,
        offset: Expr,
        value: Expr,
        accumulate: bool,
    },
    /// Sparse block write at a pattern position; a miss is fatal.
    SparseStore {
        buffer: VarId,
        position: Expr,
        value: Expr,
        accumulate: bool,
        block: BlockShape,
    },
}

impl Stmt {
    /// Nested statement bodies (loops and assembly kernels).
    pub fn children(&self) -> &[Stmt] {
        match self {
            Stmt::Assemble(a) => &a.kernel.body,
            Stmt::ForElements { body, .. }
            | Stmt::ForRange { body, .. }
            | Stmt::ForPattern { body, .. }
            | Stmt::ForRow { body, .. }
            | Stmt::ForIntersect { body, .. } => body,
            _ => &[],
        }
    }

    /// Expressions held directly by this statement (not by children).
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::Assign { value, .. } | Stmt::Accumulate { value, .. } => vec![value],
            Stmt::TensorWrite { access, value, .. } => {
                let mut exprs: Vec<&Expr> = access.indices.iter().collect();
                exprs.push(value);
                exprs
            }
            Stmt::ForRow { row, .. } => vec![row],
            Stmt::ForIntersect {
                left_row,
                right_row,
                ..
            } => vec![left_row, right_row],
            Stmt::Store { offset, value, .. } => vec![offset, value],
            Stmt::SparseStore {
                position, value, ..
            } => vec![position, value],
            Stmt::Assemble(_)
            | Stmt::ForElements { .. }
            | Stmt::ForRange { .. }
            | Stmt::ForPattern { .. }
            | Stmt::Zero(_)
            | Stmt::FieldWrite { .. }
            | Stmt::Solve(_) => Vec::new(),
        }
    }

    /// Visit this statement and all nested statements, parents first.
    pub fn walk(&self, f: &mut impl FnMut(&Stmt)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }
}

// ============================================================================
// Topology references
// ============================================================================

/// Compile-time name of a topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopologyRef {
    /// Endpoint tuples of a relation set.
    Relation(SetId),
    /// Identity connectivity of a set (diagonal pattern).
    Diagonal(SetId),
}

impl fmt::Display for TopologyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyRef::Relation(set) => write!(f, "relation({set})"),
            TopologyRef::Diagonal(set) => write!(f, "diagonal({set})"),
        }
    }
}

/// A sparsity pattern induced by a topology over a row and column set.
///
/// For `Relation(R)` with endpoints in `V`:
/// - rows `V`, cols `V` - square endpoint pattern (diagonal included)
/// - rows `R`, cols `V` - incidence pattern
/// - rows `V`, cols `R` - transposed incidence pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternRef {
    pub topology: TopologyRef,
    pub rows: SetId,
    pub cols: SetId,
}

impl PatternRef {
    /// Square pattern of a relation over its endpoint set.
    pub fn square(relation: impl Into<SetId>, endpoint_set: impl Into<SetId>) -> Self {
        let set = endpoint_set.into();
        Self {
            topology: TopologyRef::Relation(relation.into()),
            rows: set.clone(),
            cols: set,
        }
    }

    /// Diagonal pattern of a set.
    pub fn diagonal(set: impl Into<SetId>) -> Self {
        let set = set.into();
        Self {
            topology: TopologyRef::Diagonal(set.clone()),
            rows: set.clone(),
            cols: set,
        }
    }

    /// True if every entry of `self` is also an entry of `other`.
    ///
    /// Holds for equal patterns and for a diagonal inside any square
    /// relation pattern over the same set.
    pub fn is_subset_of(&self, other: &PatternRef) -> bool {
        if self == other {
            return true;
        }
        matches!(self.topology, TopologyRef::Diagonal(_))
            && other.rows == other.cols
            && self.rows == other.rows
            && self.cols == other.cols
    }
}

impl fmt::Display for PatternRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{},{}]", self.topology, self.rows, self.cols)
    }
}
