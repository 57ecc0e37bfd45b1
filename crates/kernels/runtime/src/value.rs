//! Runtime values of the reference interpreter.
//!
//! Lowered code computes with float blocks (scalars, vectors, row-major
//! matrices), integers for element indices and offsets, and booleans for
//! markers. A [`Value::Miss`] is the result of a pattern search that found
//! no entry; sparse loads read it as a zero block and sparse stores reject it.

use std::fmt;

use nalgebra as na;

use weft_foundation::BlockShape;

use crate::error::{Error, Result};

/// A float block with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockValue {
    shape: BlockShape,
    data: Vec<f64>,
}

impl BlockValue {
    /// Wrap row-major data; its length must match the shape.
    pub fn new(shape: BlockShape, data: Vec<f64>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(Error::BindingMismatch {
                what: format!("{shape} block"),
                expected: shape.len(),
                found: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            shape: BlockShape::Scalar,
            data: vec![value],
        }
    }

    /// The additive identity of a shape.
    pub fn zeros(shape: BlockShape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.len()],
        }
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// The value of a scalar block.
    pub fn as_scalar(&self) -> Option<f64> {
        match self.shape {
            BlockShape::Scalar => self.data.first().copied(),
            _ => None,
        }
    }

    fn to_matrix(&self) -> na::DMatrix<f64> {
        na::DMatrix::from_row_slice(self.shape.rows(), self.shape.cols(), &self.data)
    }

    fn from_matrix(shape: BlockShape, matrix: &na::DMatrix<f64>) -> Self {
        let mut data = Vec::with_capacity(shape.len());
        for i in 0..matrix.nrows() {
            for j in 0..matrix.ncols() {
                data.push(matrix[(i, j)]);
            }
        }
        Self { shape, data }
    }

    fn scale(&self, factor: f64) -> Self {
        Self {
            shape: self.shape,
            data: self.data.iter().map(|v| v * factor).collect(),
        }
    }

    fn zip_with(&self, rhs: &BlockValue, op: &str, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        let shape = self
            .shape
            .sum(rhs.shape)
            .ok_or_else(|| mismatch(op, self.shape, rhs.shape))?;
        Ok(Self {
            shape,
            data: self
                .data
                .iter()
                .zip(&rhs.data)
                .map(|(a, b)| f(*a, *b))
                .collect(),
        })
    }

    pub fn add(&self, rhs: &BlockValue) -> Result<Self> {
        self.zip_with(rhs, "addition", |a, b| a + b)
    }

    pub fn sub(&self, rhs: &BlockValue) -> Result<Self> {
        self.zip_with(rhs, "subtraction", |a, b| a - b)
    }

    /// Blocked product: scaling, inner product, or matrix product.
    pub fn mul(&self, rhs: &BlockValue) -> Result<Self> {
        let shape = self
            .shape
            .product(rhs.shape)
            .ok_or_else(|| mismatch("multiplication", self.shape, rhs.shape))?;
        Ok(match (self.shape, rhs.shape) {
            (BlockShape::Scalar, _) => rhs.scale(self.data[0]),
            (_, BlockShape::Scalar) => self.scale(rhs.data[0]),
            (BlockShape::Vector(_), BlockShape::Vector(_)) => {
                let dot = self.data.iter().zip(&rhs.data).map(|(a, b)| a * b).sum();
                BlockValue::scalar(dot)
            }
            (BlockShape::Vector(_), BlockShape::Matrix(_, _)) => {
                let product = rhs.to_matrix().transpose() * self.to_matrix();
                BlockValue::from_matrix(shape, &product)
            }
            _ => BlockValue::from_matrix(shape, &(self.to_matrix() * rhs.to_matrix())),
        })
    }

    /// Division by a scalar block.
    pub fn div(&self, rhs: &BlockValue) -> Result<Self> {
        let divisor = rhs
            .as_scalar()
            .ok_or_else(|| mismatch("division", self.shape, rhs.shape))?;
        Ok(Self {
            shape: self.shape,
            data: self.data.iter().map(|v| v / divisor).collect(),
        })
    }

    pub fn neg(&self) -> Self {
        self.scale(-1.0)
    }
}

fn mismatch(op: &str, lhs: BlockShape, rhs: BlockShape) -> Error {
    Error::TypeMismatch {
        context: op.to_string(),
        expected: "conforming block shapes".to_string(),
        found: format!("{lhs} and {rhs}"),
    }
}

/// A value produced by evaluating a lowered expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Block(BlockValue),
    Int(i64),
    Bool(bool),
    /// Pattern search without a hit.
    Miss,
}

impl Value {
    pub fn scalar(value: f64) -> Self {
        Value::Block(BlockValue::scalar(value))
    }

    fn kind(&self) -> String {
        match self {
            Value::Block(b) => b.shape().to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Miss => "pattern miss".to_string(),
        }
    }

    fn expected(&self, context: &str, expected: &str) -> Error {
        Error::TypeMismatch {
            context: context.to_string(),
            expected: expected.to_string(),
            found: self.kind(),
        }
    }

    pub fn as_int(&self, context: &str) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(other.expected(context, "int")),
        }
    }

    /// A non-negative integer below `len`.
    pub fn as_index(&self, context: &str, len: usize) -> Result<usize> {
        let index = self.as_int(context)?;
        usize::try_from(index)
            .ok()
            .filter(|i| *i < len)
            .ok_or_else(|| Error::IndexOutOfBounds {
                what: context.to_string(),
                index,
                len,
            })
    }

    pub fn into_block(self, context: &str) -> Result<BlockValue> {
        match self {
            Value::Block(b) => Ok(b),
            other => Err(other.expected(context, "float block")),
        }
    }

    pub fn add(&self, rhs: &Value) -> Result<Value> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Block(a), Value::Block(b)) => Ok(Value::Block(a.add(b)?)),
            _ => Err(rhs.expected("addition", &self.kind())),
        }
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            (Value::Block(a), Value::Block(b)) => Ok(Value::Block(a.sub(b)?)),
            _ => Err(rhs.expected("subtraction", &self.kind())),
        }
    }

    pub fn mul(&self, rhs: &Value) -> Result<Value> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            (Value::Block(a), Value::Block(b)) => Ok(Value::Block(a.mul(b)?)),
            _ => Err(rhs.expected("multiplication", &self.kind())),
        }
    }

    pub fn div(&self, rhs: &Value) -> Result<Value> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_div(*b)
                .map(Value::Int)
                .ok_or_else(|| rhs.expected("integer division", "nonzero int")),
            (Value::Block(a), Value::Block(b)) => Ok(Value::Block(a.div(b)?)),
            _ => Err(rhs.expected("division", &self.kind())),
        }
    }

    pub fn neg(&self) -> Result<Value> {
        match self {
            Value::Int(a) => Ok(Value::Int(-a)),
            Value::Block(b) => Ok(Value::Block(b.neg())),
            other => Err(other.expected("negation", "int or float block")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Block(b) => write!(f, "{}{:?}", b.shape(), b.data()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Miss => write!(f, "miss"),
        }
    }
}
