//! Caller-supplied data for one function invocation.
//!
//! [`Bindings`] hold the concrete sets a lowered function runs against:
//! element counts, endpoint tuples of relation sets, per-element fields and
//! scalar parameters. Element order is the order the caller supplies and is
//! preserved everywhere (loops, topologies, field layouts).
//!
//! # Example
//!
//! ```ignore
//! let bindings = Bindings::new()
//!     .with_set("V", SetData::new(3).with_flags("fixed", vec![true, false, false]))
//!     .with_set("E", SetData::relation(2, vec![0, 1, 1, 2]).with_scalars("a", vec![2.0, 1.0]))
//!     .with_param("alpha", Value::scalar(0.5));
//! ```

use indexmap::IndexMap;

use weft_foundation::{BlockShape, FieldId, SetId, VarId};
use weft_ir::{FieldType, Func};

use crate::error::{Error, Result};
use crate::value::Value;

/// Values of one field, one entry (or block) per element.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldData {
    /// Row-major blocks, `block.len()` floats per element.
    Float { block: BlockShape, values: Vec<f64> },
    Bool(Vec<bool>),
}

impl FieldData {
    pub fn scalars(values: Vec<f64>) -> Self {
        FieldData::Float {
            block: BlockShape::Scalar,
            values,
        }
    }

    /// Number of elements covered.
    pub fn element_count(&self) -> usize {
        match self {
            FieldData::Float { block, values } if !block.is_empty() => values.len() / block.len(),
            FieldData::Float { .. } => 0,
            FieldData::Bool(flags) => flags.len(),
        }
    }

    fn type_name(&self) -> String {
        match self {
            FieldData::Float { block, .. } => block.to_string(),
            FieldData::Bool(_) => "bool".to_string(),
        }
    }
}

/// Endpoint tuples of a relation set, `arity` entries per element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointData {
    pub arity: usize,
    pub tuples: Vec<usize>,
}

/// One bound set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SetData {
    len: usize,
    endpoints: Option<EndpointData>,
    fields: IndexMap<FieldId, FieldData>,
}

impl SetData {
    /// A plain set of `len` elements.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            endpoints: None,
            fields: IndexMap::new(),
        }
    }

    /// A relation set; its size is the number of tuples.
    pub fn relation(arity: usize, tuples: Vec<usize>) -> Self {
        let len = if arity == 0 { 0 } else { tuples.len() / arity };
        Self {
            len,
            endpoints: Some(EndpointData { arity, tuples }),
            fields: IndexMap::new(),
        }
    }

    /// A subset relation: element `d` is element `parents[d]` of the parent set.
    pub fn subset(parents: Vec<usize>) -> Self {
        Self::relation(1, parents)
    }

    pub fn with_field(mut self, field: impl Into<FieldId>, data: FieldData) -> Self {
        self.fields.insert(field.into(), data);
        self
    }

    pub fn with_scalars(self, field: impl Into<FieldId>, values: Vec<f64>) -> Self {
        self.with_field(field, FieldData::scalars(values))
    }

    pub fn with_blocks(self, field: impl Into<FieldId>, block: BlockShape, values: Vec<f64>) -> Self {
        self.with_field(field, FieldData::Float { block, values })
    }

    pub fn with_flags(self, field: impl Into<FieldId>, flags: Vec<bool>) -> Self {
        self.with_field(field, FieldData::Bool(flags))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn endpoints(&self) -> Option<&EndpointData> {
        self.endpoints.as_ref()
    }

    pub fn field(&self, field: &FieldId) -> Option<&FieldData> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&FieldId, &FieldData)> {
        self.fields.iter()
    }
}

/// All sets and parameters of one invocation.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    sets: IndexMap<SetId, SetData>,
    params: IndexMap<VarId, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(mut self, id: impl Into<SetId>, data: SetData) -> Self {
        self.bind_set(id, data);
        self
    }

    pub fn with_param(mut self, id: impl Into<VarId>, value: Value) -> Self {
        self.bind_param(id, value);
        self
    }

    pub fn bind_set(&mut self, id: impl Into<SetId>, data: SetData) {
        self.sets.insert(id.into(), data);
    }

    pub fn bind_param(&mut self, id: impl Into<VarId>, value: Value) {
        self.params.insert(id.into(), value);
    }

    pub fn set(&self, id: &SetId) -> Result<&SetData> {
        self.sets.get(id).ok_or_else(|| Error::UnboundSet(id.clone()))
    }

    pub fn param(&self, id: &VarId) -> Option<&Value> {
        self.params.get(id)
    }

    /// A bound field; missing fields are an error.
    pub fn field(&self, set: &SetId, field: &FieldId) -> Result<&FieldData> {
        self.set(set)?
            .field(field)
            .ok_or_else(|| Error::UnboundField {
                set: set.clone(),
                field: field.clone(),
            })
    }

    /// Replace (or add) a field of a bound set.
    pub(crate) fn store_field(&mut self, set: &SetId, field: FieldId, data: FieldData) -> Result<()> {
        let bound = self
            .sets
            .get_mut(set)
            .ok_or_else(|| Error::UnboundSet(set.clone()))?;
        bound.fields.insert(field, data);
        Ok(())
    }

    /// Check the bindings against a function's set and parameter declarations.
    ///
    /// Every declared set must be bound, relation sets with matching arity.
    /// Declared fields are optional, but a bound field must have the declared
    /// type and one entry per element.
    pub fn check(&self, func: &Func) -> Result<()> {
        for decl in func.sets.values() {
            let data = self.set(&decl.id)?;
            if let Some(endpoints) = &decl.endpoints {
                let bound = data.endpoints().ok_or_else(|| Error::BindingMismatch {
                    what: format!("endpoint arity of '{}'", decl.id),
                    expected: endpoints.arity,
                    found: 0,
                })?;
                if bound.arity != endpoints.arity {
                    return Err(Error::BindingMismatch {
                        what: format!("endpoint arity of '{}'", decl.id),
                        expected: endpoints.arity,
                        found: bound.arity,
                    });
                }
            }
            for (field, ty) in &decl.fields {
                let Some(bound) = data.field(field) else {
                    continue;
                };
                let type_ok = match (ty, bound) {
                    (FieldType::Float(expected), FieldData::Float { block, .. }) => expected == block,
                    (FieldType::Bool, FieldData::Bool(_)) => true,
                    _ => false,
                };
                if !type_ok {
                    return Err(Error::TypeMismatch {
                        context: format!("field '{}.{}'", decl.id, field),
                        expected: match ty {
                            FieldType::Float(block) => block.to_string(),
                            FieldType::Bool => "bool".to_string(),
                        },
                        found: bound.type_name(),
                    });
                }
                let complete = match bound {
                    FieldData::Float { block, values } => values.len() == data.len() * block.len(),
                    FieldData::Bool(flags) => flags.len() == data.len(),
                };
                if !complete {
                    return Err(Error::BindingMismatch {
                        what: format!("field '{}.{}'", decl.id, field),
                        expected: data.len(),
                        found: bound.element_count(),
                    });
                }
            }
        }
        for param in &func.params {
            if !self.params.contains_key(&param.id) {
                return Err(Error::UnboundVariable(param.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_ir::{SetDecl, Type, Var};

    fn func() -> Func {
        let mut sets = IndexMap::new();
        sets.insert(
            SetId::from("V"),
            SetDecl::new("V").with_field("fixed", FieldType::Bool),
        );
        sets.insert(
            SetId::from("E"),
            SetDecl::relation("E", "V", 2).with_field("a", FieldType::Float(BlockShape::Scalar)),
        );
        Func {
            id: "f".into(),
            sets,
            params: vec![Var::new("alpha", Type::float())],
            locals: Vec::new(),
            results: Vec::new(),
            body: Vec::new(),
        }
    }

    fn bindings() -> Bindings {
        Bindings::new()
            .with_set("V", SetData::new(3))
            .with_set(
                "E",
                SetData::relation(2, vec![0, 1, 1, 2]).with_scalars("a", vec![2.0, 1.0]),
            )
            .with_param("alpha", Value::scalar(1.0))
    }

    #[test]
    fn test_relation_len_from_tuples() {
        let e = SetData::relation(2, vec![0, 1, 1, 2]);
        assert_eq!(e.len(), 2);
        assert_eq!(SetData::subset(vec![0, 2]).len(), 2);
    }

    #[test]
    fn test_check_accepts_missing_optional_field() {
        bindings().check(&func()).unwrap();
    }

    #[test]
    fn test_check_rejects_unbound_set() {
        let b = Bindings::new().with_set("V", SetData::new(3));
        assert!(matches!(b.check(&func()), Err(Error::UnboundSet(s)) if s == "E"));
    }

    #[test]
    fn test_check_rejects_arity_mismatch() {
        let b = bindings().with_set("E", SetData::relation(3, vec![0, 1, 2]));
        assert!(matches!(b.check(&func()), Err(Error::BindingMismatch { .. })));
    }

    #[test]
    fn test_check_rejects_short_field() {
        let b = bindings().with_set(
            "E",
            SetData::relation(2, vec![0, 1, 1, 2]).with_scalars("a", vec![2.0]),
        );
        assert!(matches!(
            b.check(&func()),
            Err(Error::BindingMismatch { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn test_check_rejects_wrong_field_type() {
        let b = bindings().with_set("V", SetData::new(3).with_scalars("fixed", vec![0.0; 3]));
        assert!(matches!(b.check(&func()), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_check_rejects_missing_param() {
        let b = Bindings::new()
            .with_set("V", SetData::new(3))
            .with_set("E", SetData::relation(2, vec![0, 1]));
        assert!(matches!(b.check(&func()), Err(Error::UnboundVariable(_))));
    }
}
