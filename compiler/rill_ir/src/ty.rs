//! Semantic types of bound-graph nodes.
//!
//! The binder/type checker is out of scope; the backend only needs
//! structural types with cheap equality, for the repeated-global
//! consistency check, comparer resolution, and routine signatures.

use std::fmt;
use std::sync::Arc;

use crate::Name;

/// A record type: sorted, deduplicated `(name, type)` field list.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RecordTy {
    fields: Vec<(Name, Ty)>,
}

impl RecordTy {
    /// Build a record type from a field list. Fields are sorted by name;
    /// a duplicated field name keeps the first occurrence.
    pub fn new(mut fields: Vec<(Name, Ty)>) -> Self {
        fields.sort_by_key(|(name, _)| *name);
        fields.dedup_by_key(|(name, _)| *name);
        Self { fields }
    }

    /// Fields in sorted order.
    pub fn fields(&self) -> &[(Name, Ty)] {
        &self.fields
    }

    /// Ordinal of a field within the sorted list, if present.
    pub fn field_index(&self, name: Name) -> Option<usize> {
        self.fields.binary_search_by_key(&name, |(n, _)| *n).ok()
    }

    /// Type of a named field, if present.
    pub fn field_ty(&self, name: Name) -> Option<&Ty> {
        self.field_index(name).map(|i| &self.fields[i].1)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Semantic type of a bound-graph node.
///
/// Structural: two `Ty` values are equal iff they describe the same shape.
/// Aggregate payloads are `Arc`-shared so cloning a type is cheap.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Ty {
    /// The null/unit type (e.g. a missing override record).
    Null,
    Bool,
    Int,
    Float,
    Text,
    /// Homogeneous sequence.
    Seq(Arc<Ty>),
    /// Positional tuple; synthesized by the backend for capture tuples and
    /// items-in-progress tuples, never produced by the binder.
    Tuple(Arc<[Ty]>),
    /// Complete record.
    Record(Arc<RecordTy>),
    /// Module whose evaluated record has the given shape.
    Module(Arc<RecordTy>),
}

impl Ty {
    /// Convenience constructor for sequence types.
    pub fn seq(item: Ty) -> Ty {
        Ty::Seq(Arc::new(item))
    }

    /// Convenience constructor for record types.
    pub fn record(fields: Vec<(Name, Ty)>) -> Ty {
        Ty::Record(Arc::new(RecordTy::new(fields)))
    }

    /// Convenience constructor for tuple types.
    pub fn tuple(items: Vec<Ty>) -> Ty {
        Ty::Tuple(items.into())
    }

    /// Item type if this is a sequence.
    pub fn seq_item(&self) -> Option<&Ty> {
        match self {
            Ty::Seq(item) => Some(item),
            _ => None,
        }
    }

    /// Record shape if this is a record or module type.
    pub fn record_shape(&self) -> Option<&RecordTy> {
        match self {
            Ty::Record(shape) | Ty::Module(shape) => Some(shape),
            _ => None,
        }
    }

    /// Whether values of this type are numeric (summable).
    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Float)
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Null => write!(f, "null"),
            Ty::Bool => write!(f, "bool"),
            Ty::Int => write!(f, "int"),
            Ty::Float => write!(f, "float"),
            Ty::Text => write!(f, "text"),
            Ty::Seq(item) => write!(f, "seq<{item}>"),
            Ty::Tuple(items) => write!(f, "tuple[{}]", items.len()),
            Ty::Record(shape) => write!(f, "record[{}]", shape.len()),
            Ty::Module(shape) => write!(f, "module[{}]", shape.len()),
        }
    }
}
