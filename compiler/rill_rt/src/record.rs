//! Record values.
//!
//! Two distinct types: [`RecordValue`] is a complete record (every declared
//! field present, sorted by name), while [`PartialRecord`] holds only the
//! fields that were explicitly provided. The partial form exists solely as
//! the override argument of a module update; it is consumed immediately and
//! never stored inside another value, so the complete-record invariant is
//! never relaxed elsewhere.

use std::sync::Arc;

use rill_ir::Name;

use crate::Value;

/// A complete record value: sorted `(name, value)` pairs.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordValue {
    fields: Arc<[(Name, Value)]>,
}

impl RecordValue {
    /// Build from a field list; sorts by name. The caller guarantees the
    /// names are distinct and cover the record's declared shape.
    pub fn new(mut fields: Vec<(Name, Value)>) -> Self {
        fields.sort_by_key(|(name, _)| *name);
        Self {
            fields: fields.into(),
        }
    }

    pub fn fields(&self) -> &[(Name, Value)] {
        &self.fields
    }

    pub fn get(&self, name: Name) -> Option<&Value> {
        self.fields
            .binary_search_by_key(&name, |(n, _)| *n)
            .ok()
            .map(|i| &self.fields[i].1)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A partially populated record: only explicitly provided fields.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PartialRecord {
    fields: Vec<(Name, Value)>,
}

impl PartialRecord {
    pub fn new(mut fields: Vec<(Name, Value)>) -> Self {
        fields.sort_by_key(|(name, _)| *name);
        Self { fields }
    }

    /// The empty override (no fields provided).
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn get(&self, name: Name) -> Option<&Value> {
        self.fields
            .binary_search_by_key(&name, |(n, _)| *n)
            .ok()
            .map(|i| &self.fields[i].1)
    }

    pub fn fields(&self) -> &[(Name, Value)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
