//! String interner for identifier storage.
//!
//! Provides O(1) interning and lookup. Interior mutability via a single
//! `RwLock` lets the interner be shared by reference between the graph
//! builder and the codegen backend without threading `&mut` everywhere.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::Name;

struct InternerState {
    /// Map from string content to index.
    map: FxHashMap<Box<str>, u32>,
    /// Storage for string contents, indexed by `Name`.
    strings: Vec<Box<str>>,
}

/// String interner.
///
/// O(1) lookup and equality comparison for interned strings. The backend
/// interns field names, symbol names, and global names; the set is small,
/// so a single map (no sharding) is sufficient.
pub struct StringInterner {
    state: RwLock<InternerState>,
}

impl StringInterner {
    /// Create a new interner with the empty string pre-interned as
    /// [`Name::EMPTY`].
    pub fn new() -> Self {
        let mut map = FxHashMap::default();
        map.insert(Box::from(""), 0);
        Self {
            state: RwLock::new(InternerState {
                map,
                strings: vec![Box::from("")],
            }),
        }
    }

    /// Intern a string, returning its `Name`.
    ///
    /// Interning the same content twice returns the same `Name`.
    pub fn intern(&self, s: &str) -> Name {
        {
            let state = self.state.read();
            if let Some(&idx) = state.map.get(s) {
                return Name::from_raw(idx);
            }
        }
        let mut state = self.state.write();
        // Re-check under the write lock: another caller may have interned
        // between the read release and the write acquire.
        if let Some(&idx) = state.map.get(s) {
            return Name::from_raw(idx);
        }
        let idx = u32::try_from(state.strings.len()).unwrap_or_else(|_| {
            // 4 billion distinct identifiers is out of scope for a bound
            // graph; treat as unreachable rather than plumbing a Result.
            unreachable!("interner capacity exceeded")
        });
        state.strings.push(Box::from(s));
        state.map.insert(Box::from(s), idx);
        Name::from_raw(idx)
    }

    /// Resolve a `Name` back to its string content.
    ///
    /// Returns an owned `String`; lookups happen on error paths and in
    /// tests, so the clone is not a concern.
    pub fn lookup(&self, name: Name) -> String {
        let state = self.state.read();
        state
            .strings
            .get(name.index())
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    /// Number of interned strings (including the pre-interned empty string).
    pub fn len(&self) -> usize {
        self.state.read().strings.len()
    }

    /// Whether the interner holds only the pre-interned empty string.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn intern_dedups() {
        let interner = StringInterner::new();
        let a = interner.intern("items");
        let b = interner.intern("items");
        assert_eq!(a, b);
        assert_eq!(interner.lookup(a), "items");
    }

    #[test]
    fn empty_is_preinterned() {
        let interner = StringInterner::new();
        assert_eq!(interner.intern(""), Name::EMPTY);
        assert!(interner.is_empty());
    }

    #[test]
    fn distinct_strings_distinct_names() {
        let interner = StringInterner::new();
        let a = interner.intern("a");
        let b = interner.intern("b");
        assert_ne!(a, b);
        assert_eq!(interner.lookup(b), "b");
    }
}
