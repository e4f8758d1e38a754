//! Equality-comparer service.
//!
//! Given a semantic item type, [`ComparerProvider::resolve`] returns the
//! entry points for comparing, hashing, and deduplicating values of that
//! type. Resolution happens once at codegen time and the chosen comparers
//! are embedded in the emitted instructions; the runtime never inspects
//! types to pick a comparison mode.
//!
//! Four modes over two axes. *Loose* folds text case (used when the
//! execution context is case-insensitive); *strict* makes null compare
//! unequal to everything, null included. An absent optional entry means
//! the type is not comparable under that mode: the loose pair exists only
//! for types that contain text, since folding is meaningless otherwise.

use std::hash::Hasher;

use rill_ir::Ty;
use rill_rt::{Comparer, Value};
use rustc_hash::FxHasher;

use crate::{CodegenError, CodegenResult};

/// Resolved comparer entry points for one item type.
#[derive(Copy, Clone, Debug)]
pub struct ComparerSet {
    /// Structural, case-sensitive; null equals null.
    pub default: Comparer,
    /// Case-sensitive; null equals nothing.
    pub strict: Option<Comparer>,
    /// Case-folding; null equals null.
    pub loose: Option<Comparer>,
    /// Case-folding; null equals nothing.
    pub strict_loose: Option<Comparer>,
}

/// Source of comparer sets, resolved per item type at codegen time.
pub trait ComparerProvider {
    /// Fails with [`CodegenError::NotComparable`] when the type has no
    /// meaningful equality at all (modules and anything containing them).
    fn resolve(&self, ty: &Ty) -> CodegenResult<ComparerSet>;
}

/// The stock provider.
pub struct StandardComparers;

const DEFAULT: Comparer = Comparer {
    name: "default",
    eq: eq_default,
    hash: hash_default,
};

const STRICT: Comparer = Comparer {
    name: "strict",
    eq: eq_strict,
    hash: hash_default,
};

const LOOSE: Comparer = Comparer {
    name: "loose",
    eq: eq_loose,
    hash: hash_loose,
};

const STRICT_LOOSE: Comparer = Comparer {
    name: "strict-loose",
    eq: eq_strict_loose,
    hash: hash_loose,
};

impl ComparerProvider for StandardComparers {
    fn resolve(&self, ty: &Ty) -> CodegenResult<ComparerSet> {
        if !is_comparable(ty) {
            return Err(CodegenError::NotComparable { ty: ty.to_string() });
        }
        let text = contains_text(ty);
        Ok(ComparerSet {
            default: DEFAULT,
            strict: Some(STRICT),
            loose: text.then_some(LOOSE),
            strict_loose: text.then_some(STRICT_LOOSE),
        })
    }
}

fn is_comparable(ty: &Ty) -> bool {
    match ty {
        Ty::Null | Ty::Bool | Ty::Int | Ty::Float | Ty::Text => true,
        Ty::Seq(item) => is_comparable(item),
        Ty::Tuple(items) => items.iter().all(is_comparable),
        Ty::Record(shape) => shape.fields().iter().all(|(_, ty)| is_comparable(ty)),
        Ty::Module(_) => false,
    }
}

fn contains_text(ty: &Ty) -> bool {
    match ty {
        Ty::Text => true,
        Ty::Null | Ty::Bool | Ty::Int | Ty::Float | Ty::Module(_) => false,
        Ty::Seq(item) => contains_text(item),
        Ty::Tuple(items) => items.iter().any(contains_text),
        Ty::Record(shape) => shape.fields().iter().any(|(_, ty)| contains_text(ty)),
    }
}

fn eq_default(a: &Value, b: &Value) -> bool {
    a == b
}

fn eq_strict(a: &Value, b: &Value) -> bool {
    if matches!(a, Value::Null) || matches!(b, Value::Null) {
        return false;
    }
    a == b
}

/// Structural equality with case-folded text, applied through aggregates.
fn eq_loose(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Text(a), Value::Text(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Seq(a), Value::Seq(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| eq_loose(a, b))
        }
        (Value::Record(a), Value::Record(b)) => {
            a.len() == b.len()
                && a.fields()
                    .iter()
                    .zip(b.fields().iter())
                    .all(|((an, av), (bn, bv))| an == bn && eq_loose(av, bv))
        }
        _ => a == b,
    }
}

fn eq_strict_loose(a: &Value, b: &Value) -> bool {
    if matches!(a, Value::Null) || matches!(b, Value::Null) {
        return false;
    }
    eq_loose(a, b)
}

fn hash_default(value: &Value) -> u64 {
    let mut hasher = FxHasher::default();
    hash_value(value, &mut hasher, false);
    hasher.finish()
}

fn hash_loose(value: &Value) -> u64 {
    let mut hasher = FxHasher::default();
    hash_value(value, &mut hasher, true);
    hasher.finish()
}

/// Structural hash consistent with the corresponding `eq`: equal values
/// hash equal. Floats hash by bit pattern with negative zero normalized;
/// NaN never compares equal, so its hash is irrelevant.
fn hash_value(value: &Value, hasher: &mut FxHasher, fold_case: bool) {
    match value {
        Value::Null => hasher.write_u8(0),
        Value::Bool(b) => {
            hasher.write_u8(1);
            hasher.write_u8(u8::from(*b));
        }
        Value::Int(n) => {
            hasher.write_u8(2);
            hasher.write_i64(*n);
        }
        Value::Float(f) => {
            hasher.write_u8(3);
            let f = if *f == 0.0 { 0.0 } else { *f };
            hasher.write_u64(f.to_bits());
        }
        Value::Text(s) => {
            hasher.write_u8(4);
            if fold_case {
                hasher.write(s.to_lowercase().as_bytes());
            } else {
                hasher.write(s.as_bytes());
            }
        }
        Value::Seq(items) | Value::Tuple(items) => {
            hasher.write_u8(5);
            hasher.write_usize(items.len());
            for item in items.iter() {
                hash_value(item, hasher, fold_case);
            }
        }
        Value::Flags(bits) => {
            hasher.write_u8(6);
            for bit in bits.iter() {
                hasher.write_u8(u8::from(*bit));
            }
        }
        Value::Record(rec) => {
            hasher.write_u8(7);
            for (name, value) in rec.fields() {
                hasher.write_u32(name.raw());
                hash_value(value, hasher, fold_case);
            }
        }
        Value::Partial(partial) => {
            hasher.write_u8(8);
            for (name, value) in partial.fields() {
                hasher.write_u32(name.raw());
                hash_value(value, hasher, fold_case);
            }
        }
        // Identity-compared values; resolution refuses their types, so
        // they only reach a comparer through a codegen bug. A constant
        // hash keeps `hash` consistent with `eq` regardless.
        Value::Closure(_) | Value::Module(_) | Value::Ctx(_) => hasher.write_u8(9),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loose_pair_present_only_for_text_bearing_types() {
        let set = StandardComparers.resolve(&Ty::Int).expect("resolve");
        assert!(set.strict.is_some());
        assert!(set.loose.is_none());
        assert!(set.strict_loose.is_none());

        let set = StandardComparers
            .resolve(&Ty::seq(Ty::Text))
            .expect("resolve");
        assert!(set.loose.is_some());
        assert!(set.strict_loose.is_some());
    }

    #[test]
    fn module_types_are_not_comparable() {
        let shape = rill_ir::RecordTy::new(vec![]);
        let ty = Ty::Module(std::sync::Arc::new(shape));
        let err = StandardComparers.resolve(&ty).expect_err("must fail");
        assert!(matches!(err, CodegenError::NotComparable { .. }));
    }

    #[test]
    fn loose_folds_case_and_hashes_consistently() {
        let a = Value::text("Hello");
        let b = Value::text("hELLO");
        assert!(!eq_default(&a, &b));
        assert!(eq_loose(&a, &b));
        assert_eq!(hash_loose(&a), hash_loose(&b));
    }

    #[test]
    fn loose_reaches_through_aggregates() {
        let a = Value::seq(vec![Value::text("A"), Value::Int(1)]);
        let b = Value::seq(vec![Value::text("a"), Value::Int(1)]);
        assert!(eq_loose(&a, &b));
        assert_eq!(hash_loose(&a), hash_loose(&b));
    }

    #[test]
    fn strict_null_equals_nothing() {
        assert!(eq_default(&Value::Null, &Value::Null));
        assert!(!eq_strict(&Value::Null, &Value::Null));
        assert!(!eq_strict_loose(&Value::Null, &Value::text("x")));
    }

    #[test]
    fn zero_signs_hash_alike() {
        let pos = Value::Float(0.0);
        let neg = Value::Float(-0.0);
        assert!(eq_default(&pos, &neg));
        assert_eq!(hash_default(&pos), hash_default(&neg));
    }
}
