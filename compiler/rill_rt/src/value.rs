//! Runtime values.

use std::fmt;
use std::sync::Arc;

use crate::exec::EntryPoint;
use crate::module::ModuleValue;
use crate::record::{PartialRecord, RecordValue};
use crate::{ExecCtx, ExecError, ExecResult};

/// A compiled sub-routine closed over specific outer values: a tagged pair
/// of entry point and capture tuple, passable and invocable like any value.
#[derive(Clone)]
pub struct ClosureValue {
    entry: EntryPoint,
    captures: Arc<[Value]>,
}

impl ClosureValue {
    pub fn new(entry: EntryPoint, captures: Arc<[Value]>) -> Self {
        Self { entry, captures }
    }

    pub fn entry(&self) -> &EntryPoint {
        &self.entry
    }

    /// The captured values, inspectable for testing.
    pub fn captures(&self) -> &[Value] {
        &self.captures
    }

    /// Invoke with explicit arguments; captures are appended after them,
    /// matching the boundary-routine parameter convention.
    pub fn invoke(&self, args: &[Value]) -> ExecResult<Value> {
        let mut full = Vec::with_capacity(args.len() + self.captures.len());
        full.extend_from_slice(args);
        full.extend_from_slice(&self.captures);
        self.entry.invoke(&full)
    }
}

impl fmt::Debug for ClosureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClosureValue({}, {} captured)",
            self.entry.name(),
            self.captures.len()
        )
    }
}

/// A runtime value.
///
/// Aggregates are `Arc`-shared: cloning is cheap and finalized values are
/// safe to share across callers.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(Arc<str>),
    Seq(Arc<[Value]>),
    /// Positional tuple (capture tuples, items-in-progress tuples).
    Tuple(Arc<[Value]>),
    /// Bit-array (skip/take flags).
    Flags(Arc<[bool]>),
    Record(RecordValue),
    Partial(PartialRecord),
    Closure(ClosureValue),
    Module(ModuleValue),
    Ctx(Arc<ExecCtx>),
}

impl Value {
    pub fn text(s: impl Into<Arc<str>>) -> Value {
        Value::Text(s.into())
    }

    pub fn seq(items: Vec<Value>) -> Value {
        Value::Seq(items.into())
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(items.into())
    }

    pub fn flags(bits: Vec<bool>) -> Value {
        Value::Flags(bits.into())
    }

    /// Human-readable type name for error reporting.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Seq(_) => "seq",
            Value::Tuple(_) => "tuple",
            Value::Flags(_) => "flags",
            Value::Record(_) => "record",
            Value::Partial(_) => "partial record",
            Value::Closure(_) => "closure",
            Value::Module(_) => "module",
            Value::Ctx(_) => "execution context",
        }
    }

    fn mismatch(&self, expected: &'static str) -> ExecError {
        ExecError::TypeMismatch {
            expected,
            found: self.type_name(),
        }
    }

    pub fn as_bool(&self) -> ExecResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_int(&self) -> ExecResult<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn as_float(&self) -> ExecResult<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_text(&self) -> ExecResult<&str> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(other.mismatch("text")),
        }
    }

    pub fn as_seq(&self) -> ExecResult<&Arc<[Value]>> {
        match self {
            Value::Seq(items) => Ok(items),
            other => Err(other.mismatch("seq")),
        }
    }

    pub fn as_tuple(&self) -> ExecResult<&Arc<[Value]>> {
        match self {
            Value::Tuple(items) => Ok(items),
            other => Err(other.mismatch("tuple")),
        }
    }

    pub fn as_flags(&self) -> ExecResult<&Arc<[bool]>> {
        match self {
            Value::Flags(bits) => Ok(bits),
            other => Err(other.mismatch("flags")),
        }
    }

    pub fn as_record(&self) -> ExecResult<&RecordValue> {
        match self {
            Value::Record(rec) => Ok(rec),
            other => Err(other.mismatch("record")),
        }
    }

    pub fn as_closure(&self) -> ExecResult<&ClosureValue> {
        match self {
            Value::Closure(c) => Ok(c),
            other => Err(other.mismatch("closure")),
        }
    }

    pub fn as_module(&self) -> ExecResult<&ModuleValue> {
        match self {
            Value::Module(m) => Ok(m),
            other => Err(other.mismatch("module")),
        }
    }

    pub fn as_ctx(&self) -> ExecResult<&ExecCtx> {
        match self {
            Value::Ctx(ctx) => Ok(ctx),
            other => Err(other.mismatch("execution context")),
        }
    }
}

impl PartialEq for Value {
    /// Structural equality for data values; closures, modules, and
    /// contexts compare by identity (pointer) since they have no
    /// meaningful structural comparison.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) | (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Flags(a), Value::Flags(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Partial(a), Value::Partial(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => {
                a.entry.same_routine(&b.entry) && a.captures == b.captures
            }
            (Value::Module(a), Value::Module(b)) => a.same_value(b),
            (Value::Ctx(a), Value::Ctx(b)) => a == b,
            _ => false,
        }
    }
}

/// Equality/hash entry points for one comparison mode, resolved by the
/// equality-comparer service at codegen time and embedded in instructions.
///
/// Plain function pointers over `Value`: a capability table entry, not
/// runtime type inspection. `hash` must be consistent with `eq`.
#[derive(Copy, Clone)]
pub struct Comparer {
    pub name: &'static str,
    pub eq: fn(&Value, &Value) -> bool,
    pub hash: fn(&Value) -> u64,
}

impl fmt::Debug for Comparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comparer({})", self.name)
    }
}
