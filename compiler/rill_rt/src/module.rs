//! Runtime module values.
//!
//! A module bundles a record together with the machinery to recompute or
//! partially update it: the generated items-setter and record-maker entry
//! points, the current items tuple, the static descriptor, and (when the
//! formulas reference free variables) the external-capture tuple.

use std::fmt;
use std::sync::Arc;

use rill_ir::Name;

use crate::exec::EntryPoint;
use crate::record::{PartialRecord, RecordValue};
use crate::{ExecError, ExecResult, Value};

/// Static description of a module construct, shared by every value
/// produced from the same compilation.
#[derive(Debug)]
pub struct ModuleDescriptor {
    /// Number of item slots.
    pub item_count: u32,
    /// Exported record fields: `(field name, item index)`.
    pub fields: Vec<(Name, u32)>,
    /// Publicly settable symbols: `(symbol name, item index)`.
    pub symbols: Vec<(Name, u32)>,
}

impl ModuleDescriptor {
    /// Item index of a settable symbol, if the name is one.
    pub fn symbol_item(&self, name: Name) -> Option<u32> {
        self.symbols
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, item)| *item)
    }

    /// Whether an item slot defines a settable symbol.
    pub fn item_is_settable(&self, item: u32) -> bool {
        self.symbols.iter().any(|(_, i)| *i == item)
    }
}

/// The immutable, generated parts of a module: both entry points plus the
/// descriptor. Stored once and shared by every value updated from the
/// original.
pub struct ModuleAssembly {
    /// `(skip-flags, take-flags, override record, items tuple,
    /// [externals]) → items tuple`
    pub setter: EntryPoint,
    /// `(items tuple) → record`
    pub maker: EntryPoint,
    pub descriptor: ModuleDescriptor,
    /// Whether the setter takes the external-capture tuple as a trailing
    /// parameter.
    pub has_externals: bool,
}

impl fmt::Debug for ModuleAssembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleAssembly")
            .field("setter", &self.setter.name())
            .field("maker", &self.maker.name())
            .field("items", &self.descriptor.item_count)
            .finish()
    }
}

/// A runtime module value.
///
/// Supports two operations: [`record`](ModuleValue::record) (idempotent
/// evaluation of the current items into a record) and
/// [`update`](ModuleValue::update) (produce a new module value with some
/// symbols overridden, sharing unmodified items). Update never mutates the
/// original; two updates from the same base are independent.
#[derive(Clone, Debug)]
pub struct ModuleValue {
    assembly: Arc<ModuleAssembly>,
    items: Arc<[Value]>,
    /// Read-only captured free-variable values (the externals tuple's
    /// payload); passed unchanged into every setter invocation.
    externals: Option<Arc<[Value]>>,
}

impl ModuleValue {
    pub fn new(
        assembly: Arc<ModuleAssembly>,
        items: Arc<[Value]>,
        externals: Option<Arc<[Value]>>,
    ) -> Self {
        Self {
            assembly,
            items,
            externals,
        }
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.assembly.descriptor
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Identity comparison: same assembly and same items storage.
    pub(crate) fn same_value(&self, other: &ModuleValue) -> bool {
        Arc::ptr_eq(&self.assembly, &other.assembly) && Arc::ptr_eq(&self.items, &other.items)
    }

    /// Evaluate the current record from the current items.
    pub fn record(&self) -> ExecResult<RecordValue> {
        let out = self
            .assembly
            .maker
            .invoke(&[Value::Tuple(Arc::clone(&self.items))])?;
        match out {
            Value::Record(rec) => Ok(rec),
            other => Err(ExecError::TypeMismatch {
                expected: "record",
                found: other.type_name(),
            }),
        }
    }

    /// Produce a new module value with the named symbols overridden.
    ///
    /// For each item slot: if it defines a symbol in `named`, its value is
    /// taken from `over`; if it defines a symbol *not* in `named`, the
    /// current value is kept (skip flag — the incremental-recompute path);
    /// otherwise its formula re-evaluates against the updated items.
    pub fn update(&self, over: &PartialRecord, named: &[Name]) -> ExecResult<ModuleValue> {
        let descriptor = &self.assembly.descriptor;
        let count = descriptor.item_count as usize;

        let mut takes = vec![false; count];
        for &name in named {
            let item = descriptor
                .symbol_item(name)
                .ok_or(ExecError::UnknownSymbol { symbol: name.raw() })?;
            takes[item as usize] = true;
        }

        let mut skips = vec![false; count];
        for &(_, item) in &descriptor.symbols {
            if !takes[item as usize] {
                skips[item as usize] = true;
            }
        }

        let mut args = vec![
            Value::flags(skips),
            Value::flags(takes),
            Value::Partial(over.clone()),
            Value::Tuple(Arc::clone(&self.items)),
        ];
        if self.assembly.has_externals {
            let ext = self
                .externals
                .as_ref()
                .ok_or(ExecError::Internal("module externals missing"))?;
            args.push(Value::Tuple(Arc::clone(ext)));
        }

        let items = self.assembly.setter.invoke(&args)?;
        let items = items.as_tuple()?.clone();
        Ok(ModuleValue {
            assembly: Arc::clone(&self.assembly),
            items,
            externals: self.externals.clone(),
        })
    }
}
