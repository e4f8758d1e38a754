//! Routine format and stack interpreter.
//!
//! A [`Routine`] is a frozen instruction stream with a fixed parameter and
//! local-slot count. [`EntryPoint`] is the shareable, invocable handle the
//! builder hands out at finalization; once finalized a routine is immutable
//! and safe to invoke concurrently from any number of callers.
//!
//! The instruction set covers exactly what the lowered constructs need:
//! loads/stores, constants, binary operators (context-sensitive variants
//! pop the execution context), comparer-driven equality, aggregate
//! construction and indexing, label-resolved jumps, direct and closure
//! calls, per-element sequence drivers, and module assembly/update.

use std::fmt;
use std::sync::Arc;

use rill_ir::{BinOp, Builtin, Name};
use rustc_hash::FxHashMap;

use crate::module::{ModuleAssembly, ModuleValue};
use crate::record::{PartialRecord, RecordValue};
use crate::value::{ClosureValue, Comparer};
use crate::{ExecCtx, ExecError, ExecResult, Value};

/// One instruction of a generated routine.
///
/// Jump targets are absolute instruction indices; the routine builder
/// resolves label handles to indices at finalization.
#[derive(Debug, Clone)]
pub enum Instr {
    /// Push a constant.
    Const(Value),
    /// Push parameter `n`.
    LoadArg(u32),
    /// Push local slot `n`.
    LoadLocal(u32),
    /// Pop into local slot `n`.
    StoreLocal(u32),
    Pop,
    /// Pops a bool; pushes its negation.
    Not,
    /// Pops right then left.
    Binary(BinOp),
    /// Pops context, right, left.
    BinaryCtx(BinOp),
    /// Pops right then left; pushes `eq(left, right)`.
    EqWith(Comparer),
    /// Pops the builtin's arguments (context last, for the
    /// context-sensitive call forms).
    CallBuiltin(Builtin),
    /// Pops a seq/tuple/flags value; pushes its element at a fixed index.
    Index(u32),
    /// Pops value then tuple; pushes a tuple with the slot replaced.
    TupleWith(u32),
    /// Pops `n` values (pushed left to right).
    MakeTuple(u32),
    /// Pops `n` values (pushed left to right).
    MakeSeq(u32),
    /// Pops one value per name (pushed in the given order).
    MakeRecord(Arc<[Name]>),
    /// Pops one value per name; builds a partial record. Produced only on
    /// the module-update path.
    MakePartial(Arc<[Name]>),
    /// Pops a record or partial record; pushes the named field.
    FieldGet(Name),
    Jump(u32),
    /// Pops a bool.
    JumpIfFalse(u32),
    /// Pops a bool.
    JumpIfTrue(u32),
    /// Pops the result and returns it.
    Return,
    /// Pops `argc` values (pushed left to right); pushes the result.
    CallEntry { entry: EntryPoint, argc: u32 },
    /// Pops `captures` values into the closure's capture tuple.
    MakeClosure { entry: EntryPoint, captures: u32 },
    /// Pops `argc` explicit arguments then the closure.
    CallClosure { argc: u32 },
    /// Pops the sequence, then `extra` trailing arguments; invokes `body`
    /// once per element as `(element, extras...)`; pushes the result seq.
    MapSeq { body: EntryPoint, extra: u32 },
    /// Like `MapSeq`, keeping elements for which `body` returns true.
    FilterSeq { body: EntryPoint, extra: u32 },
    /// Like `MapSeq`, summing the numeric results.
    SumSeq { body: EntryPoint, extra: u32 },
    /// Pops the context then the sequence; pushes the distinct elements
    /// under the context's case mode, first occurrence order preserved.
    DistinctSeq {
        strict: Comparer,
        loose: Option<Comparer>,
    },
    /// Pops the externals tuple (when the assembly has one) then the items
    /// tuple; pushes the assembled module value.
    MakeModule { assembly: Arc<ModuleAssembly> },
    /// Pops the override partial record then the module; pushes the
    /// updated module.
    ModuleUpdate { names: Arc<[Name]> },
    /// Pops a record then the module; every field of the record overrides.
    ModuleUpdateRecord,
}

/// A finalized routine: name, arity, local-slot count, instructions.
pub struct Routine {
    name: String,
    params: usize,
    locals: usize,
    instrs: Box<[Instr]>,
}

impl Routine {
    pub fn new(name: String, params: usize, locals: usize, instrs: Vec<Instr>) -> Self {
        Self {
            name,
            params,
            locals,
            instrs: instrs.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> usize {
        self.params
    }

    pub fn locals(&self) -> usize {
        self.locals
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("locals", &self.locals)
            .field("instrs", &self.instrs.len())
            .finish()
    }
}

/// Invocable handle to a finalized routine.
#[derive(Clone)]
pub struct EntryPoint(Arc<Routine>);

impl EntryPoint {
    pub fn new(routine: Routine) -> Self {
        EntryPoint(Arc::new(routine))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn routine(&self) -> &Routine {
        &self.0
    }

    pub(crate) fn same_routine(&self, other: &EntryPoint) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Invoke the routine with positional arguments.
    pub fn invoke(&self, args: &[Value]) -> ExecResult<Value> {
        if args.len() != self.0.params {
            return Err(ExecError::ArityMismatch {
                routine: self.0.name.clone(),
                expected: self.0.params,
                found: args.len(),
            });
        }
        run(&self.0, args)
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryPoint({})", self.0.name)
    }
}

fn pop(stack: &mut Vec<Value>) -> ExecResult<Value> {
    stack.pop().ok_or(ExecError::Internal("operand stack underflow"))
}

/// Pop `n` values pushed left to right, restoring their push order.
fn pop_n(stack: &mut Vec<Value>, n: usize) -> ExecResult<Vec<Value>> {
    if stack.len() < n {
        return Err(ExecError::Internal("operand stack underflow"));
    }
    Ok(stack.split_off(stack.len() - n))
}

/// Execute a routine against its arguments.
fn run(routine: &Routine, args: &[Value]) -> ExecResult<Value> {
    let instrs = routine.instrs();
    let mut stack: Vec<Value> = Vec::with_capacity(16);
    let mut locals = vec![Value::Null; routine.locals];
    let mut pc = 0usize;

    while pc < instrs.len() {
        match &instrs[pc] {
            Instr::Const(value) => stack.push(value.clone()),
            Instr::LoadArg(n) => stack.push(
                args.get(*n as usize)
                    .cloned()
                    .ok_or(ExecError::Internal("argument index out of range"))?,
            ),
            Instr::LoadLocal(n) => stack.push(
                locals
                    .get(*n as usize)
                    .cloned()
                    .ok_or(ExecError::Internal("local index out of range"))?,
            ),
            Instr::StoreLocal(n) => {
                let value = pop(&mut stack)?;
                let slot = locals
                    .get_mut(*n as usize)
                    .ok_or(ExecError::Internal("local index out of range"))?;
                *slot = value;
            }
            Instr::Pop => {
                pop(&mut stack)?;
            }
            Instr::Not => {
                let value = pop(&mut stack)?.as_bool()?;
                stack.push(Value::Bool(!value));
            }
            Instr::Binary(op) => {
                let right = pop(&mut stack)?;
                let left = pop(&mut stack)?;
                stack.push(eval_binary(*op, &left, &right)?);
            }
            Instr::BinaryCtx(op) => {
                let ctx = pop(&mut stack)?;
                let right = pop(&mut stack)?;
                let left = pop(&mut stack)?;
                stack.push(eval_binary_ctx(*op, &left, &right, ctx.as_ctx()?)?);
            }
            Instr::EqWith(cmp) => {
                let right = pop(&mut stack)?;
                let left = pop(&mut stack)?;
                stack.push(Value::Bool((cmp.eq)(&left, &right)));
            }
            Instr::CallBuiltin(func) => {
                let result = eval_builtin(*func, &mut stack)?;
                stack.push(result);
            }
            Instr::Index(i) => {
                let value = pop(&mut stack)?;
                let i = *i as usize;
                let element = match &value {
                    Value::Seq(items) | Value::Tuple(items) => items.get(i).cloned(),
                    Value::Flags(bits) => bits.get(i).copied().map(Value::Bool),
                    other => {
                        return Err(ExecError::TypeMismatch {
                            expected: "seq, tuple, or flags",
                            found: other.type_name(),
                        })
                    }
                };
                stack.push(element.ok_or(ExecError::Internal("index out of range"))?);
            }
            Instr::TupleWith(i) => {
                let value = pop(&mut stack)?;
                let tuple = pop(&mut stack)?;
                let items = tuple.as_tuple()?;
                let mut items: Vec<Value> = items.to_vec();
                let slot = items
                    .get_mut(*i as usize)
                    .ok_or(ExecError::Internal("tuple slot out of range"))?;
                *slot = value;
                stack.push(Value::tuple(items));
            }
            Instr::MakeTuple(n) => {
                let items = pop_n(&mut stack, *n as usize)?;
                stack.push(Value::tuple(items));
            }
            Instr::MakeSeq(n) => {
                let items = pop_n(&mut stack, *n as usize)?;
                stack.push(Value::seq(items));
            }
            Instr::MakeRecord(names) => {
                let values = pop_n(&mut stack, names.len())?;
                let fields = names.iter().copied().zip(values).collect();
                stack.push(Value::Record(RecordValue::new(fields)));
            }
            Instr::MakePartial(names) => {
                let values = pop_n(&mut stack, names.len())?;
                let fields = names.iter().copied().zip(values).collect();
                stack.push(Value::Partial(PartialRecord::new(fields)));
            }
            Instr::FieldGet(name) => {
                let value = pop(&mut stack)?;
                let field = match &value {
                    Value::Record(rec) => rec.get(*name).cloned(),
                    Value::Partial(partial) => partial.get(*name).cloned(),
                    other => {
                        return Err(ExecError::TypeMismatch {
                            expected: "record",
                            found: other.type_name(),
                        })
                    }
                };
                stack.push(field.ok_or(ExecError::MissingField { field: name.raw() })?);
            }
            Instr::Jump(target) => {
                pc = *target as usize;
                continue;
            }
            Instr::JumpIfFalse(target) => {
                if !pop(&mut stack)?.as_bool()? {
                    pc = *target as usize;
                    continue;
                }
            }
            Instr::JumpIfTrue(target) => {
                if pop(&mut stack)?.as_bool()? {
                    pc = *target as usize;
                    continue;
                }
            }
            Instr::Return => return pop(&mut stack),
            Instr::CallEntry { entry, argc } => {
                let call_args = pop_n(&mut stack, *argc as usize)?;
                stack.push(entry.invoke(&call_args)?);
            }
            Instr::MakeClosure { entry, captures } => {
                let captured = pop_n(&mut stack, *captures as usize)?;
                stack.push(Value::Closure(ClosureValue::new(
                    entry.clone(),
                    captured.into(),
                )));
            }
            Instr::CallClosure { argc } => {
                let call_args = pop_n(&mut stack, *argc as usize)?;
                let closure = pop(&mut stack)?;
                stack.push(closure.as_closure()?.invoke(&call_args)?);
            }
            Instr::MapSeq { body, extra } => {
                let seq = pop(&mut stack)?;
                let extras = pop_n(&mut stack, *extra as usize)?;
                let mut out = Vec::with_capacity(seq.as_seq()?.len());
                for element in seq.as_seq()?.iter() {
                    out.push(invoke_per_element(body, element, &extras)?);
                }
                stack.push(Value::seq(out));
            }
            Instr::FilterSeq { body, extra } => {
                let seq = pop(&mut stack)?;
                let extras = pop_n(&mut stack, *extra as usize)?;
                let mut out = Vec::new();
                for element in seq.as_seq()?.iter() {
                    if invoke_per_element(body, element, &extras)?.as_bool()? {
                        out.push(element.clone());
                    }
                }
                stack.push(Value::seq(out));
            }
            Instr::SumSeq { body, extra } => {
                let seq = pop(&mut stack)?;
                let extras = pop_n(&mut stack, *extra as usize)?;
                let mut acc = Value::Int(0);
                for element in seq.as_seq()?.iter() {
                    let term = invoke_per_element(body, element, &extras)?;
                    acc = numeric_add(&acc, &term)?;
                }
                stack.push(acc);
            }
            Instr::DistinctSeq { strict, loose } => {
                let ctx = pop(&mut stack)?;
                let seq = pop(&mut stack)?;
                let cmp = if ctx.as_ctx()?.case_insensitive {
                    loose.unwrap_or(*strict)
                } else {
                    *strict
                };
                stack.push(distinct(seq.as_seq()?, &cmp));
            }
            Instr::MakeModule { assembly } => {
                let externals = if assembly.has_externals {
                    Some(pop(&mut stack)?.as_tuple()?.clone())
                } else {
                    None
                };
                let items = pop(&mut stack)?;
                let items = items.as_tuple()?.clone();
                stack.push(Value::Module(ModuleValue::new(
                    Arc::clone(assembly),
                    items,
                    externals,
                )));
            }
            Instr::ModuleUpdate { names } => {
                let over = pop(&mut stack)?;
                let module = pop(&mut stack)?;
                let over = match over {
                    Value::Partial(partial) => partial,
                    other => {
                        return Err(ExecError::TypeMismatch {
                            expected: "partial record",
                            found: other.type_name(),
                        })
                    }
                };
                let updated = module.as_module()?.update(&over, names.as_ref())?;
                stack.push(Value::Module(updated));
            }
            Instr::ModuleUpdateRecord => {
                let record = pop(&mut stack)?;
                let module = pop(&mut stack)?;
                let record = record.as_record()?;
                let names: Vec<Name> = record.fields().iter().map(|(n, _)| *n).collect();
                let over = PartialRecord::new(record.fields().to_vec());
                let updated = module.as_module()?.update(&over, &names)?;
                stack.push(Value::Module(updated));
            }
        }
        pc += 1;
    }
    Err(ExecError::Internal("routine fell through without return"))
}

/// Per-element boundary routine invocation: `(element, extras...)`.
fn invoke_per_element(body: &EntryPoint, element: &Value, extras: &[Value]) -> ExecResult<Value> {
    let mut call_args = Vec::with_capacity(1 + extras.len());
    call_args.push(element.clone());
    call_args.extend_from_slice(extras);
    body.invoke(&call_args)
}

fn numeric_add(acc: &Value, term: &Value) -> ExecResult<Value> {
    match (acc, term) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(*b)
            .map(Value::Int)
            .ok_or(ExecError::Overflow),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        // Int accumulator meeting a float term switches to float.
        (Value::Int(a), Value::Float(b)) => {
            #[expect(clippy::cast_precision_loss, reason = "numeric promotion")]
            let promoted = *a as f64;
            Ok(Value::Float(promoted + b))
        }
        (_, other) => Err(ExecError::TypeMismatch {
            expected: "int or float",
            found: other.type_name(),
        }),
    }
}

/// Distinct elements under a comparer, preserving first-occurrence order.
/// Hash buckets with an equality check, so `hash` only needs to be
/// consistent with `eq`.
fn distinct(items: &[Value], cmp: &Comparer) -> Value {
    let mut buckets: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
    let mut out: Vec<Value> = Vec::new();
    for item in items {
        let key = (cmp.hash)(item);
        let bucket = buckets.entry(key).or_default();
        if bucket.iter().any(|&i| (cmp.eq)(&out[i], item)) {
            continue;
        }
        bucket.push(out.len());
        out.push(item.clone());
    }
    Value::seq(out)
}

fn int_binary(op: BinOp, a: i64, b: i64) -> ExecResult<Value> {
    let out = match op {
        BinOp::Add => a.checked_add(b).map(Value::Int).ok_or(ExecError::Overflow)?,
        BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or(ExecError::Overflow)?,
        BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or(ExecError::Overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(ExecError::DivideByZero);
            }
            a.checked_div(b).map(Value::Int).ok_or(ExecError::Overflow)?
        }
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Ge => Value::Bool(a >= b),
        _ => return Err(ExecError::Internal("operator not defined on int")),
    };
    Ok(out)
}

fn float_binary(op: BinOp, a: f64, b: f64) -> ExecResult<Value> {
    let out = match op {
        BinOp::Add => Value::Float(a + b),
        BinOp::Sub => Value::Float(a - b),
        BinOp::Mul => Value::Float(a * b),
        BinOp::Div => Value::Float(a / b),
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Ge => Value::Bool(a >= b),
        _ => return Err(ExecError::Internal("operator not defined on float")),
    };
    Ok(out)
}

/// Evaluate a context-free binary operator.
pub fn eval_binary(op: BinOp, left: &Value, right: &Value) -> ExecResult<Value> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(left == right)),
        BinOp::Ne => return Ok(Value::Bool(left != right)),
        BinOp::And => return Ok(Value::Bool(left.as_bool()? && right.as_bool()?)),
        BinOp::Or => return Ok(Value::Bool(left.as_bool()? || right.as_bool()?)),
        BinOp::Concat => {
            let mut out = String::from(left.as_text()?);
            out.push_str(right.as_text()?);
            return Ok(Value::text(out));
        }
        BinOp::In | BinOp::TextEqCi => {
            return Err(ExecError::Internal("context-sensitive operator without context"))
        }
        _ => {}
    }
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_binary(op, *a, *b),
        (Value::Float(a), Value::Float(b)) => float_binary(op, *a, *b),
        (Value::Text(a), Value::Text(b)) => match op {
            BinOp::Lt => Ok(Value::Bool(a < b)),
            BinOp::Le => Ok(Value::Bool(a <= b)),
            BinOp::Gt => Ok(Value::Bool(a > b)),
            BinOp::Ge => Ok(Value::Bool(a >= b)),
            _ => Err(ExecError::Internal("operator not defined on text")),
        },
        (other, _) => Err(ExecError::TypeMismatch {
            expected: "matching operand types",
            found: other.type_name(),
        }),
    }
}

fn text_eq_ctx(a: &str, b: &str, ctx: &ExecCtx) -> bool {
    if ctx.case_insensitive {
        a.to_lowercase() == b.to_lowercase()
    } else {
        a == b
    }
}

fn value_eq_ctx(a: &Value, b: &Value, ctx: &ExecCtx) -> bool {
    match (a, b) {
        (Value::Text(a), Value::Text(b)) => text_eq_ctx(a, b, ctx),
        _ => a == b,
    }
}

/// Evaluate a context-sensitive binary operator (fixed allow-list).
pub fn eval_binary_ctx(op: BinOp, left: &Value, right: &Value, ctx: &ExecCtx) -> ExecResult<Value> {
    match op {
        BinOp::In => {
            let items = right.as_seq()?;
            Ok(Value::Bool(
                items.iter().any(|item| value_eq_ctx(left, item, ctx)),
            ))
        }
        BinOp::TextEqCi => Ok(Value::Bool(text_eq_ctx(
            left.as_text()?,
            right.as_text()?,
            ctx,
        ))),
        _ => Err(ExecError::Internal("operator does not take a context")),
    }
}

fn eval_builtin(func: Builtin, stack: &mut Vec<Value>) -> ExecResult<Value> {
    match func {
        Builtin::Abs => {
            let arg = pop(stack)?;
            match arg {
                Value::Int(n) => n.checked_abs().map(Value::Int).ok_or(ExecError::Overflow),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(other_numeric(&other)),
            }
        }
        Builtin::Min | Builtin::Max => {
            let right = pop(stack)?;
            let left = pop(stack)?;
            let take_left = match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => {
                    if func == Builtin::Min { a <= b } else { a >= b }
                }
                (Value::Float(a), Value::Float(b)) => {
                    if func == Builtin::Min { a <= b } else { a >= b }
                }
                (other, _) => return Err(other_numeric(other)),
            };
            Ok(if take_left { left } else { right })
        }
        Builtin::Count => {
            let arg = pop(stack)?;
            let len = arg.as_seq()?.len();
            i64::try_from(len)
                .map(Value::Int)
                .map_err(|_| ExecError::Overflow)
        }
        Builtin::Lower => {
            let arg = pop(stack)?;
            Ok(Value::text(arg.as_text()?.to_lowercase()))
        }
        Builtin::Upper => {
            let arg = pop(stack)?;
            Ok(Value::text(arg.as_text()?.to_uppercase()))
        }
        Builtin::Contains => {
            let ctx = pop(stack)?;
            let needle = pop(stack)?;
            let haystack = pop(stack)?;
            let found = if ctx.as_ctx()?.case_insensitive {
                haystack
                    .as_text()?
                    .to_lowercase()
                    .contains(&needle.as_text()?.to_lowercase())
            } else {
                haystack.as_text()?.contains(needle.as_text()?)
            };
            Ok(Value::Bool(found))
        }
    }
}

fn other_numeric(found: &Value) -> ExecError {
    ExecError::TypeMismatch {
        expected: "int or float",
        found: found.type_name(),
    }
}
