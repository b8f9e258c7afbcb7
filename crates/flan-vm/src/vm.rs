//! The stack machine: fetch, decode, execute.

#[cfg(test)]
mod test;

use std::cmp::Ordering;
use std::path::Path;

use smol_str::SmolStr;
use tracing::trace;

use flan_bytecode::inst::Inst;
use flan_bytecode::{reader, Image, ImageError, ValueTag};

use crate::config::VmConfig;
use crate::error::{Diagnostic, RuntimeError};
use crate::gc::{Heap, ObjRef, Roots};
use crate::value::{self, Function, Globals, Obj, Str, Value};

/// The evaluation stack. `from` marks the base of the current call frame;
/// frame-relative index `i` resolves to absolute position `from + i`.
pub struct Stack {
    values: Vec<Value>,
    from: usize,
}

impl Stack {
    fn new() -> Stack {
        Stack {
            values: Vec::with_capacity(u8::MAX as usize),
            from: 0,
        }
    }

    fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.values
            .pop()
            .ok_or_else(|| RuntimeError::internal("stack underflow"))
    }

    fn pop2(&mut self) -> Result<(Value, Value), RuntimeError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        Ok((lhs, rhs))
    }

    fn peek(&self) -> Result<Value, RuntimeError> {
        self.values
            .last()
            .copied()
            .ok_or_else(|| RuntimeError::internal("stack underflow"))
    }

    fn local(&self, idx: usize) -> Result<Value, RuntimeError> {
        self.values
            .get(self.from + idx)
            .copied()
            .ok_or_else(|| RuntimeError::internal("local slot out of range"))
    }

    fn set_local(&mut self, idx: usize, value: Value) -> Result<(), RuntimeError> {
        let slot = self
            .values
            .get_mut(self.from + idx)
            .ok_or_else(|| RuntimeError::internal("local slot out of range"))?;
        *slot = value;
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn values(&self) -> &[Value] {
        &self.values
    }
}

/// One call record: where to resume, the caller's frame base, and the callee
/// name for stack traces.
struct Frame {
    ret_addr: usize,
    prev_from: usize,
    name: Option<SmolStr>,
}

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

pub struct Vm {
    image: Image,
    /// Absolute cursor into the image
    pos: usize,
    stack: Stack,
    frames: Vec<Frame>,
    globals: Globals,
    heap: Heap,
    config: VmConfig,
}

impl Vm {
    pub fn new(image: Image) -> Vm {
        Vm::with_config(image, VmConfig::default())
    }

    pub fn with_config(image: Image, config: VmConfig) -> Vm {
        let pos = image.body_start();
        Vm {
            image,
            pos,
            stack: Stack::new(),
            frames: Vec::new(),
            globals: Globals::default(),
            heap: Heap::new(config.nursery_budget, config.tenured_budget),
            config,
        }
    }

    pub fn from_file(path: &Path) -> Result<Vm, ImageError> {
        Ok(Vm::new(Image::load(path)?))
    }

    /// Execute until `Halt`. Every failure is fatal; resolve it with
    /// [`Vm::diagnose`] before reporting.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let byte = self.u8()?;
            let inst =
                Inst::try_from(byte).map_err(|_| ImageError::UnknownOpcode(byte))?;

            match inst {
                Inst::LoadNeg1 => self.stack.push(Value::Int(-1)),
                Inst::Load0 => self.stack.push(Value::Int(0)),
                Inst::Load1 => self.stack.push(Value::Int(1)),
                Inst::Load2 => self.stack.push(Value::Int(2)),
                Inst::Load3 => self.stack.push(Value::Int(3)),
                Inst::Load4 => self.stack.push(Value::Int(4)),
                Inst::Load5 => self.stack.push(Value::Int(5)),

                Inst::Load => {
                    let value = self.decode_value()?;
                    self.stack.push(value);
                }
                Inst::Push => {
                    let count = self.u8()?;
                    for _ in 0..count {
                        let value = self.decode_value()?;
                        self.stack.push(value);
                    }
                }
                Inst::Pop => {
                    self.stack.pop()?;
                }
                Inst::PopN => {
                    let n = self.u8()?;
                    for _ in 0..n {
                        self.stack.pop()?;
                    }
                }
                Inst::Nip => {
                    let top = self.stack.pop()?;
                    self.stack.pop()?;
                    self.stack.push(top);
                }
                Inst::NipN => {
                    let n = self.u8()?;
                    let top = self.stack.pop()?;
                    for _ in 0..n {
                        self.stack.pop()?;
                    }
                    self.stack.push(top);
                }
                Inst::Dup => {
                    let top = self.stack.peek()?;
                    self.stack.push(top);
                }

                Inst::Add => self.arith(Arith::Add)?,
                Inst::Sub => self.arith(Arith::Sub)?,
                Inst::Mul => self.arith(Arith::Mul)?,
                Inst::Div => self.arith(Arith::Div)?,
                Inst::Mod => self.arith(Arith::Mod)?,

                Inst::Eq => self.equality(false)?,
                Inst::NEq => self.equality(true)?,
                Inst::Lt => self.compare(|ord| ord == Ordering::Less)?,
                Inst::LtE => self.compare(|ord| ord != Ordering::Greater)?,
                Inst::Gt => self.compare(|ord| ord == Ordering::Greater)?,
                Inst::GtE => self.compare(|ord| ord != Ordering::Less)?,

                Inst::And => {
                    let (lhs, rhs) = self.stack.pop2()?;
                    self.stack.push(Value::Bool(lhs.truthy() && rhs.truthy()));
                }
                Inst::Or => {
                    let (lhs, rhs) = self.stack.pop2()?;
                    self.stack.push(Value::Bool(lhs.truthy() || rhs.truthy()));
                }
                Inst::Not => {
                    let top = self.stack.pop()?;
                    self.stack.push(Value::Bool(!top.truthy()));
                }
                Inst::Negate => {
                    let top = self.stack.pop()?;
                    let negated = match top {
                        Value::Int(v) => Value::Int(-v),
                        Value::Float(v) => Value::Float(-v),
                        other => {
                            return Err(RuntimeError::type_mismatch(
                                None,
                                format!("Cannot negate {}", other.to_dbg_string()),
                            ))
                        }
                    };
                    self.stack.push(negated);
                }

                Inst::Jmp => {
                    let offset = self.u32()?;
                    self.pos += offset as usize;
                }
                Inst::Jz => {
                    let offset = self.u32()?;
                    if !self.stack.pop()?.truthy() {
                        self.pos += offset as usize;
                    }
                }
                Inst::Jnz => {
                    let offset = self.u32()?;
                    if self.stack.pop()?.truthy() {
                        self.pos += offset as usize;
                    }
                }

                Inst::InitList => {
                    let n = self.u32()? as usize;
                    let start = self.window_start(n)?;
                    let elements = self.stack.values()[start..].to_vec();
                    let list = self.alloc(Obj::List(elements));
                    self.stack.truncate(start);
                    self.stack.push(Value::Obj(list));
                }
                Inst::InitTable => {
                    let n = self.u32()? as usize;
                    let start = self.window_start(n)?;
                    let mut map = fnv::FnvHashMap::default();
                    for i in 0..n {
                        let key = self.short_str()?;
                        let value = self.stack.values()[self.stack.len() - 1 - i];
                        map.insert(key, value);
                    }
                    let table = self.alloc(Obj::Table(map));
                    self.stack.truncate(start);
                    self.stack.push(Value::Obj(table));
                }
                Inst::InitTup => {
                    let n = self.u32()?;
                    if n > u8::MAX as u32 {
                        return Err(ImageError::OversizedTuple(n).into());
                    }
                    let start = self.window_start(n as usize)?;
                    let members: Box<[Value]> = self.stack.values()[start..].into();
                    let tuple = self.alloc(Obj::Tuple(members));
                    self.stack.truncate(start);
                    self.stack.push(Value::Obj(tuple));
                }

                Inst::IdxListOrTup => {
                    let err = self.u16()?;
                    let idx = self.integer()?;
                    let target = self.stack.pop()?;
                    let element = match target {
                        Value::Obj(r) => match r.get() {
                            Obj::List(xs) => xs[resolve_index(xs.len(), idx, err)?],
                            Obj::Tuple(xs) => xs[resolve_index(xs.len(), idx, err)?],
                            _ => return Err(not_indexable(err, target)),
                        },
                        _ => return Err(not_indexable(err, target)),
                    };
                    self.stack.push(element);
                }
                Inst::SetList => {
                    let err = self.u16()?;
                    let idx = self.integer()?;
                    let new = self.stack.pop()?;
                    let target = self.stack.pop()?;
                    let list = match target {
                        Value::Obj(r) => match r.get() {
                            Obj::List(xs) => Some((r, xs.len())),
                            _ => None,
                        },
                        _ => None,
                    };
                    match list {
                        Some((r, len)) => {
                            let slot = resolve_index(len, idx, err)?;
                            // no other reference into the list is live here
                            if let Obj::List(xs) = unsafe { r.get_mut() } {
                                xs[slot] = new;
                            }
                        }
                        None => {
                            return Err(RuntimeError::type_mismatch(
                                err,
                                format!("Expected a list but got {}", target.to_dbg_string()),
                            ))
                        }
                    }
                }

                Inst::GetMember => {
                    let err = self.u16()?;
                    let key = self.short_str()?;
                    let target = self.stack.pop()?;
                    let member = match target {
                        Value::Obj(r) => match r.get() {
                            Obj::Table(map) => match map.get(&key) {
                                Some(member) => *member,
                                None => {
                                    return Err(RuntimeError::domain(
                                        err,
                                        format!("Table does not have key {key}"),
                                    ))
                                }
                            },
                            _ => return Err(not_a_table(err, target)),
                        },
                        _ => return Err(not_a_table(err, target)),
                    };
                    self.stack.push(member);
                }
                Inst::SetMember => {
                    let err = self.u16()?;
                    let key = self.short_str()?;
                    let new = self.stack.pop()?;
                    let target = self.stack.pop()?;
                    match target {
                        Value::Obj(r) if matches!(r.get(), Obj::Table(_)) => {
                            // no other reference into the table is live here
                            if let Obj::Table(map) = unsafe { r.get_mut() } {
                                map.insert(key, new);
                            }
                        }
                        other => return Err(not_a_table(err, other)),
                    }
                }

                Inst::DefGlobal => {
                    let err = self.u16()?;
                    let name = self.short_str()?;
                    let value = self.stack.pop()?;
                    if self.globals.contains_key(&name) {
                        return Err(RuntimeError::name(
                            err,
                            format!("Global {name} is already defined"),
                        ));
                    }
                    self.globals.insert(name, value);
                }
                Inst::GetGlobal => {
                    let err = self.u16()?;
                    let name = self.short_str()?;
                    match self.globals.get(&name).copied() {
                        Some(value) => self.stack.push(value),
                        None => {
                            return Err(RuntimeError::name(
                                err,
                                format!("Undefined global {name}"),
                            ))
                        }
                    }
                }
                Inst::SetGlobal => {
                    let err = self.u16()?;
                    let name = self.short_str()?;
                    let value = self.stack.pop()?;
                    match self.globals.get_mut(&name) {
                        Some(slot) => *slot = value,
                        None => {
                            return Err(RuntimeError::name(
                                err,
                                format!("Undefined global {name}"),
                            ))
                        }
                    }
                }

                Inst::GetLocal => {
                    let idx = self.u16()? as usize;
                    let value = self.stack.local(idx)?;
                    self.stack.push(value);
                }
                Inst::SetLocal => {
                    let idx = self.u16()? as usize;
                    let top = self.stack.peek()?;
                    self.stack.set_local(idx, top)?;
                }

                Inst::CallFn => self.call()?,
                Inst::RetFn => self.ret()?,
                Inst::EndFn => {
                    return Err(RuntimeError::internal(
                        "function body ran past its end without returning",
                    ))
                }

                Inst::Halt => {
                    trace!(stack = self.stack.len(), "halt");
                    return Ok(());
                }
            }
        }
    }

    /// Resolve a runtime error against the error-info table and the live
    /// call chain.
    pub fn diagnose(&self, err: &RuntimeError) -> Diagnostic {
        Diagnostic {
            context: err.blame.and_then(|idx| self.image.error_info(idx)).cloned(),
            message: err.message.clone(),
            trace: self
                .frames
                .iter()
                .rev()
                .map(|f| f.name.clone().unwrap_or_else(|| SmolStr::new("<anonymous>")))
                .collect(),
        }
    }

    pub fn stack(&self) -> &[Value] {
        self.stack.values()
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    fn call(&mut self) -> Result<(), RuntimeError> {
        let err = self.u16()?;
        let argc = self.u16()? as usize;

        let callee_at = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| RuntimeError::internal("stack underflow"))?;
        let callee = self.stack.values()[callee_at];

        let (name, arity, body_offset) = match callee {
            Value::Obj(r) => match r.get() {
                Obj::Function(f) => (f.name.clone(), f.arity, f.body_offset),
                Obj::Closure(c) => match c.function.get() {
                    Obj::Function(f) => (f.name.clone(), f.arity, f.body_offset),
                    _ => {
                        return Err(RuntimeError::internal(
                            "closure does not wrap a function",
                        ))
                    }
                },
                _ => return Err(not_callable(err, callee)),
            },
            _ => return Err(not_callable(err, callee)),
        };

        if arity as usize != argc {
            return Err(RuntimeError::domain(
                err,
                format!(
                    "{} expects {arity} arguments but got {argc}",
                    callee.to_dbg_string()
                ),
            ));
        }
        if self.frames.len() >= self.config.max_call_frames {
            return Err(RuntimeError::overflow(
                err,
                "Too many nested function calls",
            ));
        }

        trace!(callee = %callee, argc, depth = self.frames.len() + 1, "call");
        self.frames.push(Frame {
            ret_addr: self.pos,
            prev_from: self.stack.from,
            name,
        });
        self.stack.from = callee_at + 1;
        self.pos = body_offset;
        Ok(())
    }

    fn ret(&mut self) -> Result<(), RuntimeError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::internal("return outside of a call"))?;
        let ret = self.stack.pop()?;

        // drop the callee and its arguments, leave the return value
        let callee_at = self
            .stack
            .from
            .checked_sub(1)
            .ok_or_else(|| RuntimeError::internal("call frame base corrupted"))?;
        self.stack.truncate(callee_at);
        self.stack.push(ret);
        self.stack.from = frame.prev_from;
        self.pos = frame.ret_addr;

        trace!(depth = self.frames.len(), "return");
        Ok(())
    }

    fn arith(&mut self, op: Arith) -> Result<(), RuntimeError> {
        let err = self.u16()?;
        let (lhs, rhs) = self.stack.pop2()?;

        // string concatenation builds its owned payload before allocating
        if let (Arith::Add, Value::Obj(a), Value::Obj(b)) = (op, lhs, rhs) {
            let joined = match (a.get(), b.get()) {
                (Obj::Str(x), Obj::Str(y)) => {
                    Some(format!("{}{}", x.as_str(), y.as_str()))
                }
                _ => None,
            };
            if let Some(text) = joined {
                let obj = self.alloc(Obj::Str(Str::new(text)));
                self.stack.push(Value::Obj(obj));
                return Ok(());
            }
        }

        let result = match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => int_arith(op, a, b, err)?,
            (Value::Int(a), Value::Float(b)) => Value::Float(float_arith(op, a as f64, b, err)?),
            (Value::Float(a), Value::Int(b)) => Value::Float(float_arith(op, a, b as f64, err)?),
            (Value::Float(a), Value::Float(b)) => Value::Float(float_arith(op, a, b, err)?),
            _ => {
                return Err(RuntimeError::type_mismatch(
                    err,
                    arith_mismatch(op, lhs, rhs),
                ))
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn equality(&mut self, negate: bool) -> Result<(), RuntimeError> {
        let err = self.u16()?;
        let (lhs, rhs) = self.stack.pop2()?;
        match value::eq_values(lhs, rhs) {
            Some(equal) => {
                self.stack.push(Value::Bool(equal != negate));
                Ok(())
            }
            None => Err(RuntimeError::type_mismatch(
                err,
                format!(
                    "Cannot compare {} and {}",
                    lhs.to_dbg_string(),
                    rhs.to_dbg_string()
                ),
            )),
        }
    }

    fn compare(&mut self, pred: fn(Ordering) -> bool) -> Result<(), RuntimeError> {
        let err = self.u16()?;
        let (lhs, rhs) = self.stack.pop2()?;

        // the wildcard orders as true against anything
        let outcome = if lhs.is_empty() || rhs.is_empty() {
            true
        } else {
            match value::cmp_values(lhs, rhs) {
                Some(ord) => pred(ord),
                None => {
                    return Err(RuntimeError::type_mismatch(
                        err,
                        format!(
                            "Cannot compare {} and {}",
                            lhs.to_dbg_string(),
                            rhs.to_dbg_string()
                        ),
                    ))
                }
            }
        };
        self.stack.push(Value::Bool(outcome));
        Ok(())
    }

    /// Decode one tagged constant, allocating on the heap where needed. The
    /// caller pushes the result before decoding anything further, keeping it
    /// rooted across later allocations.
    fn decode_value(&mut self) -> Result<Value, RuntimeError> {
        let byte = self.u8()?;
        let tag = ValueTag::try_from(byte).map_err(|_| ImageError::UnknownValueTag(byte))?;
        Ok(match tag {
            ValueTag::Int => Value::Int(self.integer()?),
            ValueTag::Float => Value::Float(self.float()?),
            ValueTag::Bool => Value::Bool(self.u8()? == 1),
            ValueTag::Empty => Value::Empty,
            ValueTag::Str => {
                let text = self.long_str()?;
                Value::Obj(self.alloc(Obj::Str(Str::new(text))))
            }
            ValueTag::Atom => {
                let text = self.short_str()?;
                Value::Obj(self.alloc(Obj::Atom(text)))
            }
            ValueTag::Function => self.decode_function()?,
        })
    }

    /// A function constant: its body bytes stay in the image, the object
    /// records where they are. The trailing `EndFn` sentinel must match.
    fn decode_function(&mut self) -> Result<Value, RuntimeError> {
        let raw_name = self.short_str()?;
        let name = if raw_name.is_empty() {
            None
        } else {
            Some(raw_name.clone())
        };
        let arity = self.u16()?;

        let raw_len = self.integer()?;
        let body_len =
            usize::try_from(raw_len).map_err(|_| ImageError::BadFunctionLength(raw_len))?;
        let body_offset = self.pos;
        reader::skip(self.image.bytes(), &mut self.pos, body_len)?;

        if self.u8()? != u8::from(Inst::EndFn) {
            return Err(ImageError::UnterminatedFunction(raw_name).into());
        }

        let func = Function {
            name,
            arity,
            body_offset,
            body_len,
        };
        Ok(Value::Obj(self.alloc(Obj::Function(func))))
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.heap.alloc(
            obj,
            Roots {
                stack: self.stack.values(),
                globals: &self.globals,
            },
        )
    }

    /// Absolute index where the topmost `n` values begin.
    fn window_start(&self, n: usize) -> Result<usize, RuntimeError> {
        self.stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| RuntimeError::internal("stack underflow"))
    }

    fn u8(&mut self) -> Result<u8, RuntimeError> {
        Ok(reader::read_u8(self.image.bytes(), &mut self.pos)?)
    }

    fn u16(&mut self) -> Result<u16, RuntimeError> {
        Ok(reader::read_u16(self.image.bytes(), &mut self.pos)?)
    }

    fn u32(&mut self) -> Result<u32, RuntimeError> {
        Ok(reader::read_u32(self.image.bytes(), &mut self.pos)?)
    }

    fn integer(&mut self) -> Result<i64, RuntimeError> {
        Ok(reader::read_integer(self.image.bytes(), &mut self.pos)?)
    }

    fn float(&mut self) -> Result<f64, RuntimeError> {
        Ok(reader::read_float(self.image.bytes(), &mut self.pos)?)
    }

    fn short_str(&mut self) -> Result<SmolStr, RuntimeError> {
        Ok(reader::read_short_str(self.image.bytes(), &mut self.pos)?)
    }

    fn long_str(&mut self) -> Result<String, RuntimeError> {
        Ok(reader::read_long_str(self.image.bytes(), &mut self.pos)?)
    }
}

fn int_arith(op: Arith, a: i64, b: i64, err: u16) -> Result<Value, RuntimeError> {
    Ok(match op {
        Arith::Add => Value::Int(a + b),
        Arith::Sub => Value::Int(a - b),
        Arith::Mul => Value::Int(a * b),
        Arith::Div => {
            if b == 0 {
                return Err(RuntimeError::domain(err, "Cannot divide by zero"));
            }
            Value::Int(a / b)
        }
        Arith::Mod => {
            if b == 0 {
                return Err(RuntimeError::domain(err, "Cannot mod by zero"));
            }
            Value::Int(a % b)
        }
    })
}

fn float_arith(op: Arith, a: f64, b: f64, err: u16) -> Result<f64, RuntimeError> {
    Ok(match op {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
        Arith::Div => {
            if b == 0.0 {
                return Err(RuntimeError::domain(err, "Cannot divide by zero"));
            }
            a / b
        }
        // remainder keeps the dividend's sign
        Arith::Mod => {
            if b == 0.0 {
                return Err(RuntimeError::domain(err, "Cannot mod by zero"));
            }
            a % b
        }
    })
}

fn arith_mismatch(op: Arith, lhs: Value, rhs: Value) -> String {
    let (l, r) = (lhs.to_dbg_string(), rhs.to_dbg_string());
    match op {
        Arith::Add => format!("Cannot add {l} and {r}"),
        Arith::Sub => format!("Cannot subtract {r} from {l}"),
        Arith::Mul => format!("Cannot multiply {l} by {r}"),
        Arith::Div => format!("Cannot divide {l} by {r}"),
        Arith::Mod => format!("Cannot mod {l} and {r}"),
    }
}

/// Negative indices count from the end; the resolved index must be in range.
fn resolve_index(len: usize, idx: i64, err: u16) -> Result<usize, RuntimeError> {
    let len = len as i64;
    let resolved = if idx < 0 { idx + len } else { idx };
    if resolved < 0 || resolved >= len {
        return Err(RuntimeError::domain(err, "Index out of range"));
    }
    Ok(resolved as usize)
}

fn not_indexable(err: u16, value: Value) -> RuntimeError {
    RuntimeError::type_mismatch(
        err,
        format!("Expected a list or tuple but got {}", value.to_dbg_string()),
    )
}

fn not_a_table(err: u16, value: Value) -> RuntimeError {
    RuntimeError::type_mismatch(
        err,
        format!("Expected a table but got {}", value.to_dbg_string()),
    )
}

fn not_callable(err: u16, value: Value) -> RuntimeError {
    RuntimeError::type_mismatch(err, format!("Cannot call {}", value.to_dbg_string()))
}
