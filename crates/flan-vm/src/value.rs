//! Runtime values: immediates and the heap object variants.

use std::cmp::Ordering;
use std::fmt;
use std::mem;

use fnv::FnvHashMap;
use smol_str::SmolStr;

use crate::gc::ObjRef;

/// The global binding table, shared across the whole program.
pub type Globals = FnvHashMap<SmolStr, Value>;

/// A runtime value. Either self-contained or a handle to an object owned by
/// the heap; handles stay valid for the lifetime of the VM instance.
#[derive(Clone, Copy, Debug)]
pub enum Value {
    /// The blank placeholder. Truthy, and a wildcard under comparison.
    Empty,
    Int(i64),
    Float(f64),
    Bool(bool),
    Obj(ObjRef),
}

impl Value {
    /// `false`, `0` and `0.0` are falsy; everything else, including `Empty`
    /// and every heap object, is truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Bool(v) => *v,
            Value::Empty | Value::Obj(_) => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// Debug rendering: strings quoted, composites rendered recursively.
    pub fn to_dbg_string(&self) -> String {
        match self {
            Value::Obj(r) => match r.get() {
                Obj::Str(s) => format!("'{}'", s.as_str()),
                Obj::List(xs) => format!("[{}]", join_dbg(xs.iter())),
                Obj::Tuple(xs) => format!("<{}>", join_dbg(xs.iter())),
                Obj::Table(map) => {
                    let entries: Vec<String> = map
                        .iter()
                        .map(|(k, v)| format!("{k}: {}", v.to_dbg_string()))
                        .collect();
                    format!("{{{}}}", entries.join(", "))
                }
                _ => self.to_string(),
            },
            _ => self.to_string(),
        }
    }
}

fn join_dbg<'a>(values: impl Iterator<Item = &'a Value>) -> String {
    values
        .map(|v| v.to_dbg_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => f.write_str("_"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Value::Bool(v) => write!(f, "{v}"),
            Value::Obj(r) => match r.get() {
                Obj::Str(s) => f.write_str(s.as_str()),
                Obj::Atom(s) => f.write_str(s),
                Obj::List(xs) => {
                    f.write_str("[")?;
                    for (i, v) in xs.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{v}")?;
                    }
                    f.write_str("]")
                }
                Obj::Tuple(xs) => {
                    f.write_str("<")?;
                    for (i, v) in xs.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{v}")?;
                    }
                    f.write_str(">")
                }
                Obj::Table(map) => {
                    f.write_str("{")?;
                    for (i, (k, v)) in map.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{k}: {v}")?;
                    }
                    f.write_str("}")
                }
                Obj::Function(func) => write_function(f, func, *r),
                Obj::Closure(c) => match c.function.get() {
                    Obj::Function(func) => write_function(f, func, c.function),
                    _ => f.write_str("<function>"),
                },
                Obj::Upvalue(v) => write!(f, "{v}"),
            },
        }
    }
}

fn write_function(f: &mut fmt::Formatter<'_>, func: &Function, r: ObjRef) -> fmt::Result {
    match &func.name {
        Some(name) => write!(f, "<function {name}>"),
        None => write!(f, "<function@{:#x}>", r.addr()),
    }
}

/// Language equality. Either side `Empty` matches anything; integers and
/// floats compare numerically with promotion; strings and atoms compare by
/// bytes. `None` means the operands are not comparable.
pub fn eq_values(l: Value, r: Value) -> Option<bool> {
    if l.is_empty() || r.is_empty() {
        return Some(true);
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a == b),
        (Value::Int(a), Value::Float(b)) => Some(a as f64 == b),
        (Value::Float(a), Value::Int(b)) => Some(a == b as f64),
        (Value::Float(a), Value::Float(b)) => Some(a == b),
        (Value::Bool(a), Value::Bool(b)) => Some(a == b),
        (Value::Obj(a), Value::Obj(b)) => match (a.get(), b.get()) {
            (Obj::Str(x), Obj::Str(y)) => Some(x.as_str() == y.as_str()),
            (Obj::Atom(x), Obj::Atom(y)) => Some(x == y),
            _ => None,
        },
        _ => None,
    }
}

/// Language ordering, defined on numbers (with promotion) and strings
/// (lexicographic over bytes). The `Empty` wildcard is handled by the caller
/// before ordering is consulted.
pub fn cmp_values(l: Value, r: Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(&b)),
        (Value::Int(a), Value::Float(b)) => (a as f64).partial_cmp(&b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(b as f64)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(&b),
        (Value::Obj(a), Value::Obj(b)) => match (a.get(), b.get()) {
            (Obj::Str(x), Obj::Str(y)) => Some(x.as_str().as_bytes().cmp(y.as_str().as_bytes())),
            _ => None,
        },
        _ => None,
    }
}

/// A heap object. Composites own their nested values for collection
/// purposes: marking a container marks everything it holds.
#[derive(Debug)]
pub enum Obj {
    Str(Str),
    /// An immutable symbol. Compared structurally, but meant as a label
    /// rather than text.
    Atom(SmolStr),
    List(Vec<Value>),
    Table(FnvHashMap<SmolStr, Value>),
    /// Fixed-length, immutable; at most 255 members.
    Tuple(Box<[Value]>),
    Function(Function),
    /// A captured value cell shared between a closure and its defining scope.
    Upvalue(Value),
    Closure(Closure),
}

impl Obj {
    /// Estimated bytes this object keeps alive beyond its own cell. Recorded
    /// by the heap at allocation time.
    pub fn payload_size(&self) -> usize {
        match self {
            Obj::Str(s) => s.text.capacity(),
            Obj::Atom(s) => s.len(),
            Obj::List(xs) => xs.capacity() * mem::size_of::<Value>(),
            Obj::Table(map) => {
                map.len() * (mem::size_of::<Value>() + mem::size_of::<SmolStr>())
            }
            Obj::Tuple(xs) => xs.len() * mem::size_of::<Value>(),
            Obj::Function(f) => f.body_len + f.name.as_ref().map_or(0, |n| n.len()),
            Obj::Upvalue(_) => 0,
            Obj::Closure(c) => c.upvalues.len() * mem::size_of::<ObjRef>(),
        }
    }
}

/// A string plus its cached code-point count.
#[derive(Debug)]
pub struct Str {
    text: String,
    char_len: usize,
}

impl Str {
    pub fn new(text: String) -> Str {
        Str {
            char_len: text.chars().count(),
            text,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Code points, not bytes.
    pub fn char_len(&self) -> usize {
        self.char_len
    }
}

/// A compiled callable. The body is a view into the loaded image; calling
/// jumps the shared cursor to `body_offset`.
#[derive(Debug)]
pub struct Function {
    pub name: Option<SmolStr>,
    pub arity: u16,
    pub body_offset: usize,
    pub body_len: usize,
}

/// A function paired with its captured upvalue cells. Arity and name
/// delegate to the function.
#[derive(Debug)]
pub struct Closure {
    /// Always an `Obj::Function`.
    pub function: ObjRef,
    /// Each entry is an `Obj::Upvalue`.
    pub upvalues: Box<[ObjRef]>,
}
