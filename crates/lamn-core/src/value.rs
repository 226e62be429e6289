use crate::closure::Closure;
use crate::error::LamnError;
use crate::table::{Table, TableRef};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Index of a coroutine's execution context inside the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub usize);

/// Signature of a host-provided native function.
pub type HostFn = dyn Fn(Vec<Value>) -> Result<Vec<Value>, LamnError>;

/// Natives that manipulate VM state directly instead of returning normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreFunction {
    PCall,
    Create,
    Resume,
    Yield,
    Status,
    DoString,
}

impl CoreFunction {
    pub fn name(self) -> &'static str {
        match self {
            CoreFunction::PCall => "pcall",
            CoreFunction::Create => "coroutine.create",
            CoreFunction::Resume => "coroutine.resume",
            CoreFunction::Yield => "coroutine.yield",
            CoreFunction::Status => "coroutine.status",
            CoreFunction::DoString => "dostring",
        }
    }
}

/// A function implemented outside the bytecode.
#[derive(Clone)]
pub enum NativeFunction {
    /// Receives a flattened argument list and returns a multi-value result.
    Host { name: Rc<str>, func: Rc<HostFn> },
    /// Interpreted by the VM's dispatch loop.
    Core(CoreFunction),
}

impl NativeFunction {
    pub fn new(
        name: impl Into<Rc<str>>,
        func: impl Fn(Vec<Value>) -> Result<Vec<Value>, LamnError> + 'static,
    ) -> Self {
        NativeFunction::Host {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NativeFunction::Host { name, .. } => name,
            NativeFunction::Core(core) => core.name(),
        }
    }
}

impl PartialEq for NativeFunction {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NativeFunction::Host { func: a, .. }, NativeFunction::Host { func: b, .. }) => {
                Rc::ptr_eq(a, b)
            }
            (NativeFunction::Core(a), NativeFunction::Core(b)) => a == b,
            _ => false,
        }
    }
}

/// Every value a lamn program can observe.
#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    /// A table (reference-counted, interior-mutable, compared by identity).
    Table(TableRef),
    /// A compiled function plus its captured cells.
    Closure(Rc<Closure>),
    NativeFunction(NativeFunction),
    /// A coroutine handle.
    Thread(ThreadId),
    /// A multi-value list in flight: call results, `...`, pending arguments.
    VarArgs(Rc<[Value]>),
}

impl Value {
    /// Returns the type name reported by `type()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Closure(_) | Value::NativeFunction(_) => "function",
            Value::Thread(_) => "thread",
            Value::VarArgs(_) => "varargs",
        }
    }

    /// `nil` and `false` are falsy; everything else (including 0) is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Create a new empty table value.
    pub fn new_table() -> Self {
        Value::Table(Rc::new(RefCell::new(Table::new())))
    }

    pub fn native(
        name: &str,
        func: impl Fn(Vec<Value>) -> Result<Vec<Value>, LamnError> + 'static,
    ) -> Self {
        Value::NativeFunction(NativeFunction::new(name, func))
    }

    pub fn multi(values: Vec<Value>) -> Self {
        Value::VarArgs(values.into())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Collapse a multi-value to its first element; other values pass through.
    pub fn first(self) -> Value {
        match self {
            Value::VarArgs(values) => values.first().cloned().unwrap_or(Value::Nil),
            other => other,
        }
    }

    /// Append this value to `out`, expanding a multi-value in place.
    pub fn spread_into(self, out: &mut Vec<Value>) {
        match self {
            Value::VarArgs(values) => out.extend(values.iter().cloned()),
            other => out.push(other),
        }
    }

    /// The metatable consulted for operator dispatch, if any.
    pub fn metatable(&self) -> Option<TableRef> {
        match self {
            Value::Table(t) => t.borrow().metatable(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            // Reference types compare by identity
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::NativeFunction(a), Value::NativeFunction(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::VarArgs(a), Value::VarArgs(b)) => a == b,
            _ => false,
        }
    }
}

/// Formats a number the way scripts print it: integral values without a
/// fractional part.
pub fn fmt_number(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if n.is_nan() {
        write!(f, "nan")
    } else if n.is_infinite() {
        write!(f, "{}", if n > 0.0 { "inf" } else { "-inf" })
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{n}")
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Value::Nil"),
            Value::Boolean(b) => write!(f, "Value::Boolean({b})"),
            Value::Number(n) => write!(f, "Value::Number({n})"),
            Value::String(s) => write!(f, "Value::String({s:?})"),
            Value::Table(t) => write!(f, "Value::Table({:p})", Rc::as_ptr(t)),
            Value::Closure(c) => write!(f, "Value::Closure({})", c.unit.name),
            Value::NativeFunction(n) => write!(f, "Value::NativeFunction({})", n.name()),
            Value::Thread(id) => write!(f, "Value::Thread({})", id.0),
            Value::VarArgs(values) => f.debug_list().entries(values.iter()).finish(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => fmt_number(*n, f),
            Value::String(s) => write!(f, "{s}"),
            Value::Table(t) => write!(f, "table: {:p}", Rc::as_ptr(t)),
            Value::Closure(c) => write!(f, "function: {:p}", Rc::as_ptr(c)),
            Value::NativeFunction(n) => write!(f, "function: builtin: {}", n.name()),
            Value::Thread(id) => write!(f, "thread: {}", id.0),
            Value::VarArgs(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, "\t")?;
                    }
                    write!(f, "{v}")?;
                }
                Ok(())
            }
        }
    }
}
