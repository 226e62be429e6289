use crate::ops;
use crate::vm::{Output, Vm};
use lamn_core::{Closure, CoreFunction, LamnError, NativeFunction, Table, TableRef, Value};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Install the base library into `vm`'s globals.
pub(crate) fn register(vm: &mut Vm, out: Output) {
    vm.register("print", move |args| print(&out, args));
    vm.register("type", lamn_type);
    vm.register("tostring", tostring);
    vm.register("tonumber", tonumber);
    vm.register("assert", assert);
    vm.register("error", error);
    vm.register("select", select);
    vm.register("rawget", rawget);
    vm.register("rawset", rawset);
    vm.register("rawequal", rawequal);
    vm.register("setmetatable", setmetatable);
    vm.register("getmetatable", getmetatable);
    vm.register("next", next);
    vm.register("load", load);
    let max_results = vm.config().max_stack;
    vm.register("unpack", move |args| unpack(args, max_results));

    let depth = vm.config().max_chain_depth;
    let ipairs_step = Value::native("ipairs_iterator", move |args| {
        let t = table_arg("ipairs", &args, 1)?;
        let i = arg(&args, 2).as_number().unwrap_or(0.0) + 1.0;
        let v = Table::lookup(&t, &Value::Number(i), depth)?;
        Ok(if v.is_nil() {
            vec![Value::Nil]
        } else {
            vec![Value::Number(i), v]
        })
    });
    vm.register("ipairs", move |args| {
        let t = table_arg("ipairs", &args, 1)?;
        Ok(vec![ipairs_step.clone(), Value::Table(t), Value::Number(0.0)])
    });
    let next_fn = vm.get_global("next");
    vm.register("pairs", move |args| {
        let t = table_arg("pairs", &args, 1)?;
        Ok(vec![next_fn.clone(), Value::Table(t), Value::Nil])
    });

    for (name, core) in [("pcall", CoreFunction::PCall), ("dostring", CoreFunction::DoString)] {
        vm.put_global(name, Value::NativeFunction(NativeFunction::Core(core)));
    }

    let coroutine = library();
    for (name, core) in [
        ("create", CoreFunction::Create),
        ("resume", CoreFunction::Resume),
        ("yield", CoreFunction::Yield),
        ("status", CoreFunction::Status),
    ] {
        set_field(&coroutine, name, Value::NativeFunction(NativeFunction::Core(core)));
    }
    vm.put_global("coroutine", Value::Table(coroutine));

    let string = library();
    set_field(&string, "len", Value::native("string.len", string_len));
    vm.put_global("string", Value::Table(string));
}

fn library() -> TableRef {
    Rc::new(RefCell::new(Table::new()))
}

fn set_field(table: &TableRef, name: &str, value: Value) {
    table.borrow_mut().set_str(name, value);
}

// ── Argument helpers ──────────────────────────────────────────────────────────

fn arg(args: &[Value], position: usize) -> Value {
    args.get(position - 1).cloned().unwrap_or(Value::Nil)
}

fn table_arg(function: &'static str, args: &[Value], position: usize) -> Result<TableRef, LamnError> {
    match args.get(position - 1) {
        Some(Value::Table(t)) => Ok(t.clone()),
        other => Err(expected(function, position, "table", other)),
    }
}

fn expected(function: &'static str, position: usize, what: &str, got: Option<&Value>) -> LamnError {
    let got = got.map_or("no value", Value::type_name);
    LamnError::argument(function, position, format!("{what} expected, got {got}"))
}

// ── Base functions ────────────────────────────────────────────────────────────

fn print(out: &Output, args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    let line = args.iter().map(Value::to_string).collect::<Vec<_>>().join("\t");
    writeln!(out.borrow_mut(), "{line}").map_err(|e| LamnError::Runtime(format!("print: {e}")))?;
    Ok(vec![])
}

fn lamn_type(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    match args.first() {
        Some(v) => Ok(vec![Value::from(v.type_name())]),
        None => Err(expected("type", 1, "value", None)),
    }
}

fn tostring(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    Ok(vec![Value::from(arg(&args, 1).to_string())])
}

fn tonumber(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    let v = arg(&args, 1);
    let n = match arg(&args, 2) {
        Value::Nil => ops::coerce_number(&v),
        Value::Number(base) => {
            if !(2.0..=36.0).contains(&base) {
                return Err(LamnError::argument("tonumber", 2, "base out of range"));
            }
            let Some(s) = v.as_str() else {
                return Err(expected("tonumber", 1, "string", Some(&v)));
            };
            i64::from_str_radix(s.trim(), base as u32).ok().map(|n| n as f64)
        }
        other => return Err(expected("tonumber", 2, "number", Some(&other))),
    };
    Ok(vec![n.map_or(Value::Nil, Value::Number)])
}

fn assert(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    if arg(&args, 1).is_truthy() {
        return Ok(args);
    }
    match args.into_iter().nth(1) {
        Some(message) if !message.is_nil() => Err(LamnError::Raised(message)),
        _ => Err(LamnError::Raised(Value::from("assertion failed!"))),
    }
}

fn error(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    Err(LamnError::Raised(arg(&args, 1)))
}

fn select(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    let count = args.len().saturating_sub(1);
    match arg(&args, 1) {
        Value::String(s) if &*s == "#" => Ok(vec![Value::Number(count as f64)]),
        v => {
            let n = ops::coerce_number(&v).ok_or_else(|| expected("select", 1, "number", Some(&v)))?;
            let n = n as i64;
            let start = if n < 0 {
                let back = n.unsigned_abs() as usize;
                if back > count {
                    return Err(LamnError::argument("select", 1, "index out of range"));
                }
                count - back
            } else if n == 0 {
                return Err(LamnError::argument("select", 1, "index out of range"));
            } else {
                (n as usize - 1).min(count)
            };
            Ok(args.into_iter().skip(1 + start).collect())
        }
    }
}

fn rawget(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    let t = table_arg("rawget", &args, 1)?;
    let v = t.borrow().get(&arg(&args, 2));
    Ok(vec![v])
}

fn rawset(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    let t = table_arg("rawset", &args, 1)?;
    t.borrow_mut().set(arg(&args, 2), arg(&args, 3))?;
    Ok(vec![Value::Table(t)])
}

fn rawequal(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    Ok(vec![Value::Boolean(arg(&args, 1) == arg(&args, 2))])
}

fn setmetatable(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    let t = table_arg("setmetatable", &args, 1)?;
    let mt = match args.get(1) {
        Some(Value::Table(mt)) => Some(mt.clone()),
        Some(Value::Nil) => None,
        other => return Err(expected("setmetatable", 2, "nil or table", other)),
    };
    t.borrow_mut().set_metatable(mt);
    Ok(vec![Value::Table(t)])
}

fn getmetatable(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    Ok(vec![arg(&args, 1).metatable().map_or(Value::Nil, Value::Table)])
}

fn next(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    let t = table_arg("next", &args, 1)?;
    let entry = t.borrow().next(&arg(&args, 2))?;
    Ok(match entry {
        Some((k, v)) => vec![k, v],
        None => vec![Value::Nil],
    })
}

fn unpack(args: Vec<Value>, max_results: usize) -> Result<Vec<Value>, LamnError> {
    let t = table_arg("unpack", &args, 1)?;
    let t = t.borrow();
    let first = arg(&args, 2).as_number().unwrap_or(1.0) as i64;
    let last = match arg(&args, 3) {
        Value::Number(n) => n as i64,
        _ => t.len() as i64,
    };
    if first > last {
        return Ok(Vec::new());
    }
    if last.saturating_sub(first) >= max_results as i64 {
        return Err(LamnError::Runtime("too many results to unpack".into()));
    }
    Ok((first..=last).map(|i| t.get(&Value::Number(i as f64))).collect())
}

/// `load(source)`: the compiled chunk as a function, or `nil, message`.
fn load(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    let Some(Value::String(source)) = args.first() else {
        return Err(expected("load", 1, "string", args.first()));
    };
    match lamn_compiler::compile_source(source, "load") {
        Ok(unit) => Ok(vec![Value::Closure(Rc::new(Closure::root(unit)))]),
        Err(e) => Ok(vec![Value::Nil, Value::from(e.to_string())]),
    }
}

impl Vm {
    /// `dostring(source)`: compile `source` and call it in place, so its
    /// results go to the caller and its errors unwind like any other.
    pub(crate) fn dostring(&mut self, args: Vec<Value>, want: u8) -> Result<(), LamnError> {
        let Some(Value::String(source)) = args.first() else {
            return Err(expected("dostring", 1, "string", args.first()));
        };
        let unit = lamn_compiler::compile_source(source, "dostring")?;
        self.enter(Rc::new(Closure::root(unit)), Vec::new(), want, false)
    }
}

fn string_len(args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
    match args.first() {
        Some(Value::String(s)) => Ok(vec![Value::Number(s.len() as f64)]),
        other => Err(expected("string.len", 1, "string", other)),
    }
}
