use crate::config::VmConfig;
use crate::ops::{self, Arith};
use crate::thread::{Frame, ThreadState};
use lamn_core::{
    Cell, Closure, LamnError, NativeFunction, OpCode, Table, ThreadId, UnitId, Value,
};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use tracing::{debug, trace};

/// Where `print` writes.
pub(crate) type Output = Rc<RefCell<Box<dyn Write>>>;

/// The thread the host's program runs on.
pub(crate) const ROOT: ThreadId = ThreadId(0);

/// What the dispatch loop does after one instruction.
enum Flow {
    Continue,
    /// The root thread's last frame returned.
    Finished(Vec<Value>),
}

// ── VM ────────────────────────────────────────────────────────────────────────

/// Stack-based virtual machine that executes compiled units.
///
/// Every thread (the root program and each coroutine) owns its own value
/// stack, closure list, frames and handler stack; `thread_stack` records which
/// thread resumed which, and its top is the one running.
pub struct Vm {
    pub(crate) config: VmConfig,
    globals: FxHashMap<Rc<str>, Value>,
    pub(crate) threads: Vec<ThreadState>,
    pub(crate) thread_stack: Vec<ThreadId>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self::with_output(config, std::io::stdout())
    }

    /// A VM whose `print` writes to `out` instead of stdout.
    pub fn with_output(config: VmConfig, out: impl Write + 'static) -> Self {
        let mut vm = Vm {
            config,
            globals: FxHashMap::default(),
            threads: vec![ThreadState::default()],
            thread_stack: vec![ROOT],
        };
        let out: Output = Rc::new(RefCell::new(Box::new(out)));
        crate::stdlib::register(&mut vm, out);
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Install `value` as a global, or remove the global if `value` is nil.
    pub fn put_global(&mut self, name: &str, value: Value) {
        if value.is_nil() {
            self.globals.remove(name);
        } else {
            self.globals.insert(name.into(), value);
        }
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.globals.get(name).cloned().unwrap_or(Value::Nil)
    }

    /// Install a host function as a global.
    pub fn register(
        &mut self,
        name: &str,
        func: impl Fn(Vec<Value>) -> Result<Vec<Value>, LamnError> + 'static,
    ) {
        self.put_global(name, Value::native(name, func));
    }

    /// Run a root closure to completion and return its results.
    pub fn execute(&mut self, root: Rc<Closure>) -> Result<Vec<Value>, LamnError> {
        self.call(Value::Closure(root), Vec::new())
    }

    /// Call any function value from the host.
    ///
    /// Not reentrant: natives cannot drive the VM from inside a call.
    pub fn call(&mut self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
        if self.thread_stack.len() > 1 || !self.threads[ROOT.0].is_dead() {
            return Err(LamnError::Runtime("the VM is already running".into()));
        }
        match func {
            Value::Closure(closure) => {
                debug!(unit = %closure.unit.name, args = args.len(), "execute");
                self.threads[ROOT.0].clear();
                self.enter(closure, args, 0, false)?;
                self.run()
            }
            Value::NativeFunction(NativeFunction::Host { func, .. }) => func(args),
            other => Err(LamnError::Call {
                got: other.type_name(),
            }),
        }
    }

    // ── Thread access ─────────────────────────────────────────────────────────

    pub(crate) fn current_id(&self) -> ThreadId {
        self.thread_stack.last().copied().unwrap_or(ROOT)
    }

    pub(crate) fn current(&mut self) -> &mut ThreadState {
        let id = self.current_id();
        &mut self.threads[id.0]
    }

    // ── Core interpreter loop ─────────────────────────────────────────────────

    fn run(&mut self) -> Result<Vec<Value>, LamnError> {
        loop {
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished(values)) => {
                    debug!(results = values.len(), "execution finished");
                    return Ok(values);
                }
                Err(err) => {
                    let err = self.locate(err);
                    self.throw(err)?;
                }
            }
        }
    }

    /// Tag `err` with the line of the instruction that raised it.
    fn locate(&self, err: LamnError) -> LamnError {
        let thread = &self.threads[self.current_id().0];
        match thread.frame() {
            Some(frame) => {
                let unit = &frame.closure.unit;
                let line = unit.line_at(frame.ip.saturating_sub(1)).unwrap_or(0);
                err.located(&unit.source, line)
            }
            None => err,
        }
    }

    fn step(&mut self) -> Result<Flow, LamnError> {
        let frame = self
            .current()
            .frame_mut()
            .ok_or_else(|| LamnError::Runtime("no active frame".into()))?;
        let closure = frame.closure.clone();
        let ip = frame.ip;
        frame.ip += 1;

        let unit = &closure.unit;
        let ins = *unit
            .code
            .get(ip)
            .ok_or_else(|| LamnError::Runtime(format!("instruction pointer {ip} out of range")))?;
        let op = ins
            .opcode()
            .ok_or_else(|| LamnError::Runtime(format!("invalid instruction {:#010x}", ins.raw())))?;
        let (a, b) = (ins.a(), ins.b());

        match op {
            // ── Stack ─────────────────────────────────────────────────────────
            OpCode::LoadK => {
                let value = constant(&closure, a)?;
                self.current().push(value);
            }
            OpCode::GetStack => {
                let thread = self.current();
                let value = thread.cell(a).ok_or_else(|| bad_slot(a))?.get();
                thread.push(value);
            }
            OpCode::PutStack => {
                let thread = self.current();
                let cell = thread.cell(a).cloned().ok_or_else(|| bad_slot(a))?;
                let value = thread.pop();
                cell.set(value);
            }
            OpCode::PopStack => {
                let thread = self.current();
                let len = thread.stack.len().saturating_sub(a);
                thread.stack.truncate(len);
            }

            // ── Globals ───────────────────────────────────────────────────────
            OpCode::GetGlobal => {
                let name = global_name(&closure, a)?;
                let value = self.globals.get(&name).cloned().unwrap_or(Value::Nil);
                self.current().push(value);
            }
            OpCode::PutGlobal => {
                let name = global_name(&closure, a)?;
                let value = self.current().pop();
                if value.is_nil() {
                    self.globals.remove(&name);
                } else {
                    self.globals.insert(name, value);
                }
            }

            // ── Arithmetic ────────────────────────────────────────────────────
            OpCode::Add => self.arith(Arith::Add)?,
            OpCode::Sub => self.arith(Arith::Sub)?,
            OpCode::Mul => self.arith(Arith::Mul)?,
            OpCode::Div => self.arith(Arith::Div)?,
            OpCode::Mod => self.arith(Arith::Mod)?,
            OpCode::Pow => self.arith(Arith::Pow)?,
            OpCode::Neg => {
                let value = self.current().pop();
                match value {
                    Value::Number(n) => self.current().push(Value::Number(-n)),
                    other => {
                        let got = other.type_name();
                        self.call_metamethod("__unm", other.clone(), other, LamnError::Arithmetic { got })?
                    }
                }
            }

            // ── String & length ───────────────────────────────────────────────
            OpCode::Concat => {
                let thread = self.current();
                let rhs = thread.pop();
                let lhs = thread.pop();
                match ops::concat(&lhs, &rhs) {
                    Some(s) => self.current().push(Value::from(s)),
                    None => {
                        let got = if matches!(lhs, Value::String(_) | Value::Number(_)) {
                            rhs.type_name()
                        } else {
                            lhs.type_name()
                        };
                        self.call_metamethod("__concat", lhs, rhs, LamnError::Concat { got })?
                    }
                }
            }
            OpCode::Len => {
                let value = self.current().pop();
                let handler = self.metamethod(&value, "__len")?;
                if handler.is_nil() {
                    let n = match &value {
                        Value::String(s) => s.len(),
                        Value::Table(t) => t.borrow().len(),
                        other => {
                            return Err(LamnError::Length {
                                got: other.type_name(),
                            })
                        }
                    };
                    self.current().push(Value::Number(n as f64));
                } else {
                    self.call_value(handler, vec![value.clone(), value], 1)?;
                }
            }

            // ── Comparison & logic ────────────────────────────────────────────
            OpCode::Eq => {
                let thread = self.current();
                let rhs = thread.pop();
                let lhs = thread.pop();
                thread.push(Value::Boolean(lhs == rhs));
            }
            OpCode::Not => {
                let thread = self.current();
                let value = thread.pop();
                thread.push(Value::Boolean(!value.is_truthy()));
            }
            OpCode::And => {
                let thread = self.current();
                let rhs = thread.pop();
                let lhs = thread.pop();
                thread.push(if lhs.is_truthy() { rhs } else { lhs });
            }
            OpCode::Or => {
                let thread = self.current();
                let rhs = thread.pop();
                let lhs = thread.pop();
                thread.push(if lhs.is_truthy() { lhs } else { rhs });
            }
            OpCode::Less => self.compare(ops::less, "__lt")?,
            OpCode::LessEq => self.compare(ops::less_eq, "__le")?,

            // ── Tables ────────────────────────────────────────────────────────
            OpCode::NewTable => self.current().push(Value::new_table()),
            OpCode::PutTable => {
                let thread = self.current();
                let value = thread.pop();
                let key = thread.pop();
                let target = thread.pop();
                let Value::Table(table) = &target else {
                    return Err(LamnError::Index {
                        got: target.type_name(),
                    });
                };
                let mut table = table.borrow_mut();
                match (key, value) {
                    // list constructors: a trailing multi-value fills consecutive keys
                    (Value::Number(start), Value::VarArgs(values)) => {
                        for (i, v) in values.iter().enumerate() {
                            table.set(Value::Number(start + i as f64), v.clone())?;
                        }
                    }
                    (key, value) => table.set(key, value.first())?,
                }
            }
            OpCode::GetTable => {
                let thread = self.current();
                let key = thread.pop();
                let target = thread.pop();
                let value = self.index(&target, &key)?;
                self.current().push(value);
            }

            // ── Calls & control ───────────────────────────────────────────────
            OpCode::Call => {
                let thread = self.current();
                let args = thread.pop_spread(a);
                let callee = thread.pop();
                self.call_value(callee, args, b as u8)?;
            }
            OpCode::Ret => {
                let results = self.current().pop_spread(a);
                return Ok(self.return_from(results));
            }
            OpCode::Jmp => self.jump(a),
            OpCode::JmpTrue => {
                let thread = self.current();
                let value = if b == 1 {
                    thread.cell(1).ok_or_else(|| bad_slot(1))?.get()
                } else {
                    thread.pop()
                };
                if value.is_truthy() {
                    self.jump(a);
                }
            }
            OpCode::PopVarArgs => {
                let thread = self.current();
                let top = thread.cell(1).ok_or_else(|| bad_slot(1))?.get();
                let values: Rc<[Value]> = match top {
                    Value::VarArgs(values) => values,
                    other => Rc::from(vec![other]),
                };
                if b == 1 {
                    thread.stack.pop();
                } else if let Some(slot) = thread.stack.last_mut() {
                    // the slot keeps whatever was not expanded
                    let rest = values.iter().skip(a).cloned().collect();
                    *slot = Cell::new(Value::multi(rest));
                }
                for i in 0..a {
                    thread.push(values.get(i).cloned().unwrap_or(Value::Nil));
                }
            }
            OpCode::ForPrep => {
                let thread = self.current();
                const CHECKS: [(usize, &str); 3] = [
                    (3, "initial value must be a number"),
                    (2, "limit must be a number"),
                    (1, "step must be a number"),
                ];
                for (offset, message) in CHECKS {
                    let cell = thread.cell(offset).ok_or_else(|| bad_slot(offset))?;
                    let n = ops::coerce_number(&cell.get()).ok_or(LamnError::ForLoop(message))?;
                    cell.set(Value::Number(n));
                }
                if thread.cell(1).map(Cell::get) == Some(Value::Number(0.0)) {
                    return Err(LamnError::ForLoop("step is zero"));
                }
            }

            // ── Closures ──────────────────────────────────────────────────────
            OpCode::CloseVars => {
                let thread = self.current();
                let start = thread.stack.len().checked_sub(a).ok_or_else(|| bad_slot(a))?;
                thread.captures.extend(thread.stack[start..].iter().cloned());
            }
            OpCode::PopClosed => {
                let thread = self.current();
                let len = thread.captures.len().saturating_sub(a);
                thread.captures.truncate(len);
            }
            OpCode::Closure => {
                let child = unit
                    .child(UnitId(a as u16))
                    .cloned()
                    .ok_or_else(|| LamnError::Runtime(format!("no nested unit {a}")))?;
                let thread = self.current();
                let capture_base = thread.frame().map_or(0, |f| f.capture_base);
                let upvalues = thread.captures.get(capture_base..).unwrap_or(&[]).to_vec();
                thread.push(Value::Closure(Rc::new(Closure::new(child, upvalues))));
            }
            OpCode::GetUpval => {
                let value = upvalue(&closure, a)?.get();
                self.current().push(value);
            }
            OpCode::PutUpval => {
                let value = self.current().pop();
                upvalue(&closure, a)?.set(value);
            }
        }
        Ok(Flow::Continue)
    }

    fn jump(&mut self, target: usize) {
        if let Some(frame) = self.current().frame_mut() {
            frame.ip = target;
        }
    }

    // ── Calls & returns ───────────────────────────────────────────────────────

    /// Call `callee`; its results land on the current thread's stack as
    /// `want` values (or one multi-value) once it returns.
    pub(crate) fn call_value(&mut self, callee: Value, args: Vec<Value>, want: u8) -> Result<(), LamnError> {
        let (callee, args) = self.call_target(callee, args)?;
        match callee {
            Value::Closure(closure) => self.enter(closure, args, want, false),
            Value::NativeFunction(NativeFunction::Host { name, func }) => {
                trace!(function = %name, args = args.len(), "native call");
                let results = func(args)?;
                self.current().push_results(want, results);
                Ok(())
            }
            Value::NativeFunction(NativeFunction::Core(core)) => self.call_core(core, args, want),
            other => Err(LamnError::Call {
                got: other.type_name(),
            }),
        }
    }

    /// Resolve a table with a `__call` handler to the handler, with the
    /// table prepended to the arguments.
    pub(crate) fn call_target(
        &self,
        callee: Value,
        mut args: Vec<Value>,
    ) -> Result<(Value, Vec<Value>), LamnError> {
        if !matches!(callee, Value::Table(_)) {
            return Ok((callee, args));
        }
        let handler = self.metamethod(&callee, "__call")?;
        if handler.is_nil() || matches!(handler, Value::Table(_)) {
            return Err(LamnError::Call { got: "table" });
        }
        args.insert(0, callee);
        Ok((handler, args))
    }

    /// Push a frame for `closure`; its argument list becomes slot 0.
    pub(crate) fn enter(
        &mut self,
        closure: Rc<Closure>,
        args: Vec<Value>,
        want: u8,
        protected: bool,
    ) -> Result<(), LamnError> {
        let VmConfig {
            max_call_depth,
            max_stack,
            ..
        } = self.config;
        let thread = self.current();
        if thread.frames.len() >= max_call_depth || thread.stack.len() >= max_stack {
            return Err(LamnError::StackOverflow);
        }
        trace!(unit = %closure.unit.name, depth = thread.frames.len(), "enter");
        let base = thread.stack.len();
        let capture_base = thread.captures.len();
        thread.captures.extend(closure.upvalues.iter().cloned());
        thread.push(Value::multi(args));
        thread.frames.push(Frame {
            closure,
            ip: 0,
            base,
            capture_base,
            want,
            protected: u8::from(protected),
            condition: false,
        });
        Ok(())
    }

    /// Pop the current frame and deliver `results` to whoever is waiting.
    fn return_from(&mut self, mut results: Vec<Value>) -> Flow {
        let thread = self.current();
        let Some(frame) = thread.frames.pop() else {
            return Flow::Finished(results);
        };
        thread.stack.truncate(frame.base);
        thread.captures.truncate(frame.capture_base);
        if frame.condition {
            let truthy = results.first().is_some_and(Value::is_truthy);
            results = vec![Value::Boolean(truthy)];
        }
        for _ in 0..frame.protected {
            thread.handlers.pop();
            results.insert(0, Value::Boolean(true));
        }
        if !thread.frames.is_empty() {
            thread.push_results(frame.want, results);
            return Flow::Continue;
        }
        if self.thread_stack.len() <= 1 {
            return Flow::Finished(results);
        }
        // a finished coroutine looks like a final yield to its resumer
        trace!(thread = self.current_id().0, "coroutine finished");
        self.thread_stack.pop();
        results.insert(0, Value::Boolean(true));
        self.current().deliver(results);
        Flow::Continue
    }

    // ── Operators ─────────────────────────────────────────────────────────────

    fn arith(&mut self, kind: Arith) -> Result<(), LamnError> {
        let thread = self.current();
        let rhs = thread.pop();
        let lhs = thread.pop();
        if let (Value::Number(x), Value::Number(y)) = (&lhs, &rhs) {
            let result = kind.apply(*x, *y);
            self.current().push(Value::Number(result));
            return Ok(());
        }
        let got = if lhs.as_number().is_none() {
            lhs.type_name()
        } else {
            rhs.type_name()
        };
        self.call_metamethod(kind.event(), lhs, rhs, LamnError::Arithmetic { got })
    }

    fn compare(
        &mut self,
        test: fn(&Value, &Value) -> Option<bool>,
        event: &'static str,
    ) -> Result<(), LamnError> {
        let thread = self.current();
        let rhs = thread.pop();
        let lhs = thread.pop();
        if let Some(result) = test(&lhs, &rhs) {
            self.current().push(Value::Boolean(result));
            return Ok(());
        }
        let err = LamnError::Compare {
            lhs: lhs.type_name(),
            rhs: rhs.type_name(),
        };
        let id = self.current_id();
        let frames = self.current().frames.len();
        self.call_metamethod(event, lhs, rhs, err)?;
        if self.current_id() != id {
            return Ok(());
        }
        let thread = self.current();
        if thread.frames.len() > frames {
            if let Some(frame) = thread.frame_mut() {
                frame.condition = true;
            }
        } else {
            let result = thread.pop();
            thread.push(Value::Boolean(result.is_truthy()));
        }
        Ok(())
    }

    /// Dispatch to the `event` handler of either operand, or fail with `err`.
    fn call_metamethod(
        &mut self,
        event: &'static str,
        lhs: Value,
        rhs: Value,
        err: LamnError,
    ) -> Result<(), LamnError> {
        let mut handler = self.metamethod(&lhs, event)?;
        if handler.is_nil() {
            handler = self.metamethod(&rhs, event)?;
        }
        if handler.is_nil() {
            return Err(err);
        }
        trace!(event, "metamethod");
        self.call_value(handler, vec![lhs, rhs], 1)
    }

    /// Look `event` up through the metatable chain of `value`.
    pub(crate) fn metamethod(&self, value: &Value, event: &str) -> Result<Value, LamnError> {
        match value.metatable() {
            Some(mt) => Table::lookup(&mt, &Value::from(event), self.config.max_chain_depth),
            None => Ok(Value::Nil),
        }
    }

    /// `target[key]`, reading through the prototype chain. Strings index
    /// the `string` library table.
    fn index(&self, target: &Value, key: &Value) -> Result<Value, LamnError> {
        let depth = self.config.max_chain_depth;
        match target {
            Value::Table(t) => Table::lookup(t, key, depth),
            Value::String(_) => match self.globals.get("string") {
                Some(Value::Table(lib)) => Table::lookup(lib, key, depth),
                _ => Err(LamnError::Index { got: "string" }),
            },
            other => Err(LamnError::Index {
                got: other.type_name(),
            }),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

// ── Operand helpers ───────────────────────────────────────────────────────────

fn constant(closure: &Closure, idx: usize) -> Result<Value, LamnError> {
    closure
        .unit
        .constants
        .get(idx)
        .cloned()
        .ok_or_else(|| LamnError::Runtime(format!("constant {idx} out of range")))
}

fn global_name(closure: &Closure, idx: usize) -> Result<Rc<str>, LamnError> {
    match constant(closure, idx)? {
        Value::String(name) => Ok(name),
        other => Err(LamnError::Runtime(format!("global name must be a string, got {other:?}"))),
    }
}

fn upvalue(closure: &Closure, idx: usize) -> Result<&Cell, LamnError> {
    closure
        .upvalues
        .get(idx)
        .ok_or_else(|| LamnError::Runtime(format!("upvalue {idx} out of range")))
}

fn bad_slot(offset: usize) -> LamnError {
    LamnError::Runtime(format!("stack offset {offset} outside the frame"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
