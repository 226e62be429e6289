//! `lamn`: embedding API: source text in, results out.
//!
//! ```
//! let mut engine = lamn::Engine::new();
//! let results = engine.run("local t = {1, 2, 3} return #t * 2", "example")?;
//! assert_eq!(results, vec![lamn::Value::Number(6.0)]);
//! # Ok::<(), lamn::LamnError>(())
//! ```

use lamn_core::Closure;
use lamn_vm::Vm;
use std::io::Write;
use std::rc::Rc;
use tracing::debug;

pub use lamn_core::{CompiledUnit, LamnError, Value};
pub use lamn_vm::VmConfig;

/// Parse and compile `source` into a root unit labelled `name`.
pub fn compile(source: &str, name: &str) -> Result<Rc<CompiledUnit>, LamnError> {
    lamn_compiler::compile_source(source, name)
}

/// A VM with the base library installed.
pub struct Engine {
    vm: Vm,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self::from_vm(Vm::with_config(config))
    }

    /// An engine whose `print` writes to `out`.
    pub fn with_output(config: VmConfig, out: impl Write + 'static) -> Self {
        Self::from_vm(Vm::with_output(config, out))
    }

    fn from_vm(vm: Vm) -> Self {
        Self { vm }
    }

    /// Compile and run a chunk, returning whatever it returns.
    pub fn run(&mut self, source: &str, name: &str) -> Result<Vec<Value>, LamnError> {
        let unit = compile(source, name)?;
        self.execute(unit)
    }

    pub fn execute(&mut self, unit: Rc<CompiledUnit>) -> Result<Vec<Value>, LamnError> {
        self.execute_with_args(unit, Vec::new())
    }

    /// Run a compiled chunk with `args` bound to its `...`.
    pub fn execute_with_args(
        &mut self,
        unit: Rc<CompiledUnit>,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, LamnError> {
        debug!(source = %unit.source, args = args.len(), "running chunk");
        let chunk = Value::Closure(Rc::new(Closure::root(unit)));
        self.vm.call(chunk, args)
    }

    /// Call a function value, typically one a script stored in a global.
    pub fn call(&mut self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, LamnError> {
        self.vm.call(func, args)
    }

    pub fn put_global(&mut self, name: &str, value: Value) {
        self.vm.put_global(name, value);
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.vm.get_global(name)
    }

    pub fn register(
        &mut self,
        name: &str,
        func: impl Fn(Vec<Value>) -> Result<Vec<Value>, LamnError> + 'static,
    ) {
        self.vm.register(name, func);
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
