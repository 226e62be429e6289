//! Helpers shared by the VM's unit tests.

use crate::{Vm, VmConfig};
use lamn_compiler::Compiler;
use lamn_core::{Closure, LamnError, Value};
use lamn_parser::Parser;
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// A `print` sink the test can read back after the VM is done with it.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn compile(src: &str) -> Rc<Closure> {
    let block = Parser::new(src).unwrap().parse().unwrap();
    Rc::new(Closure::root(Compiler::new("<test>").compile(&block).unwrap()))
}

fn execute(src: &str) -> (Result<Vec<Value>, LamnError>, String) {
    let out = SharedBuf::default();
    let mut vm = Vm::with_output(VmConfig::default(), out.clone());
    let result = vm.execute(compile(src));
    (result, out.contents())
}

pub(crate) fn run(src: &str) -> Vec<Value> {
    match execute(src).0 {
        Ok(values) => values,
        Err(e) => panic!("script failed: {e}\n{src}"),
    }
}

pub(crate) fn run_one(src: &str) -> Value {
    run(src).into_iter().next().unwrap_or(Value::Nil)
}

pub(crate) fn run_err(src: &str) -> LamnError {
    match execute(src).0 {
        Ok(values) => panic!("expected an error, got {values:?}\n{src}"),
        Err(e) => e,
    }
}

pub(crate) fn run_with_output(src: &str) -> (Vec<Value>, String) {
    let (result, out) = execute(src);
    (result.unwrap(), out)
}

pub(crate) fn num(n: f64) -> Value {
    Value::Number(n)
}
