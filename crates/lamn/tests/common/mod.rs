#![allow(dead_code)]

use lamn::{Engine, LamnError, Value, VmConfig};
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// Collects everything a script prints.
#[derive(Clone, Default)]
pub struct Captured(Rc<RefCell<Vec<u8>>>);

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn engine() -> (Engine, Captured) {
    let out = Captured::default();
    (Engine::with_output(VmConfig::default(), out.clone()), out)
}

pub fn run(src: &str) -> Vec<Value> {
    let (mut engine, _) = engine();
    engine
        .run(src, "test")
        .unwrap_or_else(|e| panic!("script failed: {e}\n{src}"))
}

pub fn run_err(src: &str) -> LamnError {
    let (mut engine, _) = engine();
    match engine.run(src, "test") {
        Ok(values) => panic!("expected an error, got {values:?}\n{src}"),
        Err(e) => e,
    }
}

/// Run a script and return what it printed.
pub fn output(src: &str) -> String {
    let (mut engine, out) = engine();
    engine
        .run(src, "test")
        .unwrap_or_else(|e| panic!("script failed: {e}\n{src}"));
    out.text()
}

pub fn num(n: f64) -> Value {
    Value::Number(n)
}

pub fn s(text: &str) -> Value {
    Value::from(text)
}

pub fn b(v: bool) -> Value {
    Value::Boolean(v)
}
