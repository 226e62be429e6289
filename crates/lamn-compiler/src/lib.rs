//! `lamn-compiler`: lowers a lamn syntax tree to stack-machine bytecode.

pub mod builder;
pub mod compiler;
pub mod disasm;
pub mod verify;

pub use compiler::Compiler;
pub use disasm::disassemble;
pub use verify::verify;

use lamn_core::{CompiledUnit, LamnError};
use lamn_parser::Parser;
use std::rc::Rc;

/// Parse and compile `source` into a root unit labelled `name`.
pub fn compile_source(source: &str, name: &str) -> Result<Rc<CompiledUnit>, LamnError> {
    let block = Parser::new(source)?.parse()?;
    Compiler::new(name).compile(&block)
}
