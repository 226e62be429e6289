//! `lamn-parser`: builds the syntax tree from the token stream of `lamn-lexer`.

pub mod ast;
pub mod parser;

pub use ast::Block;
pub use parser::Parser;
