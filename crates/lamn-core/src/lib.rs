//! `lamn-core`: types shared by every stage of the lamn pipeline.
//!
//! This crate defines:
//! - [`Value`]: the dynamically-typed value enum
//! - [`Cell`]: the shared mutable box behind stack slots and upvalues
//! - [`Table`]: prototype-chained associative tables
//! - [`CompiledUnit`] and [`Closure`]: compiled code and its runtime instances
//! - [`Instruction`] / [`OpCode`]: the packed 32-bit instruction format
//! - [`LamnError`]: the unified error type

pub mod closure;
pub mod error;
pub mod opcode;
pub mod table;
pub mod unit;
pub mod value;

pub use closure::{Cell, Closure};
pub use error::LamnError;
pub use opcode::{Effect, Instruction, OpCode};
pub use table::{Table, TableKey, TableRef};
pub use unit::{CompiledUnit, UnitId};
pub use value::{CoreFunction, HostFn, NativeFunction, ThreadId, Value};
