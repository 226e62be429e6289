//! `lamn-vm`: stack-based virtual machine that executes compiled units.
//!
//! Each coroutine runs on its own value stack. Stack slots and upvalues are
//! shared [`Cell`](lamn_core::Cell)s, so a closure sees every later write to a
//! local it captured.

pub mod config;
mod coroutine;
pub mod ops;
mod protected;
mod stdlib;
mod thread;
pub mod vm;

#[cfg(test)]
mod testing;

pub use config::VmConfig;
pub use vm::Vm;
