//! Shared cells and closure instances.

use crate::unit::CompiledUnit;
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

// ── Cells ─────────────────────────────────────────────────────────────────────

/// A single mutable value box.
///
/// Every stack slot is a `Cell`. Closures capture the cell itself, so a write
/// through the stack slot is visible to every closure holding it, and the cell
/// outlives the frame that created it for as long as any closure refers to it.
#[derive(Clone)]
pub struct Cell(Rc<RefCell<Value>>);

impl Cell {
    pub fn new(value: Value) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    /// Copy the current contents out of the cell.
    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    /// Overwrite the contents in place; aliases observe the new value.
    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = value;
    }

    /// Move the contents out, leaving `nil` behind.
    pub fn take(&self) -> Value {
        std::mem::replace(&mut *self.0.borrow_mut(), Value::Nil)
    }

    pub fn ptr_eq(a: &Cell, b: &Cell) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell({:?})", self.0.borrow())
    }
}

// ── Closure ───────────────────────────────────────────────────────────────────

/// A runtime closure: a [`CompiledUnit`] paired with the cells it captured.
///
/// `upvalues[i]` is the cell that sat at closure-list position `i` of the
/// creating frame when the closure was made.
#[derive(Debug)]
pub struct Closure {
    pub unit: Rc<CompiledUnit>,
    pub upvalues: Vec<Cell>,
}

impl Closure {
    pub fn new(unit: Rc<CompiledUnit>, upvalues: Vec<Cell>) -> Self {
        Self { unit, upvalues }
    }

    /// Wrap a root unit, which never captures anything.
    pub fn root(unit: Rc<CompiledUnit>) -> Self {
        Self::new(unit, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let a = Cell::new(Value::Number(1.0));
        let b = a.clone();
        b.set(Value::Number(2.0));
        assert_eq!(a.get(), Value::Number(2.0));
        assert!(Cell::ptr_eq(&a, &b));
    }

    #[test]
    fn fresh_cells_are_distinct() {
        let a = Cell::new(Value::Nil);
        let b = Cell::new(Value::Nil);
        assert!(!Cell::ptr_eq(&a, &b));
    }

    #[test]
    fn take_leaves_nil() {
        let a = Cell::new(Value::from("x"));
        assert_eq!(a.take(), Value::from("x"));
        assert_eq!(a.get(), Value::Nil);
    }
}
