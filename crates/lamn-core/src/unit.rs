//! The compiler's output artifact.

use crate::opcode::Instruction;
use crate::value::Value;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Identifies a compiled unit within one compile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u16);

/// One compiled function or chunk body, immutable after compilation.
///
/// Nested function bodies are compiled into their own units and stored in
/// `children`, keyed by the id that `Closure` instructions carry.
#[derive(Debug)]
pub struct CompiledUnit {
    pub id: UnitId,
    /// Function name for diagnostics (`main chunk` for the root).
    pub name: String,
    pub code: Vec<Instruction>,
    /// De-duplicated constant pool.
    pub constants: Vec<Value>,
    pub children: BTreeMap<UnitId, Rc<CompiledUnit>>,
    /// Source line of each instruction, parallel to `code`.
    pub lines: Vec<u32>,
    pub param_count: u8,
    pub is_vararg: bool,
    /// Chunk label the unit was compiled from.
    pub source: String,
}

impl CompiledUnit {
    pub fn child(&self, id: UnitId) -> Option<&Rc<CompiledUnit>> {
        self.children.get(&id)
    }

    pub fn line_at(&self, ip: usize) -> Option<u32> {
        self.lines.get(ip).copied()
    }

    /// Visit this unit and every nested unit, parents first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a CompiledUnit)) {
        visit(self);
        for child in self.children.values() {
            child.walk(visit);
        }
    }
}
