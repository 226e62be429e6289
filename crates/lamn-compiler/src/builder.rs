use lamn_core::{CompiledUnit, Instruction, LamnError, OpCode, UnitId, Value};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Symbolic jump target, resolved to an address once the unit is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Mutable builder for a [`CompiledUnit`] during compilation.
#[derive(Debug, Default)]
pub struct UnitBuilder {
    pub code: Vec<Instruction>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
    pub children: BTreeMap<UnitId, Rc<CompiledUnit>>,
    pub param_count: u8,
    pub is_vararg: bool,
    /// Address of each label, once placed.
    labels: Vec<Option<usize>>,
    /// `(instruction index, label)` pairs awaiting their address.
    pending: Vec<(usize, Label)>,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, ins: Instruction, line: u32) -> usize {
        self.code.push(ins);
        self.lines.push(line);
        self.code.len() - 1
    }

    /// Emit a jump whose address is filled in by [`finish`](Self::finish).
    pub fn emit_jump(&mut self, op: OpCode, peek: bool, target: Label, line: u32) -> usize {
        let at = self.emit(Instruction::new(op, 0, peek as u8), line);
        self.pending.push((at, target));
        at
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn place_label(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn add_constant(&mut self, value: Value) -> Result<u16, LamnError> {
        if let Some(idx) = self.constants.iter().position(|c| c == &value) {
            return Ok(idx as u16);
        }
        let idx = u16::try_from(self.constants.len())
            .map_err(|_| LamnError::Compile("too many constants in one function".into()))?;
        self.constants.push(value);
        Ok(idx)
    }

    pub fn add_child(&mut self, unit: Rc<CompiledUnit>) {
        self.children.insert(unit.id, unit);
    }

    /// Resolve every pending jump and freeze the unit.
    pub fn finish(mut self, id: UnitId, name: String, source: String) -> Result<CompiledUnit, LamnError> {
        if self.code.len() > Instruction::MAX_A {
            return Err(LamnError::Compile(format!(
                "function '{name}' is too large ({} instructions)",
                self.code.len()
            )));
        }
        for &(at, label) in &self.pending {
            let addr = self.labels[label.0]
                .ok_or_else(|| LamnError::Compile(format!("unresolved jump label in '{name}'")))?;
            self.code[at] = self.code[at].with_a(addr as u16);
        }
        Ok(CompiledUnit {
            id,
            name,
            code: self.code,
            constants: self.constants,
            children: self.children,
            lines: self.lines,
            param_count: self.param_count,
            is_vararg: self.is_vararg,
            source,
        })
    }
}
