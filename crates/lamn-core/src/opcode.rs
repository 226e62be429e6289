/// Instruction set of the lamn stack machine.
///
/// Every instruction is one 32-bit word: the opcode in the high 8 bits,
/// operand `a` in the next 16 bits and operand `b` in the low 8 bits.
/// Stack operands are relative: `GetStack 1` reads the current top.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // ── Stack ───────────────────────────────────────────────────────────────
    /// Push constant `a`.
    LoadK = 0x00,
    /// Push a copy of the value `a` slots below the top.
    GetStack = 0x01,
    /// Pop a value and store it into the cell `a` slots below the old top.
    PutStack = 0x02,
    /// Drop `a` slots.
    PopStack = 0x03,
    /// Push the global named by constant `a`.
    GetGlobal = 0x04,
    /// Pop a value into the global named by constant `a`.
    PutGlobal = 0x05,

    // ── Operators ───────────────────────────────────────────────────────────
    Add = 0x10,
    Sub = 0x11,
    Neg = 0x12,
    Mul = 0x13,
    Div = 0x14,
    Pow = 0x15,
    Concat = 0x16,
    Mod = 0x17,
    Len = 0x18,

    // ── Calls & control ─────────────────────────────────────────────────────
    /// Return `a` values; the last one is expanded if it is a multi-value.
    Ret = 0x20,
    /// Call with `a` arguments; keep `b` results, or one multi-value if 0.
    Call = 0x21,
    /// Jump to address `a`.
    Jmp = 0x22,
    /// Pop (or peek, if `b` is 1) and jump to `a` if truthy.
    JmpTrue = 0x23,
    /// Expand the multi-value on top into `a` values; `b` = 1 consumes it.
    PopVarArgs = 0x24,
    /// Coerce the three numeric-for control slots in place.
    ForPrep = 0x25,

    // ── Closures ────────────────────────────────────────────────────────────
    /// Move the top `a` stack cells onto the closure list.
    CloseVars = 0x30,
    /// Drop `a` entries from the closure list.
    PopClosed = 0x31,
    /// Instantiate nested unit `a` over the current closure list.
    Closure = 0x32,
    /// Push the value of upvalue `a`.
    GetUpval = 0x33,
    /// Pop a value into upvalue `a`.
    PutUpval = 0x34,

    // ── Comparison & logic ──────────────────────────────────────────────────
    Eq = 0x40,
    Not = 0x41,
    And = 0x42,
    Or = 0x43,
    LessEq = 0x44,
    Less = 0x45,

    // ── Tables ──────────────────────────────────────────────────────────────
    NewTable = 0x50,
    /// Pop value, key, table; store locally.
    PutTable = 0x51,
    /// Pop key, table; push the value found through the prototype chain.
    GetTable = 0x52,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        use OpCode::*;
        Some(match byte {
            0x00 => LoadK,
            0x01 => GetStack,
            0x02 => PutStack,
            0x03 => PopStack,
            0x04 => GetGlobal,
            0x05 => PutGlobal,
            0x10 => Add,
            0x11 => Sub,
            0x12 => Neg,
            0x13 => Mul,
            0x14 => Div,
            0x15 => Pow,
            0x16 => Concat,
            0x17 => Mod,
            0x18 => Len,
            0x20 => Ret,
            0x21 => Call,
            0x22 => Jmp,
            0x23 => JmpTrue,
            0x24 => PopVarArgs,
            0x25 => ForPrep,
            0x30 => CloseVars,
            0x31 => PopClosed,
            0x32 => Closure,
            0x33 => GetUpval,
            0x34 => PutUpval,
            0x40 => Eq,
            0x41 => Not,
            0x42 => And,
            0x43 => Or,
            0x44 => LessEq,
            0x45 => Less,
            0x50 => NewTable,
            0x51 => PutTable,
            0x52 => GetTable,
            _ => return None,
        })
    }

    /// Upper-case mnemonic used by the disassembler.
    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            LoadK => "LOADK",
            GetStack => "GETSTACK",
            PutStack => "PUTSTACK",
            PopStack => "POPSTACK",
            GetGlobal => "GETGLOBAL",
            PutGlobal => "PUTGLOBAL",
            Add => "ADD",
            Sub => "SUB",
            Neg => "NEG",
            Mul => "MUL",
            Div => "DIV",
            Pow => "POW",
            Concat => "CONCAT",
            Mod => "MOD",
            Len => "LEN",
            Ret => "RET",
            Call => "CALL",
            Jmp => "JMP",
            JmpTrue => "JMPTRUE",
            PopVarArgs => "POPVARGS",
            ForPrep => "FORPREP",
            CloseVars => "CLOSEVARS",
            PopClosed => "POPCLOSED",
            Closure => "CLOSURE",
            GetUpval => "GETUPVAL",
            PutUpval => "PUTUPVAL",
            Eq => "EQ",
            Not => "NOT",
            And => "AND",
            Or => "OR",
            LessEq => "LESSEQ",
            Less => "LESS",
            NewTable => "NEWTABLE",
            PutTable => "PUTTABLE",
            GetTable => "GETTABLE",
        }
    }

    /// True for instructions whose `a` operand is a code address.
    pub fn is_jump(self) -> bool {
        matches!(self, OpCode::Jmp | OpCode::JmpTrue)
    }
}

/// Net effect of one instruction on the value stack and the closure list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Effect {
    pub stack: isize,
    pub closed: isize,
}

/// A packed instruction word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(u32);

impl Instruction {
    pub const MAX_A: usize = u16::MAX as usize;
    pub const MAX_B: usize = u8::MAX as usize;

    pub fn new(op: OpCode, a: u16, b: u8) -> Self {
        Self(((op as u32) << 24) | ((a as u32) << 8) | b as u32)
    }

    pub fn op(op: OpCode) -> Self {
        Self::new(op, 0, 0)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn opcode(self) -> Option<OpCode> {
        OpCode::from_byte((self.0 >> 24) as u8)
    }

    pub fn a(self) -> usize {
        ((self.0 >> 8) & 0xFFFF) as usize
    }

    pub fn b(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    /// Same instruction with operand `a` replaced (used for jump patching).
    pub fn with_a(self, a: u16) -> Self {
        Self((self.0 & 0xFF00_00FF) | ((a as u32) << 8))
    }

    /// Static stack and closure-list effect, shared by the compiler's depth
    /// tracking and the verifier. `None` for an undecodable word.
    pub fn effect(self) -> Option<Effect> {
        use OpCode::*;
        let a = self.a() as isize;
        let b = self.b() as isize;
        let stack = match self.opcode()? {
            LoadK | GetStack | GetGlobal | Closure | GetUpval | NewTable => 1,
            PutStack | PutGlobal | PutUpval => -1,
            PopStack => -a,
            Add | Sub | Mul | Div | Pow | Concat | Mod => -1,
            Eq | And | Or | LessEq | Less | GetTable => -1,
            Neg | Not | Len | Jmp | ForPrep | CloseVars | PopClosed => 0,
            PutTable => -3,
            Ret => -a,
            // callee and arguments are replaced by `b` results (or one multi-value)
            Call => (if b == 0 { 1 } else { b }) - (a + 1),
            JmpTrue => {
                if b == 1 {
                    0
                } else {
                    -1
                }
            }
            PopVarArgs => a - b,
        };
        let closed = match self.opcode()? {
            CloseVars => a,
            PopClosed => -a,
            _ => 0,
        };
        Some(Effect { stack, closed })
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{op:?}({}, {})", self.a(), self.b()),
            None => write!(f, "Invalid({:#010x})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operands_pack_into_their_fields() {
        let ins = Instruction::new(OpCode::Call, 0xABCD, 0x7F);
        assert_eq!(ins.opcode(), Some(OpCode::Call));
        assert_eq!(ins.a(), 0xABCD);
        assert_eq!(ins.b(), 0x7F);
        assert_eq!(ins.raw() >> 24, 0x21);
    }

    #[test]
    fn patching_a_keeps_op_and_b() {
        let ins = Instruction::new(OpCode::JmpTrue, 0, 1).with_a(300);
        assert_eq!(ins.opcode(), Some(OpCode::JmpTrue));
        assert_eq!(ins.a(), 300);
        assert_eq!(ins.b(), 1);
    }

    #[test]
    fn every_opcode_byte_round_trips() {
        for byte in 0..=u8::MAX {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(OpCode::from_byte(0xFF), None);
    }

    #[test]
    fn unknown_opcode_has_no_effect() {
        assert_eq!(Instruction::from_raw(0xFF00_0000).effect(), None);
    }

    #[test]
    fn call_effects() {
        // f(a, b) kept as one multi-value: 3 slots in, 1 out
        let multi = Instruction::new(OpCode::Call, 2, 0).effect().unwrap();
        assert_eq!(multi.stack, -2);
        // synthetic metamethod call keeping one result
        let fixed = Instruction::new(OpCode::Call, 2, 1).effect().unwrap();
        assert_eq!(fixed.stack, -2);
        let three = Instruction::new(OpCode::Call, 0, 3).effect().unwrap();
        assert_eq!(three.stack, 2);
    }

    #[test]
    fn vararg_expansion_effects() {
        let keep = Instruction::new(OpCode::PopVarArgs, 2, 0).effect().unwrap();
        assert_eq!(keep.stack, 2);
        let consume = Instruction::new(OpCode::PopVarArgs, 2, 1).effect().unwrap();
        assert_eq!(consume.stack, 1);
        let discard = Instruction::new(OpCode::PopVarArgs, 0, 1).effect().unwrap();
        assert_eq!(discard.stack, -1);
    }

    #[test]
    fn closure_list_effects() {
        let close = Instruction::new(OpCode::CloseVars, 3, 0).effect().unwrap();
        assert_eq!(close, Effect { stack: 0, closed: 3 });
        let release = Instruction::new(OpCode::PopClosed, 2, 0).effect().unwrap();
        assert_eq!(release, Effect { stack: 0, closed: -2 });
    }

    #[test]
    fn conditional_jump_peek_keeps_value() {
        assert_eq!(Instruction::new(OpCode::JmpTrue, 9, 1).effect().unwrap().stack, 0);
        assert_eq!(Instruction::new(OpCode::JmpTrue, 9, 0).effect().unwrap().stack, -1);
    }
}
