use lamn_core::{CompiledUnit, Instruction, OpCode, Value};
use std::fmt::Write;

/// Disassemble a [`CompiledUnit`] into a human-readable string.
///
/// Recursively disassembles nested units in id order so you see the full picture.
pub fn disassemble(unit: &CompiledUnit) -> String {
    let mut out = String::new();
    unit.walk(&mut |u| {
        if !out.is_empty() {
            out.push('\n');
        }
        disasm_unit(u, &mut out);
    });
    out
}

fn disasm_unit(unit: &CompiledUnit, out: &mut String) {
    // Header
    let _ = writeln!(
        out,
        "== {} #{} ==  (source={}, params={}, vararg={})",
        unit.name, unit.id.0, unit.source, unit.param_count, unit.is_vararg
    );

    // Constants pool
    if !unit.constants.is_empty() {
        out.push_str("constants:\n");
        for (i, c) in unit.constants.iter().enumerate() {
            let _ = writeln!(out, "  [K{i}]  {}", fmt_value(c));
        }
    }

    // Instructions
    out.push_str("instructions:\n");
    for (i, ins) in unit.code.iter().enumerate() {
        let line = unit.line_at(i).unwrap_or(0);
        let _ = writeln!(out, "  {i:04}  [{line:>3}]  {}", fmt_instruction(*ins, unit));
    }
}

fn fmt_value(v: &Value) -> String {
    match v {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

fn fmt_instruction(ins: Instruction, unit: &CompiledUnit) -> String {
    let Some(op) = ins.opcode() else {
        return format!("??? {:#010x}", ins.raw());
    };
    let (a, b) = (ins.a(), ins.b());
    let name = op.mnemonic();
    let constant = |idx: usize| {
        unit.constants
            .get(idx)
            .map(fmt_value)
            .unwrap_or_else(|| "?".to_string())
    };
    match op {
        OpCode::LoadK | OpCode::GetGlobal | OpCode::PutGlobal => {
            format!("{name:<10} K{a}({})", constant(a))
        }
        OpCode::Jmp => format!("{name:<10} -> {a:04}"),
        OpCode::JmpTrue => {
            let mode = if b == 1 { "peek" } else { "pop" };
            format!("{name:<10} -> {a:04}  {mode}")
        }
        OpCode::Call => {
            let results = if b == 0 { "multi".to_string() } else { b.to_string() };
            format!("{name:<10} args={a}  results={results}")
        }
        OpCode::PopVarArgs => {
            let mode = if b == 1 { "consume" } else { "keep rest" };
            format!("{name:<10} {a}  {mode}")
        }
        OpCode::Closure => {
            let child = unit
                .children
                .values()
                .find(|c| c.id.0 as usize == a)
                .map(|c| c.name.as_str())
                .unwrap_or("?");
            format!("{name:<10} #{a}({child})")
        }
        OpCode::GetStack
        | OpCode::PutStack
        | OpCode::PopStack
        | OpCode::Ret
        | OpCode::CloseVars
        | OpCode::PopClosed
        | OpCode::GetUpval
        | OpCode::PutUpval => format!("{name:<10} {a}"),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Compiler;
    use lamn_parser::Parser;

    fn disasm(src: &str) -> String {
        let block = Parser::new(src).unwrap().parse().unwrap();
        disassemble(&Compiler::new("test").compile(&block).unwrap())
    }

    #[test]
    fn shows_constants_and_lines() {
        let text = disasm("x = 'hi'\nreturn x");
        assert!(text.contains("== main chunk #0 =="));
        assert!(text.contains("[K0]  \"hi\""));
        assert!(text.contains("PUTGLOBAL  K1(\"x\")"));
        assert!(text.contains("[  2]  GETGLOBAL"));
    }

    #[test]
    fn nested_units_follow_their_parent() {
        let text = disasm("local function inner() return 1 end");
        let root = text.find("== main chunk").unwrap();
        let child = text.find("== inner #1").unwrap();
        assert!(root < child);
        assert!(text.contains("CLOSURE    #1(inner)"));
    }

    #[test]
    fn jumps_show_targets() {
        let text = disasm("return a and b");
        assert!(text.contains("JMPTRUE    -> 0003  peek"));
    }
}
