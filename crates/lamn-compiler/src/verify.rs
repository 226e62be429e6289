//! Static stack-balance check over compiled units.
//!
//! Every reachable instruction must be entered with one stack depth and one
//! closure-list depth, whichever path leads to it.

use lamn_core::{CompiledUnit, LamnError, OpCode};

/// Depths on entry to an instruction: value-stack slots above the frame base
/// (the argument slot included) and closure-list entries added by this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct State {
    depth: isize,
    closed: isize,
}

/// Check `unit` and every nested unit.
pub fn verify(unit: &CompiledUnit) -> Result<(), LamnError> {
    let mut result = Ok(());
    unit.walk(&mut |u| {
        if result.is_ok() {
            result = verify_unit(u);
        }
    });
    result
}

fn verify_unit(unit: &CompiledUnit) -> Result<(), LamnError> {
    let fail = |ip: usize, msg: String| {
        Err(LamnError::Compile(format!(
            "verification of '{}' failed at {ip:04}: {msg}",
            unit.name
        )))
    };

    let mut seen: Vec<Option<State>> = vec![None; unit.code.len()];
    let mut work = vec![(0usize, State { depth: 1, closed: 0 })];

    while let Some((ip, state)) = work.pop() {
        let Some(&ins) = unit.code.get(ip) else {
            return fail(ip, "control runs past the end of the unit".into());
        };
        match seen[ip] {
            Some(prev) if prev == state => continue,
            Some(prev) => {
                return fail(
                    ip,
                    format!("paths disagree: {prev:?} vs {state:?}"),
                )
            }
            None => seen[ip] = Some(state),
        }

        let Some(op) = ins.opcode() else {
            return fail(ip, format!("invalid instruction {:#010x}", ins.raw()));
        };
        let Some(effect) = ins.effect() else {
            return fail(ip, format!("{op:?} has no stack effect"));
        };
        let a = ins.a();

        match op {
            OpCode::GetStack if a == 0 || a as isize > state.depth => {
                return fail(ip, format!("read offset {a} outside a frame of {}", state.depth));
            }
            OpCode::PutStack if a < 2 || a as isize > state.depth => {
                return fail(ip, format!("write offset {a} outside a frame of {}", state.depth));
            }
            OpCode::LoadK | OpCode::GetGlobal | OpCode::PutGlobal
                if a >= unit.constants.len() =>
            {
                return fail(ip, format!("constant {a} out of range"));
            }
            OpCode::Closure if unit.children.keys().all(|id| id.0 as usize != a) => {
                return fail(ip, format!("no nested unit {a}"));
            }
            _ => {}
        }

        let next = State {
            depth: state.depth + effect.stack,
            closed: state.closed + effect.closed,
        };
        if next.depth < 1 {
            return fail(ip, format!("{op:?} pops below the frame origin"));
        }
        if next.closed < 0 {
            return fail(ip, format!("{op:?} releases more cells than were closed"));
        }

        match op {
            OpCode::Ret => {}
            OpCode::Jmp => work.push((a, next)),
            OpCode::JmpTrue => {
                work.push((a, next));
                work.push((ip + 1, next));
            }
            _ => work.push((ip + 1, next)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Compiler;
    use lamn_core::{Instruction, UnitId, Value};
    use lamn_parser::Parser;
    use std::collections::BTreeMap;

    fn unit(code: Vec<Instruction>) -> CompiledUnit {
        CompiledUnit {
            id: UnitId(0),
            name: "t".into(),
            lines: vec![1; code.len()],
            code,
            constants: vec![Value::Nil],
            children: BTreeMap::new(),
            param_count: 0,
            is_vararg: false,
            source: "test".into(),
        }
    }

    #[test]
    fn compiled_programs_verify() {
        let src = r#"
            local t = {1, 2, n = 3}
            for i = 1, #t do
                if t[i] > 1 then break elseif t[i] then t.n = i else end
            end
            for k, v in next, t do local w = v end
            repeat local x = 1 until x
            while false do local y = function() return y end end
            local a, b = (function(...) return ... end)(1, 2)
        "#;
        let block = Parser::new(src).unwrap().parse().unwrap();
        let unit = Compiler::new("test").compile(&block).unwrap();
        verify(&unit).unwrap();
    }

    #[test]
    fn mismatched_join_is_rejected() {
        let u = unit(vec![
            Instruction::op(OpCode::LoadK),
            Instruction::new(OpCode::JmpTrue, 2, 0),
            Instruction::op(OpCode::Ret),
        ]);
        verify(&u).unwrap();

        // JMPTRUE skips the second LOADK, so the RET is reached at two depths
        let u = unit(vec![
            Instruction::op(OpCode::LoadK),
            Instruction::new(OpCode::JmpTrue, 3, 0),
            Instruction::op(OpCode::LoadK),
            Instruction::op(OpCode::Ret),
        ]);
        let err = verify(&u).unwrap_err();
        assert!(err.to_string().contains("paths disagree"));
    }

    #[test]
    fn popping_the_argument_slot_is_rejected() {
        let u = unit(vec![
            Instruction::new(OpCode::PopStack, 1, 0),
            Instruction::op(OpCode::Ret),
        ]);
        assert!(verify(&u).is_err());
    }

    #[test]
    fn read_outside_frame_is_rejected() {
        let u = unit(vec![
            Instruction::new(OpCode::GetStack, 2, 0),
            Instruction::op(OpCode::Ret),
        ]);
        assert!(verify(&u).is_err());
    }

    #[test]
    fn falling_off_the_end_is_rejected() {
        let u = unit(vec![Instruction::op(OpCode::LoadK)]);
        assert!(verify(&u).unwrap_err().to_string().contains("past the end"));
    }
}
