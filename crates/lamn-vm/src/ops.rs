//! Operator semantics on plain values. Metamethod fallback lives in the VM.

use lamn_core::Value;

/// A binary arithmetic operator and the metamethod that overloads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl Arith {
    pub fn event(self) -> &'static str {
        match self {
            Arith::Add => "__add",
            Arith::Sub => "__sub",
            Arith::Mul => "__mul",
            Arith::Div => "__div",
            Arith::Mod => "__mod",
            Arith::Pow => "__pow",
        }
    }

    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Arith::Add => a + b,
            Arith::Sub => a - b,
            Arith::Mul => a * b,
            Arith::Div => a / b,
            // result takes the sign of the divisor
            Arith::Mod => a - (a / b).floor() * b,
            Arith::Pow => a.powf(b),
        }
    }
}

/// `a .. b` for strings and numbers; `None` if either side is neither.
pub fn concat(a: &Value, b: &Value) -> Option<String> {
    let mut out = piece(a)?;
    out.push_str(&piece(b)?);
    Some(out)
}

fn piece(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.to_string()),
        Value::Number(_) => Some(v.to_string()),
        _ => None,
    }
}

/// `a < b` for two numbers or two strings.
pub fn less(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Some(x < y),
        (Value::String(x), Value::String(y)) => Some(x < y),
        _ => None,
    }
}

/// `a <= b` for two numbers or two strings.
pub fn less_eq(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Some(x <= y),
        (Value::String(x), Value::String(y)) => Some(x <= y),
        _ => None,
    }
}

/// Parse a numeric string the way `tonumber` does: decimal, exponent or `0x` hex.
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let n = u64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if negative { -n } else { n });
    }
    // reject the spellings Rust accepts but scripts do not
    if s.is_empty() || s.chars().any(|c| c.is_ascii_alphabetic() && !matches!(c, 'e' | 'E')) {
        return None;
    }
    s.parse().ok()
}

/// A number, or a string that parses as one.
pub fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => Some(*n),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}
