//! Property-based tests for tables against a plain map model.

use lamn_core::{Table, Value};
use proptest::prelude::*;
use std::collections::HashMap;

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Set(i64, Option<i64>),
    Append(i64),
    SetName(u8, Option<i64>),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..24, prop::option::of(-50i64..50)).prop_map(|(k, v)| Op::Set(k, v)),
        (-50i64..50).prop_map(Op::Append),
        (0u8..6, prop::option::of(-50i64..50)).prop_map(|(k, v)| Op::SetName(k, v)),
    ]
}

fn name(k: u8) -> Value {
    Value::from(format!("f{k}"))
}

fn to_value(v: Option<i64>) -> Value {
    v.map_or(Value::Nil, |n| Value::Number(n as f64))
}

/// Apply `ops` to a table and to a model keyed by display text.
fn build(ops: &[Op]) -> (Table, HashMap<String, Value>) {
    let mut table = Table::new();
    let mut model = HashMap::new();
    for op in ops {
        let (key, value) = match op {
            Op::Set(k, v) => (Value::Number(*k as f64), to_value(*v)),
            Op::Append(v) => (Value::Number((table.len() + 1) as f64), Value::Number(*v as f64)),
            Op::SetName(k, v) => (name(*k), to_value(*v)),
        };
        table.set(key.clone(), value.clone()).unwrap();
        if value.is_nil() {
            model.remove(&key.to_string());
        } else {
            model.insert(key.to_string(), value);
        }
    }
    (table, model)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every read agrees with the model.
    #[test]
    fn reads_match_the_model(ops in prop::collection::vec(arb_op(), 0..80)) {
        let (table, model) = build(&ops);
        for k in 0..30 {
            let key = Value::Number(k as f64);
            let expected = model.get(&key.to_string()).cloned().unwrap_or(Value::Nil);
            prop_assert_eq!(table.get(&key), expected);
        }
        for k in 0..6 {
            let expected = model.get(&name(k).to_string()).cloned().unwrap_or(Value::Nil);
            prop_assert_eq!(table.get(&name(k)), expected);
        }
    }

    /// `next` visits each live entry exactly once.
    #[test]
    fn traversal_visits_every_entry_once(ops in prop::collection::vec(arb_op(), 0..80)) {
        let (table, model) = build(&ops);
        let mut seen = HashMap::new();
        let mut key = Value::Nil;
        while let Some((k, v)) = table.next(&key).unwrap() {
            prop_assert!(seen.insert(k.to_string(), v).is_none(), "{} visited twice", k);
            key = k;
        }
        prop_assert_eq!(seen, model);
    }

    /// `len` is always a border: `t[n]` is set (or `n` is 0) and `t[n + 1]` is not.
    #[test]
    fn length_is_a_border(ops in prop::collection::vec(arb_op(), 0..80)) {
        let (table, _) = build(&ops);
        let n = table.len();
        if n > 0 {
            prop_assert!(!table.get(&Value::Number(n as f64)).is_nil());
        }
        prop_assert!(table.get(&Value::Number((n + 1) as f64)).is_nil());
    }
}
