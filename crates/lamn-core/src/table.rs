use crate::error::LamnError;
use crate::value::{NativeFunction, Value};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

pub type TableRef = Rc<RefCell<Table>>;

/// A key usable in a [`Table`]: any value except `nil`, NaN and multi-values.
///
/// Numbers compare by value (`-0` and `0` are the same key), strings by
/// content, and reference types by identity.
#[derive(Debug, Clone)]
pub struct TableKey(Value);

impl TableKey {
    pub fn new(value: Value) -> Result<Self, LamnError> {
        match &value {
            Value::Nil => Err(LamnError::InvalidKey("nil")),
            Value::Number(n) if n.is_nan() => Err(LamnError::InvalidKey("NaN")),
            Value::VarArgs(_) => Err(LamnError::InvalidKey("a multi-value")),
            _ => Ok(TableKey(value)),
        }
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.0).hash(state);
        match &self.0 {
            // +0.0 so that -0 and 0 land in the same bucket
            Value::Number(n) => (n + 0.0).to_bits().hash(state),
            Value::Boolean(b) => b.hash(state),
            Value::String(s) => s.hash(state),
            Value::Table(t) => Rc::as_ptr(t).hash(state),
            Value::Closure(c) => Rc::as_ptr(c).hash(state),
            Value::NativeFunction(NativeFunction::Host { func, .. }) => {
                (Rc::as_ptr(func) as *const u8).hash(state)
            }
            Value::NativeFunction(NativeFunction::Core(core)) => core.hash(state),
            Value::Thread(id) => id.hash(state),
            Value::Nil | Value::VarArgs(_) => {}
        }
    }
}

/// An associative array with an optional parent link.
///
/// Integer keys `1..=n` live in a dense `array` part; every other key goes to
/// the hash part, kept in insertion order so `next` can resume from any key.
/// Reads that miss fall through to the metatable, which acts as the prototype;
/// writes always land in the table itself.
#[derive(Default)]
pub struct Table {
    /// `array[i]` is `t[i + 1]`. Cleared slots hold `nil` until overwritten.
    array: Vec<Value>,
    /// Hash entries in insertion order. Cleared entries stay as `nil` so a
    /// traversal can step past them; they are dropped on the next compaction.
    slots: Vec<(TableKey, Value)>,
    index: FxHashMap<TableKey, usize>,
    /// Non-nil entries in `slots`.
    live: usize,
    metatable: Option<TableRef>,
}

/// Zero-based array position for an integer key of at least 1.
fn array_index(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if *n >= 1.0 && n.fract() == 0.0 => Some(*n as usize - 1),
        _ => None,
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, mt: Option<TableRef>) {
        self.metatable = mt;
    }

    /// Read `t[key]` without consulting the prototype chain.
    pub fn get(&self, key: &Value) -> Value {
        if let Some(value) = array_index(key).and_then(|i| self.array.get(i)) {
            return value.clone();
        }
        let Ok(key) = TableKey::new(key.clone()) else {
            return Value::Nil;
        };
        self.index
            .get(&key)
            .and_then(|&i| self.slots.get(i))
            .map_or(Value::Nil, |(_, v)| v.clone())
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.get(&Value::from(key))
    }

    /// Write `t[key] = value`. Assigning `nil` removes the entry.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), LamnError> {
        let key = TableKey::new(key)?;
        self.assign(key, value);
        Ok(())
    }

    /// `set` for a string key, which is always valid.
    pub fn set_str(&mut self, key: &str, value: Value) {
        self.assign(TableKey(Value::from(key)), value);
    }

    fn assign(&mut self, key: TableKey, value: Value) {
        if let Some(i) = array_index(key.value()) {
            if let Some(slot) = self.array.get_mut(i) {
                *slot = value;
                return;
            }
            if i == self.array.len() && !value.is_nil() {
                self.unlink(&key);
                self.array.push(value);
                self.migrate_sequence();
                return;
            }
        }
        if !self.index.contains_key(&key) {
            if value.is_nil() {
                return;
            }
            if self.slots.len() >= 2 * self.live + 8 {
                self.compact();
            }
        }
        self.put_slot(key, value);
    }

    /// A border of the sequence: `t[n]` is non-nil (or `n` is 0) and
    /// `t[n + 1]` is nil. With no holes this is the length of `t[1..]`.
    pub fn len(&self) -> usize {
        let mut hi = self.array.len();
        if self.array.last().map_or(true, |v| !v.is_nil()) {
            return hi;
        }
        // array[hi - 1] is nil; lo is 0 or has array[lo - 1] non-nil
        let mut lo = 0;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if self.array[mid - 1].is_nil() {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        lo
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0 && self.array.iter().all(Value::is_nil)
    }

    /// The entry after `key` in iteration order, or the first entry if `key`
    /// is nil. The array part comes first, then hash entries in insertion
    /// order. Clearing fields during a traversal is allowed; adding new keys
    /// is not.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, LamnError> {
        let (array_from, slot_from) = match array_index(key) {
            _ if key.is_nil() => (0, 0),
            Some(i) if i < self.array.len() => (i + 1, 0),
            _ => {
                let k = TableKey::new(key.clone())?;
                match self.index.get(&k) {
                    Some(&slot) => (self.array.len(), slot + 1),
                    None => return Err(LamnError::Runtime("invalid key to 'next'".into())),
                }
            }
        };
        let in_array = self
            .array
            .iter()
            .enumerate()
            .skip(array_from)
            .find(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::Number((i + 1) as f64), v.clone()));
        if in_array.is_some() {
            return Ok(in_array);
        }
        Ok(self
            .slots
            .iter()
            .skip(slot_from)
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.value().clone(), v.clone())))
    }

    fn put_slot(&mut self, key: TableKey, value: Value) {
        let filled = !value.is_nil();
        match self.index.get(&key) {
            Some(&i) => {
                if !self.slots[i].1.is_nil() {
                    self.live -= 1;
                }
                self.slots[i].1 = value;
            }
            None => {
                self.index.insert(key.clone(), self.slots.len());
                self.slots.push((key, value));
            }
        }
        if filled {
            self.live += 1;
        }
    }

    /// Drop `key` from the hash part, returning its value.
    fn unlink(&mut self, key: &TableKey) -> Value {
        let Some(i) = self.index.remove(key) else {
            return Value::Nil;
        };
        let value = std::mem::replace(&mut self.slots[i].1, Value::Nil);
        if !value.is_nil() {
            self.live -= 1;
        }
        value
    }

    /// Pull the keys that now continue the array part out of the hash part.
    fn migrate_sequence(&mut self) {
        loop {
            let key = TableKey(Value::Number((self.array.len() + 1) as f64));
            let value = self.unlink(&key);
            if value.is_nil() {
                break;
            }
            self.array.push(value);
        }
    }

    fn compact(&mut self) {
        self.slots.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (i, (key, _)) in self.slots.iter().enumerate() {
            self.index.insert(key.clone(), i);
        }
    }

    /// Read `key` from `table`, following metatable links until a non-nil
    /// value is found. Chains longer than `max_depth` links are an error.
    pub fn lookup(table: &TableRef, key: &Value, max_depth: usize) -> Result<Value, LamnError> {
        let mut current = table.clone();
        for _ in 0..=max_depth {
            let next = {
                let t = current.borrow();
                let found = t.get(key);
                if !found.is_nil() {
                    return Ok(found);
                }
                match &t.metatable {
                    Some(parent) => parent.clone(),
                    None => return Ok(Value::Nil),
                }
            };
            current = next;
        }
        Err(LamnError::Runtime(format!(
            "prototype chain longer than {max_depth} links while reading '{key}'"
        )))
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("array", &self.array.len())
            .field("hash", &self.live)
            .field("has_metatable", &self.metatable.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        Rc::new(RefCell::new(Table::new()))
    }

    #[test]
    fn set_then_get() {
        let mut t = Table::new();
        t.set(Value::from("x"), Value::Number(1.0)).unwrap();
        assert_eq!(t.get_str("x"), Value::Number(1.0));
        assert_eq!(t.get_str("y"), Value::Nil);
    }

    #[test]
    fn string_fields_set_without_a_result() {
        let mut t = Table::new();
        t.set_str("len", Value::Number(1.0));
        assert_eq!(t.get_str("len"), Value::Number(1.0));
        t.set_str("len", Value::Nil);
        assert!(t.is_empty());
    }

    #[test]
    fn assigning_nil_removes() {
        let mut t = Table::new();
        t.set(Value::Number(1.0), Value::Boolean(true)).unwrap();
        t.set(Value::Number(1.0), Value::Nil).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut t = Table::new();
        assert_eq!(
            t.set(Value::Nil, Value::Number(1.0)),
            Err(LamnError::InvalidKey("nil"))
        );
        assert_eq!(
            t.set(Value::Number(f64::NAN), Value::Number(1.0)),
            Err(LamnError::InvalidKey("NaN"))
        );
    }

    #[test]
    fn negative_zero_is_the_same_key() {
        let mut t = Table::new();
        t.set(Value::Number(-0.0), Value::from("z")).unwrap();
        assert_eq!(t.get(&Value::Number(0.0)), Value::from("z"));
    }

    #[test]
    fn tables_are_keys_by_identity() {
        let k1 = Value::new_table();
        let k2 = Value::new_table();
        let mut t = Table::new();
        t.set(k1.clone(), Value::Number(1.0)).unwrap();
        assert_eq!(t.get(&k1), Value::Number(1.0));
        assert_eq!(t.get(&k2), Value::Nil);
    }

    #[test]
    fn length_is_sequence_border() {
        let mut t = Table::new();
        for i in 1..=3 {
            t.set(Value::Number(i as f64), Value::Boolean(true)).unwrap();
        }
        t.set(Value::Number(5.0), Value::Boolean(true)).unwrap();
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn next_visits_every_entry_once() {
        let mut t = Table::new();
        for i in 1..=4 {
            t.set(Value::Number(i as f64), Value::from("v")).unwrap();
        }
        t.set(Value::from("k"), Value::Boolean(true)).unwrap();
        let mut seen = 0;
        let mut key = Value::Nil;
        while let Some((k, _)) = t.next(&key).unwrap() {
            seen += 1;
            key = k;
        }
        assert_eq!(seen, 5);
        assert!(t.next(&Value::from("absent")).is_err());
        assert_eq!(Table::new().next(&Value::Nil), Ok(None));
    }

    #[test]
    fn appends_grow_the_array_part() {
        let mut t = Table::new();
        for i in 1..=1000 {
            let n = t.len();
            assert_eq!(n, i - 1);
            t.set(Value::Number((n + 1) as f64), Value::Number(i as f64)).unwrap();
        }
        assert_eq!(t.array.len(), 1000);
        assert_eq!(t.live, 0);
    }

    #[test]
    fn filling_a_gap_pulls_later_keys_into_the_array() {
        let mut t = Table::new();
        for i in [1.0, 3.0, 4.0] {
            t.set(Value::Number(i), Value::from("v")).unwrap();
        }
        assert_eq!(t.len(), 1);
        t.set(Value::Number(2.0), Value::from("v")).unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(t.array.len(), 4);
        assert_eq!(t.live, 0);
    }

    #[test]
    fn length_with_holes_is_a_border() {
        let mut t = Table::new();
        for i in 1..=8 {
            t.set(Value::Number(i as f64), Value::Boolean(true)).unwrap();
        }
        t.set(Value::Number(8.0), Value::Nil).unwrap();
        t.set(Value::Number(7.0), Value::Nil).unwrap();
        t.set(Value::Number(3.0), Value::Nil).unwrap();
        let n = t.len();
        assert!(n == 2 || n == 6, "{n} is not a border");
        assert!(!t.get(&Value::Number(n as f64)).is_nil());
        assert!(t.get(&Value::Number((n + 1) as f64)).is_nil());
    }

    #[test]
    fn traversal_survives_clearing_every_field() {
        let mut t = Table::new();
        for i in 1..=5 {
            t.set(Value::Number(i as f64), Value::Boolean(true)).unwrap();
        }
        for k in ["a", "b", "c"] {
            t.set(Value::from(k), Value::Boolean(true)).unwrap();
        }
        let mut seen = 0;
        let mut key = Value::Nil;
        while let Some((k, _)) = t.next(&key).unwrap() {
            t.set(k.clone(), Value::Nil).unwrap();
            seen += 1;
            key = k;
        }
        assert_eq!(seen, 8);
        assert!(t.is_empty());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn cleared_entries_are_compacted_on_insert() {
        let mut t = Table::new();
        for i in 0..100 {
            let key = Value::from(format!("k{i}"));
            t.set(key.clone(), Value::Number(i as f64)).unwrap();
            t.set(key, Value::Nil).unwrap();
        }
        assert!(t.slots.len() <= 10);
        t.set(Value::from("kept"), Value::Boolean(true)).unwrap();
        assert_eq!(t.get_str("kept"), Value::Boolean(true));
        assert_eq!(t.next(&Value::Nil), Ok(Some((Value::from("kept"), Value::Boolean(true)))));
    }

    #[test]
    fn lookup_follows_one_link() {
        let proto = table();
        proto.borrow_mut().set(Value::from("k"), Value::Number(7.0)).unwrap();
        let child = table();
        child.borrow_mut().set_metatable(Some(proto));
        assert_eq!(Table::lookup(&child, &Value::from("k"), 100), Ok(Value::Number(7.0)));
        assert_eq!(child.borrow().get_str("k"), Value::Nil);
    }

    #[test]
    fn lookup_follows_two_links() {
        let grand = table();
        grand.borrow_mut().set(Value::from("k"), Value::from("deep")).unwrap();
        let parent = table();
        parent.borrow_mut().set_metatable(Some(grand));
        let child = table();
        child.borrow_mut().set_metatable(Some(parent));
        assert_eq!(Table::lookup(&child, &Value::from("k"), 100), Ok(Value::from("deep")));
    }

    #[test]
    fn local_value_shadows_prototype() {
        let proto = table();
        proto.borrow_mut().set(Value::from("k"), Value::Number(1.0)).unwrap();
        let child = table();
        child.borrow_mut().set(Value::from("k"), Value::Number(2.0)).unwrap();
        child.borrow_mut().set_metatable(Some(proto));
        assert_eq!(Table::lookup(&child, &Value::from("k"), 100), Ok(Value::Number(2.0)));
    }

    #[test]
    fn cyclic_chain_is_an_error() {
        let t = table();
        t.borrow_mut().set_metatable(Some(t.clone()));
        assert!(Table::lookup(&t, &Value::from("missing"), 10).is_err());
        // break the cycle so the test does not leak
        t.borrow_mut().set_metatable(None);
    }
}
