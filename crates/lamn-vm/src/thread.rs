use lamn_core::{Cell, Closure, Value};
use std::rc::Rc;

// ── Call frame ────────────────────────────────────────────────────────────────

/// A single entry on a thread's call stack.
#[derive(Debug)]
pub(crate) struct Frame {
    pub closure: Rc<Closure>,
    /// Index of the next instruction to execute.
    pub ip: usize,
    /// Stack index of the frame's slot 0 (its argument list).
    pub base: usize,
    /// Closure-list index where this frame's view begins; the closure's own
    /// upvalues sit first.
    pub capture_base: usize,
    /// Results the caller keeps; 0 means one multi-value.
    pub want: u8,
    /// `pcall` layers this frame was entered through. Returning pops that
    /// many handlers and prepends a `true` for each.
    pub protected: u8,
    /// A comparison metamethod: the result is reduced to a boolean.
    pub condition: bool,
}

/// State saved by `pcall`, restored when an error unwinds to it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExceptionHandler {
    pub frames: usize,
    pub stack: usize,
    pub captures: usize,
    pub want: u8,
    /// Enclosing handlers pushed by `pcall`s whose callee was this handler's
    /// `pcall`. A caught error also pops those and prepends their `true`s.
    pub wraps: u8,
}

// ── Thread ────────────────────────────────────────────────────────────────────

/// One independent execution context: the root program or a coroutine.
#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    pub stack: Vec<Cell>,
    /// Cells closed over by live frames, in frame order.
    pub captures: Vec<Cell>,
    pub frames: Vec<Frame>,
    pub handlers: Vec<ExceptionHandler>,
    /// Result count wanted by the `resume`/`yield` this thread is blocked in.
    pub awaiting: u8,
    /// `pcall` layers wrapped around that `resume`/`yield`.
    pub awaiting_protected: u8,
}

impl ThreadState {
    /// A suspended coroutine whose first resume enters `closure`.
    pub fn coroutine(closure: Rc<Closure>) -> Self {
        let captures = closure.upvalues.clone();
        Self {
            stack: Vec::new(),
            captures,
            frames: vec![Frame {
                closure,
                ip: 0,
                base: 0,
                capture_base: 0,
                want: 0,
                protected: 0,
                condition: false,
            }],
            handlers: Vec::new(),
            awaiting: 0,
            awaiting_protected: 0,
        }
    }

    /// A thread with no frames left can never run again.
    pub fn is_dead(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
        self.captures.clear();
        self.frames.clear();
        self.handlers.clear();
        self.awaiting = 0;
        self.awaiting_protected = 0;
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(Cell::new(value));
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().map(|c| c.get()).unwrap_or(Value::Nil)
    }

    /// Pop `n` values, expanding multi-values, oldest first.
    pub fn pop_spread(&mut self, n: usize) -> Vec<Value> {
        let start = self.stack.len().saturating_sub(n);
        let mut out = Vec::with_capacity(n);
        for cell in self.stack.drain(start..) {
            cell.get().spread_into(&mut out);
        }
        out
    }

    /// The cell `offset` slots below the top (1 = the top).
    pub fn cell(&self, offset: usize) -> Option<&Cell> {
        self.stack.len().checked_sub(offset).and_then(|i| self.stack.get(i))
    }

    /// Deliver `values` to whoever asked for `want` results: one multi-value
    /// if `want` is 0, otherwise exactly `want` values padded with `nil`.
    pub fn push_results(&mut self, want: u8, values: Vec<Value>) {
        if want == 0 {
            self.push(Value::multi(values));
            return;
        }
        let want = want as usize;
        let mut values = values.into_iter();
        for _ in 0..want {
            self.push(values.next().unwrap_or(Value::Nil));
        }
    }

    /// Hand `values` to the `resume` or `yield` this thread is blocked in.
    pub fn deliver(&mut self, mut values: Vec<Value>) {
        for _ in 0..self.awaiting_protected {
            self.handlers.pop();
            values.insert(0, Value::Boolean(true));
        }
        self.awaiting_protected = 0;
        self.push_results(self.awaiting, values);
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_results_are_padded_and_truncated() {
        let mut t = ThreadState::default();
        t.push_results(3, vec![Value::Number(1.0)]);
        assert_eq!(t.stack.len(), 3);
        assert_eq!(t.pop(), Value::Nil);
        t.push_results(1, vec![Value::Number(7.0), Value::Number(8.0)]);
        assert_eq!(t.pop(), Value::Number(7.0));
    }

    #[test]
    fn zero_want_keeps_a_multi_value() {
        let mut t = ThreadState::default();
        t.push_results(0, vec![Value::Boolean(true), Value::Nil]);
        assert_eq!(t.stack.len(), 1);
        assert_eq!(t.pop(), Value::multi(vec![Value::Boolean(true), Value::Nil]));
    }

    #[test]
    fn delivery_unwraps_pending_pcalls() {
        let mut t = ThreadState::default();
        t.handlers.push(ExceptionHandler {
            frames: 0,
            stack: 0,
            captures: 0,
            want: 2,
            wraps: 0,
        });
        t.awaiting = 2;
        t.awaiting_protected = 1;
        t.deliver(vec![Value::from("x"), Value::from("y")]);
        assert!(t.handlers.is_empty());
        assert_eq!(t.awaiting_protected, 0);
        assert_eq!(t.pop(), Value::from("x"));
        assert_eq!(t.pop(), Value::Boolean(true));
    }

    #[test]
    fn pop_spread_flattens_in_order() {
        let mut t = ThreadState::default();
        t.push(Value::Number(1.0));
        t.push(Value::multi(vec![Value::Number(2.0), Value::Number(3.0)]));
        assert_eq!(
            t.pop_spread(2),
            vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]
        );
        assert!(t.stack.is_empty());
    }

    #[test]
    fn cell_offsets_count_from_the_top() {
        let mut t = ThreadState::default();
        t.push(Value::from("a"));
        t.push(Value::from("b"));
        assert_eq!(t.cell(1).unwrap().get(), Value::from("b"));
        assert_eq!(t.cell(2).unwrap().get(), Value::from("a"));
        assert!(t.cell(3).is_none());
    }
}
