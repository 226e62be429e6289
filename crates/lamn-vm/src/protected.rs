//! Protected calls and error unwinding.

use crate::thread::ExceptionHandler;
use crate::vm::{Vm, ROOT};
use lamn_core::{LamnError, NativeFunction, ThreadId, Value};
use tracing::trace;

impl Vm {
    /// `pcall(f, ...)`: run `f` so that an error inside it becomes
    /// `false, message` instead of unwinding further.
    pub(crate) fn pcall(&mut self, args: Vec<Value>, want: u8) -> Result<(), LamnError> {
        let mut args = args.into_iter();
        let func = args.next().unwrap_or(Value::Nil);
        let (func, args) = match self.call_target(func, args.collect()) {
            Ok(target) => target,
            Err(err) => {
                self.current().push_results(want, vec![Value::Boolean(false), err.into_value()]);
                return Ok(());
            }
        };
        match func {
            Value::Closure(closure) => {
                self.push_handler(want);
                self.enter(closure, args, want, true)
            }
            Value::NativeFunction(NativeFunction::Host { func, .. }) => {
                let results = match func(args) {
                    Ok(mut results) => {
                        results.insert(0, Value::Boolean(true));
                        results
                    }
                    Err(err) => vec![Value::Boolean(false), err.into_value()],
                };
                self.current().push_results(want, results);
                Ok(())
            }
            Value::NativeFunction(NativeFunction::Core(core)) => {
                let caller = self.current_id();
                self.push_handler(want);
                let thread = self.current();
                let (frames, handlers) = (thread.frames.len(), thread.handlers.len());
                self.call_core(core, args, 0)?;
                self.settle_core(caller, frames, handlers, want);
                Ok(())
            }
            other => {
                let err = LamnError::Call {
                    got: other.type_name(),
                };
                self.current().push_results(want, vec![Value::Boolean(false), err.into_value()]);
                Ok(())
            }
        }
    }

    fn push_handler(&mut self, want: u8) {
        let thread = self.current();
        thread.handlers.push(ExceptionHandler {
            frames: thread.frames.len(),
            stack: thread.stack.len(),
            captures: thread.captures.len(),
            want,
            wraps: 0,
        });
        trace!(handlers = thread.handlers.len(), "pcall");
    }

    /// Finish a `pcall` whose callee was a core native, called with its
    /// results packed into one multi-value. A native that entered a frame or
    /// switched threads delivers later; the handler pop and the leading
    /// `true` then ride along with that delivery.
    fn settle_core(&mut self, caller: ThreadId, frames: usize, handlers: usize, want: u8) {
        let switched = self.current_id() != caller;
        let thread = &mut self.threads[caller.0];
        if thread.handlers.len() > handlers {
            // a nested pcall left its own handler pending
            if let Some(inner) = thread.handlers.last_mut() {
                inner.wraps += 1;
            }
        }
        if switched {
            thread.awaiting = want;
            thread.awaiting_protected += 1;
        } else if thread.frames.len() > frames {
            if let Some(frame) = thread.frame_mut() {
                frame.want = want;
                frame.protected += 1;
            }
        } else {
            let mut results = thread.pop_spread(1);
            thread.handlers.pop();
            results.insert(0, Value::Boolean(true));
            thread.push_results(want, results);
        }
    }

    /// Unwind to the innermost handler. Threads without one are abandoned
    /// (and marked dead) until a handler is found; if the root thread has
    /// none, the VM resets and the error goes back to the host.
    pub(crate) fn throw(&mut self, err: LamnError) -> Result<(), LamnError> {
        loop {
            let id = self.current_id();
            let thread = &mut self.threads[id.0];
            if let Some(handler) = thread.handlers.pop() {
                trace!(thread = id.0, frames = handler.frames, "unwinding to handler");
                thread.frames.truncate(handler.frames);
                thread.stack.truncate(handler.stack);
                thread.captures.truncate(handler.captures);
                let mut results = vec![Value::Boolean(false), err.into_value()];
                let mut want = handler.want;
                for _ in 0..handler.wraps {
                    if let Some(outer) = thread.handlers.pop() {
                        want = outer.want;
                    }
                    results.insert(0, Value::Boolean(true));
                }
                thread.awaiting_protected = 0;
                thread.push_results(want, results);
                return Ok(());
            }
            thread.clear();
            if id == ROOT {
                self.thread_stack.truncate(1);
                return Err(err);
            }
            trace!(thread = id.0, "coroutine died with an error");
            self.thread_stack.pop();
        }
    }
}
