//! Coroutines: cooperative threads with their own stacks.
//!
//! A resume pushes the target onto `thread_stack` and the dispatch loop simply
//! carries on in it; a yield (or the body returning) pops it and hands the
//! values to the resumer as the result of its `resume` call.

use crate::thread::ThreadState;
use crate::vm::Vm;
use lamn_core::{Closure, CoreFunction, LamnError, ThreadId, Value};
use std::rc::Rc;
use tracing::trace;

impl Vm {
    /// Dispatch a native that manipulates VM state.
    pub(crate) fn call_core(
        &mut self,
        core: CoreFunction,
        args: Vec<Value>,
        want: u8,
    ) -> Result<(), LamnError> {
        match core {
            CoreFunction::PCall => self.pcall(args, want),
            CoreFunction::DoString => self.dostring(args, want),
            CoreFunction::Create => {
                let Some(Value::Closure(body)) = args.into_iter().next() else {
                    return Err(LamnError::argument("coroutine.create", 1, "function expected"));
                };
                let id = self.create_thread(body);
                self.current().push_results(want, vec![Value::Thread(id)]);
                Ok(())
            }
            CoreFunction::Resume => self.resume(args, want),
            CoreFunction::Yield => self.yield_now(args, want),
            CoreFunction::Status => {
                let id = thread_arg("coroutine.status", args.first())?;
                let status = self.status(id);
                self.current().push_results(want, vec![Value::from(status)]);
                Ok(())
            }
        }
    }

    fn create_thread(&mut self, body: Rc<Closure>) -> ThreadId {
        self.threads.push(ThreadState::coroutine(body));
        let id = ThreadId(self.threads.len() - 1);
        trace!(thread = id.0, "coroutine created");
        id
    }

    fn resume(&mut self, args: Vec<Value>, want: u8) -> Result<(), LamnError> {
        let id = thread_arg("coroutine.resume", args.first())?;
        if self.thread_stack.contains(&id) {
            return Err(LamnError::Coroutine("cannot resume non-suspended coroutine"));
        }
        let target = self
            .threads
            .get(id.0)
            .ok_or_else(|| LamnError::Runtime(format!("no thread {}", id.0)))?;
        if target.is_dead() {
            self.current().push_results(want, vec![Value::Boolean(false)]);
            return Ok(());
        }
        trace!(thread = id.0, "resume");
        self.current().awaiting = want;
        self.threads[id.0].deliver(args.into_iter().skip(1).collect());
        self.thread_stack.push(id);
        Ok(())
    }

    fn yield_now(&mut self, args: Vec<Value>, want: u8) -> Result<(), LamnError> {
        if self.thread_stack.len() <= 1 {
            return Err(LamnError::Coroutine("attempt to yield from outside a coroutine"));
        }
        trace!(thread = self.current_id().0, "yield");
        self.current().awaiting = want;
        self.thread_stack.pop();
        let mut results = Vec::with_capacity(args.len() + 1);
        results.push(Value::Boolean(true));
        results.extend(args);
        self.current().deliver(results);
        Ok(())
    }

    fn status(&self, id: ThreadId) -> &'static str {
        if self.current_id() == id {
            "running"
        } else if self.thread_stack.contains(&id) {
            "normal"
        } else if self.threads.get(id.0).map_or(true, ThreadState::is_dead) {
            "dead"
        } else {
            "suspended"
        }
    }
}

fn thread_arg(function: &'static str, arg: Option<&Value>) -> Result<ThreadId, LamnError> {
    match arg {
        Some(Value::Thread(id)) => Ok(*id),
        other => Err(LamnError::argument(
            function,
            1,
            format!(
                "coroutine expected, got {}",
                other.map_or("no value", Value::type_name)
            ),
        )),
    }
}
