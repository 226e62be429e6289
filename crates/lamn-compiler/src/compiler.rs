use crate::builder::{Label, UnitBuilder};
use lamn_core::{CompiledUnit, Instruction, LamnError, OpCode, UnitId, Value};
use lamn_parser::ast::{BinOp, Block, Expr, FuncBody, FuncName, ReturnStmt, Stmt, TableField, UnOp};
use std::rc::Rc;
use tracing::debug;

// ── Scope tracking ────────────────────────────────────────────────────────────

/// How many stack slots an expression must leave behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Fixed(usize),
    /// One slot, holding a multi-value if the expression produced one.
    Multi,
}

/// A live local: its stack slot (relative to the frame base) and its
/// position in the frame's closure list.
#[derive(Debug, Clone)]
struct Local {
    name: String,
    slot: usize,
    closure_pos: usize,
}

/// Snapshot of the bookkeeping at a block entry.
#[derive(Debug, Clone, Copy)]
struct Scope {
    locals: usize,
    depth: usize,
    closed: usize,
}

/// Where `break` goes and what it must release on the way.
#[derive(Debug, Clone, Copy)]
struct LoopExit {
    label: Label,
    scope: Scope,
}

enum Var {
    Local(usize),
    Upvalue(usize),
    Global,
}

// ── Compiler ─────────────────────────────────────────────────────────────────

/// Compiles a syntax tree into stack-machine [`CompiledUnit`]s.
///
/// One `Compiler` handles one function body; nested bodies get a child
/// compiler seeded with the names visible at their definition site.
pub struct Compiler {
    source: String,
    name: String,
    id: UnitId,
    /// Next unused unit id in this compile pass.
    next_id: u16,
    builder: UnitBuilder,
    locals: Vec<Local>,
    /// Names captured from enclosing units, with their closure-list positions.
    enclosing: Vec<(String, usize)>,
    /// Slots above the frame base, counting the argument slot.
    depth: usize,
    /// Length of the closure-list view, counting inherited upvalues.
    closed: usize,
    upvalue_count: usize,
    line: u32,
    loop_exit: Option<LoopExit>,
}

impl Compiler {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: "main chunk".to_string(),
            id: UnitId(0),
            next_id: 1,
            builder: UnitBuilder::new(),
            locals: Vec::new(),
            enclosing: Vec::new(),
            depth: 1,
            closed: 0,
            upvalue_count: 0,
            line: 1,
            loop_exit: None,
        }
    }

    fn child(&self, name: String, id: UnitId) -> Self {
        let mut enclosing = self.enclosing.clone();
        enclosing.extend(self.locals.iter().map(|l| (l.name.clone(), l.closure_pos)));
        Self {
            source: self.source.clone(),
            name,
            id,
            next_id: self.next_id,
            builder: UnitBuilder::new(),
            locals: Vec::new(),
            enclosing,
            depth: 1,
            closed: self.closed,
            upvalue_count: self.closed,
            line: self.line,
            loop_exit: None,
        }
    }

    /// Compile `block` as a chunk and return the root unit.
    ///
    /// The chunk is a vararg function: whatever the host passes to it is
    /// available as `...`.
    pub fn compile(mut self, block: &Block) -> Result<Rc<CompiledUnit>, LamnError> {
        self.builder.is_vararg = true;
        self.compile_body(block)?;
        let unit = Rc::new(self.finish()?);
        if cfg!(debug_assertions) {
            crate::verify::verify(&unit)?;
        }
        Ok(unit)
    }

    fn compile_body(&mut self, block: &Block) -> Result<(), LamnError> {
        self.compile_statements(block)?;
        self.emit(OpCode::Ret, 0, 0)?;
        Ok(())
    }

    fn finish(self) -> Result<CompiledUnit, LamnError> {
        let unit = self.builder.finish(self.id, self.name, self.source)?;
        debug!(
            unit = %unit.name,
            id = unit.id.0,
            instructions = unit.code.len(),
            constants = unit.constants.len(),
            "compiled unit"
        );
        Ok(unit)
    }

    // ── Emission ──────────────────────────────────────────────────────────────

    /// Emit one instruction and apply its static effect to the tracked depths.
    fn emit(&mut self, op: OpCode, a: usize, b: usize) -> Result<usize, LamnError> {
        let a = u16::try_from(a).map_err(|_| {
            LamnError::Compile(format!("operand {a} of {} out of range", op.mnemonic()))
        })?;
        let b = u8::try_from(b).map_err(|_| {
            LamnError::Compile(format!("operand {b} of {} out of range", op.mnemonic()))
        })?;
        let ins = Instruction::new(op, a, b);
        self.apply(ins)?;
        Ok(self.builder.emit(ins, self.line))
    }

    fn emit_jump(&mut self, op: OpCode, peek: bool, target: Label) -> Result<(), LamnError> {
        self.apply(Instruction::new(op, 0, peek as u8))?;
        self.builder.emit_jump(op, peek, target, self.line);
        Ok(())
    }

    fn apply(&mut self, ins: Instruction) -> Result<(), LamnError> {
        let effect = ins
            .effect()
            .ok_or_else(|| LamnError::Compile(format!("no stack effect for {ins:?}")))?;
        let depth = self.depth as isize + effect.stack;
        let closed = self.closed as isize + effect.closed;
        if depth < 1 || closed < self.upvalue_count as isize {
            return Err(LamnError::Compile(format!(
                "{ins:?} unbalances the stack in '{}'",
                self.name
            )));
        }
        self.depth = depth as usize;
        self.closed = closed as usize;
        Ok(())
    }

    fn load_constant(&mut self, value: Value) -> Result<(), LamnError> {
        let idx = self.builder.add_constant(value)?;
        self.emit(OpCode::LoadK, idx as usize, 0)?;
        Ok(())
    }

    fn load_nil(&mut self, count: usize) -> Result<(), LamnError> {
        for _ in 0..count {
            self.load_constant(Value::Nil)?;
        }
        Ok(())
    }

    fn pop(&mut self, count: usize) -> Result<(), LamnError> {
        if count > 0 {
            self.emit(OpCode::PopStack, count, 0)?;
        }
        Ok(())
    }

    /// Push a copy of the value in `slot`.
    fn get_slot(&mut self, slot: usize) -> Result<(), LamnError> {
        self.emit(OpCode::GetStack, self.depth - slot, 0)?;
        Ok(())
    }

    /// Pop the top value into `slot`.
    fn put_slot(&mut self, slot: usize) -> Result<(), LamnError> {
        self.emit(OpCode::PutStack, self.depth - slot, 0)?;
        Ok(())
    }

    // ── Scopes ────────────────────────────────────────────────────────────────

    fn scope(&self) -> Scope {
        Scope {
            locals: self.locals.len(),
            depth: self.depth,
            closed: self.closed,
        }
    }

    /// Name the top `names.len()` slots, which were just closed over.
    fn bind_locals(&mut self, names: &[String]) {
        let n = names.len();
        for (i, name) in names.iter().enumerate() {
            self.locals.push(Local {
                name: name.clone(),
                slot: self.depth - n + i,
                closure_pos: self.closed - n + i,
            });
        }
    }

    /// Release everything introduced since `to`, without forgetting names.
    fn emit_cleanup(&mut self, to: Scope) -> Result<(), LamnError> {
        if self.closed > to.closed {
            self.emit(OpCode::PopClosed, self.closed - to.closed, 0)?;
        }
        self.pop(self.depth - to.depth)
    }

    fn close_scope(&mut self, to: Scope) -> Result<(), LamnError> {
        self.emit_cleanup(to)?;
        self.locals.truncate(to.locals);
        Ok(())
    }

    /// Clean up down to `to` and jump to `label`. The code that follows is
    /// only reachable by other paths, so the tracked depths are restored.
    fn jump_out(&mut self, to: Scope, label: Label) -> Result<(), LamnError> {
        let (depth, closed) = (self.depth, self.closed);
        self.emit_cleanup(to)?;
        self.emit_jump(OpCode::Jmp, false, label)?;
        self.depth = depth;
        self.closed = closed;
        Ok(())
    }

    fn with_loop<T>(
        &mut self,
        exit: LoopExit,
        f: impl FnOnce(&mut Self) -> Result<T, LamnError>,
    ) -> Result<T, LamnError> {
        let outer = self.loop_exit.replace(exit);
        let result = f(self);
        self.loop_exit = outer;
        result
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    fn resolve(&self, name: &str) -> Var {
        if let Some(local) = self.locals.iter().rev().find(|l| l.name == name) {
            return Var::Local(local.slot);
        }
        if let Some((_, pos)) = self.enclosing.iter().rev().find(|(n, _)| n == name) {
            return Var::Upvalue(*pos);
        }
        Var::Global
    }

    fn read_var(&mut self, name: &str) -> Result<(), LamnError> {
        match self.resolve(name) {
            Var::Local(slot) => self.get_slot(slot),
            Var::Upvalue(pos) => self.emit(OpCode::GetUpval, pos, 0).map(drop),
            Var::Global => {
                let idx = self.builder.add_constant(Value::from(name))?;
                self.emit(OpCode::GetGlobal, idx as usize, 0).map(drop)
            }
        }
    }

    /// Pop the top value into the variable `name`.
    fn write_var(&mut self, name: &str) -> Result<(), LamnError> {
        match self.resolve(name) {
            Var::Local(slot) => self.put_slot(slot),
            Var::Upvalue(pos) => self.emit(OpCode::PutUpval, pos, 0).map(drop),
            Var::Global => {
                let idx = self.builder.add_constant(Value::from(name))?;
                self.emit(OpCode::PutGlobal, idx as usize, 0).map(drop)
            }
        }
    }

    // ── Block / Statements ────────────────────────────────────────────────────

    fn compile_block(&mut self, block: &Block) -> Result<(), LamnError> {
        let scope = self.scope();
        self.compile_statements(block)?;
        self.close_scope(scope)
    }

    /// Statements of `block` in the current scope.
    fn compile_statements(&mut self, block: &Block) -> Result<(), LamnError> {
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        if let Some(ret) = &block.ret {
            self.compile_return(ret)?;
        }
        Ok(())
    }

    fn compile_return(&mut self, ret: &ReturnStmt) -> Result<(), LamnError> {
        let (depth, closed) = (self.depth, self.closed);
        self.line = ret.line;
        let count = self.compile_multi_list(&ret.values)?;
        self.line = ret.line;
        if self.closed > self.upvalue_count {
            self.emit(OpCode::PopClosed, self.closed - self.upvalue_count, 0)?;
        }
        self.emit(OpCode::Ret, count, 0)?;
        self.depth = depth;
        self.closed = closed;
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), LamnError> {
        self.line = stmt_line(stmt);
        match stmt {
            Stmt::Local { names, values, .. } => {
                self.compile_expr_list(values, names.len())?;
                self.emit(OpCode::CloseVars, names.len(), 0)?;
                self.bind_locals(names);
            }

            Stmt::LocalFunction { name, body, .. } => {
                // declared before the body so the function can call itself
                self.load_nil(1)?;
                self.emit(OpCode::CloseVars, 1, 0)?;
                self.bind_locals(std::slice::from_ref(name));
                self.compile_function(body, name.clone())?;
                self.write_var(name)?;
            }

            Stmt::Assign {
                targets, values, ..
            } => self.compile_assign(targets, values)?,

            Stmt::Call(expr) => self.compile_expr(expr, Arity::Fixed(0))?,

            Stmt::Do(block) => self.compile_block(block)?,

            Stmt::While { cond, body, .. } => {
                let start = self.builder.new_label();
                let exit = self.builder.new_label();
                self.builder.place_label(start);
                self.compile_expr(cond, Arity::Fixed(1))?;
                self.emit(OpCode::Not, 0, 0)?;
                self.emit_jump(OpCode::JmpTrue, false, exit)?;
                let scope = self.scope();
                self.with_loop(LoopExit { label: exit, scope }, |c| c.compile_block(body))?;
                self.emit_jump(OpCode::Jmp, false, start)?;
                self.builder.place_label(exit);
            }

            Stmt::Repeat { body, cond, .. } => self.compile_repeat(body, cond)?,

            Stmt::If { clauses, else_, .. } => {
                let end = self.builder.new_label();
                for (i, (cond, block)) in clauses.iter().enumerate() {
                    let next = self.builder.new_label();
                    self.compile_expr(cond, Arity::Fixed(1))?;
                    self.emit(OpCode::Not, 0, 0)?;
                    self.emit_jump(OpCode::JmpTrue, false, next)?;
                    self.compile_block(block)?;
                    if i + 1 < clauses.len() || else_.is_some() {
                        self.emit_jump(OpCode::Jmp, false, end)?;
                    }
                    self.builder.place_label(next);
                }
                if let Some(block) = else_ {
                    self.compile_block(block)?;
                }
                self.builder.place_label(end);
            }

            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                ..
            } => self.compile_numeric_for(var, start, limit, step.as_ref(), body)?,

            Stmt::GenericFor {
                names, exprs, body, ..
            } => self.compile_generic_for(names, exprs, body)?,

            Stmt::Function { name, body, .. } => self.compile_function_stmt(name, body)?,

            Stmt::Break(line) => {
                let exit = self.loop_exit.ok_or_else(|| LamnError::Syntax {
                    line: *line,
                    column: 0,
                    message: "'break' outside a loop".into(),
                })?;
                self.jump_out(exit.scope, exit.label)?;
            }
        }
        Ok(())
    }

    /// Targets are evaluated left to right, then the values, then every
    /// store happens from the last target to the first.
    fn compile_assign(&mut self, targets: &[Expr], values: &[Expr]) -> Result<(), LamnError> {
        if let [target] = targets {
            match target {
                Expr::Name(name, _) => {
                    self.compile_expr_list(values, 1)?;
                    return self.write_var(name);
                }
                _ => {
                    self.compile_place(target)?;
                    self.compile_expr_list(values, 1)?;
                    self.emit(OpCode::PutTable, 0, 0)?;
                    return Ok(());
                }
            }
        }

        let start = self.depth;
        // `None` for names, else the slot holding the target's table (key above it)
        let mut places = Vec::with_capacity(targets.len());
        for target in targets {
            match target {
                Expr::Name(name, _) => places.push((Some(name.as_str()), 0)),
                _ => {
                    self.compile_place(target)?;
                    places.push((None, self.depth - 2));
                }
            }
        }
        let temps = self.depth - start;
        self.compile_expr_list(values, targets.len())?;
        for (name, table_slot) in places.into_iter().rev() {
            match name {
                Some(name) => self.write_var(name)?,
                None => {
                    self.get_slot(table_slot)?;
                    self.get_slot(table_slot + 1)?;
                    self.emit(OpCode::GetStack, 3, 0)?;
                    self.emit(OpCode::PutTable, 0, 0)?;
                    self.pop(1)?;
                }
            }
        }
        self.pop(temps)
    }

    /// Push the table and key of an indexing target.
    fn compile_place(&mut self, target: &Expr) -> Result<(), LamnError> {
        match target {
            Expr::Index { table, key, .. } => {
                self.compile_expr(table, Arity::Fixed(1))?;
                self.compile_expr(key, Arity::Fixed(1))
            }
            Expr::Field { table, field, .. } => {
                self.compile_expr(table, Arity::Fixed(1))?;
                self.load_constant(Value::from(field.as_str()))
            }
            other => Err(LamnError::Compile(format!(
                "cannot assign to {other:?}"
            ))),
        }
    }

    fn compile_repeat(&mut self, body: &Block, cond: &Expr) -> Result<(), LamnError> {
        let start = self.builder.new_label();
        let exit = self.builder.new_label();
        let done = self.builder.new_label();
        self.builder.place_label(start);
        let scope = self.scope();
        self.with_loop(LoopExit { label: exit, scope }, |c| {
            c.compile_statements(body)?;
            // the condition still sees the body's locals
            c.compile_expr(cond, Arity::Fixed(1))?;
            c.emit_jump(OpCode::JmpTrue, false, done)?;
            c.jump_out(scope, start)
        })?;
        self.builder.place_label(done);
        self.close_scope(scope)?;
        self.builder.place_label(exit);
        Ok(())
    }

    fn compile_numeric_for(
        &mut self,
        var: &str,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
    ) -> Result<(), LamnError> {
        let outer = self.scope();
        self.compile_expr(start, Arity::Fixed(1))?;
        self.compile_expr(limit, Arity::Fixed(1))?;
        match step {
            Some(step) => self.compile_expr(step, Arity::Fixed(1))?,
            None => self.load_constant(Value::Number(1.0))?,
        }
        self.emit(OpCode::ForPrep, 0, 0)?;
        let (v, lim, step) = (self.depth - 3, self.depth - 2, self.depth - 1);
        let control = self.scope();

        let top = self.builder.new_label();
        let exit = self.builder.new_label();
        self.builder.place_label(top);

        // (0 < step and v <= limit) or (step < 0 and limit <= v)
        self.load_constant(Value::Number(0.0))?;
        self.get_slot(step)?;
        self.emit(OpCode::Less, 0, 0)?;
        self.get_slot(v)?;
        self.get_slot(lim)?;
        self.emit(OpCode::LessEq, 0, 0)?;
        self.emit(OpCode::And, 0, 0)?;
        self.get_slot(step)?;
        self.load_constant(Value::Number(0.0))?;
        self.emit(OpCode::Less, 0, 0)?;
        self.get_slot(lim)?;
        self.get_slot(v)?;
        self.emit(OpCode::LessEq, 0, 0)?;
        self.emit(OpCode::And, 0, 0)?;
        self.emit(OpCode::Or, 0, 0)?;
        self.emit(OpCode::Not, 0, 0)?;
        self.emit_jump(OpCode::JmpTrue, false, exit)?;

        // each iteration binds a fresh cell, so closures keep their own copy
        self.get_slot(v)?;
        self.emit(OpCode::CloseVars, 1, 0)?;
        self.bind_locals(&[var.to_string()]);
        self.with_loop(LoopExit { label: exit, scope: control }, |c| {
            c.compile_statements(body)
        })?;
        self.close_scope(control)?;

        self.get_slot(v)?;
        self.get_slot(step)?;
        self.emit(OpCode::Add, 0, 0)?;
        self.put_slot(v)?;
        self.emit_jump(OpCode::Jmp, false, top)?;

        self.builder.place_label(exit);
        self.close_scope(outer)
    }

    fn compile_generic_for(
        &mut self,
        names: &[String],
        exprs: &[Expr],
        body: &Block,
    ) -> Result<(), LamnError> {
        let outer = self.scope();
        self.compile_expr_list(exprs, 3)?;
        let (iter, state, ctl) = (self.depth - 3, self.depth - 2, self.depth - 1);
        let control = self.scope();

        let top = self.builder.new_label();
        let run = self.builder.new_label();
        let exit = self.builder.new_label();
        self.builder.place_label(top);

        self.get_slot(iter)?;
        self.get_slot(state)?;
        self.get_slot(ctl)?;
        self.emit(OpCode::Call, 2, names.len())?;
        self.emit(OpCode::CloseVars, names.len(), 0)?;
        self.bind_locals(names);
        let first = self.depth - names.len();

        self.get_slot(first)?;
        self.put_slot(ctl)?;
        self.get_slot(first)?;
        self.load_constant(Value::Nil)?;
        self.emit(OpCode::Eq, 0, 0)?;
        self.emit(OpCode::Not, 0, 0)?;
        self.emit_jump(OpCode::JmpTrue, false, run)?;
        self.jump_out(control, exit)?;

        self.builder.place_label(run);
        self.with_loop(LoopExit { label: exit, scope: control }, |c| {
            c.compile_statements(body)
        })?;
        self.close_scope(control)?;
        self.emit_jump(OpCode::Jmp, false, top)?;

        self.builder.place_label(exit);
        self.close_scope(outer)
    }

    /// `function a.b.c:m() end` stores into `a.b.c["m"]`; a plain name is an
    /// ordinary assignment.
    fn compile_function_stmt(&mut self, name: &FuncName, body: &FuncBody) -> Result<(), LamnError> {
        let display = name.display();
        let key = match (&name.method, name.fields.last()) {
            (Some(method), _) => method,
            (None, Some(field)) => field,
            (None, None) => {
                self.compile_function(body, display)?;
                return self.write_var(&name.root);
            }
        };
        let path = if name.method.is_some() {
            &name.fields[..]
        } else {
            &name.fields[..name.fields.len() - 1]
        };
        self.read_var(&name.root)?;
        for field in path {
            self.load_constant(Value::from(field.as_str()))?;
            self.emit(OpCode::GetTable, 0, 0)?;
        }
        self.load_constant(Value::from(key.as_str()))?;
        self.compile_function(body, display)?;
        self.emit(OpCode::PutTable, 0, 0)?;
        Ok(())
    }

    // ── Function body compilation ─────────────────────────────────────────────

    /// Compile `body` into a child unit and push a closure over it.
    fn compile_function(&mut self, body: &FuncBody, name: String) -> Result<(), LamnError> {
        let id = UnitId(self.next_id);
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| LamnError::Compile("too many functions in one chunk".into()))?;

        let mut child = self.child(name, id);
        child.line = body.line;
        child.builder.is_vararg = body.is_vararg;
        child.builder.param_count = u8::try_from(body.params.len())
            .map_err(|_| LamnError::Compile("too many parameters".into()))?;

        // prologue: spread the argument list into one closed slot per parameter
        if !body.params.is_empty() {
            child.emit(OpCode::PopVarArgs, body.params.len(), 0)?;
            child.emit(OpCode::CloseVars, body.params.len(), 0)?;
            child.bind_locals(&body.params);
        }
        child.compile_body(&body.body)?;

        self.next_id = child.next_id;
        let unit = child.finish()?;
        self.builder.add_child(Rc::new(unit));
        self.emit(OpCode::Closure, id.0 as usize, 0)?;
        Ok(())
    }

    // ── Expressions ───────────────────────────────────────────────────────────

    /// Compile `exprs` into exactly `count` slots: surplus values are
    /// evaluated and dropped, missing ones are `nil`, and only the last
    /// expression may expand into several.
    fn compile_expr_list(&mut self, exprs: &[Expr], count: usize) -> Result<(), LamnError> {
        let Some(last) = exprs.len().checked_sub(1) else {
            return self.load_nil(count);
        };
        for (i, expr) in exprs.iter().enumerate() {
            let want = if i < last {
                usize::from(i < count)
            } else {
                count.saturating_sub(i)
            };
            self.compile_expr(expr, Arity::Fixed(want))?;
        }
        Ok(())
    }

    /// One slot per expression, the last one left unexpanded. Returns the
    /// number of slots pushed.
    fn compile_multi_list(&mut self, exprs: &[Expr]) -> Result<usize, LamnError> {
        for (i, expr) in exprs.iter().enumerate() {
            let arity = if i + 1 == exprs.len() {
                Arity::Multi
            } else {
                Arity::Fixed(1)
            };
            self.compile_expr(expr, arity)?;
        }
        Ok(exprs.len())
    }

    fn compile_expr(&mut self, expr: &Expr, arity: Arity) -> Result<(), LamnError> {
        self.line = expr.line();
        match expr {
            Expr::Call { func, args, line } => {
                self.compile_expr(func, Arity::Fixed(1))?;
                let nargs = self.compile_multi_list(args)?;
                self.line = *line;
                self.finish_call(nargs, arity)
            }
            Expr::MethodCall {
                obj,
                method,
                args,
                line,
            } => {
                self.compile_expr(obj, Arity::Fixed(1))?;
                self.emit(OpCode::GetStack, 1, 0)?;
                self.load_constant(Value::from(method.as_str()))?;
                self.emit(OpCode::GetTable, 0, 0)?;
                // [obj, f] -> [f, obj]
                self.emit(OpCode::GetStack, 1, 0)?;
                self.emit(OpCode::GetStack, 3, 0)?;
                self.emit(OpCode::PutStack, 3, 0)?;
                self.emit(OpCode::PutStack, 3, 0)?;
                let nargs = self.compile_multi_list(args)?;
                self.line = *line;
                self.finish_call(nargs + 1, arity)
            }
            Expr::VarArgs(line) => {
                if !self.builder.is_vararg {
                    return Err(LamnError::Syntax {
                        line: *line,
                        column: 0,
                        message: "cannot use '...' outside a vararg function".into(),
                    });
                }
                self.get_slot(0)?;
                self.adjust_multi(arity)
            }
            _ => {
                self.compile_single(expr)?;
                match arity {
                    Arity::Multi | Arity::Fixed(1) => Ok(()),
                    Arity::Fixed(0) => self.pop(1),
                    Arity::Fixed(n) => self.load_nil(n - 1),
                }
            }
        }
    }

    fn finish_call(&mut self, nargs: usize, arity: Arity) -> Result<(), LamnError> {
        match arity {
            Arity::Fixed(n) if (1..=Instruction::MAX_B).contains(&n) => {
                self.emit(OpCode::Call, nargs, n)?;
                Ok(())
            }
            _ => {
                self.emit(OpCode::Call, nargs, 0)?;
                self.adjust_multi(arity)
            }
        }
    }

    /// The top slot holds a multi-value; expand it to the wanted count.
    fn adjust_multi(&mut self, arity: Arity) -> Result<(), LamnError> {
        match arity {
            Arity::Multi => Ok(()),
            Arity::Fixed(n) => self.emit(OpCode::PopVarArgs, n, 1).map(drop),
        }
    }

    /// Compile an expression that produces exactly one value.
    fn compile_single(&mut self, expr: &Expr) -> Result<(), LamnError> {
        match expr {
            Expr::Nil(_) => self.load_constant(Value::Nil),
            Expr::True(_) => self.load_constant(Value::Boolean(true)),
            Expr::False(_) => self.load_constant(Value::Boolean(false)),
            Expr::Number(n, _) => self.load_constant(Value::Number(*n)),
            Expr::Str(s, _) => self.load_constant(Value::from(s.as_str())),
            Expr::Name(name, _) => self.read_var(name),
            Expr::Paren(inner, _) => self.compile_expr(inner, Arity::Fixed(1)),

            Expr::Unary { op, operand, .. } => {
                self.compile_expr(operand, Arity::Fixed(1))?;
                let opcode = match op {
                    UnOp::Neg => OpCode::Neg,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                };
                self.emit(opcode, 0, 0).map(drop)
            }

            Expr::Binary { op, lhs, rhs, .. } => self.compile_binary(*op, lhs, rhs),

            Expr::Index { table, key, .. } => {
                self.compile_expr(table, Arity::Fixed(1))?;
                self.compile_expr(key, Arity::Fixed(1))?;
                self.emit(OpCode::GetTable, 0, 0).map(drop)
            }
            Expr::Field { table, field, .. } => {
                self.compile_expr(table, Arity::Fixed(1))?;
                self.load_constant(Value::from(field.as_str()))?;
                self.emit(OpCode::GetTable, 0, 0).map(drop)
            }

            Expr::Function(body) => self.compile_function(body, "anonymous".to_string()),
            Expr::Table(fields, _) => self.compile_table(fields),

            Expr::Call { .. } | Expr::MethodCall { .. } | Expr::VarArgs(_) => {
                self.compile_expr(expr, Arity::Fixed(1))
            }
        }
    }

    fn compile_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<(), LamnError> {
        match op {
            BinOp::And => {
                let take_rhs = self.builder.new_label();
                let end = self.builder.new_label();
                self.compile_expr(lhs, Arity::Fixed(1))?;
                self.emit_jump(OpCode::JmpTrue, true, take_rhs)?;
                self.emit_jump(OpCode::Jmp, false, end)?;
                self.builder.place_label(take_rhs);
                self.pop(1)?;
                self.compile_expr(rhs, Arity::Fixed(1))?;
                self.builder.place_label(end);
                return Ok(());
            }
            BinOp::Or => {
                let end = self.builder.new_label();
                self.compile_expr(lhs, Arity::Fixed(1))?;
                self.emit_jump(OpCode::JmpTrue, true, end)?;
                self.pop(1)?;
                self.compile_expr(rhs, Arity::Fixed(1))?;
                self.builder.place_label(end);
                return Ok(());
            }
            _ => {}
        }

        self.compile_expr(lhs, Arity::Fixed(1))?;
        self.compile_expr(rhs, Arity::Fixed(1))?;
        let (opcode, negate) = match op {
            BinOp::Add => (OpCode::Add, false),
            BinOp::Sub => (OpCode::Sub, false),
            BinOp::Mul => (OpCode::Mul, false),
            BinOp::Div => (OpCode::Div, false),
            BinOp::Mod => (OpCode::Mod, false),
            BinOp::Pow => (OpCode::Pow, false),
            BinOp::Concat => (OpCode::Concat, false),
            BinOp::Eq => (OpCode::Eq, false),
            BinOp::NotEq => (OpCode::Eq, true),
            BinOp::Lt => (OpCode::Less, false),
            BinOp::LtEq => (OpCode::LessEq, false),
            BinOp::Gt => (OpCode::LessEq, true),
            BinOp::GtEq => (OpCode::Less, true),
            BinOp::And | BinOp::Or => {
                return Err(LamnError::Compile(format!("no lowering for {op:?}")))
            }
        };
        self.emit(opcode, 0, 0)?;
        if negate {
            self.emit(OpCode::Not, 0, 0)?;
        }
        Ok(())
    }

    fn compile_table(&mut self, fields: &[TableField]) -> Result<(), LamnError> {
        self.emit(OpCode::NewTable, 0, 0)?;
        let mut index = 1.0;
        for (i, field) in fields.iter().enumerate() {
            self.emit(OpCode::GetStack, 1, 0)?;
            match field {
                TableField::Positional(value) => {
                    self.load_constant(Value::Number(index))?;
                    index += 1.0;
                    // a trailing call or `...` fills the following indices
                    let arity = if i + 1 == fields.len() && value.is_multi() {
                        Arity::Multi
                    } else {
                        Arity::Fixed(1)
                    };
                    self.compile_expr(value, arity)?;
                }
                TableField::Named(name, value) => {
                    self.load_constant(Value::from(name.as_str()))?;
                    self.compile_expr(value, Arity::Fixed(1))?;
                }
                TableField::Keyed(key, value) => {
                    self.compile_expr(key, Arity::Fixed(1))?;
                    self.compile_expr(value, Arity::Fixed(1))?;
                }
            }
            self.emit(OpCode::PutTable, 0, 0)?;
        }
        Ok(())
    }
}

fn stmt_line(stmt: &Stmt) -> u32 {
    match stmt {
        Stmt::Local { line, .. }
        | Stmt::LocalFunction { line, .. }
        | Stmt::Assign { line, .. }
        | Stmt::While { line, .. }
        | Stmt::Repeat { line, .. }
        | Stmt::If { line, .. }
        | Stmt::NumericFor { line, .. }
        | Stmt::GenericFor { line, .. }
        | Stmt::Function { line, .. } => *line,
        Stmt::Call(expr) => expr.line(),
        Stmt::Do(block) => block.line,
        Stmt::Break(line) => *line,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lamn_parser::Parser;

    fn compile(src: &str) -> Rc<CompiledUnit> {
        let block = Parser::new(src).unwrap().parse().unwrap();
        Compiler::new("<test>").compile(&block).unwrap()
    }

    fn compile_err(src: &str) -> LamnError {
        let block = Parser::new(src).unwrap().parse().unwrap();
        Compiler::new("<test>").compile(&block).unwrap_err()
    }

    fn opcodes(unit: &CompiledUnit) -> Vec<&'static str> {
        unit.code
            .iter()
            .filter_map(|ins| ins.opcode())
            .map(OpCode::mnemonic)
            .collect()
    }

    fn count(unit: &CompiledUnit, op: OpCode) -> usize {
        unit.code.iter().filter(|i| i.opcode() == Some(op)).count()
    }

    // ── Constants ──────────────────────────────────────────────────────────────
    #[test]
    fn number_and_string_constants() {
        let unit = compile(r#"return 42, "hello""#);
        assert!(unit.constants.contains(&Value::Number(42.0)));
        assert!(unit.constants.contains(&Value::from("hello")));
        assert_eq!(opcodes(&unit), vec!["LOADK", "LOADK", "RET", "RET"]);
    }

    #[test]
    fn constants_are_shared() {
        let unit = compile("local a, b = 7, 7");
        assert_eq!(unit.constants, vec![Value::Number(7.0)]);
    }

    // ── Locals & globals ──────────────────────────────────────────────────────
    #[test]
    fn locals_are_closed_after_declaration() {
        let unit = compile("local x = 5; return x");
        assert_eq!(
            opcodes(&unit),
            vec!["LOADK", "CLOSEVARS", "GETSTACK", "POPCLOSED", "RET", "RET"]
        );
        // x sits in slot 1, just above the argument slot
        assert_eq!(unit.code[2].a(), 1);
    }

    #[test]
    fn globals_use_name_constants() {
        let unit = compile("x = y");
        assert_eq!(opcodes(&unit), vec!["GETGLOBAL", "PUTGLOBAL", "RET"]);
        assert_eq!(unit.constants, vec![Value::from("y"), Value::from("x")]);
    }

    #[test]
    fn missing_values_are_padded_with_nil() {
        let unit = compile("local a, b, c = 1");
        assert_eq!(count(&unit, OpCode::LoadK), 3);
        assert_eq!(unit.code[3], Instruction::new(OpCode::CloseVars, 3, 0));
    }

    #[test]
    fn surplus_values_are_dropped() {
        let unit = compile("local a = 1, 2");
        assert_eq!(opcodes(&unit)[..3], ["LOADK", "LOADK", "POPSTACK"]);
    }

    #[test]
    fn call_results_fill_remaining_targets() {
        let unit = compile("local a, b = f()");
        assert!(unit.code.contains(&Instruction::new(OpCode::Call, 0, 2)));
    }

    // ── Operators ─────────────────────────────────────────────────────────────
    #[test]
    fn derived_comparisons_negate() {
        let unit = compile("return 1 > 2, 1 >= 2, 1 ~= 2");
        let ops = opcodes(&unit);
        assert_eq!(
            &ops[..12],
            &[
                "LOADK", "LOADK", "LESSEQ", "NOT", "LOADK", "LOADK", "LESS", "NOT", "LOADK",
                "LOADK", "EQ", "NOT"
            ]
        );
    }

    #[test]
    fn short_circuit_peeks() {
        let unit = compile("return a or b");
        assert_eq!(unit.code[1], Instruction::new(OpCode::JmpTrue, 4, 1));
        assert_eq!(opcodes(&unit)[2], "POPSTACK");
    }

    // ── Control flow ──────────────────────────────────────────────────────────
    #[test]
    fn while_jumps_back_to_condition() {
        let unit = compile("while x do end");
        let back = unit
            .code
            .iter()
            .find(|i| i.opcode() == Some(OpCode::Jmp))
            .unwrap();
        assert_eq!(back.a(), 0);
    }

    #[test]
    fn break_releases_loop_locals() {
        let unit = compile("while true do local a = 1 break end");
        let ops = opcodes(&unit);
        let jmp = ops.iter().position(|&o| o == "JMP").unwrap();
        assert_eq!(&ops[jmp - 2..=jmp], &["POPCLOSED", "POPSTACK", "JMP"]);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert!(matches!(compile_err("break"), LamnError::Syntax { .. }));
    }

    #[test]
    fn numeric_for_prepares_and_guards() {
        let unit = compile("for i = 1, 3 do end");
        assert_eq!(count(&unit, OpCode::ForPrep), 1);
        assert_eq!(count(&unit, OpCode::Or), 1);
        assert_eq!(count(&unit, OpCode::And), 2);
    }

    #[test]
    fn generic_for_calls_iterator_for_each_name() {
        let unit = compile("for k, v in pairs(t) do end");
        assert!(unit.code.contains(&Instruction::new(OpCode::Call, 2, 2)));
    }

    // ── Functions ─────────────────────────────────────────────────────────────
    #[test]
    fn nested_functions_become_children() {
        let unit = compile("local function f(x) return function() return x end end");
        assert_eq!(unit.children.len(), 1);
        let f = unit.child(UnitId(1)).unwrap();
        assert_eq!(f.param_count, 1);
        assert_eq!(opcodes(f)[..2], ["POPVARGS", "CLOSEVARS"]);
        let inner = f.child(UnitId(2)).unwrap();
        // f is closure position 0, x is 1
        assert!(inner.code.contains(&Instruction::new(OpCode::GetUpval, 1, 0)));
    }

    #[test]
    fn local_function_is_visible_to_itself() {
        let unit = compile("local function f() return f() end");
        let f = unit.child(UnitId(1)).unwrap();
        assert_eq!(opcodes(f)[0], "GETUPVAL");
    }

    #[test]
    fn methods_receive_self() {
        let unit = compile("function obj.m:go(x) return self end");
        let go = unit.child(UnitId(1)).unwrap();
        assert_eq!(go.name, "obj.m:go");
        assert_eq!(go.param_count, 2);
    }

    #[test]
    fn varargs_outside_vararg_function_is_rejected() {
        assert!(matches!(
            compile_err("local function f() return ... end"),
            LamnError::Syntax { .. }
        ));
    }

    #[test]
    fn chunk_accepts_varargs() {
        let unit = compile("return ...");
        assert_eq!(unit.code[0], Instruction::new(OpCode::GetStack, 1, 0));
        assert!(unit.is_vararg);
    }

    #[test]
    fn unit_ids_count_up_in_definition_order() {
        let unit = compile("local a = function() end local b = function() end");
        let ids: Vec<_> = unit.children.keys().map(|id| id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn lines_follow_statements() {
        let unit = compile("local a = 1\n\nprint(a)");
        assert_eq!(unit.line_at(0), Some(1));
        assert_eq!(unit.lines.last(), Some(&3));
    }
}
