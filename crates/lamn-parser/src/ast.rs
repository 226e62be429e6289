//! Syntax tree consumed by the compiler.
//!
//! A source chunk parses to a top-level [`Block`].

/// 1-based source line number carried by nodes for diagnostics.
pub type Line = u32;

// ── Blocks & Statements ──────────────────────────────────────────────────────

/// A sequence of statements, optionally terminated by an explicit `return`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub ret: Option<ReturnStmt>,
    pub line: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub values: Vec<Expr>,
    pub line: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `local namelist [= explist]`
    Local {
        names: Vec<String>,
        values: Vec<Expr>,
        line: Line,
    },

    /// `local function Name funcbody`
    LocalFunction {
        name: String,
        body: FuncBody,
        line: Line,
    },

    /// `varlist = explist`; targets are `Name`, `Index` or `Field` expressions.
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
        line: Line,
    },

    /// A call evaluated for its side effects; all results are discarded.
    Call(Expr),

    /// `do block end`
    Do(Block),

    /// `while exp do block end`
    While { cond: Expr, body: Block, line: Line },

    /// `repeat block until exp`; `cond` sees the body's locals.
    Repeat { body: Block, cond: Expr, line: Line },

    /// `if exp then block {elseif exp then block} [else block] end`
    If {
        clauses: Vec<(Expr, Block)>,
        else_: Option<Block>,
        line: Line,
    },

    /// `for Name = exp, exp [, exp] do block end`
    NumericFor {
        var: String,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
        line: Line,
    },

    /// `for namelist in explist do block end`
    GenericFor {
        names: Vec<String>,
        exprs: Vec<Expr>,
        body: Block,
        line: Line,
    },

    /// `function a.b.c:m funcbody`
    Function {
        name: FuncName,
        body: FuncBody,
        line: Line,
    },

    Break(Line),
}

/// Dotted function name, e.g. `a.b.c:method`.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncName {
    pub root: String,
    pub fields: Vec<String>,
    pub method: Option<String>,
}

impl FuncName {
    /// The name used in diagnostics and disassembly.
    pub fn display(&self) -> String {
        let mut s = self.root.clone();
        for f in &self.fields {
            s.push('.');
            s.push_str(f);
        }
        if let Some(m) = &self.method {
            s.push(':');
            s.push_str(m);
        }
        s
    }
}

/// Function parameters + body block. Methods get an explicit `self` first.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncBody {
    pub params: Vec<String>,
    pub is_vararg: bool,
    pub body: Block,
    pub line: Line,
}

// ── Expressions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil(Line),
    True(Line),
    False(Line),
    Number(f64, Line),
    Str(String, Line),
    /// `...`
    VarArgs(Line),

    Name(String, Line),

    /// `( exp )`: truncates a multi-value to exactly one value.
    Paren(Box<Expr>, Line),

    Unary {
        op: UnOp,
        operand: Box<Expr>,
        line: Line,
    },

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: Line,
    },

    /// `table[key]`
    Index {
        table: Box<Expr>,
        key: Box<Expr>,
        line: Line,
    },

    /// `table.field`
    Field {
        table: Box<Expr>,
        field: String,
        line: Line,
    },

    /// `func(args)`, `func{table}` or `func"string"`
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        line: Line,
    },

    /// `obj:method(args)`
    MethodCall {
        obj: Box<Expr>,
        method: String,
        args: Vec<Expr>,
        line: Line,
    },

    /// `function(params) body end`
    Function(Box<FuncBody>),

    /// `{ field, field, ... }`
    Table(Vec<TableField>, Line),
}

impl Expr {
    pub fn line(&self) -> Line {
        match self {
            Expr::Nil(l) | Expr::True(l) | Expr::False(l) | Expr::VarArgs(l) => *l,
            Expr::Number(_, l) | Expr::Str(_, l) | Expr::Name(_, l) | Expr::Paren(_, l) => *l,
            Expr::Unary { line, .. } | Expr::Binary { line, .. } => *line,
            Expr::Index { line, .. } | Expr::Field { line, .. } => *line,
            Expr::Call { line, .. } | Expr::MethodCall { line, .. } => *line,
            Expr::Function(body) => body.line,
            Expr::Table(_, l) => *l,
        }
    }

    /// Calls and `...` can produce any number of values.
    pub fn is_multi(&self) -> bool {
        matches!(self, Expr::Call { .. } | Expr::MethodCall { .. } | Expr::VarArgs(_))
    }
}

/// A single field in a table constructor.
#[derive(Debug, Clone, PartialEq)]
pub enum TableField {
    /// `[expr] = expr`
    Keyed(Expr, Expr),
    /// `Name = expr`
    Named(String, Expr),
    /// `expr`: gets the next array index
    Positional(Expr),
}

// ── Operators ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg, // -
    Not, // not
    Len, // #
}
