use crate::ast::*;
use lamn_core::LamnError;
use lamn_lexer::{Lexer, Token, TokenKind};

/// Recursive-descent parser with precedence climbing for binary operators.
///
/// ```ignore
/// let block = Parser::new("local x = 1 + 2")?.parse()?;
/// ```
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

// ── Constructor ───────────────────────────────────────────────────────────────

impl Parser {
    /// Lex `src` and create a parser over the token stream.
    pub fn new(src: &str) -> Result<Self, LamnError> {
        let tokens = Lexer::new(src).tokenize()?;
        Ok(Self { tokens, pos: 0 })
    }

    /// Parse the entire source as a [`Block`].
    pub fn parse(mut self) -> Result<Block, LamnError> {
        let block = self.parse_block()?;
        self.expect(TokenKind::Eof)?;
        Ok(block)
    }
}

// ── Token navigation ──────────────────────────────────────────────────────────

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_ahead(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + n).map(|t| &t.kind)
    }

    fn line(&self) -> Line {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: String) -> LamnError {
        let tok = &self.tokens[self.pos];
        LamnError::Syntax {
            line: tok.line,
            column: tok.column,
            message,
        }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), LamnError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, got {:?}", expected, self.peek())))
        }
    }

    fn expect_name(&mut self) -> Result<String, LamnError> {
        match self.peek().clone() {
            TokenKind::Name(s) => {
                self.advance();
                Ok(s)
            }
            other => Err(self.error(format!("expected a name, got {:?}", other))),
        }
    }
}

// ── Block & Statements ────────────────────────────────────────────────────────

impl Parser {
    /// `block ::= {stat} [retstat]`
    fn parse_block(&mut self) -> Result<Block, LamnError> {
        let line = self.line();
        let mut stmts = Vec::new();
        loop {
            while self.eat(&TokenKind::Semicolon) {}

            if matches!(self.peek(), TokenKind::Return) {
                let ret = self.parse_return()?;
                return Ok(Block {
                    stmts,
                    ret: Some(ret),
                    line,
                });
            }
            if self.is_block_end() {
                break;
            }
            stmts.push(self.parse_stmt()?);
        }
        Ok(Block {
            stmts,
            ret: None,
            line,
        })
    }

    fn is_block_end(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Eof | TokenKind::End | TokenKind::Else | TokenKind::Elseif | TokenKind::Until
        )
    }

    fn parse_return(&mut self) -> Result<ReturnStmt, LamnError> {
        let line = self.line();
        self.expect(TokenKind::Return)?;
        let values = if self.is_block_end() || matches!(self.peek(), TokenKind::Semicolon) {
            Vec::new()
        } else {
            self.parse_expr_list()?
        };
        self.eat(&TokenKind::Semicolon);
        if !self.is_block_end() {
            return Err(self.error("'return' must be the last statement of a block".into()));
        }
        Ok(ReturnStmt { values, line })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, LamnError> {
        let line = self.line();
        match self.peek() {
            TokenKind::If => self.parse_if(),
            TokenKind::While => {
                self.advance();
                let cond = self.parse_expr()?;
                self.expect(TokenKind::Do)?;
                let body = self.parse_block()?;
                self.expect(TokenKind::End)?;
                Ok(Stmt::While { cond, body, line })
            }
            TokenKind::Do => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(TokenKind::End)?;
                Ok(Stmt::Do(body))
            }
            TokenKind::For => self.parse_for(),
            TokenKind::Repeat => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(TokenKind::Until)?;
                let cond = self.parse_expr()?;
                Ok(Stmt::Repeat { body, cond, line })
            }
            TokenKind::Function => self.parse_function_stmt(),
            TokenKind::Local => self.parse_local(),
            TokenKind::Break => {
                self.advance();
                Ok(Stmt::Break(line))
            }
            _ => self.parse_expr_stmt(),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, LamnError> {
        let line = self.line();
        self.expect(TokenKind::If)?;
        let mut clauses = Vec::new();
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Then)?;
        clauses.push((cond, self.parse_block()?));

        let mut else_ = None;
        loop {
            if self.eat(&TokenKind::Elseif) {
                let cond = self.parse_expr()?;
                self.expect(TokenKind::Then)?;
                clauses.push((cond, self.parse_block()?));
            } else {
                if self.eat(&TokenKind::Else) {
                    else_ = Some(self.parse_block()?);
                }
                break;
            }
        }
        self.expect(TokenKind::End)?;
        Ok(Stmt::If {
            clauses,
            else_,
            line,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, LamnError> {
        let line = self.line();
        self.expect(TokenKind::For)?;
        let first = self.expect_name()?;

        if self.eat(&TokenKind::Assign) {
            let start = self.parse_expr()?;
            self.expect(TokenKind::Comma)?;
            let limit = self.parse_expr()?;
            let step = if self.eat(&TokenKind::Comma) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(TokenKind::Do)?;
            let body = self.parse_block()?;
            self.expect(TokenKind::End)?;
            return Ok(Stmt::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
                line,
            });
        }

        let mut names = vec![first];
        while self.eat(&TokenKind::Comma) {
            names.push(self.expect_name()?);
        }
        self.expect(TokenKind::In)?;
        let exprs = self.parse_expr_list()?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_block()?;
        self.expect(TokenKind::End)?;
        Ok(Stmt::GenericFor {
            names,
            exprs,
            body,
            line,
        })
    }

    /// `function funcname funcbody` where `funcname ::= Name {'.' Name} [':' Name]`
    fn parse_function_stmt(&mut self) -> Result<Stmt, LamnError> {
        let line = self.line();
        self.expect(TokenKind::Function)?;
        let root = self.expect_name()?;
        let mut fields = Vec::new();
        while self.eat(&TokenKind::Dot) {
            fields.push(self.expect_name()?);
        }
        let method = if self.eat(&TokenKind::Colon) {
            Some(self.expect_name()?)
        } else {
            None
        };
        let body = self.parse_func_body(method.is_some(), line)?;
        Ok(Stmt::Function {
            name: FuncName {
                root,
                fields,
                method,
            },
            body,
            line,
        })
    }

    fn parse_local(&mut self) -> Result<Stmt, LamnError> {
        let line = self.line();
        self.expect(TokenKind::Local)?;
        if self.eat(&TokenKind::Function) {
            let name = self.expect_name()?;
            let body = self.parse_func_body(false, line)?;
            return Ok(Stmt::LocalFunction { name, body, line });
        }
        let mut names = vec![self.expect_name()?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.expect_name()?);
        }
        let values = if self.eat(&TokenKind::Assign) {
            self.parse_expr_list()?
        } else {
            Vec::new()
        };
        Ok(Stmt::Local {
            names,
            values,
            line,
        })
    }

    /// Assignment or call statement.
    fn parse_expr_stmt(&mut self) -> Result<Stmt, LamnError> {
        let line = self.line();
        let expr = self.parse_suffixed_expr()?;

        if matches!(self.peek(), TokenKind::Assign | TokenKind::Comma) {
            let mut targets = vec![expr];
            while self.eat(&TokenKind::Comma) {
                targets.push(self.parse_suffixed_expr()?);
            }
            if let Some(bad) = targets
                .iter()
                .find(|t| !matches!(t, Expr::Name(..) | Expr::Index { .. } | Expr::Field { .. }))
            {
                return Err(LamnError::Syntax {
                    line: bad.line(),
                    column: 0,
                    message: "cannot assign to this expression".into(),
                });
            }
            self.expect(TokenKind::Assign)?;
            let values = self.parse_expr_list()?;
            return Ok(Stmt::Assign {
                targets,
                values,
                line,
            });
        }

        match expr {
            Expr::Call { .. } | Expr::MethodCall { .. } => Ok(Stmt::Call(expr)),
            _ => Err(self.error("expected assignment or function call".into())),
        }
    }

    /// `funcbody ::= '(' [parlist] ')' block end`
    fn parse_func_body(&mut self, method: bool, line: Line) -> Result<FuncBody, LamnError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        let mut is_vararg = false;
        if method {
            params.push("self".to_string());
        }
        if !matches!(self.peek(), TokenKind::RParen) {
            loop {
                if self.eat(&TokenKind::DotDotDot) {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        self.expect(TokenKind::End)?;
        Ok(FuncBody {
            params,
            is_vararg,
            body,
            line,
        })
    }
}

// ── Expressions ───────────────────────────────────────────────────────────────

/// Binding power of unary operators; only `^` binds tighter.
const UNARY_PRIORITY: u8 = 11;

impl Parser {
    fn parse_expr_list(&mut self) -> Result<Vec<Expr>, LamnError> {
        let mut list = vec![self.parse_expr()?];
        while self.eat(&TokenKind::Comma) {
            list.push(self.parse_expr()?);
        }
        Ok(list)
    }

    pub fn parse_expr(&mut self) -> Result<Expr, LamnError> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, LamnError> {
        let mut lhs = self.parse_unary()?;
        while let Some((left, right, op)) = binary_op(self.peek()) {
            if left <= min_prec {
                break;
            }
            let line = self.line();
            self.advance();
            let rhs = self.parse_binary(right)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, LamnError> {
        let line = self.line();
        let op = match self.peek() {
            TokenKind::Not => UnOp::Not,
            TokenKind::Minus => UnOp::Neg,
            TokenKind::Hash => UnOp::Len,
            _ => return self.parse_simple(),
        };
        self.advance();
        let operand = self.parse_binary(UNARY_PRIORITY)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
            line,
        })
    }

    fn parse_simple(&mut self) -> Result<Expr, LamnError> {
        let line = self.line();
        let expr = match self.peek().clone() {
            TokenKind::Number(n) => Expr::Number(n, line),
            TokenKind::Str(s) => Expr::Str(s, line),
            TokenKind::Nil => Expr::Nil(line),
            TokenKind::True => Expr::True(line),
            TokenKind::False => Expr::False(line),
            TokenKind::DotDotDot => Expr::VarArgs(line),
            TokenKind::Function => {
                self.advance();
                return Ok(Expr::Function(Box::new(self.parse_func_body(false, line)?)));
            }
            TokenKind::LBrace => return self.parse_table(),
            _ => return self.parse_suffixed_expr(),
        };
        self.advance();
        Ok(expr)
    }

    /// Primary expression followed by `.field`, `[key]`, `(args)` and `:m(args)` suffixes.
    fn parse_suffixed_expr(&mut self) -> Result<Expr, LamnError> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = self.line();
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let field = self.expect_name()?;
                    expr = Expr::Field {
                        table: Box::new(expr),
                        field,
                        line,
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::Index {
                        table: Box::new(expr),
                        key: Box::new(key),
                        line,
                    };
                }
                TokenKind::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let args = self.parse_call_args()?;
                    expr = Expr::MethodCall {
                        obj: Box::new(expr),
                        method,
                        args,
                        line,
                    };
                }
                TokenKind::LParen | TokenKind::LBrace | TokenKind::Str(_) => {
                    let args = self.parse_call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        line,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, LamnError> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Name(n) => {
                self.advance();
                Ok(Expr::Name(n, line))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Paren(Box::new(inner), line))
            }
            other => Err(self.error(format!("unexpected symbol {:?}", other))),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, LamnError> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::LParen => {
                self.advance();
                if self.eat(&TokenKind::RParen) {
                    return Ok(Vec::new());
                }
                let args = self.parse_expr_list()?;
                self.expect(TokenKind::RParen)?;
                Ok(args)
            }
            TokenKind::LBrace => Ok(vec![self.parse_table()?]),
            TokenKind::Str(s) => {
                self.advance();
                Ok(vec![Expr::Str(s, line)])
            }
            other => Err(self.error(format!("expected function arguments, got {:?}", other))),
        }
    }

    fn parse_table(&mut self) -> Result<Expr, LamnError> {
        let line = self.line();
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !matches!(self.peek(), TokenKind::RBrace) {
            fields.push(self.parse_field()?);
            if !self.eat(&TokenKind::Comma) && !self.eat(&TokenKind::Semicolon) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::Table(fields, line))
    }

    fn parse_field(&mut self) -> Result<TableField, LamnError> {
        match self.peek().clone() {
            TokenKind::LBracket => {
                self.advance();
                let key = self.parse_expr()?;
                self.expect(TokenKind::RBracket)?;
                self.expect(TokenKind::Assign)?;
                Ok(TableField::Keyed(key, self.parse_expr()?))
            }
            TokenKind::Name(name) if self.peek_ahead(1) == Some(&TokenKind::Assign) => {
                self.advance();
                self.advance();
                Ok(TableField::Named(name, self.parse_expr()?))
            }
            _ => Ok(TableField::Positional(self.parse_expr()?)),
        }
    }
}

/// `(left, right, op)` binding powers for a binary operator token.
/// Right-associative operators bind their right side one step looser.
fn binary_op(kind: &TokenKind) -> Option<(u8, u8, BinOp)> {
    Some(match kind {
        TokenKind::Or => (1, 1, BinOp::Or),
        TokenKind::And => (2, 2, BinOp::And),
        TokenKind::Lt => (3, 3, BinOp::Lt),
        TokenKind::Gt => (3, 3, BinOp::Gt),
        TokenKind::LtEq => (3, 3, BinOp::LtEq),
        TokenKind::GtEq => (3, 3, BinOp::GtEq),
        TokenKind::Eq => (3, 3, BinOp::Eq),
        TokenKind::NotEq => (3, 3, BinOp::NotEq),
        TokenKind::DotDot => (5, 4, BinOp::Concat),
        TokenKind::Plus => (6, 6, BinOp::Add),
        TokenKind::Minus => (6, 6, BinOp::Sub),
        TokenKind::Star => (7, 7, BinOp::Mul),
        TokenKind::Slash => (7, 7, BinOp::Div),
        TokenKind::Percent => (7, 7, BinOp::Mod),
        TokenKind::Caret => (13, 12, BinOp::Pow),
        _ => return None,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Block {
        Parser::new(src).unwrap().parse().unwrap()
    }

    fn parse_expr(src: &str) -> Expr {
        let block = parse(&format!("return {src}"));
        block.ret.unwrap().values.into_iter().next().unwrap()
    }

    fn parse_err(src: &str) -> LamnError {
        Parser::new(src).unwrap().parse().unwrap_err()
    }

    fn is_binary(expr: &Expr, expected: BinOp) -> bool {
        matches!(expr, Expr::Binary { op, .. } if *op == expected)
    }

    #[test]
    fn empty_block() {
        let block = parse("");
        assert!(block.stmts.is_empty());
        assert!(block.ret.is_none());
    }

    #[test]
    fn bare_return() {
        assert_eq!(parse("return").ret.unwrap().values.len(), 0);
    }

    #[test]
    fn literals() {
        assert_eq!(parse_expr("42"), Expr::Number(42.0, 1));
        assert_eq!(parse_expr("'hi'"), Expr::Str("hi".into(), 1));
        assert_eq!(parse_expr("nil"), Expr::Nil(1));
        assert_eq!(parse_expr("..."), Expr::VarArgs(1));
    }

    #[test]
    fn mul_binds_tighter_than_add() {
        let expr = parse_expr("1 + 2 * 3");
        let Expr::Binary { op, rhs, .. } = expr else {
            panic!("expected binary expression");
        };
        assert_eq!(op, BinOp::Add);
        assert!(is_binary(&rhs, BinOp::Mul));
    }

    #[test]
    fn subtraction_is_left_associative() {
        let Expr::Binary { lhs, .. } = parse_expr("1 - 2 - 3") else {
            panic!("expected binary expression");
        };
        assert!(is_binary(&lhs, BinOp::Sub));
    }

    #[test]
    fn concat_is_right_associative() {
        let Expr::Binary { op, rhs, .. } = parse_expr("'a' .. 'b' .. 'c'") else {
            panic!("expected binary expression");
        };
        assert_eq!(op, BinOp::Concat);
        assert!(is_binary(&rhs, BinOp::Concat));
    }

    #[test]
    fn pow_binds_tighter_than_unary_minus() {
        let Expr::Unary { op, operand, .. } = parse_expr("-2 ^ 2") else {
            panic!("expected unary expression");
        };
        assert_eq!(op, UnOp::Neg);
        assert!(is_binary(&operand, BinOp::Pow));
    }

    #[test]
    fn comparison_binds_tighter_than_and() {
        let Expr::Binary { op, lhs, rhs, .. } = parse_expr("a < b and c >= d") else {
            panic!("expected binary expression");
        };
        assert_eq!(op, BinOp::And);
        assert!(is_binary(&lhs, BinOp::Lt));
        assert!(is_binary(&rhs, BinOp::GtEq));
    }

    #[test]
    fn parentheses_are_kept() {
        assert!(matches!(parse_expr("(f())"), Expr::Paren(..)));
    }

    #[test]
    fn local_with_multiple_names() {
        let block = parse("local a, b = 1");
        let Stmt::Local { names, values, .. } = &block.stmts[0] else {
            panic!("expected local");
        };
        assert_eq!(names, &["a".to_string(), "b".to_string()]);
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn assignment_targets() {
        let block = parse("a, t.x, t[1] = 1, 2, 3");
        let Stmt::Assign { targets, .. } = &block.stmts[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(targets[1], Expr::Field { .. }));
        assert!(matches!(targets[2], Expr::Index { .. }));
    }

    #[test]
    fn if_with_elseif_and_else() {
        let block = parse("if a then elseif b then else end");
        let Stmt::If { clauses, else_, .. } = &block.stmts[0] else {
            panic!("expected if");
        };
        assert_eq!(clauses.len(), 2);
        assert!(else_.is_some());
    }

    #[test]
    fn numeric_and_generic_for() {
        let block = parse("for i = 1, 10, 2 do end for k, v in next, t do end");
        assert!(matches!(block.stmts[0], Stmt::NumericFor { step: Some(_), .. }));
        let Stmt::GenericFor { names, exprs, .. } = &block.stmts[1] else {
            panic!("expected generic for");
        };
        assert_eq!(names.len(), 2);
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn method_definition_gets_self() {
        let block = parse("function a.b:m(x) end");
        let Stmt::Function { name, body, .. } = &block.stmts[0] else {
            panic!("expected function statement");
        };
        assert_eq!(name.display(), "a.b:m");
        assert_eq!(body.params, vec!["self".to_string(), "x".to_string()]);
    }

    #[test]
    fn vararg_parameters() {
        let block = parse("local function f(a, ...) end");
        let Stmt::LocalFunction { body, .. } = &block.stmts[0] else {
            panic!("expected local function");
        };
        assert!(body.is_vararg);
        assert_eq!(body.params.len(), 1);
    }

    #[test]
    fn call_sugar_forms() {
        let block = parse("f'x' g{1, 2} o:m(1)");
        assert!(matches!(&block.stmts[0], Stmt::Call(Expr::Call { args, .. }) if args.len() == 1));
        assert!(matches!(&block.stmts[1], Stmt::Call(Expr::Call { args, .. }) if matches!(args[0], Expr::Table(..))));
        assert!(matches!(&block.stmts[2], Stmt::Call(Expr::MethodCall { .. })));
    }

    #[test]
    fn table_constructor_fields() {
        let Expr::Table(fields, _) = parse_expr("{1, x = 2, [3] = 4; 5}") else {
            panic!("expected table");
        };
        assert!(matches!(fields[0], TableField::Positional(_)));
        assert!(matches!(fields[1], TableField::Named(..)));
        assert!(matches!(fields[2], TableField::Keyed(..)));
        assert!(matches!(fields[3], TableField::Positional(_)));
    }

    #[test]
    fn lines_are_recorded() {
        let block = parse("\n\nlocal x = 1");
        assert!(matches!(block.stmts[0], Stmt::Local { line: 3, .. }));
    }

    #[test]
    fn return_must_end_block() {
        assert!(matches!(parse_err("return 1 x = 2"), LamnError::Syntax { .. }));
    }

    #[test]
    fn expression_statement_must_be_call() {
        assert!(matches!(parse_err("x"), LamnError::Syntax { .. }));
        assert!(matches!(parse_err("(f) = 1"), LamnError::Syntax { .. }));
    }

    #[test]
    fn unclosed_block_is_an_error() {
        assert!(matches!(parse_err("while true do"), LamnError::Syntax { .. }));
    }
}
