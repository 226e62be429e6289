use crate::token::{Token, TokenKind};
use lamn_core::LamnError;
use once_cell::sync::Lazy;
use regex::Regex;

/// What a matched lexeme turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Whitespace,
    Comment,
    LongBracket,
    HexNumber,
    Number,
    Name,
    QuotedString,
    Symbol,
}

/// Anchored patterns, tried in order at the current position.
static RULES: Lazy<Vec<(Rule, Regex)>> = Lazy::new(|| {
    [
        (Rule::Whitespace, r"^[ \t\r\n]+"),
        (Rule::Comment, r"^--"),
        (Rule::LongBracket, r"^\[=*\["),
        (Rule::HexNumber, r"^0[xX][0-9a-fA-F]+"),
        (Rule::Number, r"^(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][+-]?[0-9]+)?"),
        (Rule::Name, r"^[A-Za-z_][A-Za-z0-9_]*"),
        (
            Rule::QuotedString,
            r#"^(?:"(?:[^"\\\n]|\\(?s:.))*"|'(?:[^'\\\n]|\\(?s:.))*')"#,
        ),
        (
            Rule::Symbol,
            r"^(?:\.\.\.|\.\.|==|~=|<=|>=|[-+*/%^#<>=(){}\[\];:,.])",
        ),
    ]
    .into_iter()
    .map(|(rule, pattern)| (rule, Regex::new(pattern).expect("token pattern is valid")))
    .collect()
});

/// Opening of a long bracket after `--`.
static LONG_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[=*\[").expect("long bracket pattern is valid"));

/// Tokenises a source string into a flat list of [`Token`]s.
pub struct Lexer<'src> {
    src: &'src str,
    pos: usize,
    line: u32,
    line_start: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            line_start: 0,
        }
    }

    /// Consume the entire source and return all tokens, including a final `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LamnError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    // ── internal helpers ────────────────────────────────────────────────────

    fn rest(&self) -> &'src str {
        let src: &'src str = self.src;
        &src[self.pos..]
    }

    fn column(&self) -> u32 {
        (self.pos - self.line_start + 1) as u32
    }

    /// Advance over `len` bytes, keeping line bookkeeping current.
    fn consume(&mut self, len: usize) -> &'src str {
        let src: &'src str = self.src;
        let text = &src[self.pos..self.pos + len];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                self.line += 1;
                self.line_start = self.pos + i + 1;
            }
        }
        self.pos += len;
        text
    }

    fn error(&self, message: impl Into<String>) -> LamnError {
        LamnError::Syntax {
            line: self.line,
            column: self.column(),
            message: message.into(),
        }
    }

    fn next_token(&mut self) -> Result<Token, LamnError> {
        loop {
            if self.pos >= self.src.len() {
                return Ok(Token::new(TokenKind::Eof, self.line, self.column()));
            }
            let (line, column) = (self.line, self.column());
            let rest = self.rest();
            let matched = RULES
                .iter()
                .find_map(|(rule, re)| re.find(rest).map(|m| (*rule, m.end())));
            let Some((rule, len)) = matched else {
                let ch = rest.chars().next().unwrap_or('?');
                return Err(self.error(format!("unexpected character '{ch}'")));
            };
            let kind = match rule {
                Rule::Whitespace => {
                    self.consume(len);
                    continue;
                }
                Rule::Comment => {
                    self.consume(len);
                    self.skip_comment()?;
                    continue;
                }
                Rule::LongBracket => {
                    let level = len - 2;
                    self.consume(len);
                    TokenKind::Str(self.long_bracket_body(level)?)
                }
                Rule::HexNumber => {
                    let text = self.consume(len);
                    let value = u64::from_str_radix(&text[2..], 16)
                        .map_err(|_| self.error(format!("malformed number '{text}'")))?;
                    TokenKind::Number(value as f64)
                }
                Rule::Number => {
                    let text = self.consume(len);
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| self.error(format!("malformed number '{text}'")))?;
                    TokenKind::Number(value)
                }
                Rule::Name => {
                    let text = self.consume(len);
                    TokenKind::keyword(text).unwrap_or_else(|| TokenKind::Name(text.to_owned()))
                }
                Rule::QuotedString => {
                    let text = self.consume(len);
                    TokenKind::Str(unescape(&text[1..text.len() - 1]).map_err(|m| self.error(m))?)
                }
                Rule::Symbol => {
                    let text = self.consume(len);
                    TokenKind::symbol(text)
                        .ok_or_else(|| self.error(format!("unknown symbol '{text}'")))?
                }
            };
            return Ok(Token::new(kind, line, column));
        }
    }

    /// Skip the rest of a comment whose `--` was already consumed.
    fn skip_comment(&mut self) -> Result<(), LamnError> {
        let rest = self.rest();
        if let Some(m) = LONG_OPEN.find(rest) {
            let level = m.end() - 2;
            self.consume(m.end());
            self.long_bracket_body(level)?;
            return Ok(());
        }
        let len = rest.find('\n').unwrap_or(rest.len());
        self.consume(len);
        Ok(())
    }

    /// Read up to the `]=*]` closing a long bracket of `level` equals signs.
    fn long_bracket_body(&mut self, level: usize) -> Result<String, LamnError> {
        let close = format!("]{}]", "=".repeat(level));
        let rest = self.rest();
        let Some(end) = rest.find(&close) else {
            return Err(self.error("unfinished long string or comment"));
        };
        let body = self.consume(end);
        self.consume(close.len());
        // a newline directly after the opening bracket is not part of the string
        let body = body
            .strip_prefix("\r\n")
            .or_else(|| body.strip_prefix('\n'))
            .unwrap_or(body);
        Ok(body.to_owned())
    }
}

/// Resolve backslash escapes inside a quoted string body.
fn unescape(body: &str) -> Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            return Err("unfinished escape sequence".into());
        };
        match esc {
            'n' | '\n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\u{7}'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '\\' | '"' | '\'' => out.push(esc),
            'z' => {
                while chars.peek().is_some_and(|c| c.is_whitespace()) {
                    chars.next();
                }
            }
            'x' => {
                let hex: String = (0..2).filter_map(|_| chars.next()).collect();
                let code = u8::from_str_radix(&hex, 16)
                    .map_err(|_| format!("invalid hex escape '\\x{hex}'"))?;
                out.push(char::from(code));
            }
            d if d.is_ascii_digit() => {
                let mut digits = d.to_string();
                while digits.len() < 3 && chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                    digits.extend(chars.next());
                }
                let code = digits
                    .parse::<u8>()
                    .map_err(|_| format!("decimal escape '\\{digits}' too large"))?;
                out.push(char::from(code));
            }
            other => return Err(format!("invalid escape sequence '\\{other}'")),
        }
    }
    Ok(out)
}
