use crate::value::Value;
use thiserror::Error;

/// All errors that can occur within the lamn runtime.
#[derive(Debug, Error, PartialEq)]
pub enum LamnError {
    /// A lexical or parse error.
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax {
        line: u32,
        column: u32,
        message: String,
    },

    /// The compiler met a shape it cannot lower. Never a user-recoverable error.
    #[error("compile error: {0}")]
    Compile(String),

    /// A value passed to `error()`, carried unchanged.
    #[error("{0}")]
    Raised(Value),

    #[error("attempt to perform arithmetic on a {got} value")]
    Arithmetic { got: &'static str },

    #[error("attempt to concatenate a {got} value")]
    Concat { got: &'static str },

    #[error("attempt to compare {lhs} with {rhs}")]
    Compare {
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("attempt to call a {got} value")]
    Call { got: &'static str },

    #[error("attempt to index a {got} value")]
    Index { got: &'static str },

    #[error("attempt to get length of a {got} value")]
    Length { got: &'static str },

    #[error("bad argument #{position} to '{function}' ({message})")]
    Argument {
        function: &'static str,
        position: usize,
        message: String,
    },

    #[error("table index is {0}")]
    InvalidKey(&'static str),

    #[error("'for' {0}")]
    ForLoop(&'static str),

    #[error("stack overflow")]
    StackOverflow,

    #[error("{0}")]
    Coroutine(&'static str),

    /// Any other runtime failure.
    #[error("{0}")]
    Runtime(String),

    /// A VM-internal error tagged with the line of the faulting instruction.
    #[error("{unit}:{line}: {source}")]
    Located {
        unit: String,
        line: u32,
        source: Box<LamnError>,
    },
}

impl LamnError {
    /// Shorthand for a bad-argument error raised by a native function.
    pub fn argument(function: &'static str, position: usize, message: impl Into<String>) -> Self {
        LamnError::Argument {
            function,
            position,
            message: message.into(),
        }
    }

    /// The value a `pcall` hands back for this error: `error()` payloads
    /// unchanged, everything else as its message.
    pub fn into_value(self) -> Value {
        match self {
            LamnError::Raised(value) => value,
            other => Value::from(other.to_string()),
        }
    }

    /// Attach a source position, unless the error is a user payload or
    /// already carries one.
    pub fn located(self, unit: &str, line: u32) -> Self {
        match self {
            LamnError::Raised(_) | LamnError::Located { .. } | LamnError::Syntax { .. } => self,
            other => LamnError::Located {
                unit: unit.to_owned(),
                line,
                source: Box::new(other),
            },
        }
    }
}
