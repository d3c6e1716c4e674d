use std::fmt;
use thiserror::Error;

/// A 1-based line/column pair in the program source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// All error types produced by the lexer, parser, and interpreter.
#[derive(Error, Debug)]
pub enum Error {
    #[error("lex error at {position}: {message}")]
    Lex { message: String, position: Position },

    #[error("parse error at {position}: {message}")]
    Parse { message: String, position: Position },

    #[error("runtime error: {message}")]
    Runtime { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    pub fn lex(message: impl Into<String>, position: Position) -> Self {
        Self::Lex {
            message: message.into(),
            position,
        }
    }

    pub fn parse(message: impl Into<String>, position: Position) -> Self {
        Self::Parse {
            message: message.into(),
            position,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Source position of a lex or parse error, for caret rendering.
    pub fn position(&self) -> Option<Position> {
        match self {
            Error::Lex { position, .. } | Error::Parse { position, .. } => Some(*position),
            _ => None,
        }
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
