//! tawk - a POSIX-style AWK interpreter
//!
//! The crate is the AWK *core*: a context-sensitive lexer, a
//! recursive-descent parser that resolves scalar/array kinds and function
//! calls, and a tree-walking interpreter with AWK's dynamic string/number
//! values, associative arrays, field splitting, printf, and redirection
//! handles. The thin command-line front end lives in `main.rs`.
//!
//! # Example
//!
//! ```
//! use tawk::{parse_program, Interp};
//!
//! let program = parse_program(r#"BEGIN { print "Hello, World!" }"#).unwrap();
//! let mut interp = Interp::new(&program);
//! let mut output = Vec::new();
//! interp.run(Box::new(std::io::empty()), &mut output).unwrap();
//!
//! assert_eq!(String::from_utf8(output).unwrap(), "Hello, World!\n");
//! ```
//!
//! # Processing input
//!
//! ```
//! use std::io::Cursor;
//! use tawk::{parse_program, Interp};
//!
//! let program = parse_program("{ sum += $2 } END { print sum }").unwrap();
//! let mut interp = Interp::new(&program);
//! let input = Cursor::new(String::from("foo 12\nbar 34\nbaz 56\n"));
//! let mut output = Vec::new();
//! let status = interp.run(Box::new(input), &mut output).unwrap();
//!
//! assert_eq!(status, 0);
//! assert_eq!(String::from_utf8(output).unwrap(), "102\n");
//! ```

pub mod ast;
pub mod error;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod value;

pub use error::{Error, Position, Result};
pub use interp::Interp;
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::{parse_program, Parser};
pub use value::Value;
