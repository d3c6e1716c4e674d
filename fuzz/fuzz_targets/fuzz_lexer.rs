#![no_main]

use libfuzzer_sys::fuzz_target;
use tawk::{Lexer, TokenKind};

fuzz_target!(|data: &str| {
    // Scan to the end; errors are fine, panics and hangs are not.
    let mut lexer = Lexer::new(data);
    loop {
        match lexer.scan() {
            Ok(tok) if tok.kind == TokenKind::Eof => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
});
