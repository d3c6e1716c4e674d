mod tokens;

pub use tokens::{keyword_token, Builtin, Token, TokenKind};

use crate::error::{Error, Position, Result};

/// Streaming AWK scanner.
///
/// The parser pulls one token at a time with [`scan`](Lexer::scan). Because
/// `/.../` is context-sensitive, `scan` always returns `Div`/`DivAssign` for a
/// slash; when the grammar allows a regex at that point, the parser calls
/// [`scan_regex`](Lexer::scan_regex) to re-scan the slash as a regex literal.
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: usize,
    column: usize,
    had_space: bool,
    // Set when the last token was Div/DivAssign, for scan_regex.
    last_div: Option<(Position, bool)>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
            had_space: false,
            last_div: None,
        }
    }

    /// Whether whitespace, a comment, or a line continuation preceded the
    /// most recently scanned token. The parser uses this to tell a function
    /// call `name(` from a variable followed by a grouped expression.
    pub fn had_space(&self) -> bool {
        self.had_space
    }

    /// Scan the next token.
    pub fn scan(&mut self) -> Result<Token> {
        let tok = self.scan_inner()?;
        self.last_div = match tok.kind {
            TokenKind::Div => Some((tok.pos, false)),
            TokenKind::DivAssign => Some((tok.pos, true)),
            _ => None,
        };
        Ok(tok)
    }

    /// Re-scan the `Div` or `DivAssign` token just returned by [`scan`] as a
    /// regex literal, consuming input up to the closing slash. The token's
    /// position is rewound to the opening slash; a `DivAssign` contributes
    /// its `=` to the pattern.
    pub fn scan_regex(&mut self) -> Result<Token> {
        let Some((pos, was_assign)) = self.last_div.take() else {
            return Err(Error::lex(
                "regex scan not preceded by '/'",
                Position::new(self.line, self.column),
            ));
        };

        let mut pattern = String::new();
        if was_assign {
            pattern.push('=');
        }
        loop {
            match self.advance() {
                Some('/') => break,
                Some('\\') => {
                    // Keep every escape verbatim except \/ so the regex
                    // engine sees the original bytes.
                    match self.advance() {
                        Some('/') => pattern.push('/'),
                        Some(ch) => {
                            pattern.push('\\');
                            pattern.push(ch);
                        }
                        None => return Err(Error::lex("unterminated regex", pos)),
                    }
                }
                Some('\n') => {
                    return Err(Error::lex("newline in regex", pos));
                }
                Some(ch) => pattern.push(ch),
                None => return Err(Error::lex("unterminated regex", pos)),
            }
        }

        Ok(Token::new(TokenKind::Regex(pattern), pos))
    }

    fn scan_inner(&mut self) -> Result<Token> {
        self.skip_space()?;

        let pos = Position::new(self.line, self.column);

        let Some(ch) = self.peek() else {
            return Ok(Token::new(TokenKind::Eof, pos));
        };

        let kind = match ch {
            '\n' => {
                self.advance();
                TokenKind::Newline
            }
            '"' => return self.scan_string(pos),
            '0'..='9' => return self.scan_number(pos),
            '.' => {
                if self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
                    return self.scan_number(pos);
                }
                return Err(Error::lex("unexpected character '.'", pos));
            }
            'a'..='z' | 'A'..='Z' | '_' => return Ok(self.scan_name(pos)),
            '/' => {
                self.advance();
                self.choice('=', TokenKind::Div, TokenKind::DivAssign)
            }
            '+' => {
                self.advance();
                match self.peek() {
                    Some('+') => {
                        self.advance();
                        TokenKind::Incr
                    }
                    Some('=') => {
                        self.advance();
                        TokenKind::AddAssign
                    }
                    _ => TokenKind::Add,
                }
            }
            '-' => {
                self.advance();
                match self.peek() {
                    Some('-') => {
                        self.advance();
                        TokenKind::Decr
                    }
                    Some('=') => {
                        self.advance();
                        TokenKind::SubAssign
                    }
                    _ => TokenKind::Sub,
                }
            }
            '*' => {
                self.advance();
                match self.peek() {
                    Some('*') => {
                        // ** is an alias for ^
                        self.advance();
                        self.choice('=', TokenKind::Pow, TokenKind::PowAssign)
                    }
                    Some('=') => {
                        self.advance();
                        TokenKind::MulAssign
                    }
                    _ => TokenKind::Mul,
                }
            }
            '%' => {
                self.advance();
                self.choice('=', TokenKind::Mod, TokenKind::ModAssign)
            }
            '^' => {
                self.advance();
                self.choice('=', TokenKind::Pow, TokenKind::PowAssign)
            }
            '=' => {
                self.advance();
                self.choice('=', TokenKind::Assign, TokenKind::Equals)
            }
            '<' => {
                self.advance();
                self.choice('=', TokenKind::Less, TokenKind::Lte)
            }
            '>' => {
                self.advance();
                match self.peek() {
                    Some('=') => {
                        self.advance();
                        TokenKind::Gte
                    }
                    Some('>') => {
                        self.advance();
                        TokenKind::Append
                    }
                    _ => TokenKind::Greater,
                }
            }
            '!' => {
                self.advance();
                match self.peek() {
                    Some('=') => {
                        self.advance();
                        TokenKind::NotEquals
                    }
                    Some('~') => {
                        self.advance();
                        TokenKind::NotMatch
                    }
                    _ => TokenKind::Not,
                }
            }
            '~' => {
                self.advance();
                TokenKind::Match
            }
            '&' => {
                self.advance();
                if self.peek() == Some('&') {
                    self.advance();
                    TokenKind::And
                } else {
                    return Err(Error::lex("unexpected '&', expected '&&'", pos));
                }
            }
            '|' => {
                self.advance();
                if self.peek() == Some('|') {
                    self.advance();
                    TokenKind::Or
                } else {
                    TokenKind::Pipe
                }
            }
            '$' => {
                self.advance();
                TokenKind::Dollar
            }
            '?' => {
                self.advance();
                TokenKind::Question
            }
            ':' => {
                self.advance();
                TokenKind::Colon
            }
            '{' => {
                self.advance();
                TokenKind::Lbrace
            }
            '}' => {
                self.advance();
                TokenKind::Rbrace
            }
            '[' => {
                self.advance();
                TokenKind::Lbracket
            }
            ']' => {
                self.advance();
                TokenKind::Rbracket
            }
            '(' => {
                self.advance();
                TokenKind::Lparen
            }
            ')' => {
                self.advance();
                TokenKind::Rparen
            }
            ';' => {
                self.advance();
                TokenKind::Semicolon
            }
            ',' => {
                self.advance();
                TokenKind::Comma
            }
            other => {
                return Err(Error::lex(format!("unexpected character {:?}", other), pos));
            }
        };

        Ok(Token::new(kind, pos))
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn peek_second(&self) -> Option<char> {
        let mut it = self.chars.clone();
        it.next();
        it.next().map(|(_, c)| c)
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.chars.next().map(|(_, c)| c)?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn choice(&mut self, second: char, plain: TokenKind, combined: TokenKind) -> TokenKind {
        if self.peek() == Some(second) {
            self.advance();
            combined
        } else {
            plain
        }
    }

    /// Skip spaces, tabs, carriage returns, comments, and `\`-newline line
    /// continuations. Newlines themselves are tokens.
    fn skip_space(&mut self) -> Result<()> {
        self.had_space = false;
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.advance();
                    self.had_space = true;
                }
                Some('\\') => {
                    match self.peek_second() {
                        Some('\n') => {
                            self.advance();
                            self.advance();
                            self.had_space = true;
                        }
                        Some('\r') => {
                            let pos = Position::new(self.line, self.column);
                            self.advance();
                            self.advance();
                            if self.peek() == Some('\n') {
                                self.advance();
                                self.had_space = true;
                            } else {
                                return Err(Error::lex(
                                    "expected newline after line continuation",
                                    pos,
                                ));
                            }
                        }
                        _ => {
                            return Err(Error::lex(
                                "expected newline after line continuation",
                                Position::new(self.line, self.column),
                            ));
                        }
                    }
                }
                Some('#') => {
                    self.had_space = true;
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan_string(&mut self, pos: Position) -> Result<Token> {
        self.advance(); // opening quote
        let mut value = String::new();

        loop {
            match self.advance() {
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('n') => value.push('\n'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    // Any other escape is the escaped character itself.
                    Some(ch) => value.push(ch),
                    None => return Err(Error::lex("unterminated string", pos)),
                },
                Some('\n') => return Err(Error::lex("newline in string", pos)),
                Some(ch) => value.push(ch),
                None => return Err(Error::lex("unterminated string", pos)),
            }
        }

        Ok(Token::new(TokenKind::Str(value), pos))
    }

    fn scan_number(&mut self, pos: Position) -> Result<Token> {
        let mut text = String::new();

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if self.peek() == Some('.') {
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }

        // Consume an exponent only when digits actually follow it, so that
        // "1e" lexes as the number 1 and the name "e".
        if matches!(self.peek(), Some('e' | 'E')) {
            let exponent_ok = match self.peek_second() {
                Some(c) if c.is_ascii_digit() => true,
                Some('+' | '-') => {
                    let mut it = self.chars.clone();
                    it.next();
                    it.next();
                    it.next().is_some_and(|(_, c)| c.is_ascii_digit())
                }
                _ => false,
            };
            if exponent_ok {
                text.push(self.advance().unwrap());
                if matches!(self.peek(), Some('+' | '-')) {
                    text.push(self.advance().unwrap());
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        let value: f64 = text
            .parse()
            .map_err(|_| Error::lex(format!("invalid number '{}'", text), pos))?;

        Ok(Token::new(TokenKind::Number(value), pos))
    }

    fn scan_name(&mut self, pos: Position) -> Token {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = keyword_token(&name).unwrap_or(TokenKind::Name(name));
        Token::new(kind, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut kinds = Vec::new();
        loop {
            let tok = lexer.scan().unwrap();
            let eof = tok.kind == TokenKind::Eof;
            kinds.push(tok.kind);
            if eof {
                break;
            }
        }
        kinds
    }

    #[test]
    fn operators() {
        let kinds = scan_all("x + y - z * w / v % u ^ t");
        assert_eq!(kinds[1], TokenKind::Add);
        assert_eq!(kinds[3], TokenKind::Sub);
        assert_eq!(kinds[5], TokenKind::Mul);
        assert_eq!(kinds[7], TokenKind::Div);
        assert_eq!(kinds[9], TokenKind::Mod);
        assert_eq!(kinds[11], TokenKind::Pow);
    }

    #[test]
    fn star_star_is_pow() {
        let kinds = scan_all("a ** b **= c");
        assert_eq!(kinds[1], TokenKind::Pow);
        assert_eq!(kinds[3], TokenKind::PowAssign);
    }

    #[test]
    fn keywords_and_builtins() {
        let kinds = scan_all("BEGIN END while getline length foo");
        assert_eq!(kinds[0], TokenKind::Begin);
        assert_eq!(kinds[1], TokenKind::End);
        assert_eq!(kinds[2], TokenKind::While);
        assert_eq!(kinds[3], TokenKind::Getline);
        assert_eq!(kinds[4], TokenKind::Func(Builtin::Length));
        assert_eq!(kinds[5], TokenKind::Name("foo".to_string()));
    }

    #[test]
    fn numbers() {
        let kinds = scan_all("42 3.14 .5 1e10 2.5e-3 1e");
        assert_eq!(kinds[0], TokenKind::Number(42.0));
        assert_eq!(kinds[1], TokenKind::Number(3.14));
        assert_eq!(kinds[2], TokenKind::Number(0.5));
        assert_eq!(kinds[3], TokenKind::Number(1e10));
        assert_eq!(kinds[4], TokenKind::Number(2.5e-3));
        // "1e" without exponent digits is the number 1 and the name e
        assert_eq!(kinds[5], TokenKind::Number(1.0));
        assert_eq!(kinds[6], TokenKind::Name("e".to_string()));
    }

    #[test]
    fn strings() {
        let kinds = scan_all(r#""hello" "a\tb\n" "q\zq""#);
        assert_eq!(kinds[0], TokenKind::Str("hello".to_string()));
        assert_eq!(kinds[1], TokenKind::Str("a\tb\n".to_string()));
        // Unknown escapes keep the escaped character
        assert_eq!(kinds[2], TokenKind::Str("qzq".to_string()));
    }

    #[test]
    fn slash_is_division_until_rescanned() {
        let mut lexer = Lexer::new("/foo\\/bar/");
        let tok = lexer.scan().unwrap();
        assert_eq!(tok.kind, TokenKind::Div);
        let re = lexer.scan_regex().unwrap();
        assert_eq!(re.kind, TokenKind::Regex("foo/bar".to_string()));
        assert_eq!(re.pos.column, 1);
    }

    #[test]
    fn regex_keeps_other_escapes_verbatim() {
        let mut lexer = Lexer::new("/a\\.b\\d/");
        lexer.scan().unwrap();
        let re = lexer.scan_regex().unwrap();
        assert_eq!(re.kind, TokenKind::Regex("a\\.b\\d".to_string()));
    }

    #[test]
    fn div_assign_rescans_with_equals() {
        let mut lexer = Lexer::new("/=foo/");
        let tok = lexer.scan().unwrap();
        assert_eq!(tok.kind, TokenKind::DivAssign);
        let re = lexer.scan_regex().unwrap();
        assert_eq!(re.kind, TokenKind::Regex("=foo".to_string()));
    }

    #[test]
    fn had_space_tracking() {
        let mut lexer = Lexer::new("f(x) g (y)");
        assert_eq!(lexer.scan().unwrap().kind, TokenKind::Name("f".to_string()));
        assert_eq!(lexer.scan().unwrap().kind, TokenKind::Lparen);
        assert!(!lexer.had_space());
        lexer.scan().unwrap(); // x
        lexer.scan().unwrap(); // )
        lexer.scan().unwrap(); // g
        assert_eq!(lexer.scan().unwrap().kind, TokenKind::Lparen);
        assert!(lexer.had_space());
    }

    #[test]
    fn comments_and_continuations() {
        let kinds = scan_all("a # comment\nb \\\nc");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Name("a".to_string()),
                TokenKind::Newline,
                TokenKind::Name("b".to_string()),
                TokenKind::Name("c".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn line_and_column_positions() {
        let mut lexer = Lexer::new("a\n  bb");
        let a = lexer.scan().unwrap();
        assert_eq!((a.pos.line, a.pos.column), (1, 1));
        lexer.scan().unwrap(); // newline
        let b = lexer.scan().unwrap();
        assert_eq!((b.pos.line, b.pos.column), (2, 3));
    }

    #[test]
    fn lex_errors() {
        assert!(Lexer::new("\"abc").scan().is_err());
        assert!(Lexer::new("\"ab\ncd\"").scan().is_err());
        assert!(Lexer::new("a & b").scan_all_err());
        assert!(Lexer::new("@").scan().is_err());
        let mut lexer = Lexer::new("/ab\ncd/");
        lexer.scan().unwrap();
        assert!(lexer.scan_regex().is_err());
    }

    impl<'a> Lexer<'a> {
        fn scan_all_err(&mut self) -> bool {
            loop {
                match self.scan() {
                    Err(_) => return true,
                    Ok(t) if t.kind == TokenKind::Eof => return false,
                    Ok(_) => {}
                }
            }
        }
    }
}
