use std::collections::HashMap;

use crate::ast::*;
use crate::error::{Error, Position, Result};
use crate::lexer::{Builtin, Lexer, Token, TokenKind};

/// Parse AWK source into a [`Program`].
pub fn parse_program(source: &str) -> Result<Program> {
    Parser::new(Lexer::new(source))?.parse()
}

/// Scalar/array kind of a name, resolved during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Unknown,
    Scalar,
    Array,
}

/// Which kind of action body the parser is inside, for `next`/`return`
/// placement checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    Main,
    Begin,
    End,
    Func,
}

/// A bare variable read, recorded during the parse and applied as a scalar
/// use in the finalize pass (reads that turn out to be function-call or
/// `length` arguments stay polymorphic and are removed again).
struct ScalarUse {
    name: String,
    in_func: Option<usize>,
    pos: Position,
}

enum ArgShape {
    Var(String),
    Other,
}

/// A user-function call site, checked and kind-unified in the finalize pass.
struct CallSite {
    name: String,
    shapes: Vec<ArgShape>,
    in_func: Option<usize>,
    pos: Position,
}

/// Recursive-descent parser over a streaming [`Lexer`].
///
/// The parser drives the lexer's regex context: whenever an expression may
/// start and the pending token is `/` or `/=`, it re-scans the token as a
/// regex literal.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    cur: Token,
    cur_space: bool,
    paren_depth: usize,
    /// Paren depth at entry to a print/printf expression list; `>` and `>>`
    /// at that depth belong to the redirection, not to a comparison.
    print_depth: Option<usize>,
    loop_depth: usize,
    ctx: Ctx,

    globals: HashMap<String, Kind>,
    funcs: HashMap<String, usize>,
    functions: Vec<Function>,
    func_kinds: Vec<Vec<Kind>>,
    cur_func: Option<usize>,
    scalar_uses: Vec<ScalarUse>,
    call_sites: Vec<CallSite>,

    rules: Vec<Rule>,
}

const SPECIAL_SCALARS: &[&str] = &[
    "FS", "OFS", "ORS", "RS", "NR", "NF", "FNR", "FILENAME", "SUBSEP", "CONVFMT", "OFMT",
    "RSTART", "RLENGTH", "ARGC",
];

impl<'a> Parser<'a> {
    pub fn new(mut lexer: Lexer<'a>) -> Result<Self> {
        let cur = lexer.scan()?;
        let cur_space = lexer.had_space();
        let mut globals = HashMap::new();
        for name in SPECIAL_SCALARS {
            globals.insert(name.to_string(), Kind::Scalar);
        }
        globals.insert("ENVIRON".to_string(), Kind::Array);
        globals.insert("ARGV".to_string(), Kind::Array);

        Ok(Self {
            lexer,
            cur,
            cur_space,
            paren_depth: 0,
            print_depth: None,
            loop_depth: 0,
            ctx: Ctx::Main,
            globals,
            funcs: HashMap::new(),
            functions: Vec::new(),
            func_kinds: Vec::new(),
            cur_func: None,
            scalar_uses: Vec::new(),
            call_sites: Vec::new(),
            rules: Vec::new(),
        })
    }

    /// Parse the whole program.
    pub fn parse(mut self) -> Result<Program> {
        self.skip_terminators()?;
        while self.cur.kind != TokenKind::Eof {
            if self.cur.kind == TokenKind::Function {
                self.parse_function()?;
            } else {
                let rule = self.parse_rule()?;
                self.rules.push(rule);
            }
            self.skip_terminators()?;
        }
        self.finalize()?;
        Ok(Program {
            rules: self.rules,
            functions: self.functions,
        })
    }

    // ===== Rules and functions =====

    fn parse_rule(&mut self) -> Result<Rule> {
        let pos = self.cur.pos;
        match self.cur.kind {
            TokenKind::Begin => {
                self.advance()?;
                self.skip_newlines()?;
                self.ctx = Ctx::Begin;
                let action = self.parse_block()?;
                self.ctx = Ctx::Main;
                Ok(Rule {
                    pattern: Pattern::Begin,
                    action: Some(action),
                    pos,
                })
            }
            TokenKind::End => {
                self.advance()?;
                self.skip_newlines()?;
                self.ctx = Ctx::End;
                let action = self.parse_block()?;
                self.ctx = Ctx::Main;
                Ok(Rule {
                    pattern: Pattern::End,
                    action: Some(action),
                    pos,
                })
            }
            TokenKind::Lbrace => {
                let action = self.parse_block()?;
                Ok(Rule {
                    pattern: Pattern::Always,
                    action: Some(action),
                    pos,
                })
            }
            _ => {
                let start = self.parse_expr()?;
                let pattern = if self.cur.kind == TokenKind::Comma {
                    self.advance()?;
                    self.skip_newlines()?;
                    let end = self.parse_expr()?;
                    Pattern::Range(start, end)
                } else {
                    Pattern::Expr(start)
                };
                // The action must open on the same logical line; otherwise
                // this is a pattern-only rule with the default print.
                let action = if self.cur.kind == TokenKind::Lbrace {
                    Some(self.parse_block()?)
                } else {
                    None
                };
                Ok(Rule {
                    pattern,
                    action,
                    pos,
                })
            }
        }
    }

    fn parse_function(&mut self) -> Result<()> {
        let pos = self.cur.pos;
        self.advance()?; // function
        let name = match &self.cur.kind {
            TokenKind::Name(n) => n.clone(),
            TokenKind::Func(b) => {
                return Err(self.err(format!("can't redefine built-in '{}'", b.name())));
            }
            other => {
                return Err(self.err(format!("expected function name, found {}", other.describe())));
            }
        };
        if self.funcs.contains_key(&name) {
            return Err(Error::parse(format!("function '{}' already defined", name), pos));
        }
        if self.globals.get(&name).is_some_and(|k| *k != Kind::Unknown) {
            return Err(Error::parse(
                format!("'{}' is already used as a variable", name),
                pos,
            ));
        }
        self.advance()?;

        self.expect(TokenKind::Lparen)?;
        let mut params = Vec::new();
        while self.cur.kind != TokenKind::Rparen {
            let (param, ppos) = self.expect_name()?;
            if params.contains(&param) {
                return Err(Error::parse(format!("duplicate parameter '{}'", param), ppos));
            }
            params.push(param);
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::Rparen)?;
        self.skip_newlines()?;

        let idx = self.functions.len();
        self.funcs.insert(name.clone(), idx);
        self.func_kinds.push(vec![Kind::Unknown; params.len()]);
        self.functions.push(Function {
            name,
            params,
            array_params: Vec::new(),
            body: Vec::new(),
            pos,
        });

        self.cur_func = Some(idx);
        self.ctx = Ctx::Func;
        let body = self.parse_block()?;
        self.ctx = Ctx::Main;
        self.cur_func = None;
        self.functions[idx].body = body;
        Ok(())
    }

    // ===== Statements =====

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(TokenKind::Lbrace)?;
        self.skip_terminators()?;
        let mut stmts = Vec::new();
        while self.cur.kind != TokenKind::Rbrace && self.cur.kind != TokenKind::Eof {
            stmts.push(self.parse_stmt()?);
            self.skip_terminators()?;
        }
        self.expect(TokenKind::Rbrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.cur.kind {
            TokenKind::Semicolon => {
                self.advance()?;
                Ok(Stmt::Block(Vec::new()))
            }
            TokenKind::Lbrace => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Do => self.parse_do_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Break => {
                if self.loop_depth == 0 {
                    return Err(self.err("break outside a loop"));
                }
                self.advance()?;
                Ok(Stmt::Break)
            }
            TokenKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.err("continue outside a loop"));
                }
                self.advance()?;
                Ok(Stmt::Continue)
            }
            TokenKind::Next => {
                if matches!(self.ctx, Ctx::Begin | Ctx::End) {
                    return Err(self.err("next can't be used inside BEGIN or END"));
                }
                self.advance()?;
                Ok(Stmt::Next)
            }
            TokenKind::NextFile => {
                if matches!(self.ctx, Ctx::Begin | Ctx::End) {
                    return Err(self.err("nextfile can't be used inside BEGIN or END"));
                }
                self.advance()?;
                Ok(Stmt::NextFile)
            }
            TokenKind::Exit => {
                self.advance()?;
                let code = if self.can_start_expr() {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                Ok(Stmt::Exit(code))
            }
            TokenKind::Return => {
                if self.ctx != Ctx::Func {
                    return Err(self.err("return outside a function"));
                }
                self.advance()?;
                let value = if self.can_start_expr() {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                Ok(Stmt::Return(value))
            }
            TokenKind::Delete => {
                self.advance()?;
                let (array, apos) = self.expect_name()?;
                self.mark(&array, Kind::Array, apos)?;
                let mut index = Vec::new();
                if self.cur.kind == TokenKind::Lbracket {
                    self.advance()?;
                    index.push(self.parse_expr()?);
                    while self.cur.kind == TokenKind::Comma {
                        self.advance()?;
                        index.push(self.parse_expr()?);
                    }
                    self.expect(TokenKind::Rbracket)?;
                }
                Ok(Stmt::Delete { array, index })
            }
            TokenKind::Print => self.parse_print(false),
            TokenKind::Printf => self.parse_print(true),
            _ => Ok(Stmt::Expr(self.parse_expr()?)),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.advance()?; // if
        self.expect(TokenKind::Lparen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Rparen)?;
        self.skip_newlines()?;
        let then_stmt = Box::new(self.parse_stmt()?);
        self.skip_terminators()?;
        let else_stmt = if self.cur.kind == TokenKind::Else {
            self.advance()?;
            self.skip_newlines()?;
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_stmt,
            else_stmt,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        self.advance()?; // while
        self.expect(TokenKind::Lparen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Rparen)?;
        self.skip_newlines()?;
        let body = Box::new(self.parse_loop_body()?);
        Ok(Stmt::While { cond, body })
    }

    fn parse_do_while(&mut self) -> Result<Stmt> {
        self.advance()?; // do
        self.skip_newlines()?;
        let body = Box::new(self.parse_loop_body()?);
        self.skip_terminators()?;
        self.expect(TokenKind::While)?;
        self.expect(TokenKind::Lparen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Rparen)?;
        Ok(Stmt::DoWhile { body, cond })
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        self.advance()?; // for
        self.expect(TokenKind::Lparen)?;

        let init = if self.cur.kind == TokenKind::Semicolon {
            self.advance()?;
            None
        } else {
            let pos = self.cur.pos;
            let init_expr = self.parse_expr()?;
            if self.cur.kind == TokenKind::Rparen {
                // for (key in array)
                if let Expr::In { index, array } = init_expr {
                    let var = match index.as_slice() {
                        [Expr::Var(v)] => v.clone(),
                        _ => {
                            return Err(Error::parse("for-in needs a single variable", pos));
                        }
                    };
                    self.advance()?; // )
                    self.skip_newlines()?;
                    let body = Box::new(self.parse_loop_body()?);
                    return Ok(Stmt::ForIn { var, array, body });
                }
                return Err(self.err("expected ';' in for"));
            }
            self.expect(TokenKind::Semicolon)?;
            Some(Box::new(Stmt::Expr(init_expr)))
        };

        let cond = if self.cur.kind != TokenKind::Semicolon {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon)?;

        let step = if self.cur.kind != TokenKind::Rparen {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Rparen)?;
        self.skip_newlines()?;

        let body = Box::new(self.parse_loop_body()?);
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn parse_loop_body(&mut self) -> Result<Stmt> {
        self.loop_depth += 1;
        let body = self.parse_stmt();
        self.loop_depth -= 1;
        body
    }

    fn parse_print(&mut self, printf: bool) -> Result<Stmt> {
        let pos = self.cur.pos;
        self.advance()?; // print / printf

        let saved = self.print_depth;
        self.print_depth = Some(self.paren_depth);
        let mut args = Vec::new();
        if self.can_start_expr() {
            args.push(self.parse_expr()?);
            while self.cur.kind == TokenKind::Comma {
                self.advance()?;
                self.skip_newlines()?;
                args.push(self.parse_expr()?);
            }
        }
        self.print_depth = saved;

        if printf && args.is_empty() {
            return Err(Error::parse("printf requires a format argument", pos));
        }

        let redirect = match self.cur.kind {
            TokenKind::Greater => {
                self.advance()?;
                Some(Redirect::File(self.parse_concat()?))
            }
            TokenKind::Append => {
                self.advance()?;
                Some(Redirect::Append(self.parse_concat()?))
            }
            TokenKind::Pipe => {
                self.advance()?;
                Some(Redirect::Pipe(self.parse_concat()?))
            }
            _ => None,
        };

        if printf {
            Ok(Stmt::Printf { args, redirect })
        } else {
            Ok(Stmt::Print { args, redirect })
        }
    }

    // ===== Expressions =====
    //
    // Precedence, loosest to tightest: assignment, ?:, ||, &&, in, ~ !~,
    // comparison (and `| getline`), concatenation, + -, * / %, unary ! - +,
    // ^ (right-assoc), ++ --, $, primary.

    fn parse_expr(&mut self) -> Result<Expr> {
        let target = self.parse_ternary()?;

        let op = match self.cur.kind {
            TokenKind::Assign => None,
            TokenKind::AddAssign => Some(BinaryOp::Add),
            TokenKind::SubAssign => Some(BinaryOp::Sub),
            TokenKind::MulAssign => Some(BinaryOp::Mul),
            TokenKind::DivAssign => Some(BinaryOp::Div),
            TokenKind::ModAssign => Some(BinaryOp::Mod),
            TokenKind::PowAssign => Some(BinaryOp::Pow),
            _ => return Ok(target),
        };

        if !target.is_lvalue() {
            return Err(self.err("assignment to non-lvalue"));
        }
        if let Expr::Var(name) = &target {
            let name = name.clone();
            self.mark(&name, Kind::Scalar, self.cur.pos)?;
        }
        self.advance()?;
        let value = self.parse_expr()?;
        Ok(Expr::Assign {
            target: Box::new(target),
            op,
            value: Box::new(value),
        })
    }

    fn parse_ternary(&mut self) -> Result<Expr> {
        let cond = self.parse_or()?;
        if self.cur.kind != TokenKind::Question {
            return Ok(cond);
        }
        self.advance()?;
        self.skip_newlines()?;
        let yes = self.parse_ternary()?;
        self.expect(TokenKind::Colon)?;
        self.skip_newlines()?;
        let no = self.parse_ternary()?;
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            yes: Box::new(yes),
            no: Box::new(no),
        })
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut expr = self.parse_and()?;
        while self.cur.kind == TokenKind::Or {
            self.advance()?;
            self.skip_newlines()?;
            let right = self.parse_and()?;
            expr = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut expr = self.parse_in()?;
        while self.cur.kind == TokenKind::And {
            self.advance()?;
            self.skip_newlines()?;
            let right = self.parse_in()?;
            expr = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_in(&mut self) -> Result<Expr> {
        let mut expr = self.parse_match()?;
        while self.cur.kind == TokenKind::In {
            self.advance()?;
            let (array, apos) = self.expect_name()?;
            self.mark(&array, Kind::Array, apos)?;
            expr = Expr::In {
                index: vec![expr],
                array,
            };
        }
        Ok(expr)
    }

    fn parse_match(&mut self) -> Result<Expr> {
        let mut expr = self.parse_compare()?;
        loop {
            let negated = match self.cur.kind {
                TokenKind::Match => false,
                TokenKind::NotMatch => true,
                _ => break,
            };
            self.advance()?;
            let pattern = self.parse_compare()?;
            expr = Expr::MatchRe {
                negated,
                text: Box::new(expr),
                pattern: Box::new(pattern),
            };
        }
        Ok(expr)
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let mut expr = self.parse_concat()?;
        loop {
            let at_print_level = self.print_depth == Some(self.paren_depth);
            let op = match self.cur.kind {
                TokenKind::Less => BinaryOp::Lt,
                TokenKind::Lte => BinaryOp::Le,
                TokenKind::Gte => BinaryOp::Ge,
                TokenKind::Equals => BinaryOp::Eq,
                TokenKind::NotEquals => BinaryOp::Ne,
                TokenKind::Greater if !at_print_level => BinaryOp::Gt,
                TokenKind::Pipe if !at_print_level => {
                    // cmd | getline [lvalue]
                    self.advance()?;
                    if self.cur.kind != TokenKind::Getline {
                        return Err(self.err("expected getline after '|'"));
                    }
                    self.advance()?;
                    let target = self.parse_getline_target()?;
                    expr = Expr::Getline {
                        source: GetlineSource::Cmd(Box::new(expr)),
                        target: target.map(Box::new),
                    };
                    continue;
                }
                _ => break,
            };
            self.advance()?;
            let right = self.parse_concat()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_concat(&mut self) -> Result<Expr> {
        let mut expr = self.parse_add()?;
        while self.starts_concat_operand() {
            let right = self.parse_add()?;
            expr = Expr::Binary {
                op: BinaryOp::Concat,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn starts_concat_operand(&self) -> bool {
        matches!(
            self.cur.kind,
            TokenKind::Number(_)
                | TokenKind::Str(_)
                | TokenKind::Name(_)
                | TokenKind::Func(_)
                | TokenKind::Dollar
                | TokenKind::Lparen
                | TokenKind::Not
                | TokenKind::Incr
                | TokenKind::Decr
        )
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut expr = self.parse_mul()?;
        loop {
            let (op, wrap) = match self.cur.kind {
                TokenKind::Add => (BinaryOp::Add, None),
                TokenKind::Sub => (BinaryOp::Sub, None),
                // `5++6` is 5 + (+6) when the left side is not an lvalue
                TokenKind::Incr => (BinaryOp::Add, Some(UnaryOp::Pos)),
                TokenKind::Decr => (BinaryOp::Sub, Some(UnaryOp::Neg)),
                _ => break,
            };
            self.advance()?;
            let mut right = self.parse_mul()?;
            if let Some(u) = wrap {
                right = Expr::Unary {
                    op: u,
                    expr: Box::new(right),
                };
            }
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.cur.kind {
                TokenKind::Mul => BinaryOp::Mul,
                TokenKind::Div => BinaryOp::Div,
                TokenKind::Mod => BinaryOp::Mod,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.regex_here()?;
        let op = match self.cur.kind {
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Sub => UnaryOp::Neg,
            TokenKind::Add => UnaryOp::Pos,
            _ => return self.parse_pow(),
        };
        self.advance()?;
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_pow(&mut self) -> Result<Expr> {
        let expr = self.parse_preincr()?;
        if self.cur.kind == TokenKind::Pow {
            self.advance()?;
            // Right-associative; the right side may itself be unary (2^-3).
            let right = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                left: Box::new(expr),
                right: Box::new(right),
            });
        }
        Ok(expr)
    }

    fn parse_preincr(&mut self) -> Result<Expr> {
        let up = match self.cur.kind {
            TokenKind::Incr => true,
            TokenKind::Decr => false,
            _ => return self.parse_postfix(),
        };
        let pos = self.cur.pos;
        self.advance()?;
        let target = self.parse_preincr()?;
        if !target.is_lvalue() {
            return Err(Error::parse(
                format!("'{}' requires an lvalue", if up { "++" } else { "--" }),
                pos,
            ));
        }
        if let Expr::Var(name) = &target {
            let name = name.clone();
            self.mark(&name, Kind::Scalar, pos)?;
        }
        Ok(Expr::IncrDecr {
            pre: true,
            up,
            target: Box::new(target),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_field()?;
        loop {
            let up = match self.cur.kind {
                TokenKind::Incr => true,
                TokenKind::Decr => false,
                _ => break,
            };
            if !expr.is_lvalue() {
                break;
            }
            if let Expr::Var(name) = &expr {
                let name = name.clone();
                self.mark(&name, Kind::Scalar, self.cur.pos)?;
            }
            self.advance()?;
            expr = Expr::IncrDecr {
                pre: false,
                up,
                target: Box::new(expr),
            };
        }
        Ok(expr)
    }

    fn parse_field(&mut self) -> Result<Expr> {
        match self.cur.kind {
            TokenKind::Dollar => {
                self.advance()?;
                let operand = self.parse_field()?;
                Ok(Expr::Field(Box::new(operand)))
            }
            TokenKind::Incr | TokenKind::Decr => self.parse_preincr(),
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.cur.kind.clone() {
            TokenKind::Number(n) => {
                self.advance()?;
                Ok(Expr::Num(n))
            }
            TokenKind::Str(s) => {
                self.advance()?;
                Ok(Expr::Str(s))
            }
            TokenKind::Regex(r) => {
                self.advance()?;
                Ok(Expr::Regex(r))
            }
            TokenKind::Name(name) => {
                let pos = self.cur.pos;
                self.advance()?;
                if self.cur.kind == TokenKind::Lbracket {
                    self.mark(&name, Kind::Array, pos)?;
                    self.advance()?;
                    let mut index = vec![self.parse_expr()?];
                    while self.cur.kind == TokenKind::Comma {
                        self.advance()?;
                        index.push(self.parse_expr()?);
                    }
                    self.expect(TokenKind::Rbracket)?;
                    Ok(Expr::Index { array: name, index })
                } else if self.cur.kind == TokenKind::Lparen && !self.cur_space {
                    // A call: POSIX forbids space before '(' here.
                    self.parse_call(name, pos)
                } else {
                    self.scalar_uses.push(ScalarUse {
                        name: name.clone(),
                        in_func: self.cur_func,
                        pos,
                    });
                    Ok(Expr::Var(name))
                }
            }
            TokenKind::Func(b) => self.parse_builtin(b),
            TokenKind::Getline => {
                self.advance()?;
                let target = self.parse_getline_target()?;
                let source = if self.cur.kind == TokenKind::Less {
                    self.advance()?;
                    GetlineSource::File(Box::new(self.parse_field()?))
                } else {
                    GetlineSource::Main
                };
                Ok(Expr::Getline {
                    source,
                    target: target.map(Box::new),
                })
            }
            TokenKind::Lparen => {
                self.advance()?;
                let first = self.parse_expr()?;
                if self.cur.kind == TokenKind::Comma {
                    // (i, j) in arr
                    let mut index = vec![first];
                    while self.cur.kind == TokenKind::Comma {
                        self.advance()?;
                        index.push(self.parse_expr()?);
                    }
                    self.expect(TokenKind::Rparen)?;
                    if self.cur.kind != TokenKind::In {
                        return Err(self.err("expected 'in' after (expr, ...)"));
                    }
                    self.advance()?;
                    let (array, apos) = self.expect_name()?;
                    self.mark(&array, Kind::Array, apos)?;
                    return Ok(Expr::In { index, array });
                }
                self.expect(TokenKind::Rparen)?;
                Ok(Expr::Group(Box::new(first)))
            }
            other => Err(self.err(format!("unexpected {}", other.describe()))),
        }
    }

    fn parse_call(&mut self, name: String, pos: Position) -> Result<Expr> {
        self.advance()?; // (
        let mut args = Vec::new();
        let mut shapes = Vec::new();
        if self.cur.kind != TokenKind::Rparen {
            loop {
                let (arg, shape) = self.parse_polymorphic_arg()?;
                args.push(arg);
                shapes.push(shape);
                if self.cur.kind == TokenKind::Comma {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::Rparen)?;
        self.call_sites.push(CallSite {
            name: name.clone(),
            shapes,
            in_func: self.cur_func,
            pos,
        });
        Ok(Expr::Call { name, args })
    }

    /// Parse an argument whose scalar/array kind is decided by the callee:
    /// a bare variable stays unmarked and its shape is reported for the
    /// finalize pass.
    fn parse_polymorphic_arg(&mut self) -> Result<(Expr, ArgShape)> {
        let before = self.scalar_uses.len();
        let arg = self.parse_expr()?;
        let shape = match &arg {
            Expr::Var(name) => {
                if self.scalar_uses.len() == before + 1
                    && self.scalar_uses.last().is_some_and(|u| u.name == *name)
                {
                    self.scalar_uses.pop();
                }
                ArgShape::Var(name.clone())
            }
            _ => ArgShape::Other,
        };
        Ok((arg, shape))
    }

    fn parse_builtin(&mut self, func: Builtin) -> Result<Expr> {
        let pos = self.cur.pos;
        self.advance()?;

        // `length` may be written without parentheses.
        if func == Builtin::Length && self.cur.kind != TokenKind::Lparen {
            return Ok(Expr::BuiltinCall {
                func,
                args: Vec::new(),
            });
        }

        self.expect(TokenKind::Lparen)?;
        let mut args = Vec::new();
        match func {
            Builtin::Split => {
                args.push(self.parse_expr()?);
                self.expect(TokenKind::Comma)?;
                let (array, apos) = self.expect_name()?;
                self.mark(&array, Kind::Array, apos)?;
                args.push(Expr::Var(array));
                if self.cur.kind == TokenKind::Comma {
                    self.advance()?;
                    args.push(self.parse_expr()?);
                }
            }
            Builtin::Sub | Builtin::Gsub => {
                args.push(self.parse_expr()?);
                self.expect(TokenKind::Comma)?;
                args.push(self.parse_expr()?);
                if self.cur.kind == TokenKind::Comma {
                    let tpos = self.cur.pos;
                    self.advance()?;
                    let target = self.parse_expr()?;
                    if !target.is_lvalue() {
                        return Err(Error::parse(
                            format!("{} target must be an lvalue", func.name()),
                            tpos,
                        ));
                    }
                    if let Expr::Var(name) = &target {
                        let name = name.clone();
                        self.mark(&name, Kind::Scalar, tpos)?;
                    }
                    args.push(target);
                }
            }
            Builtin::Length => {
                if self.cur.kind != TokenKind::Rparen {
                    let (arg, _shape) = self.parse_polymorphic_arg()?;
                    args.push(arg);
                }
            }
            _ => {
                if self.cur.kind != TokenKind::Rparen {
                    args.push(self.parse_expr()?);
                    while self.cur.kind == TokenKind::Comma {
                        self.advance()?;
                        args.push(self.parse_expr()?);
                    }
                }
            }
        }
        self.expect(TokenKind::Rparen)?;

        let (min, max) = func.arity();
        if args.len() < min || args.len() > max {
            return Err(Error::parse(
                format!("wrong number of arguments to {}()", func.name()),
                pos,
            ));
        }
        Ok(Expr::BuiltinCall { func, args })
    }

    /// Optional lvalue following `getline`.
    fn parse_getline_target(&mut self) -> Result<Option<Expr>> {
        match self.cur.kind.clone() {
            TokenKind::Name(name) => {
                let pos = self.cur.pos;
                self.advance()?;
                if self.cur.kind == TokenKind::Lbracket {
                    self.mark(&name, Kind::Array, pos)?;
                    self.advance()?;
                    let mut index = vec![self.parse_expr()?];
                    while self.cur.kind == TokenKind::Comma {
                        self.advance()?;
                        index.push(self.parse_expr()?);
                    }
                    self.expect(TokenKind::Rbracket)?;
                    Ok(Some(Expr::Index { array: name, index }))
                } else if self.cur.kind == TokenKind::Lparen && !self.cur_space {
                    Err(self.err("unexpected '(' after getline"))
                } else {
                    self.mark(&name, Kind::Scalar, pos)?;
                    Ok(Some(Expr::Var(name)))
                }
            }
            TokenKind::Dollar => {
                let field = self.parse_field()?;
                Ok(Some(field))
            }
            _ => Ok(None),
        }
    }

    // ===== Name kind tracking =====

    fn mark(&mut self, name: &str, kind: Kind, pos: Position) -> Result<()> {
        self.mark_in(name, kind, self.cur_func, pos)
    }

    fn mark_in(
        &mut self,
        name: &str,
        kind: Kind,
        in_func: Option<usize>,
        pos: Position,
    ) -> Result<()> {
        if let Some(fi) = in_func {
            if let Some(pi) = self.functions[fi].params.iter().position(|p| p == name) {
                return unify(&mut self.func_kinds[fi][pi], kind, name, pos);
            }
        }
        if self.funcs.contains_key(name) {
            return Err(Error::parse(
                format!("can't use function '{}' as a variable", name),
                pos,
            ));
        }
        let slot = self.globals.entry(name.to_string()).or_insert(Kind::Unknown);
        unify(slot, kind, name, pos)
    }

    fn kind_of(&self, name: &str, in_func: Option<usize>) -> Kind {
        if let Some(fi) = in_func {
            if let Some(pi) = self.functions[fi].params.iter().position(|p| p == name) {
                return self.func_kinds[fi][pi];
            }
        }
        self.globals.get(name).copied().unwrap_or(Kind::Unknown)
    }

    /// Resolve deferred scalar uses and unify call-site argument kinds with
    /// callee parameter kinds.
    fn finalize(&mut self) -> Result<()> {
        let uses = std::mem::take(&mut self.scalar_uses);
        for u in uses {
            self.mark_in(&u.name, Kind::Scalar, u.in_func, u.pos)?;
        }

        let sites = std::mem::take(&mut self.call_sites);
        for site in &sites {
            let Some(&fi) = self.funcs.get(&site.name) else {
                return Err(Error::parse(
                    format!("call to undefined function '{}'", site.name),
                    site.pos,
                ));
            };
            if site.shapes.len() > self.functions[fi].params.len() {
                return Err(Error::parse(
                    format!("too many arguments in call to '{}'", site.name),
                    site.pos,
                ));
            }
        }

        loop {
            let mut changed = false;
            for site in &sites {
                let fi = self.funcs[&site.name];
                for (i, shape) in site.shapes.iter().enumerate() {
                    let param_kind = self.func_kinds[fi][i];
                    match shape {
                        ArgShape::Var(v) => {
                            let var_kind = self.kind_of(v, site.in_func);
                            match (param_kind, var_kind) {
                                (Kind::Array, Kind::Unknown) => {
                                    self.mark_in(v, Kind::Array, site.in_func, site.pos)?;
                                    changed = true;
                                }
                                (Kind::Unknown, Kind::Array) => {
                                    self.func_kinds[fi][i] = Kind::Array;
                                    changed = true;
                                }
                                (Kind::Array, Kind::Scalar) => {
                                    return Err(Error::parse(
                                        format!(
                                            "can't pass scalar '{}' as array to '{}'",
                                            v, site.name
                                        ),
                                        site.pos,
                                    ));
                                }
                                (Kind::Scalar, Kind::Array) => {
                                    return Err(Error::parse(
                                        format!(
                                            "can't pass array '{}' as scalar to '{}'",
                                            v, site.name
                                        ),
                                        site.pos,
                                    ));
                                }
                                _ => {}
                            }
                        }
                        ArgShape::Other => {
                            if param_kind == Kind::Array {
                                return Err(Error::parse(
                                    format!(
                                        "argument {} to '{}' must be an array name",
                                        i + 1,
                                        site.name
                                    ),
                                    site.pos,
                                ));
                            }
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for (idx, kinds) in self.func_kinds.iter().enumerate() {
            self.functions[idx].array_params = kinds.iter().map(|k| *k == Kind::Array).collect();
        }
        Ok(())
    }

    // ===== Token plumbing =====

    /// Re-scan a pending `/` or `/=` as a regex literal. Called wherever an
    /// expression may start, which is exactly the set of positions where a
    /// regex is grammatically legal.
    fn regex_here(&mut self) -> Result<()> {
        if matches!(self.cur.kind, TokenKind::Div | TokenKind::DivAssign) {
            self.cur = self.lexer.scan_regex()?;
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        // Depth changes as the paren is consumed, so that a '(' sitting in
        // `cur` does not yet count as "inside parentheses".
        match self.cur.kind {
            TokenKind::Lparen => self.paren_depth += 1,
            TokenKind::Rparen => self.paren_depth = self.paren_depth.saturating_sub(1),
            _ => {}
        }
        loop {
            let tok = self.lexer.scan()?;
            // Newlines are invisible inside parentheses.
            if tok.kind == TokenKind::Newline && self.paren_depth > 0 {
                continue;
            }
            self.cur_space = self.lexer.had_space();
            self.cur = tok;
            return Ok(());
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<()> {
        if std::mem::discriminant(&self.cur.kind) == std::mem::discriminant(&kind) {
            self.advance()
        } else {
            Err(self.err(format!(
                "expected {}, found {}",
                kind.describe(),
                self.cur.kind.describe()
            )))
        }
    }

    fn expect_name(&mut self) -> Result<(String, Position)> {
        match self.cur.kind.clone() {
            TokenKind::Name(name) => {
                let pos = self.cur.pos;
                self.advance()?;
                Ok((name, pos))
            }
            other => Err(self.err(format!("expected name, found {}", other.describe()))),
        }
    }

    fn skip_newlines(&mut self) -> Result<()> {
        while self.cur.kind == TokenKind::Newline {
            self.advance()?;
        }
        Ok(())
    }

    fn skip_terminators(&mut self) -> Result<()> {
        while matches!(self.cur.kind, TokenKind::Newline | TokenKind::Semicolon) {
            self.advance()?;
        }
        Ok(())
    }

    fn can_start_expr(&self) -> bool {
        matches!(
            self.cur.kind,
            TokenKind::Number(_)
                | TokenKind::Str(_)
                | TokenKind::Regex(_)
                | TokenKind::Name(_)
                | TokenKind::Func(_)
                | TokenKind::Dollar
                | TokenKind::Lparen
                | TokenKind::Not
                | TokenKind::Add
                | TokenKind::Sub
                | TokenKind::Incr
                | TokenKind::Decr
                | TokenKind::Getline
                | TokenKind::Div
                | TokenKind::DivAssign
        )
    }

    fn err(&self, message: impl Into<String>) -> Error {
        Error::parse(message, self.cur.pos)
    }
}

fn unify(slot: &mut Kind, kind: Kind, name: &str, pos: Position) -> Result<()> {
    match (*slot, kind) {
        (_, Kind::Unknown) => Ok(()),
        (Kind::Unknown, k) => {
            *slot = k;
            Ok(())
        }
        (a, b) if a == b => Ok(()),
        _ => Err(Error::parse(
            format!("can't use '{}' as both array and scalar", name),
            pos,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<Program> {
        parse_program(source)
    }

    #[test]
    fn simple_print() {
        let program = parse(r#"{ print "hello" }"#).unwrap();
        assert_eq!(program.rules.len(), 1);
        assert!(matches!(program.rules[0].pattern, Pattern::Always));
    }

    #[test]
    fn begin_end() {
        let program = parse(r#"BEGIN { x = 1 } END { print x }"#).unwrap();
        assert_eq!(program.rules.len(), 2);
        assert!(matches!(program.rules[0].pattern, Pattern::Begin));
        assert!(matches!(program.rules[1].pattern, Pattern::End));
    }

    #[test]
    fn regex_pattern() {
        let program = parse(r#"/foo/ { print }"#).unwrap();
        assert!(matches!(
            &program.rules[0].pattern,
            Pattern::Expr(Expr::Regex(r)) if r == "foo"
        ));
    }

    #[test]
    fn range_pattern() {
        let program = parse(r#"/start/, /stop/ { print }"#).unwrap();
        assert!(matches!(&program.rules[0].pattern, Pattern::Range(_, _)));
    }

    #[test]
    fn pattern_without_action() {
        let program = parse("NR > 1").unwrap();
        assert!(program.rules[0].action.is_none());
    }

    #[test]
    fn regex_after_match_op() {
        let program = parse(r#"$1 ~ /^a+b/ { print }"#).unwrap();
        match &program.rules[0].pattern {
            Pattern::Expr(Expr::MatchRe { pattern, .. }) => {
                assert!(matches!(pattern.as_ref(), Expr::Regex(r) if r == "^a+b"));
            }
            other => panic!("unexpected pattern {:?}", other),
        }
    }

    #[test]
    fn division_is_not_regex() {
        let program = parse("{ x = a / 2 / b }").unwrap();
        assert_eq!(program.rules.len(), 1);
    }

    #[test]
    fn function_definition() {
        let program = parse("function add(a, b) { return a + b }").unwrap();
        assert_eq!(program.functions.len(), 1);
        assert_eq!(program.functions[0].name, "add");
        assert_eq!(program.functions[0].params, vec!["a", "b"]);
        assert_eq!(program.functions[0].array_params, vec![false, false]);
    }

    #[test]
    fn array_parameter_detected() {
        let program = parse("function fill(arr) { arr[1] = 1 } BEGIN { fill(x); print x[1] }")
            .unwrap();
        assert_eq!(program.functions[0].array_params, vec![true]);
    }

    #[test]
    fn array_kind_propagates_to_argument() {
        // x is only ever passed to fill(), which indexes it: x must resolve
        // to an array, so using it as a scalar elsewhere is an error.
        let err = parse("function fill(a) { a[1] = 1 } BEGIN { fill(x); y = x + 1 }")
            .unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn scalar_array_conflict() {
        let err = parse("{ x[1] = 1; x = 2 }").unwrap_err();
        assert!(err.to_string().contains("both array and scalar"));
    }

    #[test]
    fn undefined_function_call() {
        let err = parse("BEGIN { nope(1) }").unwrap_err();
        assert!(err.to_string().contains("undefined function"));
    }

    #[test]
    fn call_needs_adjacent_paren() {
        // `f (x)` is not a call: f is a variable concatenated with (x),
        // while `f(x)` is a call and f must then be defined.
        assert!(parse("BEGIN { y = f (1) }").is_ok());
        assert!(parse("BEGIN { y = f(1) }").is_err());
    }

    #[test]
    fn too_many_call_arguments() {
        let err = parse("function f(a) { return a } BEGIN { f(1, 2) }").unwrap_err();
        assert!(err.to_string().contains("too many arguments"));
    }

    #[test]
    fn builtin_arity_checked() {
        assert!(parse("BEGIN { print substr(\"abc\") }").is_err());
        assert!(parse("BEGIN { print atan2(1) }").is_err());
    }

    #[test]
    fn length_without_parens() {
        let program = parse("{ print length }").unwrap();
        assert_eq!(program.rules.len(), 1);
    }

    #[test]
    fn sub_target_must_be_lvalue() {
        let err = parse("{ sub(/a/, \"b\", 1 + 2) }").unwrap_err();
        assert!(err.to_string().contains("lvalue"));
    }

    #[test]
    fn getline_forms() {
        assert!(parse("{ getline }").is_ok());
        assert!(parse("{ getline line }").is_ok());
        assert!(parse("{ getline < \"file\" }").is_ok());
        assert!(parse("{ getline line < \"file\" }").is_ok());
        assert!(parse("{ \"date\" | getline now }").is_ok());
        assert!(parse("{ while ((\"ls\" | getline f) > 0) print f }").is_ok());
    }

    #[test]
    fn for_in_loop() {
        let program = parse("{ for (k in seen) print k }").unwrap();
        let action = program.rules[0].action.as_ref().unwrap();
        assert!(matches!(&action[0], Stmt::ForIn { var, array, .. }
            if var == "k" && array == "seen"));
    }

    #[test]
    fn subscript_tuple_in() {
        assert!(parse("{ if ((i, j) in grid) print }").is_ok());
    }

    #[test]
    fn break_outside_loop() {
        assert!(parse("{ break }").is_err());
        assert!(parse("{ while (1) break }").is_ok());
    }

    #[test]
    fn next_in_begin_rejected() {
        assert!(parse("BEGIN { next }").is_err());
        assert!(parse("{ next }").is_ok());
    }

    #[test]
    fn return_outside_function() {
        assert!(parse("{ return 1 }").is_err());
    }

    #[test]
    fn print_redirection_vs_comparison() {
        // Top-level > redirects; parenthesized > compares.
        let program = parse(r#"{ print $1 > "out" }"#).unwrap();
        let action = program.rules[0].action.as_ref().unwrap();
        assert!(matches!(
            &action[0],
            Stmt::Print { redirect: Some(Redirect::File(_)), .. }
        ));

        let program = parse(r#"{ print ($1 > "out") }"#).unwrap();
        let action = program.rules[0].action.as_ref().unwrap();
        assert!(matches!(&action[0], Stmt::Print { redirect: None, .. }));
    }

    #[test]
    fn newlines_suppressed_in_parens() {
        assert!(parse("{ x = (1 +\n 2) }").is_ok());
        assert!(parse("BEGIN { if (1 &&\n 1) print \"y\" }").is_ok());
    }

    #[test]
    fn concat_binds_tighter_than_comparison() {
        let program = parse(r#"{ x = "a" "b" == "ab" }"#).unwrap();
        let action = program.rules[0].action.as_ref().unwrap();
        let Stmt::Expr(Expr::Assign { value, .. }) = &action[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(
            value.as_ref(),
            Expr::Binary { op: BinaryOp::Eq, .. }
        ));
    }

    #[test]
    fn exponent_is_right_associative() {
        let program = parse("{ x = 2 ^ 3 ^ 2 }").unwrap();
        let action = program.rules[0].action.as_ref().unwrap();
        let Stmt::Expr(Expr::Assign { value, .. }) = &action[0] else {
            panic!("expected assignment");
        };
        let Expr::Binary { op: BinaryOp::Pow, right, .. } = value.as_ref() else {
            panic!("expected power");
        };
        assert!(matches!(
            right.as_ref(),
            Expr::Binary { op: BinaryOp::Pow, .. }
        ));
    }

    #[test]
    fn delete_forms() {
        assert!(parse("{ delete a[1] }").is_ok());
        assert!(parse("{ delete a[1, 2] }").is_ok());
        assert!(parse("{ delete a }").is_ok());
    }

    #[test]
    fn assignment_to_non_lvalue() {
        let err = parse("{ 1 + 2 = 3 }").unwrap_err();
        assert!(err.to_string().contains("non-lvalue"));
    }
}
