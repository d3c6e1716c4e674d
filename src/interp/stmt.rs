use std::io::Write;

use crate::ast::{Redirect, Stmt};
use crate::value::Value;

use super::{Ctrl, Flow, Interp, Res};

impl<'p> Interp<'p> {
    pub(crate) fn exec_stmts(&mut self, stmts: &[Stmt], out: &mut dyn Write) -> Res<()> {
        for stmt in stmts {
            self.exec(stmt, out)?;
        }
        Ok(())
    }

    pub(crate) fn exec(&mut self, stmt: &Stmt, out: &mut dyn Write) -> Res<()> {
        match stmt {
            Stmt::Expr(e) => {
                self.eval(e, out)?;
                Ok(())
            }

            Stmt::Print { args, redirect } => self.exec_print(args, redirect.as_ref(), out),

            Stmt::Printf { args, redirect } => self.exec_printf(args, redirect.as_ref(), out),

            Stmt::Block(stmts) => self.exec_stmts(stmts, out),

            Stmt::If {
                cond,
                then_stmt,
                else_stmt,
            } => {
                if self.eval(cond, out)?.is_truthy() {
                    self.exec(then_stmt, out)
                } else if let Some(stmt) = else_stmt {
                    self.exec(stmt, out)
                } else {
                    Ok(())
                }
            }

            Stmt::While { cond, body } => {
                while self.eval(cond, out)?.is_truthy() {
                    match self.exec(body, out) {
                        Ok(()) => {}
                        Err(Ctrl::Flow(Flow::Break)) => break,
                        Err(Ctrl::Flow(Flow::Continue)) => {}
                        Err(other) => return Err(other),
                    }
                }
                Ok(())
            }

            Stmt::DoWhile { body, cond } => {
                loop {
                    match self.exec(body, out) {
                        Ok(()) => {}
                        Err(Ctrl::Flow(Flow::Break)) => break,
                        Err(Ctrl::Flow(Flow::Continue)) => {}
                        Err(other) => return Err(other),
                    }
                    if !self.eval(cond, out)?.is_truthy() {
                        break;
                    }
                }
                Ok(())
            }

            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.exec(init, out)?;
                }
                loop {
                    if let Some(cond) = cond {
                        if !self.eval(cond, out)?.is_truthy() {
                            break;
                        }
                    }
                    match self.exec(body, out) {
                        Ok(()) => {}
                        Err(Ctrl::Flow(Flow::Break)) => break,
                        Err(Ctrl::Flow(Flow::Continue)) => {}
                        Err(other) => return Err(other),
                    }
                    if let Some(step) = step {
                        self.eval(step, out)?;
                    }
                }
                Ok(())
            }

            Stmt::ForIn { var, array, body } => {
                // Iterate over a snapshot of keys; order is unspecified and
                // mutation during the loop does not disturb the walk.
                let slot = self.array_slot(array);
                let keys: Vec<String> = self.arrays[slot].keys().cloned().collect();
                for key in keys {
                    self.set_scalar(var, Value::from_input(key))
                        .map_err(Ctrl::Error)?;
                    match self.exec(body, out) {
                        Ok(()) => {}
                        Err(Ctrl::Flow(Flow::Break)) => break,
                        Err(Ctrl::Flow(Flow::Continue)) => {}
                        Err(other) => return Err(other),
                    }
                }
                Ok(())
            }

            Stmt::Break => Err(Ctrl::Flow(Flow::Break)),
            Stmt::Continue => Err(Ctrl::Flow(Flow::Continue)),
            Stmt::Next => Err(Ctrl::Flow(Flow::Next)),
            Stmt::NextFile => Err(Ctrl::Flow(Flow::NextFile)),

            Stmt::Exit(code) => {
                if let Some(e) = code {
                    let code = self.eval(e, out)?.to_num() as i32;
                    self.set_exit_code(code);
                }
                Err(Ctrl::Flow(Flow::Exit))
            }

            Stmt::Return(value) => {
                let v = match value {
                    Some(e) => self.eval(e, out)?,
                    None => Value::Uninit,
                };
                Err(Ctrl::Flow(Flow::Return(v)))
            }

            Stmt::Delete { array, index } => {
                let slot = self.array_slot(array);
                if index.is_empty() {
                    self.arrays[slot].clear();
                } else {
                    let key = self.make_key(index, out)?;
                    let slot = self.array_slot(array);
                    self.arrays[slot].remove(&key);
                }
                Ok(())
            }
        }
    }

    fn exec_print(
        &mut self,
        args: &[crate::ast::Expr],
        redirect: Option<&Redirect>,
        out: &mut dyn Write,
    ) -> Res<()> {
        let mut line = if args.is_empty() {
            self.record().to_string()
        } else {
            let mut parts = Vec::with_capacity(args.len());
            for arg in args {
                let v = self.eval(arg, out)?;
                parts.push(v.into_str(self.ofmt()));
            }
            parts.join(self.ofs())
        };
        line.push_str(self.ors());
        self.write_output(line.as_bytes(), redirect, out)
    }

    fn exec_printf(
        &mut self,
        args: &[crate::ast::Expr],
        redirect: Option<&Redirect>,
        out: &mut dyn Write,
    ) -> Res<()> {
        let format = self.eval(&args[0], out)?.into_str(self.convfmt());
        let mut values = Vec::with_capacity(args.len() - 1);
        for arg in &args[1..] {
            values.push(self.eval(arg, out)?);
        }
        let text =
            super::format::sprintf(&format, &values, self.convfmt()).map_err(Ctrl::Error)?;
        self.write_output(text.as_bytes(), redirect, out)
    }
}
