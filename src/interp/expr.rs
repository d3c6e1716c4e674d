use std::io::Write;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::Error;
use crate::value::{self, Value};

use super::{Ctrl, Interp, Res};

impl<'p> Interp<'p> {
    /// Evaluate an expression. `out` is the destination for any unredirected
    /// output produced along the way (a called function may print).
    pub(crate) fn eval(&mut self, expr: &Expr, out: &mut dyn Write) -> Res<Value> {
        match expr {
            Expr::Num(n) => Ok(Value::num(*n)),
            Expr::Str(s) => Ok(Value::str(s.clone())),

            // A bare regex matches against the current record.
            Expr::Regex(pattern) => {
                let re = self.regex(pattern).map_err(Ctrl::Error)?;
                Ok(Value::from_bool(re.is_match(&self.record)))
            }

            Expr::Var(name) => self.get_scalar(name),

            Expr::Field(index) => {
                let n = self.eval(index, out)?.to_num();
                let i = self.field_index(n)?;
                Ok(Value::from_input(self.get_field(i).to_string()))
            }

            Expr::Index { array, index } => {
                let key = self.make_key(index, out)?;
                let slot = self.array_slot(array);
                Ok(self.arrays[slot].get(&key).cloned().unwrap_or_default())
            }

            Expr::Group(inner) => self.eval(inner, out),

            Expr::Unary { op, expr } => {
                let v = self.eval(expr, out)?;
                Ok(match op {
                    UnaryOp::Neg => Value::num(-v.to_num()),
                    UnaryOp::Pos => Value::num(v.to_num()),
                    UnaryOp::Not => Value::from_bool(!v.is_truthy()),
                })
            }

            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right, out),

            Expr::Ternary { cond, yes, no } => {
                if self.eval(cond, out)?.is_truthy() {
                    self.eval(yes, out)
                } else {
                    self.eval(no, out)
                }
            }

            Expr::Assign { target, op, value } => {
                let new = match op {
                    None => self.eval(value, out)?,
                    Some(op) => {
                        let current = self.eval(target, out)?.to_num();
                        let rhs = self.eval(value, out)?.to_num();
                        Value::num(self.arith(*op, current, rhs)?)
                    }
                };
                self.assign(target, new.clone(), out)?;
                Ok(new)
            }

            Expr::IncrDecr { pre, up, target } => {
                let old = self.eval(target, out)?.to_num();
                let new = if *up { old + 1.0 } else { old - 1.0 };
                self.assign(target, Value::num(new), out)?;
                Ok(Value::num(if *pre { new } else { old }))
            }

            Expr::MatchRe {
                negated,
                text,
                pattern,
            } => {
                let subject = self.eval(text, out)?.into_str(self.convfmt());
                let pat = self.pattern_text(pattern, out)?;
                let re = self.regex(&pat).map_err(Ctrl::Error)?;
                Ok(Value::from_bool(re.is_match(&subject) != *negated))
            }

            Expr::In { index, array } => {
                let key = self.make_key(index, out)?;
                let slot = self.array_slot(array);
                Ok(Value::from_bool(self.arrays[slot].contains_key(&key)))
            }

            Expr::Call { name, args } => self.call_function(name, args, out),

            Expr::BuiltinCall { func, args } => self.call_builtin(*func, args, out),

            Expr::Getline { source, target } => {
                self.eval_getline(source, target.as_deref(), out)
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        out: &mut dyn Write,
    ) -> Res<Value> {
        match op {
            BinaryOp::And => {
                if !self.eval(left, out)?.is_truthy() {
                    return Ok(Value::from_bool(false));
                }
                let r = self.eval(right, out)?;
                return Ok(Value::from_bool(r.is_truthy()));
            }
            BinaryOp::Or => {
                if self.eval(left, out)?.is_truthy() {
                    return Ok(Value::from_bool(true));
                }
                let r = self.eval(right, out)?;
                return Ok(Value::from_bool(r.is_truthy()));
            }
            _ => {}
        }

        let l = self.eval(left, out)?;
        let r = self.eval(right, out)?;

        let v = match op {
            BinaryOp::Concat => {
                let mut s = l.into_str(self.convfmt());
                s.push_str(&r.into_str(self.convfmt()));
                Value::Str(s)
            }
            BinaryOp::Lt => Value::from_bool(value::compare(&l, &r, self.convfmt()).is_lt()),
            BinaryOp::Le => Value::from_bool(value::compare(&l, &r, self.convfmt()).is_le()),
            BinaryOp::Gt => Value::from_bool(value::compare(&l, &r, self.convfmt()).is_gt()),
            BinaryOp::Ge => Value::from_bool(value::compare(&l, &r, self.convfmt()).is_ge()),
            BinaryOp::Eq => Value::from_bool(value::compare(&l, &r, self.convfmt()).is_eq()),
            BinaryOp::Ne => Value::from_bool(value::compare(&l, &r, self.convfmt()).is_ne()),
            _ => Value::num(self.arith(op, l.to_num(), r.to_num())?),
        };
        Ok(v)
    }

    pub(crate) fn arith(&self, op: BinaryOp, l: f64, r: f64) -> Res<f64> {
        let v = match op {
            BinaryOp::Add => l + r,
            BinaryOp::Sub => l - r,
            BinaryOp::Mul => l * r,
            BinaryOp::Div => {
                if r == 0.0 {
                    return Err(Ctrl::Error(Error::runtime("division by zero")));
                }
                l / r
            }
            BinaryOp::Mod => {
                if r == 0.0 {
                    return Err(Ctrl::Error(Error::runtime("division by zero in %")));
                }
                l % r
            }
            BinaryOp::Pow => l.powf(r),
            _ => return Err(Ctrl::Error(Error::runtime("not an arithmetic operator"))),
        };
        Ok(v)
    }

    /// Regex pattern text of a match operand: a regex literal contributes
    /// its source, anything else converts through its string form.
    pub(crate) fn pattern_text(&mut self, expr: &Expr, out: &mut dyn Write) -> Res<String> {
        match expr {
            Expr::Regex(p) => Ok(p.clone()),
            other => Ok(self.eval(other, out)?.into_str(self.convfmt())),
        }
    }

    /// Store a value through an lvalue expression.
    pub(crate) fn assign(&mut self, target: &Expr, value: Value, out: &mut dyn Write) -> Res<()> {
        match target {
            Expr::Var(name) => self.set_scalar(name, value).map_err(Ctrl::Error),
            Expr::Field(index) => {
                let n = self.eval(index, out)?.to_num();
                let i = self.field_index(n)?;
                let s = value.into_str(self.convfmt());
                self.set_field(i, s)
            }
            Expr::Index { array, index } => {
                let key = self.make_key(index, out)?;
                let slot = self.array_slot(array);
                self.arrays[slot].insert(key, value);
                Ok(())
            }
            _ => Err(Ctrl::Error(Error::runtime("assignment to non-lvalue"))),
        }
    }
}
