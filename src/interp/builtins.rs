use std::collections::HashMap;
use std::io::Write;
use std::process::Command;

use regex::Regex;

use crate::ast::Expr;
use crate::error::Error;
use crate::lexer::Builtin;
use crate::value::Value;

use super::{Ctrl, Flow, Interp, Res};

impl<'p> Interp<'p> {
    /// Call a user-defined function: bind parameters left to right, aliasing
    /// array arguments, then execute the body. Missing arguments become
    /// uninitialized locals.
    pub(crate) fn call_function(
        &mut self,
        name: &str,
        args: &[Expr],
        out: &mut dyn Write,
    ) -> Res<Value> {
        let Some(func) = self.function(name) else {
            return Err(Ctrl::Error(Error::runtime(format!(
                "calling undefined function '{}'",
                name
            ))));
        };

        let mut scalars = HashMap::new();
        let mut arrays = HashMap::new();
        let mut owned_slots = Vec::new();

        for (i, param) in func.params.iter().enumerate() {
            if func.array_params[i] {
                let slot = match args.get(i) {
                    Some(Expr::Var(vname)) => self.array_slot(vname),
                    Some(_) => {
                        return Err(Ctrl::Error(Error::runtime(format!(
                            "argument {} to '{}' must be an array name",
                            i + 1,
                            name
                        ))));
                    }
                    None => {
                        let slot = self.new_slot();
                        owned_slots.push(slot);
                        slot
                    }
                };
                arrays.insert(param.clone(), slot);
            } else {
                let value = match args.get(i) {
                    Some(arg) => self.eval(arg, out)?,
                    None => Value::Uninit,
                };
                scalars.insert(param.clone(), value);
            }
        }

        self.push_frame(func, scalars, arrays, owned_slots);
        let result = self.exec_stmts(&func.body, out);
        self.pop_frame();

        match result {
            Ok(()) => Ok(Value::Uninit),
            Err(Ctrl::Flow(Flow::Return(v))) => Ok(v),
            Err(other) => Err(other),
        }
    }

    pub(crate) fn call_builtin(
        &mut self,
        func: Builtin,
        args: &[Expr],
        out: &mut dyn Write,
    ) -> Res<Value> {
        match func {
            Builtin::Length => self.builtin_length(args, out),
            Builtin::Substr => self.builtin_substr(args, out),
            Builtin::Index => {
                let s = self.eval(&args[0], out)?.into_str(self.convfmt());
                let t = self.eval(&args[1], out)?.into_str(self.convfmt());
                let pos = s.find(&t).map(|i| i + 1).unwrap_or(0);
                Ok(Value::num(pos as f64))
            }
            Builtin::Split => self.builtin_split(args, out),
            Builtin::Sub | Builtin::Gsub => {
                self.builtin_sub(args, func == Builtin::Gsub, out)
            }
            Builtin::Match => self.builtin_match(args, out),
            Builtin::Sprintf => {
                let format = self.eval(&args[0], out)?.into_str(self.convfmt());
                let mut values = Vec::with_capacity(args.len() - 1);
                for arg in &args[1..] {
                    values.push(self.eval(arg, out)?);
                }
                let text = super::format::sprintf(&format, &values, self.convfmt())
                    .map_err(Ctrl::Error)?;
                Ok(Value::str(text))
            }
            Builtin::Tolower => {
                let s = self.eval(&args[0], out)?.into_str(self.convfmt());
                Ok(Value::str(s.to_ascii_lowercase()))
            }
            Builtin::Toupper => {
                let s = self.eval(&args[0], out)?.into_str(self.convfmt());
                Ok(Value::str(s.to_ascii_uppercase()))
            }
            Builtin::Sin => self.math1(args, out, f64::sin),
            Builtin::Cos => self.math1(args, out, f64::cos),
            Builtin::Exp => self.math1(args, out, f64::exp),
            Builtin::Log => self.math1(args, out, f64::ln),
            Builtin::Sqrt => self.math1(args, out, f64::sqrt),
            Builtin::Int => self.math1(args, out, f64::trunc),
            Builtin::Atan2 => {
                let y = self.eval(&args[0], out)?.to_num();
                let x = self.eval(&args[1], out)?.to_num();
                Ok(Value::num(y.atan2(x)))
            }
            Builtin::Rand => Ok(Value::num(self.next_rand())),
            Builtin::Srand => {
                let seed = match args.first() {
                    Some(e) => Some(self.eval(e, out)?.to_num()),
                    None => None,
                };
                Ok(Value::num(self.reseed(seed)))
            }
            Builtin::System => {
                let cmd = self.eval(&args[0], out)?.into_str(self.convfmt());
                self.flush_all_output(out).map_err(Ctrl::Error)?;
                let status = Command::new("sh")
                    .arg("-c")
                    .arg(&cmd)
                    .status()
                    .map(|s| s.code().unwrap_or(-1))
                    .unwrap_or(-1);
                Ok(Value::num(status as f64))
            }
            Builtin::Close => {
                let target = self.eval(&args[0], out)?.into_str(self.convfmt());
                Ok(Value::num(self.close_target(&target)))
            }
            Builtin::Fflush => {
                let status = match args.first() {
                    None => self.flush_target(None, out)?,
                    Some(e) => {
                        let name = self.eval(e, out)?.into_str(self.convfmt());
                        self.flush_target(Some(&name), out)?
                    }
                };
                Ok(Value::num(status))
            }
        }
    }

    fn math1(
        &mut self,
        args: &[Expr],
        out: &mut dyn Write,
        f: impl Fn(f64) -> f64,
    ) -> Res<Value> {
        let n = self.eval(&args[0], out)?.to_num();
        Ok(Value::num(f(n)))
    }

    fn builtin_length(&mut self, args: &[Expr], out: &mut dyn Write) -> Res<Value> {
        match args.first() {
            None => Ok(Value::num(self.record().len() as f64)),
            Some(Expr::Var(name)) if self.is_array(name) => {
                let slot = self.array_slot(name);
                Ok(Value::num(self.arrays[slot].len() as f64))
            }
            Some(e) => {
                let s = self.eval(e, out)?.into_str(self.convfmt());
                Ok(Value::num(s.len() as f64))
            }
        }
    }

    fn builtin_substr(&mut self, args: &[Expr], out: &mut dyn Write) -> Res<Value> {
        let s = self.eval(&args[0], out)?.into_str(self.convfmt());
        let m = self.eval(&args[1], out)?.to_num().trunc();
        let n = match args.get(2) {
            Some(e) => Some(self.eval(e, out)?.to_num().trunc()),
            None => None,
        };

        let len = s.len() as f64;
        // 1-based start, clamped to the string
        let start = m.max(1.0);
        let end = match n {
            Some(n) => (m + n.max(0.0)).min(len + 1.0),
            None => len + 1.0,
        };
        if end <= start || start > len {
            return Ok(Value::str(""));
        }
        let mut begin = (start - 1.0) as usize;
        let mut finish = (end - 1.0) as usize;
        // Byte indices; back off to char boundaries for non-ASCII text
        while begin < s.len() && !s.is_char_boundary(begin) {
            begin += 1;
        }
        while finish < s.len() && !s.is_char_boundary(finish) {
            finish += 1;
        }
        Ok(Value::str(s[begin..finish.max(begin)].to_string()))
    }

    fn builtin_split(&mut self, args: &[Expr], out: &mut dyn Write) -> Res<Value> {
        let s = self.eval(&args[0], out)?.into_str(self.convfmt());
        let Expr::Var(array) = &args[1] else {
            return Err(Ctrl::Error(Error::runtime("split: second argument must be an array")));
        };

        let parts: Vec<String> = match args.get(2) {
            None => {
                let fs = self.fs_clone();
                self.split_by_rules(&s, &fs, false)?
            }
            Some(Expr::Regex(pattern)) => {
                let pattern = pattern.clone();
                self.split_by_rules(&s, &pattern, true)?
            }
            Some(e) => {
                let sep = self.eval(e, out)?.into_str(self.convfmt());
                self.split_by_rules(&s, &sep, false)?
            }
        };

        let slot = self.array_slot(array);
        self.arrays[slot].clear();
        let count = parts.len();
        for (i, part) in parts.into_iter().enumerate() {
            self.arrays[slot].insert((i + 1).to_string(), Value::from_input(part));
        }
        Ok(Value::num(count as f64))
    }

    fn fs_clone(&self) -> String {
        self.fs.clone()
    }

    /// FS-style splitting: `" "` means whitespace runs with trimming, any
    /// other single character splits literally, longer separators (or a
    /// regex literal) split as regexes.
    pub(crate) fn split_by_rules(
        &mut self,
        text: &str,
        sep: &str,
        force_regex: bool,
    ) -> Res<Vec<String>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        if !force_regex {
            if sep == " " {
                return Ok(text.split_whitespace().map(String::from).collect());
            }
            if sep.chars().count() == 1 {
                let c = sep.chars().next().unwrap();
                return Ok(text.split(c).map(String::from).collect());
            }
        }
        let re = self.regex(sep).map_err(Ctrl::Error)?;
        Ok(re.split(text).map(String::from).collect())
    }

    fn builtin_sub(&mut self, args: &[Expr], global: bool, out: &mut dyn Write) -> Res<Value> {
        let pattern = self.pattern_text(&args[0], out)?;
        let repl = self.eval(&args[1], out)?.into_str(self.convfmt());
        let re = self.regex(&pattern).map_err(Ctrl::Error)?;

        let target = args.get(2);
        let text = match target {
            Some(e) => self.eval(e, out)?.into_str(self.convfmt()),
            None => self.record().to_string(),
        };

        let (new_text, count) = substitute(&re, &repl, &text, global);
        if count > 0 {
            match target {
                Some(e) => self.assign(e, Value::str(new_text), out)?,
                None => self.set_record(new_text)?,
            }
        }
        Ok(Value::num(count as f64))
    }

    fn builtin_match(&mut self, args: &[Expr], out: &mut dyn Write) -> Res<Value> {
        let s = self.eval(&args[0], out)?.into_str(self.convfmt());
        let pattern = self.pattern_text(&args[1], out)?;
        let re = self.regex(&pattern).map_err(Ctrl::Error)?;

        match re.find(&s) {
            Some(m) => {
                self.rstart = (m.start() + 1) as f64;
                self.rlength = m.len() as f64;
                Ok(Value::num(self.rstart))
            }
            None => {
                self.rstart = 0.0;
                self.rlength = -1.0;
                Ok(Value::num(0.0))
            }
        }
    }
}

/// Replace the first (or all non-overlapping) matches, expanding `&` to the
/// matched text; `\&` is a literal ampersand and `\\` a backslash.
fn substitute(re: &Regex, repl: &str, text: &str, global: bool) -> (String, usize) {
    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    let mut count = 0;
    for m in re.find_iter(text) {
        result.push_str(&text[last..m.start()]);
        result.push_str(&expand_replacement(repl, m.as_str()));
        last = m.end();
        count += 1;
        if !global {
            break;
        }
    }
    result.push_str(&text[last..]);
    (result, count)
}

fn expand_replacement(repl: &str, matched: &str) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut chars = repl.chars();
    while let Some(c) = chars.next() {
        match c {
            '&' => out.push_str(matched),
            '\\' => match chars.next() {
                Some('&') => out.push('&'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re(p: &str) -> Regex {
        Regex::new(p).unwrap()
    }

    #[test]
    fn substitute_first_and_all() {
        assert_eq!(substitute(&re("o"), "0", "foo", false), ("f0o".to_string(), 1));
        assert_eq!(substitute(&re("o"), "0", "foo", true), ("f00".to_string(), 2));
        assert_eq!(substitute(&re("x"), "0", "foo", true), ("foo".to_string(), 0));
    }

    #[test]
    fn ampersand_expansion() {
        assert_eq!(
            substitute(&re("b"), "&&", "abc", true),
            ("abbc".to_string(), 1)
        );
        assert_eq!(
            substitute(&re("b"), "[&]", "abc", false),
            ("a[b]c".to_string(), 1)
        );
        assert_eq!(
            substitute(&re("b"), r"\&", "abc", false),
            ("a&c".to_string(), 1)
        );
        assert_eq!(
            substitute(&re("b"), r"\\&", "abc", false),
            (r"a\bc".to_string(), 1)
        );
    }
}
