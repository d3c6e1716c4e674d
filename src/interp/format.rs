//! printf/sprintf formatting.
//!
//! AWK's printf is close to C's but not close enough to defer to the host:
//! `%c` takes a number (code point) or a string (first character), `%i`
//! aliases `%d`, and `*` pulls width/precision from the argument list.

use crate::error::{Error, Result};
use crate::value::{self, Value};

#[derive(Default)]
struct Spec {
    minus: bool,
    plus: bool,
    space: bool,
    hash: bool,
    zero: bool,
    width: Option<usize>,
    prec: Option<usize>,
}

pub(crate) fn sprintf(format: &str, args: &[Value], convfmt: &str) -> Result<String> {
    let mut out = String::with_capacity(format.len() + 16);
    let mut chars = format.chars().peekable();
    let mut next = 0usize;

    let mut take = |next: &mut usize| -> Value {
        let v = args.get(*next).cloned().unwrap_or_default();
        *next += 1;
        v
    };

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut spec = Spec::default();
        loop {
            match chars.peek() {
                Some('-') => spec.minus = true,
                Some('+') => spec.plus = true,
                Some(' ') => spec.space = true,
                Some('#') => spec.hash = true,
                Some('0') => spec.zero = true,
                _ => break,
            }
            chars.next();
        }

        if chars.peek() == Some(&'*') {
            chars.next();
            let w = take(&mut next).to_num() as i64;
            if w < 0 {
                spec.minus = true;
                spec.width = Some(w.unsigned_abs() as usize);
            } else {
                spec.width = Some(w as usize);
            }
        } else {
            let mut w: Option<usize> = None;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                w = Some(w.unwrap_or(0) * 10 + d as usize);
                chars.next();
            }
            spec.width = w;
        }

        if chars.peek() == Some(&'.') {
            chars.next();
            if chars.peek() == Some(&'*') {
                chars.next();
                let p = take(&mut next).to_num() as i64;
                // A negative * precision means "as if omitted"
                spec.prec = if p < 0 { None } else { Some(p as usize) };
            } else {
                let mut p = 0usize;
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                    p = p * 10 + d as usize;
                    chars.next();
                }
                spec.prec = Some(p);
            }
        }

        let Some(verb) = chars.next() else {
            return Err(Error::runtime("missing conversion at end of format string"));
        };

        let arg = take(&mut next);
        let piece = match verb {
            'd' | 'i' => {
                let body = format_int(arg.to_num() as i64, spec.prec);
                pad_numeric(with_sign(body, &spec), &spec)
            }
            'u' => {
                let body = format_uint(arg.to_num() as i64 as u64, spec.prec, 10, false, "");
                pad_numeric(body, &spec)
            }
            'o' => {
                let prefix = if spec.hash { "0" } else { "" };
                let body = format_uint(arg.to_num() as i64 as u64, spec.prec, 8, false, prefix);
                pad_numeric(body, &spec)
            }
            'x' => {
                let prefix = if spec.hash { "0x" } else { "" };
                let body = format_uint(arg.to_num() as i64 as u64, spec.prec, 16, false, prefix);
                pad_numeric(body, &spec)
            }
            'X' => {
                let prefix = if spec.hash { "0X" } else { "" };
                let body = format_uint(arg.to_num() as i64 as u64, spec.prec, 16, true, prefix);
                pad_numeric(body, &spec)
            }
            'e' | 'E' => {
                let body = value::format_e(arg.to_num(), spec.prec.unwrap_or(6), verb == 'E');
                pad_numeric(with_sign(body, &spec), &spec)
            }
            'f' | 'F' => {
                let body = value::format_f(arg.to_num(), spec.prec.unwrap_or(6));
                pad_numeric(with_sign(body, &spec), &spec)
            }
            'g' | 'G' => {
                let body = value::format_g(
                    arg.to_num(),
                    spec.prec.unwrap_or(6),
                    verb == 'G',
                    spec.hash,
                );
                pad_numeric(with_sign(body, &spec), &spec)
            }
            'c' => {
                let body = match &arg {
                    Value::Num(n) => char::from_u32(*n as u32)
                        .map(String::from)
                        .unwrap_or_default(),
                    other => other
                        .as_str(convfmt)
                        .chars()
                        .next()
                        .map(String::from)
                        .unwrap_or_default(),
                };
                pad_text(body, &spec)
            }
            's' => {
                let mut body = arg.into_str(convfmt);
                if let Some(p) = spec.prec {
                    body = body.chars().take(p).collect();
                }
                pad_text(body, &spec)
            }
            other => {
                return Err(Error::runtime(format!(
                    "unsupported format specifier '%{}'",
                    other
                )));
            }
        };
        out.push_str(&piece);
    }

    Ok(out)
}

fn format_int(n: i64, prec: Option<usize>) -> String {
    let digits = n.unsigned_abs().to_string();
    let digits = zero_extend(digits, prec);
    if n < 0 {
        format!("-{}", digits)
    } else {
        digits
    }
}

fn format_uint(n: u64, prec: Option<usize>, radix: u32, upper: bool, prefix: &str) -> String {
    let digits = match radix {
        8 => format!("{:o}", n),
        16 if upper => format!("{:X}", n),
        16 => format!("{:x}", n),
        _ => format!("{}", n),
    };
    format!("{}{}", prefix, zero_extend(digits, prec))
}

fn zero_extend(digits: String, prec: Option<usize>) -> String {
    match prec {
        Some(p) if digits.len() < p => format!("{}{}", "0".repeat(p - digits.len()), digits),
        _ => digits,
    }
}

/// Apply `+` / space to a non-negative numeric body.
fn with_sign(body: String, spec: &Spec) -> String {
    if body.starts_with('-') {
        body
    } else if spec.plus {
        format!("+{}", body)
    } else if spec.space {
        format!(" {}", body)
    } else {
        body
    }
}

fn pad_numeric(body: String, spec: &Spec) -> String {
    let Some(width) = spec.width else { return body };
    let len = body.chars().count();
    if len >= width {
        return body;
    }
    let fill = width - len;
    if spec.minus {
        format!("{}{}", body, " ".repeat(fill))
    } else if spec.zero {
        // Zeros pad after any sign or radix prefix
        let (head, tail) = split_prefix(&body);
        format!("{}{}{}", head, "0".repeat(fill), tail)
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn pad_text(body: String, spec: &Spec) -> String {
    let Some(width) = spec.width else { return body };
    let len = body.chars().count();
    if len >= width {
        return body;
    }
    let fill = width - len;
    if spec.minus {
        format!("{}{}", body, " ".repeat(fill))
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn split_prefix(s: &str) -> (&str, &str) {
    let mut head = 0;
    let bytes = s.as_bytes();
    if !bytes.is_empty() && matches!(bytes[0], b'-' | b'+' | b' ') {
        head = 1;
    }
    if s[head..].starts_with("0x") || s[head..].starts_with("0X") {
        head += 2;
    }
    s.split_at(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: &str, args: &[Value]) -> String {
        sprintf(format, args, "%.6g").unwrap()
    }

    #[test]
    fn plain_text_and_percent() {
        assert_eq!(fmt("hello", &[]), "hello");
        assert_eq!(fmt("100%%", &[]), "100%");
    }

    #[test]
    fn integers() {
        assert_eq!(fmt("%d", &[Value::num(42.0)]), "42");
        assert_eq!(fmt("%i", &[Value::num(-7.0)]), "-7");
        assert_eq!(fmt("%d", &[Value::num(3.9)]), "3");
        assert_eq!(fmt("%5d", &[Value::num(42.0)]), "   42");
        assert_eq!(fmt("%-5d|", &[Value::num(42.0)]), "42   |");
        assert_eq!(fmt("%05d", &[Value::num(-42.0)]), "-0042");
        assert_eq!(fmt("%+d % d", &[Value::num(5.0), Value::num(5.0)]), "+5  5");
        assert_eq!(fmt("%.4d", &[Value::num(42.0)]), "0042");
    }

    #[test]
    fn unsigned_and_radix() {
        assert_eq!(fmt("%o", &[Value::num(8.0)]), "10");
        assert_eq!(fmt("%x", &[Value::num(255.0)]), "ff");
        assert_eq!(fmt("%X", &[Value::num(255.0)]), "FF");
        assert_eq!(fmt("%#x", &[Value::num(255.0)]), "0xff");
        assert_eq!(fmt("%#o", &[Value::num(8.0)]), "010");
        assert_eq!(fmt("%u", &[Value::num(42.0)]), "42");
    }

    #[test]
    fn floats() {
        assert_eq!(fmt("%f", &[Value::num(3.14159)]), "3.141590");
        assert_eq!(fmt("%.2f", &[Value::num(3.14159)]), "3.14");
        assert_eq!(fmt("%8.2f", &[Value::num(3.14159)]), "    3.14");
        assert_eq!(fmt("%e", &[Value::num(12345.678)]), "1.234568e+04");
        assert_eq!(fmt("%.2E", &[Value::num(0.00123)]), "1.23E-03");
        assert_eq!(fmt("%g", &[Value::num(0.00001)]), "1e-05");
        assert_eq!(fmt("%g", &[Value::num(100.0)]), "100");
    }

    #[test]
    fn strings() {
        assert_eq!(fmt("%s", &[Value::str("abc")]), "abc");
        assert_eq!(fmt("%5s", &[Value::str("ab")]), "   ab");
        assert_eq!(fmt("%-5s|", &[Value::str("ab")]), "ab   |");
        assert_eq!(fmt("%.2s", &[Value::str("abcdef")]), "ab");
        // A numeric argument converts through CONVFMT
        assert_eq!(fmt("%s", &[Value::num(2.5)]), "2.5");
    }

    #[test]
    fn chars() {
        assert_eq!(fmt("%c", &[Value::num(65.0)]), "A");
        assert_eq!(fmt("%c", &[Value::str("xyz")]), "x");
        assert_eq!(fmt("%c", &[Value::Uninit]), "");
    }

    #[test]
    fn star_width_and_precision() {
        assert_eq!(
            fmt("%*d", &[Value::num(5.0), Value::num(42.0)]),
            "   42"
        );
        assert_eq!(
            fmt("%.*f", &[Value::num(2.0), Value::num(3.14159)]),
            "3.14"
        );
        // Negative * width means left alignment
        assert_eq!(
            fmt("%*d|", &[Value::num(-5.0), Value::num(42.0)]),
            "42   |"
        );
    }

    #[test]
    fn missing_arguments_are_uninitialized() {
        assert_eq!(fmt("%s %d", &[]), " 0");
    }

    #[test]
    fn bad_specifier_is_an_error() {
        assert!(sprintf("%q", &[], "%.6g").is_err());
        assert!(sprintf("abc%", &[], "%.6g").is_err());
    }
}
