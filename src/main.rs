use std::env;
use std::fs;
use std::io::{self, BufRead, Read};
use std::process;

use tawk::{parse_program, Interp};

fn main() {
    let args: Vec<String> = env::args().collect();
    match run(&args[1..]) {
        Ok(code) => process::exit(code),
        Err(CliError::Usage(msg)) => {
            eprintln!("tawk: {}", msg);
            eprintln!("usage: tawk [-F fs] [-v var=value] [-f progfile | 'prog'] [file ...]");
            process::exit(2);
        }
        Err(CliError::Fatal(msg)) => {
            eprintln!("{}", msg);
            process::exit(1);
        }
    }
}

enum CliError {
    Usage(String),
    Fatal(String),
}

fn run(args: &[String]) -> Result<i32, CliError> {
    let mut field_sep: Option<String> = None;
    let mut assignments: Vec<(String, String)> = Vec::new();
    let mut prog_files: Vec<String> = Vec::new();
    let mut operands: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--" {
            i += 1;
            break;
        } else if arg == "-F" {
            i += 1;
            let fs = args
                .get(i)
                .ok_or_else(|| CliError::Usage("option -F requires an argument".into()))?;
            field_sep = Some(fs.clone());
        } else if let Some(fs) = arg.strip_prefix("-F") {
            field_sep = Some(fs.to_string());
        } else if arg == "-v" {
            i += 1;
            let v = args
                .get(i)
                .ok_or_else(|| CliError::Usage("option -v requires an argument".into()))?;
            assignments.push(parse_assignment(v)?);
        } else if let Some(v) = arg.strip_prefix("-v") {
            assignments.push(parse_assignment(v)?);
        } else if arg == "-f" {
            i += 1;
            let f = args
                .get(i)
                .ok_or_else(|| CliError::Usage("option -f requires an argument".into()))?;
            prog_files.push(f.clone());
        } else if let Some(f) = arg.strip_prefix("-f") {
            prog_files.push(f.to_string());
        } else if arg == "-" || !arg.starts_with('-') {
            break;
        } else {
            return Err(CliError::Usage(format!("unknown option: {}", arg)));
        }
        i += 1;
    }
    operands.extend(args[i..].iter().cloned());

    // Program text: -f files (repeatable, - is stdin), else the first operand.
    let source = if prog_files.is_empty() {
        if operands.is_empty() {
            return Err(CliError::Usage("no program text".into()));
        }
        operands.remove(0)
    } else {
        let mut buf = String::new();
        for path in &prog_files {
            if path == "-" {
                io::stdin()
                    .read_to_string(&mut buf)
                    .map_err(|e| CliError::Fatal(format!("tawk: reading program: {}", e)))?;
            } else {
                let text = fs::read_to_string(path)
                    .map_err(|e| CliError::Fatal(format!("tawk: can't open '{}': {}", path, e)))?;
                buf.push_str(&text);
            }
            buf.push('\n');
        }
        buf
    };

    let program = match parse_program(&source) {
        Ok(p) => p,
        Err(e) => {
            let mut msg = e.to_string();
            if let Some(pos) = e.position() {
                msg.push('\n');
                msg.push_str(&source_pointer(&source, pos.line, pos.column));
            }
            return Err(CliError::Fatal(msg));
        }
    };

    let mut interp = Interp::new(&program);
    interp.set_argv0("tawk");
    if let Some(fs) = field_sep {
        interp
            .set_var("FS", &fs)
            .map_err(|e| CliError::Fatal(e.to_string()))?;
    }
    for (name, value) in &assignments {
        interp
            .set_var(name, value)
            .map_err(|e| CliError::Fatal(e.to_string()))?;
    }
    interp.set_args(operands);

    let stdin: Box<dyn BufRead> = Box::new(io::stdin().lock());
    let stdout = io::stdout();
    let mut output = stdout.lock();
    interp
        .run(stdin, &mut output)
        .map_err(|e| CliError::Fatal(e.to_string()))
}

fn parse_assignment(text: &str) -> Result<(String, String), CliError> {
    match text.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(CliError::Usage(format!(
            "-v argument must be name=value: '{}'",
            text
        ))),
    }
}

/// Render the offending source line with a caret under the error column.
fn source_pointer(source: &str, line: usize, column: usize) -> String {
    let Some(text) = source.lines().nth(line.saturating_sub(1)) else {
        return String::new();
    };
    let shown = text.replace('\t', "    ");
    let mut offset = 0;
    for (i, ch) in text.chars().enumerate() {
        if i + 1 >= column {
            break;
        }
        offset += if ch == '\t' { 4 } else { 1 };
    }
    format!("{}\n{}^", shown, " ".repeat(offset))
}
