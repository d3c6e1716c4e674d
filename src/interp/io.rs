use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, Command, Stdio};

use crate::ast::{Expr, GetlineSource, Redirect};
use crate::error::{Error, Result};
use crate::value::Value;

use super::{Ctrl, Interp, Res};

/// Mode half of an output-handle key. `print > f` and `print >> f` address
/// distinct handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OutputMode {
    File,
    Append,
    Pipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum InputMode {
    File,
    Pipe,
}

pub(crate) struct OutputHandle {
    writer: BufWriter<Box<dyn Write>>,
    child: Option<Child>,
}

pub(crate) struct InputHandle {
    reader: Box<dyn BufRead>,
    child: Option<Child>,
}

/// The main-input cursor: walks `ARGV[1..ARGC-1]`, applying `name=value`
/// assignments in place, opening files, and falling back to the embedder's
/// stdin for `-` or an effectively empty argument list.
#[derive(Default)]
pub(crate) struct MainInput {
    stdin: Option<Box<dyn BufRead>>,
    pub(crate) current: Option<Box<dyn BufRead>>,
    next_arg: usize,
    opened_file: bool,
    used_stdin: bool,
}

impl MainInput {
    pub(crate) fn reset(&mut self, stdin: Box<dyn BufRead>) {
        self.stdin = Some(stdin);
        self.current = None;
        self.next_arg = 0;
        self.opened_file = false;
        self.used_stdin = false;
    }
}

/// Read one newline-terminated record; a trailing record without a newline
/// is accepted.
fn read_record(reader: &mut dyn BufRead) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(Some(line))
}

fn split_assignment(arg: &str) -> Option<(&str, &str)> {
    let (name, value) = arg.split_once('=')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first == '_' || first.is_ascii_alphabetic()) {
        return None;
    }
    if !chars.all(|c| c == '_' || c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((name, value))
}

impl<'p> Interp<'p> {
    /// Next record from the main input, bumping `NR`/`FNR`. Shared between
    /// the record loop and the plain `getline` forms.
    pub(crate) fn next_main_record(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(reader) = self.main_input.current.as_mut() {
                if let Some(line) = read_record(reader.as_mut())? {
                    self.nr += 1.0;
                    self.fnr += 1.0;
                    return Ok(Some(line));
                }
                self.main_input.current = None;
            }
            if !self.advance_input_source()? {
                return Ok(None);
            }
        }
    }

    fn advance_input_source(&mut self) -> Result<bool> {
        loop {
            let i = self.main_input.next_arg;
            if (i as f64) < self.argc {
                self.main_input.next_arg += 1;
                if i == 0 {
                    continue;
                }
                let slot = self.global_arrays["ARGV"];
                let arg = self.arrays[slot]
                    .get(&i.to_string())
                    .map(|v| v.as_str(&self.convfmt).into_owned())
                    .unwrap_or_default();
                if arg.is_empty() {
                    continue;
                }
                if let Some((name, value)) = split_assignment(&arg) {
                    let value = Value::from_input(value.to_string());
                    self.set_scalar(name, value)?;
                    continue;
                }
                if arg == "-" {
                    let Some(reader) = self.main_input.stdin.take() else {
                        continue;
                    };
                    self.main_input.opened_file = true;
                    self.filename = String::new();
                    self.fnr = 0.0;
                    self.main_input.current = Some(reader);
                    return Ok(true);
                }
                let file = File::open(&arg)
                    .map_err(|e| Error::runtime(format!("can't open file '{}': {}", arg, e)))?;
                self.main_input.opened_file = true;
                self.filename = arg;
                self.fnr = 0.0;
                self.main_input.current = Some(Box::new(BufReader::new(file)));
                return Ok(true);
            }

            // ARGV exhausted; with no file operands, read the embedder's stdin.
            if !self.main_input.opened_file && !self.main_input.used_stdin {
                self.main_input.used_stdin = true;
                if let Some(reader) = self.main_input.stdin.take() {
                    self.filename = String::new();
                    self.fnr = 0.0;
                    self.main_input.current = Some(reader);
                    return Ok(true);
                }
            }
            return Ok(false);
        }
    }

    /// Evaluate any of the four getline forms. Returns 1 on success, 0 at
    /// end of input, -1 on I/O error.
    pub(crate) fn eval_getline(
        &mut self,
        source: &GetlineSource,
        target: Option<&Expr>,
        out: &mut dyn Write,
    ) -> Res<Value> {
        match source {
            GetlineSource::Main => {
                // Failure to open a main input file stays fatal here, like
                // the record loop.
                match self.next_main_record().map_err(Ctrl::Error)? {
                    None => Ok(Value::num(0.0)),
                    Some(line) => {
                        match target {
                            None => self.set_record(line)?,
                            Some(lv) => self.assign(lv, Value::from_input(line), out)?,
                        }
                        Ok(Value::num(1.0))
                    }
                }
            }
            GetlineSource::File(name_expr) => {
                let name = self.eval(name_expr, out)?.into_str(&self.convfmt);
                let key = (InputMode::File, name.clone());
                if !self.inputs.contains_key(&key) {
                    match File::open(&name) {
                        Ok(f) => {
                            self.inputs.insert(
                                key.clone(),
                                InputHandle {
                                    reader: Box::new(BufReader::new(f)),
                                    child: None,
                                },
                            );
                        }
                        Err(_) => return Ok(Value::num(-1.0)),
                    }
                }
                let handle = self.inputs.get_mut(&key).unwrap();
                match read_record(handle.reader.as_mut()) {
                    Err(_) => Ok(Value::num(-1.0)),
                    Ok(None) => Ok(Value::num(0.0)),
                    Ok(Some(line)) => {
                        match target {
                            None => self.set_record(line)?,
                            Some(lv) => self.assign(lv, Value::from_input(line), out)?,
                        }
                        Ok(Value::num(1.0))
                    }
                }
            }
            GetlineSource::Cmd(cmd_expr) => {
                let cmd = self.eval(cmd_expr, out)?.into_str(&self.convfmt);
                let key = (InputMode::Pipe, cmd.clone());
                if !self.inputs.contains_key(&key) {
                    out.flush().map_err(Error::Io).map_err(Ctrl::Error)?;
                    let spawned = Command::new("sh")
                        .arg("-c")
                        .arg(&cmd)
                        .stdout(Stdio::piped())
                        .spawn();
                    match spawned {
                        Ok(mut child) => {
                            let stdout = child.stdout.take().expect("piped stdout");
                            self.inputs.insert(
                                key.clone(),
                                InputHandle {
                                    reader: Box::new(BufReader::new(stdout)),
                                    child: Some(child),
                                },
                            );
                        }
                        Err(_) => return Ok(Value::num(-1.0)),
                    }
                }
                let handle = self.inputs.get_mut(&key).unwrap();
                match read_record(handle.reader.as_mut()) {
                    Err(_) => Ok(Value::num(-1.0)),
                    Ok(None) => Ok(Value::num(0.0)),
                    Ok(Some(line)) => {
                        self.nr += 1.0;
                        match target {
                            None => self.set_record(line)?,
                            Some(lv) => self.assign(lv, Value::from_input(line), out)?,
                        }
                        Ok(Value::num(1.0))
                    }
                }
            }
        }
    }

    /// Write print/printf output, redirected or not. Output errors are fatal.
    pub(crate) fn write_output(
        &mut self,
        bytes: &[u8],
        redirect: Option<&Redirect>,
        out: &mut dyn Write,
    ) -> Res<()> {
        let (mode, target_expr) = match redirect {
            None => {
                out.write_all(bytes).map_err(Error::Io).map_err(Ctrl::Error)?;
                return Ok(());
            }
            Some(Redirect::File(e)) => (OutputMode::File, e),
            Some(Redirect::Append(e)) => (OutputMode::Append, e),
            Some(Redirect::Pipe(e)) => (OutputMode::Pipe, e),
        };
        let target = self.eval(target_expr, out)?.into_str(&self.convfmt);
        let handle = self.output_handle(mode, &target, out).map_err(Ctrl::Error)?;
        handle
            .writer
            .write_all(bytes)
            .map_err(|e| Ctrl::Error(Error::runtime(format!("write to '{}' failed: {}", target, e))))
    }

    fn output_handle(
        &mut self,
        mode: OutputMode,
        target: &str,
        out: &mut dyn Write,
    ) -> Result<&mut OutputHandle> {
        let key = (mode, target.to_string());
        if !self.outputs.contains_key(&key) {
            let handle = match mode {
                OutputMode::File => {
                    let f = File::create(target).map_err(|e| {
                        Error::runtime(format!("can't redirect to '{}': {}", target, e))
                    })?;
                    OutputHandle {
                        writer: BufWriter::new(Box::new(f)),
                        child: None,
                    }
                }
                OutputMode::Append => {
                    let f = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(target)
                        .map_err(|e| {
                            Error::runtime(format!("can't redirect to '{}': {}", target, e))
                        })?;
                    OutputHandle {
                        writer: BufWriter::new(Box::new(f)),
                        child: None,
                    }
                }
                OutputMode::Pipe => {
                    // Order output: anything already printed comes first.
                    out.flush()?;
                    let mut child = Command::new("sh")
                        .arg("-c")
                        .arg(target)
                        .stdin(Stdio::piped())
                        .spawn()
                        .map_err(|e| {
                            Error::runtime(format!("can't start command '{}': {}", target, e))
                        })?;
                    let stdin = child.stdin.take().expect("piped stdin");
                    OutputHandle {
                        writer: BufWriter::new(Box::new(stdin)),
                        child: Some(child),
                    }
                }
            };
            self.outputs.insert(key.clone(), handle);
        }
        Ok(self.outputs.get_mut(&key).unwrap())
    }

    /// `close(expr)`: close every handle whose target string matches,
    /// surfacing a pipe's exit status. Returns -1 when nothing matched.
    pub(crate) fn close_target(&mut self, target: &str) -> f64 {
        let mut found = false;
        let mut status = 0.0;

        let out_keys: Vec<_> = self
            .outputs
            .keys()
            .filter(|(_, t)| t == target)
            .cloned()
            .collect();
        for key in out_keys {
            if let Some(handle) = self.outputs.remove(&key) {
                found = true;
                status = close_output(handle).unwrap_or(status);
            }
        }

        let in_keys: Vec<_> = self
            .inputs
            .keys()
            .filter(|(_, t)| t == target)
            .cloned()
            .collect();
        for key in in_keys {
            if let Some(handle) = self.inputs.remove(&key) {
                found = true;
                status = close_input(handle).unwrap_or(status);
            }
        }

        if found { status } else { -1.0 }
    }

    /// `fflush([target])`.
    pub(crate) fn flush_target(&mut self, target: Option<&str>, out: &mut dyn Write) -> Res<f64> {
        match target {
            None | Some("") => {
                out.flush().map_err(Error::Io).map_err(Ctrl::Error)?;
                if target.is_none() {
                    for handle in self.outputs.values_mut() {
                        handle
                            .writer
                            .flush()
                            .map_err(Error::Io)
                            .map_err(Ctrl::Error)?;
                    }
                }
                Ok(0.0)
            }
            Some(name) => {
                let mut found = false;
                for ((_, t), handle) in self.outputs.iter_mut() {
                    if t == name {
                        handle
                            .writer
                            .flush()
                            .map_err(Error::Io)
                            .map_err(Ctrl::Error)?;
                        found = true;
                    }
                }
                Ok(if found { 0.0 } else { -1.0 })
            }
        }
    }

    /// Flush pending output for an external command (`system`, pipes).
    pub(crate) fn flush_all_output(&mut self, out: &mut dyn Write) -> Result<()> {
        out.flush()?;
        for handle in self.outputs.values_mut() {
            handle.writer.flush()?;
        }
        Ok(())
    }

    /// Release every handle at program end; the first error wins.
    pub(crate) fn teardown(&mut self, out: &mut dyn Write) -> Result<()> {
        let mut first_err: Option<Error> = None;

        for (_, handle) in std::mem::take(&mut self.outputs) {
            if let Err(e) = close_output(handle) {
                first_err.get_or_insert(Error::Io(e));
            }
        }
        for (_, handle) in std::mem::take(&mut self.inputs) {
            let _ = close_input(handle);
        }
        self.main_input.current = None;
        self.main_input.stdin = None;

        if let Err(e) = out.flush() {
            first_err.get_or_insert(Error::Io(e));
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn close_output(mut handle: OutputHandle) -> std::result::Result<f64, std::io::Error> {
    handle.writer.flush()?;
    drop(handle.writer);
    if let Some(mut child) = handle.child {
        let status = child.wait()?;
        return Ok(status.code().unwrap_or(-1) as f64);
    }
    Ok(0.0)
}

fn close_input(handle: InputHandle) -> std::result::Result<f64, std::io::Error> {
    drop(handle.reader);
    if let Some(mut child) = handle.child {
        let status = child.wait()?;
        return Ok(status.code().unwrap_or(-1) as f64);
    }
    Ok(0.0)
}
