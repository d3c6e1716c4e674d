mod builtins;
mod expr;
mod format;
mod io;
mod stmt;

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::rc::Rc;

use regex::Regex;

use crate::ast::{Function, Pattern, Program, Rule};
use crate::error::{Error, Result};
use crate::value::Value;

use io::{InputHandle, InputMode, MainInput, OutputHandle, OutputMode};

/// Non-local control transfers. Each is raised where the statement executes
/// and caught at the matching boundary: loops for `Break`/`Continue`, the
/// record loop for `Next`/`NextFile`, the run loop for `Exit`, and the
/// active call for `Return`.
#[derive(Debug)]
pub(crate) enum Flow {
    Break,
    Continue,
    Next,
    NextFile,
    Exit,
    Return(Value),
}

/// What unwinds out of a statement or expression: a real error or a
/// control-flow signal.
pub(crate) enum Ctrl {
    Error(Error),
    Flow(Flow),
}

impl From<Error> for Ctrl {
    fn from(e: Error) -> Self {
        Ctrl::Error(e)
    }
}

impl From<std::io::Error> for Ctrl {
    fn from(e: std::io::Error) -> Self {
        Ctrl::Error(Error::Io(e))
    }
}

pub(crate) type Res<T> = std::result::Result<T, Ctrl>;

/// One user-function invocation: parameter bindings plus the array slots
/// this frame created (recycled when the frame pops).
struct Frame<'p> {
    func: &'p Function,
    scalars: HashMap<String, Value>,
    arrays: HashMap<String, usize>,
    owned_slots: Vec<usize>,
}

/// Tree-walking AWK interpreter.
///
/// One instance executes one program over one input sequence; nothing is
/// shared between instances, so concurrent interpretation means independent
/// interpreters.
pub struct Interp<'p> {
    program: &'p Program,
    funcs: HashMap<&'p str, &'p Function>,

    globals: HashMap<String, Value>,
    arrays: Vec<HashMap<String, Value>>,
    free_slots: Vec<usize>,
    global_arrays: HashMap<String, usize>,
    frames: Vec<Frame<'p>>,

    // Special globals with dedicated storage
    fs: String,
    ofs: String,
    ors: String,
    subsep: String,
    convfmt: String,
    ofmt: String,
    nr: f64,
    fnr: f64,
    filename: String,
    rstart: f64,
    rlength: f64,
    argc: f64,

    record: String,
    fields: Vec<String>,

    range_on: Vec<bool>,
    regexes: HashMap<String, Rc<Regex>>,

    seed: f64,
    rng: u64,

    exit_code: i32,
    exited: bool,

    outputs: HashMap<(OutputMode, String), OutputHandle>,
    inputs: HashMap<(InputMode, String), InputHandle>,
    main_input: MainInput,
}

const MAX_FIELD_INDEX: usize = 1_000_000;

impl<'p> Interp<'p> {
    pub fn new(program: &'p Program) -> Self {
        let mut funcs = HashMap::new();
        for func in &program.functions {
            funcs.insert(func.name.as_str(), func);
        }

        let environ: HashMap<String, Value> = std::env::vars()
            .map(|(k, v)| (k, Value::from_input(v)))
            .collect();
        let mut argv = HashMap::new();
        argv.insert("0".to_string(), Value::str("awk"));

        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);

        let mut global_arrays = HashMap::new();
        global_arrays.insert("ENVIRON".to_string(), 0);
        global_arrays.insert("ARGV".to_string(), 1);

        Self {
            program,
            funcs,
            globals: HashMap::new(),
            arrays: vec![environ, argv],
            free_slots: Vec::new(),
            global_arrays,
            frames: Vec::new(),
            fs: " ".to_string(),
            ofs: " ".to_string(),
            ors: "\n".to_string(),
            subsep: "\x1c".to_string(),
            convfmt: "%.6g".to_string(),
            ofmt: "%.6g".to_string(),
            nr: 0.0,
            fnr: 0.0,
            filename: String::new(),
            rstart: 0.0,
            rlength: -1.0,
            argc: 1.0,
            record: String::new(),
            fields: Vec::new(),
            range_on: Vec::new(),
            regexes: HashMap::new(),
            seed: seed as f64,
            rng: seed | 1,
            exit_code: 0,
            exited: false,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
            main_input: MainInput::default(),
        }
    }

    /// Set a named global before execution, with command-line assignment
    /// semantics (the value is a StrNum candidate).
    pub fn set_var(&mut self, name: &str, value: &str) -> Result<()> {
        self.set_scalar(name, Value::from_input(value.to_string()))
    }

    /// Name for `ARGV[0]`.
    pub fn set_argv0(&mut self, name: &str) {
        let slot = self.global_arrays["ARGV"];
        self.arrays[slot].insert("0".to_string(), Value::str(name));
    }

    /// Install `ARGV[1..]` and `ARGC`: filenames, `-` for standard input,
    /// and `name=value` assignments applied when reached mid-stream.
    pub fn set_args(&mut self, args: Vec<String>) {
        let slot = self.global_arrays["ARGV"];
        let argv0 = self.arrays[slot]
            .get("0")
            .cloned()
            .unwrap_or(Value::str("awk"));
        self.arrays[slot].clear();
        self.arrays[slot].insert("0".to_string(), argv0);
        self.argc = (args.len() + 1) as f64;
        for (i, arg) in args.into_iter().enumerate() {
            self.arrays[slot].insert((i + 1).to_string(), Value::from_input(arg));
        }
    }

    /// Execute the program. `stdin` backs the empty/`-` input sources;
    /// `output` receives unredirected print/printf. Returns the exit status.
    pub fn run<W: Write>(&mut self, stdin: Box<dyn BufRead>, output: &mut W) -> Result<i32> {
        self.main_input.reset(stdin);
        self.range_on = vec![false; self.program.rules.len()];
        self.exited = false;

        let result = self.run_program(output);
        let cleanup = self.teardown(output);
        let code = result?;
        cleanup?;
        Ok(code)
    }

    fn run_program(&mut self, out: &mut dyn Write) -> Result<i32> {
        // BEGIN rules
        for rule in &self.program.rules {
            if !matches!(rule.pattern, Pattern::Begin) {
                continue;
            }
            if let Some(action) = &rule.action {
                match self.exec_stmts(action, out) {
                    Ok(()) => {}
                    Err(Ctrl::Flow(Flow::Exit)) => {
                        self.exited = true;
                        break;
                    }
                    Err(Ctrl::Flow(_)) => {
                        return Err(Error::runtime("next used inside BEGIN"));
                    }
                    Err(Ctrl::Error(e)) => return Err(e),
                }
            }
        }

        let has_main = self
            .program
            .rules
            .iter()
            .any(|r| !matches!(r.pattern, Pattern::Begin | Pattern::End));
        let has_end = self
            .program
            .rules
            .iter()
            .any(|r| matches!(r.pattern, Pattern::End));

        if !self.exited && (has_main || has_end) {
            self.record_loop(out)?;
        }

        // END rules run once, even after exit
        for rule in &self.program.rules {
            if !matches!(rule.pattern, Pattern::End) {
                continue;
            }
            if let Some(action) = &rule.action {
                match self.exec_stmts(action, out) {
                    Ok(()) => {}
                    Err(Ctrl::Flow(Flow::Exit)) => break,
                    Err(Ctrl::Flow(_)) => {
                        return Err(Error::runtime("next used inside END"));
                    }
                    Err(Ctrl::Error(e)) => return Err(e),
                }
            }
        }

        Ok(self.exit_code)
    }

    fn record_loop(&mut self, out: &mut dyn Write) -> Result<i32> {
        'records: loop {
            let Some(line) = self.next_main_record()? else {
                break;
            };
            self.set_record(line).map_err(Ctrl::into_error)?;

            for ri in 0..self.program.rules.len() {
                let rule: &Rule = &self.program.rules[ri];
                if matches!(rule.pattern, Pattern::Begin | Pattern::End) {
                    continue;
                }

                let matched = match self.rule_matches(ri, out) {
                    Ok(m) => m,
                    Err(Ctrl::Flow(Flow::Next)) => continue 'records,
                    Err(Ctrl::Flow(Flow::NextFile)) => {
                        self.main_input.current = None;
                        continue 'records;
                    }
                    Err(Ctrl::Flow(Flow::Exit)) => {
                        self.exited = true;
                        break 'records;
                    }
                    Err(Ctrl::Flow(_)) => {
                        return Err(Error::runtime("break or continue outside a loop"));
                    }
                    Err(Ctrl::Error(e)) => return Err(e),
                };
                if !matched {
                    continue;
                }

                match &self.program.rules[ri].action {
                    Some(action) => match self.exec_stmts(action, out) {
                        Ok(()) => {}
                        Err(Ctrl::Flow(Flow::Next)) => continue 'records,
                        Err(Ctrl::Flow(Flow::NextFile)) => {
                            self.main_input.current = None;
                            continue 'records;
                        }
                        Err(Ctrl::Flow(Flow::Exit)) => {
                            self.exited = true;
                            break 'records;
                        }
                        Err(Ctrl::Flow(_)) => {
                            return Err(Error::runtime("break or continue outside a loop"));
                        }
                        Err(Ctrl::Error(e)) => return Err(e),
                    },
                    None => {
                        // Default action: print the record
                        out.write_all(self.record.as_bytes())?;
                        out.write_all(self.ors.as_bytes())?;
                    }
                }
            }
        }
        Ok(self.exit_code)
    }

    fn rule_matches(&mut self, ri: usize, out: &mut dyn Write) -> Res<bool> {
        match &self.program.rules[ri].pattern {
            Pattern::Always => Ok(true),
            Pattern::Begin | Pattern::End => Ok(false),
            Pattern::Expr(e) => Ok(self.eval(e, out)?.is_truthy()),
            Pattern::Range(start, end) => {
                if !self.range_on[ri] {
                    if self.eval(start, out)?.is_truthy() {
                        self.range_on[ri] = true;
                        return Ok(true);
                    }
                    Ok(false)
                } else {
                    // The end test is only consulted once the range is on.
                    if self.eval(end, out)?.is_truthy() {
                        self.range_on[ri] = false;
                    }
                    Ok(true)
                }
            }
        }
    }

    // ===== Record and fields =====

    pub(crate) fn set_record(&mut self, record: String) -> Res<()> {
        self.record = record;
        self.split_record()
    }

    fn split_record(&mut self) -> Res<()> {
        self.fields.clear();
        if self.record.is_empty() {
            return Ok(());
        }
        if self.fs == " " {
            self.fields
                .extend(self.record.split_whitespace().map(String::from));
        } else if self.fs.chars().count() == 1 {
            let sep = self.fs.chars().next().unwrap();
            self.fields.extend(self.record.split(sep).map(String::from));
        } else {
            let re = self.regex(&self.fs.clone()).map_err(Ctrl::Error)?;
            self.fields.extend(re.split(&self.record).map(String::from));
        }
        Ok(())
    }

    pub(crate) fn nf(&self) -> usize {
        self.fields.len()
    }

    pub(crate) fn get_field(&self, index: usize) -> &str {
        if index == 0 {
            &self.record
        } else {
            self.fields.get(index - 1).map(String::as_str).unwrap_or("")
        }
    }

    /// Resolve a `$e` index, rejecting negative and absurd values.
    pub(crate) fn field_index(&self, n: f64) -> Res<usize> {
        let i = n.trunc();
        if i < 0.0 {
            return Err(Ctrl::Error(Error::runtime(format!(
                "field index negative: {}",
                i
            ))));
        }
        if i > MAX_FIELD_INDEX as f64 {
            return Err(Ctrl::Error(Error::runtime(format!(
                "field index too large: {}",
                i
            ))));
        }
        Ok(i as usize)
    }

    pub(crate) fn set_field(&mut self, index: usize, value: String) -> Res<()> {
        if index == 0 {
            return self.set_record(value);
        }
        if self.fields.len() < index {
            self.fields.resize(index, String::new());
        }
        self.fields[index - 1] = value;
        self.rebuild_record();
        Ok(())
    }

    fn set_nf(&mut self, n: usize) {
        self.fields.resize(n.min(MAX_FIELD_INDEX), String::new());
        self.rebuild_record();
    }

    fn rebuild_record(&mut self) {
        self.record = self.fields.join(&self.ofs);
    }

    // ===== Scalar variables =====

    fn local_frame(&self, name: &str) -> Option<&Frame<'p>> {
        self.frames
            .last()
            .filter(|f| f.func.params.iter().any(|p| p == name))
    }

    pub(crate) fn get_scalar(&self, name: &str) -> Res<Value> {
        if let Some(frame) = self.local_frame(name) {
            if frame.arrays.contains_key(name) {
                return Err(Ctrl::Error(Error::runtime(format!(
                    "can't use array '{}' in scalar context",
                    name
                ))));
            }
            return Ok(frame.scalars.get(name).cloned().unwrap_or_default());
        }
        let value = match name {
            "FS" => Value::str(self.fs.clone()),
            "OFS" => Value::str(self.ofs.clone()),
            "ORS" => Value::str(self.ors.clone()),
            "RS" => Value::str("\n"),
            "SUBSEP" => Value::str(self.subsep.clone()),
            "CONVFMT" => Value::str(self.convfmt.clone()),
            "OFMT" => Value::str(self.ofmt.clone()),
            "NR" => Value::num(self.nr),
            "FNR" => Value::num(self.fnr),
            "NF" => Value::num(self.nf() as f64),
            "FILENAME" => Value::str(self.filename.clone()),
            "RSTART" => Value::num(self.rstart),
            "RLENGTH" => Value::num(self.rlength),
            "ARGC" => Value::num(self.argc),
            _ => self.globals.get(name).cloned().unwrap_or_default(),
        };
        Ok(value)
    }

    pub(crate) fn set_scalar(&mut self, name: &str, value: Value) -> Result<()> {
        if self.local_frame(name).is_some() {
            let frame = self.frames.last_mut().unwrap();
            if frame.arrays.contains_key(name) {
                return Err(Error::runtime(format!(
                    "can't use array '{}' in scalar context",
                    name
                )));
            }
            frame.scalars.insert(name.to_string(), value);
            return Ok(());
        }
        match name {
            "FS" => self.fs = value.into_str(&self.convfmt),
            "OFS" => self.ofs = value.into_str(&self.convfmt),
            "ORS" => self.ors = value.into_str(&self.convfmt),
            "RS" => {
                return Err(Error::runtime("RS is read-only (records are newline-separated)"));
            }
            "SUBSEP" => self.subsep = value.into_str(&self.convfmt),
            "CONVFMT" => self.convfmt = value.into_str(&self.convfmt),
            "OFMT" => self.ofmt = value.into_str(&self.convfmt),
            "NR" => self.nr = value.to_num(),
            "FNR" => self.fnr = value.to_num(),
            "NF" => {
                let n = value.to_num();
                self.set_nf(if n < 0.0 { 0 } else { n as usize });
            }
            "FILENAME" => self.filename = value.into_str(&self.convfmt),
            "RSTART" => self.rstart = value.to_num(),
            "RLENGTH" => self.rlength = value.to_num(),
            "ARGC" => self.argc = value.to_num(),
            _ => {
                self.globals.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    // ===== Arrays =====

    fn new_slot(&mut self) -> usize {
        if let Some(slot) = self.free_slots.pop() {
            self.arrays[slot].clear();
            slot
        } else {
            self.arrays.push(HashMap::new());
            self.arrays.len() - 1
        }
    }

    /// Arena slot for the array `name` in the current scope, created on
    /// first use.
    pub(crate) fn array_slot(&mut self, name: &str) -> usize {
        let is_local = self
            .frames
            .last()
            .is_some_and(|f| f.func.params.iter().any(|p| p == name));
        if is_local {
            if let Some(&slot) = self.frames.last().unwrap().arrays.get(name) {
                return slot;
            }
            let slot = self.new_slot();
            let frame = self.frames.last_mut().unwrap();
            frame.arrays.insert(name.to_string(), slot);
            frame.owned_slots.push(slot);
            slot
        } else if let Some(&slot) = self.global_arrays.get(name) {
            slot
        } else {
            let slot = self.new_slot();
            self.global_arrays.insert(name.to_string(), slot);
            slot
        }
    }

    /// Whether `name` is bound to an array right now (for `length(arr)`).
    pub(crate) fn is_array(&self, name: &str) -> bool {
        if let Some(frame) = self.local_frame(name) {
            return frame.arrays.contains_key(name);
        }
        self.global_arrays.contains_key(name)
    }

    /// Join subscript values into a composite key with SUBSEP.
    pub(crate) fn make_key(&mut self, index: &[crate::ast::Expr], out: &mut dyn Write) -> Res<String> {
        let mut parts = Vec::with_capacity(index.len());
        for e in index {
            let v = self.eval(e, out)?;
            parts.push(v.into_str(&self.convfmt));
        }
        Ok(parts.join(&self.subsep))
    }

    // ===== Call frames =====

    pub(crate) fn push_frame(
        &mut self,
        func: &'p Function,
        scalars: HashMap<String, Value>,
        arrays: HashMap<String, usize>,
        owned_slots: Vec<usize>,
    ) {
        self.frames.push(Frame {
            func,
            scalars,
            arrays,
            owned_slots,
        });
    }

    pub(crate) fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            for slot in frame.owned_slots {
                self.arrays[slot].clear();
                self.free_slots.push(slot);
            }
        }
    }

    pub(crate) fn function(&self, name: &str) -> Option<&'p Function> {
        self.funcs.get(name).copied()
    }

    // ===== Regex cache =====

    pub(crate) fn regex(&mut self, pattern: &str) -> Result<Rc<Regex>> {
        if let Some(re) = self.regexes.get(pattern) {
            return Ok(re.clone());
        }
        let re = Rc::new(Regex::new(pattern)?);
        self.regexes.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    // ===== Random numbers (xorshift64) =====

    pub(crate) fn next_rand(&mut self) -> f64 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    pub(crate) fn reseed(&mut self, seed: Option<f64>) -> f64 {
        let prev = self.seed;
        let seed = seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as f64)
                .unwrap_or(0.0)
        });
        self.seed = seed;
        self.rng = (seed as i64 as u64) | 1;
        prev
    }

    pub(crate) fn set_exit_code(&mut self, code: i32) {
        self.exit_code = code;
    }

    pub(crate) fn ofmt(&self) -> &str {
        &self.ofmt
    }

    pub(crate) fn convfmt(&self) -> &str {
        &self.convfmt
    }

    pub(crate) fn record(&self) -> &str {
        &self.record
    }

    pub(crate) fn ofs(&self) -> &str {
        &self.ofs
    }

    pub(crate) fn ors(&self) -> &str {
        &self.ors
    }
}

impl Ctrl {
    /// Collapse a control signal that escaped to the top level.
    fn into_error(self) -> Error {
        match self {
            Ctrl::Error(e) => e,
            Ctrl::Flow(_) => Error::runtime("control flow escaped the interpreter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use std::io::Cursor;

    fn run_awk(program: &str, input: &str) -> String {
        let program = parse_program(program).unwrap();
        let mut interp = Interp::new(&program);
        let mut output = Vec::new();
        let stdin: Box<dyn BufRead> = Box::new(Cursor::new(input.as_bytes().to_vec()));
        interp.run(stdin, &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn begin_print() {
        assert_eq!(run_awk(r#"BEGIN { print "hello" }"#, ""), "hello\n");
    }

    #[test]
    fn print_fields() {
        assert_eq!(run_awk("{ print $1 }", "one two three"), "one\n");
        assert_eq!(run_awk("{ print $1, $3 }", "one two three"), "one three\n");
        assert_eq!(run_awk("{ print $0 }", "  spaced   out  "), "  spaced   out  \n");
    }

    #[test]
    fn nf_and_last_field() {
        assert_eq!(run_awk("{ print NF }", "a b c d"), "4\n");
        assert_eq!(run_awk("{ print $NF }", "a b c d"), "d\n");
    }

    #[test]
    fn field_assignment_rebuilds_record() {
        assert_eq!(run_awk("{ $2 = \"X\"; print $0 }", "a b c"), "a X c\n");
        assert_eq!(run_awk("{ $5 = \"e\"; print $0; print NF }", "a b"), "a b   e\n5\n");
    }

    #[test]
    fn nf_assignment_truncates() {
        assert_eq!(run_awk("{ NF = 2; print $0 }", "a b c d"), "a b\n");
    }

    #[test]
    fn fs_single_char_preserves_empties() {
        assert_eq!(run_awk("BEGIN { FS=\":\" } { print NF }", "a::b"), "3\n");
    }

    #[test]
    fn fs_regex() {
        assert_eq!(run_awk("BEGIN { FS=\", *\" } { print $2 }", "a,  b, c"), "b\n");
    }

    #[test]
    fn pattern_matching() {
        assert_eq!(run_awk("/two/", "one\ntwo\nthree"), "two\n");
        assert_eq!(run_awk("$1 > 2 { print $1 }", "1\n3\n2\n5"), "3\n5\n");
    }

    #[test]
    fn range_pattern() {
        assert_eq!(
            run_awk("/start/,/stop/", "a\nstart\nb\nstop\nc"),
            "start\nb\nstop\n"
        );
    }

    #[test]
    fn range_end_checked_on_later_records() {
        // Start and stop on the same record leaves the range on.
        assert_eq!(
            run_awk("/x/,/x/", "a\nx\nb\nx\nc"),
            "x\nb\nx\n"
        );
    }

    #[test]
    fn next_statement() {
        assert_eq!(
            run_awk("/skip/ { next } { print }", "a\nskip\nb"),
            "a\nb\n"
        );
    }

    #[test]
    fn exit_runs_end() {
        assert_eq!(
            run_awk("BEGIN { exit } END { print \"bye\" }", ""),
            "bye\n"
        );
    }

    #[test]
    fn exit_status_propagates() {
        let program = parse_program("BEGIN { exit 7 } END { print \"bye\" }").unwrap();
        let mut interp = Interp::new(&program);
        let mut output = Vec::new();
        let stdin: Box<dyn BufRead> = Box::new(Cursor::new(Vec::new()));
        let code = interp.run(stdin, &mut output).unwrap();
        assert_eq!(code, 7);
        assert_eq!(output, b"bye\n");
    }

    #[test]
    fn end_sees_input() {
        // END-only programs still consume input so NR is meaningful.
        assert_eq!(run_awk("END { print NR }", "a\nb\nc"), "3\n");
    }

    #[test]
    fn uninitialized_variables() {
        assert_eq!(run_awk("BEGIN { print x+0, \"<\" x \">\" }", ""), "0 <>\n");
    }

    #[test]
    fn rs_is_read_only() {
        let program = parse_program("BEGIN { RS = \"x\" }").unwrap();
        let mut interp = Interp::new(&program);
        let mut output = Vec::new();
        let stdin: Box<dyn BufRead> = Box::new(Cursor::new(Vec::new()));
        assert!(interp.run(stdin, &mut output).is_err());
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let program = parse_program("BEGIN { print 1/0 }").unwrap();
        let mut interp = Interp::new(&program);
        let mut output = Vec::new();
        let stdin: Box<dyn BufRead> = Box::new(Cursor::new(Vec::new()));
        assert!(interp.run(stdin, &mut output).is_err());
    }
}
