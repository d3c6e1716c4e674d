//! Integration tests for the tawk binary.

use std::io::Write;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

struct CliResult {
    stdout: String,
    stderr: String,
    code: i32,
}

fn run_tawk(args: &[&str], input: Option<&str>) -> CliResult {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tawk"));
    cmd.args(args);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().expect("spawn tawk");
    if let Some(text) = input {
        child
            .stdin
            .as_mut()
            .unwrap()
            .write_all(text.as_bytes())
            .unwrap();
    }
    drop(child.stdin.take());

    let output = child.wait_with_output().expect("wait for tawk");
    CliResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code().unwrap_or(-1),
    }
}

#[test]
fn simple_program() {
    let r = run_tawk(&["BEGIN { print \"hello\" }"], None);
    assert_eq!(r.stdout, "hello\n");
    assert_eq!(r.code, 0);
}

#[test]
fn reads_stdin() {
    let r = run_tawk(&["{ print $2 }"], Some("a b c\n"));
    assert_eq!(r.stdout, "b\n");
}

#[test]
fn field_separator_flag() {
    let r = run_tawk(&["-F", ":", "{ print $1 }"], Some("x:y:z\n"));
    assert_eq!(r.stdout, "x\n");
    let r = run_tawk(&["-F:", "{ print $2 }"], Some("x:y:z\n"));
    assert_eq!(r.stdout, "y\n");
}

#[test]
fn variable_assignment_flag() {
    let r = run_tawk(&["-v", "greeting=hi", "BEGIN { print greeting }"], None);
    assert_eq!(r.stdout, "hi\n");
    // -v values are strnums
    let r = run_tawk(&["-v", "n=010", "BEGIN { print (n == 10) }"], None);
    assert_eq!(r.stdout, "1\n");
}

#[test]
fn program_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "BEGIN {{ print \"from file\" }}").unwrap();
    let r = run_tawk(&["-f", file.path().to_str().unwrap()], None);
    assert_eq!(r.stdout, "from file\n");
}

#[test]
fn multiple_program_files_concatenate() {
    let mut f1 = NamedTempFile::new().unwrap();
    writeln!(f1, "BEGIN {{ print \"one\" }}").unwrap();
    let mut f2 = NamedTempFile::new().unwrap();
    writeln!(f2, "BEGIN {{ print \"two\" }}").unwrap();
    let r = run_tawk(
        &[
            "-f",
            f1.path().to_str().unwrap(),
            "-f",
            f2.path().to_str().unwrap(),
        ],
        None,
    );
    assert_eq!(r.stdout, "one\ntwo\n");
}

#[test]
fn file_operands() {
    let mut f1 = NamedTempFile::new().unwrap();
    writeln!(f1, "a").unwrap();
    let mut f2 = NamedTempFile::new().unwrap();
    writeln!(f2, "b").unwrap();
    let r = run_tawk(
        &[
            "{ print }",
            f1.path().to_str().unwrap(),
            f2.path().to_str().unwrap(),
        ],
        None,
    );
    assert_eq!(r.stdout, "a\nb\n");
}

#[test]
fn dash_reads_stdin() {
    let r = run_tawk(&["{ print }", "-"], Some("via stdin\n"));
    assert_eq!(r.stdout, "via stdin\n");
}

#[test]
fn exit_status_from_program() {
    let r = run_tawk(&["BEGIN { exit 7 }"], None);
    assert_eq!(r.code, 7);
}

#[test]
fn usage_error_without_program() {
    let r = run_tawk(&[], None);
    assert_eq!(r.code, 2);
    assert!(r.stderr.contains("usage"));
}

#[test]
fn unknown_option_is_usage_error() {
    let r = run_tawk(&["--bogus", "1"], None);
    assert_eq!(r.code, 2);
}

#[test]
fn parse_error_renders_caret() {
    let r = run_tawk(&["BEGIN { x = }"], None);
    assert_eq!(r.code, 1);
    assert!(r.stderr.contains("parse error"), "{}", r.stderr);
    assert!(r.stderr.contains('^'), "{}", r.stderr);
}

#[test]
fn runtime_error_exits_nonzero() {
    let r = run_tawk(&["BEGIN { print 1 / 0 }"], None);
    assert_eq!(r.code, 1);
    assert!(r.stderr.contains("division by zero"));
}

#[test]
fn missing_input_file_is_fatal() {
    let r = run_tawk(&["{ print }", "/no/such/input/file"], None);
    assert_eq!(r.code, 1);
    assert!(r.stderr.contains("can't open"));
}
