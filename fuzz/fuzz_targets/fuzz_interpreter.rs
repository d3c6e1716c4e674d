#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::{BufRead, Cursor};
use tawk::{parse_program, Interp};

fuzz_target!(|data: &[u8]| {
    // First third is the program, the rest is input.
    let split = data.len() / 3;
    let (program, input) = data.split_at(split);
    let Ok(program) = std::str::from_utf8(program) else {
        return;
    };
    if program.len() > 4096 || input.len() > 65536 {
        return;
    }
    // Keep the fuzzer away from processes and the filesystem.
    if program.contains("system") || program.contains('|') || program.contains('>') {
        return;
    }

    let Ok(program) = parse_program(program) else {
        return;
    };
    let mut interp = Interp::new(&program);
    let mut output = Vec::new();
    let stdin: Box<dyn BufRead> = Box::new(Cursor::new(input.to_vec()));
    let _ = interp.run(stdin, &mut output);
});
