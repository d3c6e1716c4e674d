#![no_main]

use libfuzzer_sys::fuzz_target;
use tawk::parse_program;

fuzz_target!(|data: &str| {
    let _ = parse_program(data);
});
