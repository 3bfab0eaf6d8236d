#![no_main]

use gilstats::uprobe::parse_trace_line;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any trace_pipe line, however mangled, must parse or be skipped
    if let Ok(line) = std::str::from_utf8(data) {
        let _ = parse_trace_line(line);
    }
});
