#![no_main]

use cadence_state::{parse_run_state_document, render_run_state_document};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(state) = parse_run_state_document(&raw) {
        let rendered = render_run_state_document(&state).expect("render parsed state");
        let reparsed = parse_run_state_document(&rendered).expect("reparse rendered state");
        assert_eq!(reparsed.current_cycle, state.current_cycle);
        assert_eq!(reparsed.improvements.len(), state.improvements.len());
    }
});
