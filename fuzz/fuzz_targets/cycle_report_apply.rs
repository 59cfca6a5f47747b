#![no_main]

use cadence_state::{apply_cycle_report, parse_cycle_report, RunState, COUNTER_CYCLE_SUCCEEDED};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let Ok(report) = parse_cycle_report(&raw) else {
        return;
    };
    let reported = report.improvements.len();
    let mut state = RunState::cold_start(1, None, 0);
    state.begin_cycle();
    apply_cycle_report(&mut state, report, 1, 2);
    assert_eq!(state.improvements.len(), reported);
    assert!(state.improvements.iter().all(|record| !record.kind.is_empty()));
    assert_eq!(state.counter(COUNTER_CYCLE_SUCCEEDED), 0);
});
