#![no_main]

use cadence_state::parse_archive_document;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(mut document) = parse_archive_document(&raw) {
        let Some(entry) = document.entries.first().cloned() else {
            return;
        };
        let before = document.entries.len();
        document.upsert_entry(entry);
        assert!(document.entries.len() <= before);
    }
});
