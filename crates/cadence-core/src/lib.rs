//! Foundational low-level utilities shared across Cadence crates.
//!
//! Provides atomic document writes, corrupt-file quarantine, size-bounded
//! JSON-lines logs, and the unix-millisecond clock helpers used by the state
//! store, the lock manager, and the cycle scheduler.

pub mod atomic_io;
pub mod ndjson_log;
pub mod time_utils;

pub use atomic_io::{quarantine_file, write_text_atomic};
pub use ndjson_log::{LogRetention, NdjsonLog, DEFAULT_LOG_BACKUPS, DEFAULT_LOG_MAX_BYTES};
pub use time_utils::{
    current_unix_timestamp_ms, format_unix_ms_rfc3339, is_deadline_reached,
    parse_rfc3339_unix_ms,
};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn current_unix_timestamp_ms_is_after_2020() {
        assert!(current_unix_timestamp_ms() > 1_577_836_800_000);
    }

    #[test]
    fn is_deadline_reached_respects_none_and_bounds() {
        let now = current_unix_timestamp_ms();
        assert!(!is_deadline_reached(None, now));
        assert!(is_deadline_reached(Some(now), now));
        assert!(is_deadline_reached(Some(now.saturating_sub(1)), now));
        assert!(!is_deadline_reached(Some(now.saturating_add(1)), now));
    }

    #[test]
    fn write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("state.json");
        write_text_atomic(&path, "{\"current_cycle\":3}").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"current_cycle\":3}");
    }
}
