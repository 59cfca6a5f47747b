use chrono::{DateTime, SecondsFormat, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `deadline_unix_ms` is present and no longer in the future.
pub fn is_deadline_reached(deadline_unix_ms: Option<u64>, now_unix_ms: u64) -> bool {
    matches!(deadline_unix_ms, Some(value) if value <= now_unix_ms)
}

/// Parses an RFC 3339 timestamp into unix milliseconds.
pub fn parse_rfc3339_unix_ms(raw: &str) -> Result<u64, String> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|error| format!("invalid RFC 3339 timestamp '{raw}': {error}"))?;
    u64::try_from(parsed.timestamp_millis())
        .map_err(|_| format!("timestamp '{raw}' is before the unix epoch"))
}

/// Renders unix milliseconds as an RFC 3339 UTC string.
pub fn format_unix_ms_rfc3339(unix_ms: u64) -> String {
    i64::try_from(unix_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|value| value.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| format!("unix_ms:{unix_ms}"))
}
