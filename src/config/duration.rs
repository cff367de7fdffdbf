//! Human-readable duration values used by environment overrides
//! such as `DEVSTACK_HEALTH_TIMEOUT=90s`.

use std::time::Duration;

/// Parse a duration string like `"500ms"`, `"30s"`, `"5m"`, `"1h"` or a bare
/// number of seconds.
///
/// Returns `None` if the string cannot be parsed.
///
/// ```
/// use devstack::config::parse_duration_string;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration_string("500ms"), Some(Duration::from_millis(500)));
/// assert_eq!(parse_duration_string("5m"), Some(Duration::from_secs(300)));
/// assert_eq!(parse_duration_string("45"), Some(Duration::from_secs(45)));
/// ```
pub fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return None;
    }
    let value: u64 = digits.parse().ok()?;

    match unit.trim() {
        "ms" => Some(Duration::from_millis(value)),
        "" | "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Read a duration override from the environment through `lookup`.
///
/// Unset variables yield `None` silently; unparsable values are reported
/// with a warning and also yield `None` so the caller keeps its default.
pub(crate) fn duration_override<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match parse_duration_string(&raw) {
        Some(d) => Some(d),
        None => {
            tracing::warn!("Ignoring {}='{}': expected a duration like 30s or 5m", key, raw);
            None
        }
    }
}
