//! Compact duration grammar used throughout rule configurations.
//!
//! Rule expressions carry durations as strings like `10s`, `5m`, `2h` or
//! `1d`. Parsing is total: anything outside the grammar yields zero, which
//! downstream code treats as "no duration".

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static DURATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)([smhd])$").unwrap());

/// Parse a compact duration string into milliseconds.
///
/// Returns 0 for any input outside `^\d+[smhd]$`, including negative
/// numbers, fractions, unknown units, and embedded whitespace.
pub fn parse_duration_ms(input: &str) -> u64 {
    let Some(caps) = DURATION_RE.captures(input) else {
        return 0;
    };
    // Overflowing amounts degrade to 0 rather than panicking.
    let Ok(amount) = caps[1].parse::<u64>() else {
        return 0;
    };
    let unit_ms: u64 = match &caps[2] {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => unreachable!("regex restricts units"),
    };
    amount.saturating_mul(unit_ms)
}

/// Parse a compact duration string into a [`Duration`].
pub fn parse_duration(input: &str) -> Duration {
    Duration::from_millis(parse_duration_ms(input))
}
