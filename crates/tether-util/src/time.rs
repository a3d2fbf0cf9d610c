//! Duration helpers
//!
//! Timeouts are configured in whole milliseconds and reported to humans in
//! seconds, so conversions in both directions live here.

use std::time::Duration;

/// Build a duration from a millisecond count
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Millisecond count of a duration, saturating at `u64::MAX`
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Half of a duration, used when a deadline is split between two attempts
pub fn half(duration: Duration) -> Duration {
    duration / 2
}

/// Render a duration as seconds with at most three decimals and no trailing zeros.
///
/// `10ms` renders as `0.01`, `1500ms` as `1.5`, `2s` as `2`.
pub fn format_seconds(duration: Duration) -> String {
    let rendered = format!("{:.3}", duration.as_secs_f64());
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(millis(10)), "0.01");
        assert_eq!(format_seconds(millis(1500)), "1.5");
        assert_eq!(format_seconds(millis(2000)), "2");
        assert_eq!(format_seconds(millis(1)), "0.001");
        assert_eq!(format_seconds(Duration::ZERO), "0");
    }

    #[test]
    fn test_half() {
        assert_eq!(half(millis(1000)), millis(500));
        assert_eq!(half(millis(100)), millis(50));
        assert_eq!(half(millis(1)), Duration::from_micros(500));
    }

    #[test]
    fn test_millis_roundtrip() {
        assert_eq!(as_millis(millis(1234)), 1234);
        assert_eq!(as_millis(Duration::MAX), u64::MAX);
    }
}
