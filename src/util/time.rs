//! Wall-clock helpers for record timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Capture timestamps only need millisecond resolution; a clock set before
/// the epoch yields 0 rather than panicking inside an intercept.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let a = timestamp_ms();
        let b = timestamp_ms();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000); // after 2017
    }
}
