//! Wall-clock helpers.
//!
//! Expiration deadlines are absolute wall-clock times supplied by callers, so
//! all timestamps are milliseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
#[inline]
pub fn now_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

/// Convert a `SystemTime` into epoch milliseconds (0 for pre-epoch times).
#[inline]
pub fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_is_monotonic_enough() {
        let a = now_millis();
        std::thread::sleep(Duration::from_millis(5));
        let b = now_millis();
        assert!(b >= a + 4);
    }

    #[test]
    fn test_to_millis() {
        assert_eq!(to_millis(UNIX_EPOCH + Duration::from_millis(1500)), 1500);
        assert_eq!(to_millis(UNIX_EPOCH), 0);
    }
}
