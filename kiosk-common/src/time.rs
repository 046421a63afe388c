//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Seconds elapsed since `since`, saturating at zero for clock skew
pub fn seconds_since(since: DateTime<Utc>) -> u64 {
    (now() - since).num_seconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
    }

    #[test]
    fn test_millis_to_duration_one_second() {
        let duration = millis_to_duration(1000);
        assert_eq!(duration, Duration::from_secs(1));
    }

    #[test]
    fn test_seconds_since_future_is_zero() {
        let future = now() + chrono::Duration::seconds(120);
        assert_eq!(seconds_since(future), 0);
    }

    #[test]
    fn test_seconds_since_past() {
        let past = now() - chrono::Duration::seconds(90);
        let elapsed = seconds_since(past);
        assert!((90..=91).contains(&elapsed));
    }
}
