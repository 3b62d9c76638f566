//! Timestamp utilities

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Absolute expiry (ms since epoch) for a TTL starting now
pub fn expiry_from_ttl(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
}

/// `start + ttl`, saturating at the latest representable instant
pub fn add_ttl(start: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Convert epoch milliseconds back to a timestamp (clamped to the epoch on overflow)
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
    }

    #[test]
    fn test_millis_to_duration_one_second() {
        assert_eq!(millis_to_duration(1000), Duration::from_secs(1));
    }

    #[test]
    fn test_add_ttl_saturates() {
        let start = now();
        assert_eq!(add_ttl(start, Duration::from_secs(1)) - start, chrono::Duration::seconds(1));
        assert_eq!(add_ttl(start, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_expiry_from_ttl() {
        assert_eq!(expiry_from_ttl(None), None);
        let before = now_ms();
        let expiry = expiry_from_ttl(Some(Duration::from_secs(60))).unwrap();
        assert!(expiry >= before + 60_000);
        assert!(expiry <= now_ms() + 60_000);
    }

    #[test]
    fn test_from_ms_roundtrip() {
        let ts = from_ms(1_700_000_000_123);
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
    }
}
