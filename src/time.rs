//! Small time helpers, kept separate so the Transfer Monitor and Session
//! Coordinator don't each reach for `chrono` directly.

/// Current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current Unix timestamp in milliseconds, used by the Transfer Monitor's
/// 500ms tick and the coordinator's join-announcement cadence.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_timestamp_is_reasonable() {
        let ts = now_timestamp();
        assert!(ts > 1704067200, "timestamp {ts} looks too old");
        assert!(ts < 4102444800, "timestamp {ts} looks too far in the future");
    }

    #[test]
    fn now_timestamp_millis_is_reasonable() {
        let ts = now_timestamp_millis();
        assert!(ts > 1704067200_000, "timestamp {ts} looks too old");
    }
}
