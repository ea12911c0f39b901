use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Current UTC time as an RFC 3339 string (second precision).
pub fn now_iso8601() -> String {
    let now = OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Milliseconds since the Unix epoch, used for signal expiry.
pub fn now_unix_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso8601_parses_back() {
        let stamp = now_iso8601();
        assert!(OffsetDateTime::parse(&stamp, &Rfc3339).is_ok());
        assert!(stamp.ends_with('Z'));
    }

    #[test]
    fn unix_ms_is_monotone_enough() {
        let first = now_unix_ms();
        let second = now_unix_ms();
        assert!(second >= first);
        assert!(first > 1_600_000_000_000);
    }
}
