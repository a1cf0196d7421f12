/// Minute-precision timestamp rounding shared by grant and voucher writers,
/// plus the canonical database timestamp format
use crate::error::{PortalError, PortalResult};
use chrono::{DateTime, Duration, SecondsFormat, Timelike, Utc};

/// Floor a timestamp to the enclosing minute
pub fn floor_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

/// Ceil a timestamp to the next minute boundary; already-aligned values
/// are returned unchanged
pub fn ceil_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    if dt.second() == 0 && dt.nanosecond() == 0 {
        dt
    } else {
        floor_to_minute(dt) + Duration::minutes(1)
    }
}

/// Truncate a timestamp to second precision
pub fn truncate_to_second(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_nanosecond(0).unwrap_or(dt)
}

/// Format a timestamp for storage. Fixed-width UTC RFC3339 with
/// microseconds, so lexicographic comparison in SQL matches chronological
/// order.
pub fn fmt_db(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_db(s: &str) -> PortalResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PortalError::Internal(format!("Invalid stored timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_floor_strips_seconds() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 42).unwrap();
        let floored = floor_to_minute(dt);
        assert_eq!(floored, Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 0).unwrap());
    }

    #[test]
    fn test_ceil_rounds_up() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 1).unwrap();
        assert_eq!(
            ceil_to_minute(dt),
            Utc.with_ymd_and_hms(2025, 3, 1, 10, 16, 0).unwrap()
        );
    }

    #[test]
    fn test_ceil_on_boundary_is_identity() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(ceil_to_minute(dt), dt);
    }

    #[test]
    fn test_db_format_round_trip_and_ordering() {
        let early = Utc.with_ymd_and_hms(2025, 3, 1, 9, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        assert!(fmt_db(early) < fmt_db(late));
        assert_eq!(parse_db(&fmt_db(late)).unwrap(), late);
    }

    #[test]
    fn test_rounding_is_idempotent() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 1, 23, 59, 59).unwrap();
        assert_eq!(ceil_to_minute(ceil_to_minute(dt)), ceil_to_minute(dt));
        assert_eq!(floor_to_minute(floor_to_minute(dt)), floor_to_minute(dt));
    }
}
