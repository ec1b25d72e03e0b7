//! Lenient parsing of model-produced timestamps.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Parse an ISO-8601 style timestamp into UTC.
///
/// Accepted forms, tried in order:
/// 1. RFC 3339 with offset: `"2020-03-01T09:00:00Z"`, `"2020-03-01T09:00:00+02:00"`
/// 2. Date-time without offset (assumed UTC), with or without sub-seconds
/// 3. Date only: `"2020-03-01"`
/// 4. Year and month: `"2020-03"` (first day of the month)
/// 5. Year only: `"2020"` (January 1st)
///
/// Returns `None` for empty or unrecognised input; callers drop such values
/// instead of guessing.
pub fn parse_flexible_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return midnight(date);
    }

    if let Some((year, month)) = s.split_once('-') {
        if year.len() == 4 && month.len() == 2 {
            let year = year.parse::<i32>().ok()?;
            let month = month.parse::<u32>().ok()?;
            return NaiveDate::from_ymd_opt(year, month, 1).and_then(midnight);
        }
        return None;
    }

    if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
        let year = s.parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(year, 1, 1).and_then(midnight);
    }

    None
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|ndt| Utc.from_utc_datetime(&ndt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let dt = parse_flexible_datetime("2024-01-15T10:30:00+05:00").expect("should parse");
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 5, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_naive_datetime() {
        let dt = parse_flexible_datetime("2024-01-15T10:30:00.250").expect("should parse");
        assert_eq!(dt.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_parse_date_only() {
        let dt = parse_flexible_datetime("2020-06-30").expect("should parse");
        assert_eq!((dt.year(), dt.month(), dt.day()), (2020, 6, 30));
    }

    #[test]
    fn test_parse_partial_dates() {
        let month = parse_flexible_datetime("2020-03").expect("should parse");
        assert_eq!((month.year(), month.month(), month.day()), (2020, 3, 1));

        let year = parse_flexible_datetime("2020").expect("should parse");
        assert_eq!(year, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(parse_flexible_datetime(""), None);
        assert_eq!(parse_flexible_datetime("sometime in spring"), None);
        assert_eq!(parse_flexible_datetime("2020-13"), None);
        assert_eq!(parse_flexible_datetime("20201"), None);
        assert_eq!(parse_flexible_datetime("2021-02-30"), None);
        assert_eq!(parse_flexible_datetime("null"), None);
    }
}
