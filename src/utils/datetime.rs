//! Date/time conversions between the wire formats used by web archives and
//! the SQL timestamp format stored in the database, plus duration formatting
//! for log messages.

use chrono::NaiveDateTime;

/// SQL timestamp format used throughout the store (`YYYY-MM-DD HH:MM:SS`).
pub const SQL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Compact 14-digit timestamp format used by web archives (`YYYYMMDDHHMMSS`).
pub const COMPACT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Current time as a SQL timestamp (UTC).
pub fn sql_now() -> String {
    chrono::Utc::now().format(SQL_FORMAT).to_string()
}

/// Convert a long date (`Thu, 07 Jan 2021 12:00:00 GMT`) to a SQL timestamp.
pub fn convert_long_date(value: &str) -> Option<String> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.naive_utc().format(SQL_FORMAT).to_string())
}

/// Convert a compact 14-digit timestamp to a SQL timestamp.
pub fn convert_timestamp(value: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(value, COMPACT_FORMAT)
        .ok()
        .map(|dt| dt.format(SQL_FORMAT).to_string())
}

/// Convert a SQL timestamp back to the compact 14-digit form.
pub fn convert_sql_timestamp(value: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(value, SQL_FORMAT)
        .ok()
        .map(|dt| dt.format(COMPACT_FORMAT).to_string())
}

/// Convert a date/time string in a caller-supplied strftime format to a SQL
/// timestamp. Date-only formats get a midnight time part.
pub fn convert_custom_datetime(value: &str, format: &str) -> Option<String> {
    let format = if format.is_empty() { SQL_FORMAT } else { format };
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
        return Some(dt.format(SQL_FORMAT).to_string());
    }
    chrono::NaiveDate::parse_from_str(value, format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.format(SQL_FORMAT).to_string())
}

/// Format a number of seconds as a short human-readable duration ("1d 2h 3min 4s").
pub fn seconds_to_string(seconds: u64) -> String {
    let mut rest = seconds;
    let days = rest / 86_400;
    rest -= days * 86_400;
    let hours = rest / 3_600;
    rest -= hours * 3_600;
    let minutes = rest / 60;
    rest -= minutes * 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d "));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}min "));
    }
    if rest > 0 {
        out.push_str(&format!("{rest}s "));
    }
    if out.is_empty() {
        return "0s".to_string();
    }
    out.pop();
    out
}

/// Format a number of milliseconds as a short human-readable duration.
pub fn ms_to_string(milliseconds: u64) -> String {
    let ms = milliseconds % 1_000;
    let seconds = milliseconds / 1_000;
    if seconds == 0 {
        return format!("{ms}ms");
    }
    let mut out = seconds_to_string(seconds);
    if ms > 0 {
        out.push_str(&format!(" {ms}ms"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_date_to_sql() {
        assert_eq!(
            convert_long_date("Thu, 07 Jan 2021 12:00:00 GMT").as_deref(),
            Some("2021-01-07 12:00:00")
        );
        assert!(convert_long_date("not a date").is_none());
    }

    #[test]
    fn compact_to_sql_and_back() {
        assert_eq!(
            convert_timestamp("20210107120000").as_deref(),
            Some("2021-01-07 12:00:00")
        );
        assert_eq!(
            convert_sql_timestamp("2021-01-07 12:00:00").as_deref(),
            Some("20210107120000")
        );
    }

    #[test]
    fn compact_round_trip() {
        let sql = convert_timestamp("19991231235959").unwrap();
        assert_eq!(convert_sql_timestamp(&sql).as_deref(), Some("19991231235959"));
    }

    #[test]
    fn rejects_malformed_compact() {
        assert!(convert_timestamp("2021010712000").is_none());
        assert!(convert_timestamp("20211307120000").is_none());
    }

    #[test]
    fn custom_formats() {
        assert_eq!(
            convert_custom_datetime("07.01.2021 12:00", "%d.%m.%Y %H:%M").as_deref(),
            Some("2021-01-07 12:00:00")
        );
        assert_eq!(
            convert_custom_datetime("2021-01-07", "%Y-%m-%d").as_deref(),
            Some("2021-01-07 00:00:00")
        );
        assert!(convert_custom_datetime("garbage", "%Y-%m-%d").is_none());
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(seconds_to_string(0), "0s");
        assert_eq!(seconds_to_string(61), "1min 1s");
        assert_eq!(seconds_to_string(90_061), "1d 1h 1min 1s");
        assert_eq!(ms_to_string(500), "500ms");
        assert_eq!(ms_to_string(61_000), "1min 1s");
    }
}
