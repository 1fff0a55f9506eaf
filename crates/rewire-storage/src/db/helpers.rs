//! Database helper functions for safe type conversions.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;

/// Parse a UUID string from database, returning a rusqlite error on failure.
pub fn parse_uuid(s: &str) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

/// Parse an RFC3339 datetime string from database, returning a rusqlite error on failure.
pub fn parse_datetime(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

/// Parse an optional RFC3339 datetime column.
pub fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Parse an optional `YYYY-MM-DD` date column.
pub fn parse_optional_date(s: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    s.as_deref()
        .map(|d| {
            NaiveDate::parse_from_str(d, "%Y-%m-%d").map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
            })
        })
        .transpose()
}

/// Parse a JSON string list column, treating garbage as an empty list.
pub fn parse_string_list(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optional_date() {
        let date = parse_optional_date(Some(String::from("2024-03-05"))).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(parse_optional_date(None).unwrap(), None);
        assert!(parse_optional_date(Some(String::from("05/03/2024"))).is_err());
    }

    #[test]
    fn test_parse_string_list_tolerates_garbage() {
        assert_eq!(parse_string_list("[\"a\",\"b\"]"), vec!["a", "b"]);
        assert!(parse_string_list("not json").is_empty());
    }

    #[test]
    fn test_parse_datetime_rejects_garbage() {
        assert!(parse_datetime("yesterday").is_err());
        assert!(parse_uuid("not-a-uuid").is_err());
    }
}
