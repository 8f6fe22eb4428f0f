// =============================================================================
// DATE / TIME UTILITIES
// =============================================================================
// Wire formats used across the service:
// - dates:        YYYY-MM-DD
// - times of day: HH:MM (24-hour, zero padded)
// - timestamps:   ISO 8601 with offset
//
// Slot boundaries are a calendar date plus a time of day, interpreted in the
// rule's time zone (or the configured default).
// =============================================================================

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

use super::ValidationError;

/// Parse a time of day. `HH:MM` is the wire format; `HH:MM:SS` is accepted
/// because databases and ISO clients echo seconds back.
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ValidationError> {
    let format = match raw.len() {
        5 => "%H:%M",
        8 => "%H:%M:%S",
        _ => return Err(ValidationError::InvalidTime(raw.to_string())),
    };

    NaiveTime::parse_from_str(raw, format).map_err(|_| ValidationError::InvalidTime(raw.to_string()))
}

/// Parse a calendar date in `YYYY-MM-DD` form.
pub fn parse_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    if raw.len() != 10 {
        return Err(ValidationError::InvalidDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ValidationError::InvalidDate(raw.to_string()))
}

/// Day-of-week index as stored on schedule rules: Monday=0 … Sunday=6.
pub fn weekday_index(date: NaiveDate) -> i16 {
    date.weekday().num_days_from_monday() as i16
}

/// Resolve an optional IANA zone name, falling back to `default` when absent.
pub fn resolve_timezone(name: Option<&str>, default: Tz) -> Result<Tz, ValidationError> {
    match name.map(str::trim) {
        None | Some("") => Ok(default),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| ValidationError::UnknownTimezone(name.to_string())),
    }
}

/// Combine a date and a wall-clock time in `tz`.
///
/// An ambiguous local time (clocks going back) resolves to the earlier
/// instant. A local time that does not exist (clocks going forward) yields
/// `None`.
pub fn localize(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&date.and_time(time)).earliest()
}

// -----------------------------------------------------------------------------
// SERDE: HH:MM
// -----------------------------------------------------------------------------
/// `#[serde(with = "hhmm")]` for `NaiveTime` fields on the wire.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}
