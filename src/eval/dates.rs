use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, TimeDelta, Utc};

use crate::{AttributeValue, Timestamp};

/// Relative offsets of this many units or more are rejected.
const MAX_RELATIVE_OFFSET: u32 = 10_000;

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a relative date token like `-7d` or `1y` into `now` minus that offset.
///
/// Units are `h` (hours), `d` (days), `w` (weeks), `m` (months) and `y` (years). The leading `-`
/// is optional and ignored: tokens always point into the past.
pub fn parse_relative_date(value: &str, now: Timestamp) -> Option<Timestamp> {
    let value = value.strip_prefix('-').unwrap_or(value);
    let unit = value.chars().last()?;
    let number = &value[..value.len() - unit.len_utf8()];
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: u32 = number.parse().ok()?;
    if number >= MAX_RELATIVE_OFFSET {
        return None;
    }

    match unit {
        'h' => now.checked_sub_signed(TimeDelta::try_hours(number.into())?),
        'd' => now.checked_sub_signed(TimeDelta::try_days(number.into())?),
        'w' => now.checked_sub_signed(TimeDelta::try_weeks(number.into())?),
        'm' => now.checked_sub_months(Months::new(number)),
        'y' => now.checked_sub_months(Months::new(number * 12)),
        _ => None,
    }
}

/// Parse an absolute date. Values without an offset are taken as UTC and bare dates as midnight.
pub fn parse_date(value: &str) -> Option<Timestamp> {
    let value = value.trim();

    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(date) = DateTime::parse_from_str(value, format) {
            return Some(date.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(date) = NaiveDateTime::parse_from_str(value, format) {
            return Some(date.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc())
}

/// Interpret an attribute as a point in time.
pub(super) fn attribute_to_date(value: &AttributeValue) -> Option<Timestamp> {
    match value {
        AttributeValue::DateTime(date) => Some(*date),
        AttributeValue::String(s) => parse_date(s),
        _ => None,
    }
}
