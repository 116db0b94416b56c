//! Local-time helpers.
//!
//! Local inputs carry a fixed UTC offset in minutes. They are converted to
//! UTC once, where they enter the system.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

use herald_common::error::AppError;

/// Largest UTC offset in use anywhere (UTC+14).
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, AppError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| AppError::Validation(format!("invalid time of day '{}', expected HH:MM", value)))
}

pub fn fixed_offset(utc_offset_minutes: i32) -> Result<FixedOffset, AppError> {
    if utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
        return Err(AppError::Validation(format!(
            "utc_offset_minutes must be within ±{}",
            MAX_OFFSET_MINUTES
        )));
    }
    FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
        AppError::Validation(format!("invalid utc offset {} minutes", utc_offset_minutes))
    })
}

/// Convert a local date and time at a fixed offset to a UTC instant.
pub fn local_to_utc(
    date: NaiveDate,
    time: NaiveTime,
    utc_offset_minutes: i32,
) -> Result<DateTime<Utc>, AppError> {
    let offset = fixed_offset(utc_offset_minutes)?;
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| AppError::Validation("local time cannot be resolved".to_string()))
}

/// Calendar date at a fixed offset.
pub fn local_date(now: DateTime<Utc>, utc_offset_minutes: i32) -> Result<NaiveDate, AppError> {
    Ok(now.with_timezone(&fixed_offset(utc_offset_minutes)?).date_naive())
}

/// Whether local `now` is within `tolerance` of today's `time_of_day`.
///
/// The window is anchored to the local calendar day and does not wrap across
/// midnight: a 23:58 rule is not due at 00:01.
pub fn within_window(
    now: DateTime<Utc>,
    time_of_day: NaiveTime,
    utc_offset_minutes: i32,
    tolerance: Duration,
) -> Result<bool, AppError> {
    let local_now = now.with_timezone(&fixed_offset(utc_offset_minutes)?).naive_local();
    let target = local_now.date().and_time(time_of_day);
    Ok((local_now - target).abs() <= tolerance)
}
