//! Cron expressions for recurring jobs.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::{Result, SchedulerError};

/// Normalize an expression to the seven-field form the `cron` crate expects.
///
/// Standard five-field expressions gain a leading seconds field of `0` and a
/// trailing year field of `*`, and their numeric day-of-week values move from
/// the standard 0-7 (Sunday is 0 or 7) to the crate's 1-7 (Sunday is 1). Six
/// and seven field expressions pass through.
fn to_cron_crate_format(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => format!(
            "0 {} {} {} {} {} *",
            minute,
            hour,
            day,
            month,
            day_of_week_field(weekday)
        ),
        _ => expression.trim().to_string(),
    }
}

/// Rewrite a standard day-of-week field with crate numbering.
///
/// Numeric items become explicit day lists. Named days, `*` and `?` are the
/// same in both dialects and are kept, as are items that fail to parse so the
/// crate reports them.
fn day_of_week_field(field: &str) -> String {
    field
        .split(',')
        .map(|item| match standard_days(item) {
            Some(days) => days
                .iter()
                .map(|day| (day + 1).to_string())
                .collect::<Vec<_>>()
                .join(","),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Days (0 = Sunday) selected by a numeric day-of-week item such as `5`,
/// `1-5`, `*/2` or `1-7/3`.
fn standard_days(item: &str) -> Option<BTreeSet<u32>> {
    if item == "*" || item.chars().any(|c| c.is_ascii_alphabetic() || c == '?') {
        return None;
    }

    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, step.parse::<u32>().ok().filter(|s| *s > 0)?),
        None => (item, 1),
    };

    let (start, end) = match range.split_once('-') {
        _ if range == "*" => (0, 6),
        Some((start, end)) => (start.parse::<u32>().ok()?, end.parse::<u32>().ok()?),
        // `n/step` runs from n to the end of the week.
        None if item.contains('/') => (range.parse::<u32>().ok()?, 6),
        None => {
            let day = range.parse::<u32>().ok()?;
            (day, day)
        }
    };

    if start > end || end > 7 {
        return None;
    }

    Some(
        (start..=end)
            .step_by(step as usize)
            .map(|day| day % 7)
            .collect(),
    )
}

/// Parse a cron expression.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    if expression.trim().is_empty() {
        return Err(SchedulerError::invalid_cron(expression, "empty expression"));
    }

    let schedule = Schedule::from_str(&to_cron_crate_format(expression))?;
    Ok(schedule)
}

/// First fire time of `schedule` strictly after `after`.
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Parse `expression` and compute its first fire time after `after`.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_cron(expression)?;
    next_after(&schedule, after).ok_or_else(|| {
        SchedulerError::invalid_cron(expression, "expression has no future fire time")
    })
}
