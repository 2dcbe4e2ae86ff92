//! ISO-8601 durations as used by workflow timeouts, delays and retry policies.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{codes, DirektivError, Result};

static ISO_DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
    )
    .expect("valid duration pattern")
});

/// Parse an ISO-8601 duration such as `PT15M` or `P1DT2H`.
///
/// Years count as 365 days and months as 30 days.
pub fn parse(input: &str) -> Result<Duration> {
    let input = input.trim();
    let caps = ISO_DURATION
        .captures(input)
        .filter(|c| c.iter().skip(1).any(|g| g.is_some()))
        .ok_or_else(|| {
            DirektivError::catchable(
                codes::BAD_DURATION,
                format!("'{}' is not a valid ISO-8601 duration", input),
            )
        })?;

    let overflow = || {
        DirektivError::catchable(
            codes::BAD_DURATION,
            format!("'{}' is out of range", input),
        )
    };
    let field = |idx: usize| -> Result<i64> {
        match caps.get(idx) {
            Some(m) => m.as_str().parse::<i64>().map_err(|_| overflow()),
            None => Ok(0),
        }
    };

    let days = [(1, 365), (2, 30), (3, 7), (4, 1)]
        .into_iter()
        .try_fold(0i64, |acc, (idx, per)| {
            field(idx)?
                .checked_mul(per)
                .and_then(|d| acc.checked_add(d))
                .ok_or_else(overflow)
        })?;

    let mut parts = vec![
        Duration::try_days(days),
        Duration::try_hours(field(5)?),
        Duration::try_minutes(field(6)?),
    ];
    if let Some(seconds) = caps.get(7) {
        let secs: f64 = seconds.as_str().parse().map_err(|_| overflow())?;
        let millis = (secs * 1000.0).round();
        if !millis.is_finite() || millis >= i64::MAX as f64 {
            return Err(overflow());
        }
        parts.push(Duration::try_milliseconds(millis as i64));
    }

    parts
        .into_iter()
        .try_fold(Duration::zero(), |total, part| {
            part.and_then(|p| total.checked_add(&p))
        })
        .ok_or_else(overflow)
}

/// `at + duration`, failing with a catchable error when the result is not
/// representable.
pub fn add(at: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    at.checked_add_signed(duration).ok_or_else(|| {
        DirektivError::catchable(
            codes::BAD_DURATION,
            format!("{} after {} is out of range", duration, at),
        )
    })
}

/// Parse an optional duration, falling back to `default` when absent.
pub fn parse_or(input: Option<&str>, default: &str) -> Result<Duration> {
    match input {
        Some(value) if !value.trim().is_empty() => parse(value),
        _ => parse(default),
    }
}
