//! Daily active-window evaluation.
//!
//! A window is a `from`/`to` pair of `HH:mm` bounds in a timezone. Both
//! bounds are inclusive and a window whose `from` is later than its `to`
//! wraps midnight. Missing or malformed bounds leave the entity
//! unrestricted; evaluation never fails.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

use beacon_core::ActiveWindow;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Minutes since midnight for a strict `HH:mm` value (hour 00-23,
/// minute 00-59, both zero-padded).
pub fn parse_hhmm(value: &str) -> Option<u32> {
    let (hour, minute) = value.split_once(':')?;
    if hour.len() != 2 || minute.len() != 2 {
        return None;
    }
    if !hour.bytes().chain(minute.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    (hour < 24 && minute < 60).then_some(hour * 60 + minute)
}

/// The window's timezone, or `default` when it names none or an unknown one.
pub fn resolve_timezone(name: Option<&str>, default: Tz) -> Tz {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
            tracing::debug!(timezone = name, "Unknown timezone, using default");
            default
        }),
        None => default,
    }
}

fn minutes_in(tz: Tz, now: DateTime<Utc>) -> u32 {
    let local = now.with_timezone(&tz);
    local.hour() * 60 + local.minute()
}

/// Whether `minute` (since midnight) falls inside `[from, to]`, wrapping
/// midnight when `from > to`.
fn contains(from: u32, to: u32, minute: u32) -> bool {
    debug_assert!(minute < MINUTES_PER_DAY);
    if from <= to {
        from <= minute && minute <= to
    } else {
        minute >= from || minute <= to
    }
}

pub fn is_active(window: &ActiveWindow, default_tz: Tz, now: DateTime<Utc>) -> bool {
    let from = window.from.as_deref().and_then(parse_hhmm);
    let to = window.to.as_deref().and_then(parse_hhmm);
    let (Some(from), Some(to)) = (from, to) else {
        return true;
    };
    let tz = resolve_timezone(window.timezone.as_deref(), default_tz);
    contains(from, to, minutes_in(tz, now))
}
