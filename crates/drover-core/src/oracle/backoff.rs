//! Spending-cap detection and reset-time arithmetic.
//!
//! Providers report an exhausted quota with a phrase like
//! "spending cap reached ... resets 8pm". The reset time is interpreted in
//! local wall-clock time, rolling to tomorrow when the named time is
//! already past. All arithmetic is pure over an injected "now" so it can
//! be tested to the second.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeDelta};
use regex::Regex;

/// The provider phrase that signals an exhausted spending cap.
const CAP_PHRASE: &str = "spending cap reached";

/// A wall-clock reset time parsed from provider output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTime {
    /// Hour in 24-hour local time.
    pub hour: u32,
    pub minute: u32,
}

fn reset_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)resets?\s*(?:at\s*)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)")
            .expect("reset-time regex must compile")
    })
}

/// Whether provider output reports a spending cap.
pub fn detects_spending_cap(output: &str) -> bool {
    output.to_lowercase().contains(CAP_PHRASE)
}

/// Parse the reset time from provider output, e.g. "resets 8pm",
/// "resets at 10:30am".
pub fn parse_reset_time(output: &str) -> Option<ResetTime> {
    let captures = reset_regex().captures(output)?;
    let raw_hour: u32 = captures.get(1)?.as_str().parse().ok()?;
    let minute: u32 = captures
        .get(2)
        .map(|m| m.as_str().parse().ok())
        .unwrap_or(Some(0))?;
    if raw_hour == 0 || raw_hour > 12 || minute > 59 {
        return None;
    }
    let meridiem = captures.get(3)?.as_str().to_lowercase();

    let hour = match (raw_hour, meridiem.as_str()) {
        (12, "am") => 0,
        (12, "pm") => 12,
        (h, "am") => h,
        (h, _) => h + 12,
    };
    Some(ResetTime { hour, minute })
}

/// Seconds from `now` until the next local occurrence of the reset time.
///
/// When `now` is already past the named time today, the deadline rolls to
/// tomorrow.
pub fn sleep_until_reset(now: DateTime<Local>, reset: ResetTime) -> Duration {
    let target_time = NaiveTime::from_hms_opt(reset.hour, reset.minute, 0)
        .unwrap_or(NaiveTime::MIN);
    let now_naive = now.naive_local();
    let mut target = now_naive.date().and_time(target_time);
    if target <= now_naive {
        target = target + TimeDelta::days(1);
    }
    let seconds = (target - now_naive).num_seconds().max(0) as u64;
    Duration::from_secs(seconds)
}
