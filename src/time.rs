use serde::{Deserialize, Deserializer};
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    cyborgtime::parse_duration(s)
        .map_err(|e| format!("{s:?} is not a duration ({e}), expected something like 5s or 30d"))
}

/// A duration written the human way (`5s`, `30d`, `1h 30m`) in flags and config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDuration(Duration);

impl From<Duration> for ParsedDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl Deref for ParsedDuration {
    type Target = Duration;

    fn deref(&self) -> &Duration {
        &self.0
    }
}

impl FromStr for ParsedDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        parse_duration(s).map(Self)
    }
}

impl<'de> Deserialize<'de> for ParsedDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// [`humanize_duration`] for std durations; anything beyond `time`'s range is "forever".
pub fn humanize_std_duration(duration: Duration) -> String {
    time::Duration::try_from(duration).map_or_else(|_| "forever".to_string(), humanize_duration)
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("{count} {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

/// Renders e.g. `3 months, 8 days, 16 hours`. The sign is dropped.
pub fn humanize_duration(duration: time::Duration) -> String {
    const UNITS: [(i64, &str); 5] = [
        (31_557_600, "year"), // 365.25 days
        (2_630_016, "month"), // 30.44 days
        (86400, "day"),
        (3600, "hour"),
        (60, "minute"),
    ];

    let mut seconds = duration.whole_seconds().saturating_abs();
    let mut parts = Vec::new();
    for (unit_seconds, unit) in UNITS {
        let count = seconds / unit_seconds;
        seconds %= unit_seconds;
        if count > 0 {
            parts.push(plural(count, unit));
        }
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(plural(seconds, "second"));
    }
    parts.join(", ")
}
