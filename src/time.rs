//! clocks and generalized time values
//!
//! everything time dependent (password policy, lockout, idle checks) reads
//! the time through a [Clock] so tests can move it explicitly

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use std::sync::Mutex;

/// a source for the current time
pub trait Clock: std::fmt::Debug + Send + Sync {
    /// the current time
    fn now(&self) -> DateTime<Utc>;
}

/// the wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// a clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    /// the current time
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// create a clock standing at the given time
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// move the clock forward
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += duration;
    }

    /// set the clock to a specific time
    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// format a timestamp as LDAP generalized time with millisecond precision
pub fn format_generalized_time(time: &DateTime<Utc>) -> String {
    time.format("%Y%m%d%H%M%S%.3fZ").to_string()
}

/// parse an LDAP generalized time value in UTC
///
/// accepts an optional fraction of seconds; values without seconds
/// (`YYYYmmddHHMMZ`) are accepted too
pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim().strip_suffix('Z')?;
    let (base, fraction) = match value.split_once(['.', ',']) {
        Some((base, fraction)) => (base, Some(fraction)),
        None => (value, None),
    };
    let naive = match base.len() {
        14 => NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S").ok()?,
        12 => NaiveDateTime::parse_from_str(&format!("{}00", base), "%Y%m%d%H%M%S").ok()?,
        _ => return None,
    };
    let mut time = Utc.from_utc_datetime(&naive);
    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let digits: String = fraction.chars().chain("000000000".chars()).take(9).collect();
        let nanos: i64 = digits.parse().ok()?;
        time += Duration::nanoseconds(nanos);
    }
    Some(time)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generalized_time_round_trip() {
        let time = Utc.with_ymd_and_hms(2024, 2, 29, 13, 45, 7).unwrap()
            + Duration::milliseconds(250);
        let formatted = format_generalized_time(&time);
        assert_eq!(formatted, "20240229134507.250Z");
        assert_eq!(parse_generalized_time(&formatted), Some(time));
    }

    #[test]
    fn parses_variants() {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
        assert_eq!(parse_generalized_time("20240102030400Z"), Some(time));
        assert_eq!(parse_generalized_time("202401020304Z"), Some(time));
        assert_eq!(parse_generalized_time("20240102030400"), None);
        assert_eq!(parse_generalized_time("garbage"), None);
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }
}
