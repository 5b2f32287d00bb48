//! Reset policies deciding when an admitted call's capacity comes back.

use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CooldownError, Result};

/// Common fixed periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// A non-empty set of UTC times of day at which capacity is replenished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyResetTimes(Vec<NaiveTime>);

impl DailyResetTimes {
    pub fn new(times: Vec<NaiveTime>) -> Result<Self> {
        if times.is_empty() {
            return Err(CooldownError::Config(
                "At least one daily reset time is required".to_string(),
            ));
        }
        Ok(Self(times))
    }

    /// Parse times written as `HH:MM:SS` or `HH:MM`.
    pub fn parse<S: AsRef<str>>(times: &[S]) -> Result<Self> {
        let parsed = times
            .iter()
            .map(|t| parse_time_of_day(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(parsed)
    }

    pub fn times(&self) -> &[NaiveTime] {
        &self.0
    }

    /// The soonest configured time of day strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.0
            .iter()
            .map(|time| next_occurrence(now, *time))
            .min()
            .unwrap_or(now)
    }
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| CooldownError::Config(format!("Invalid reset time {:?}: {}", s, e)))
}

fn next_occurrence(now: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    let mut candidate = Utc.from_utc_datetime(&now.date_naive().and_time(time));
    while candidate <= now {
        candidate += chrono::Duration::days(1);
    }
    candidate
}

/// When capacity consumed by an admitted call is given back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetPolicy {
    /// A fixed offset from the moment of admission
    Period(Duration),
    /// The next configured time of day
    Daily(DailyResetTimes),
}

impl ResetPolicy {
    pub fn every(period: Duration) -> Self {
        ResetPolicy::Period(period)
    }

    /// Build a fixed period from fractional seconds.
    pub fn from_secs_f64(secs: f64) -> Result<Self> {
        Duration::try_from_secs_f64(secs)
            .map(ResetPolicy::Period)
            .map_err(|e| CooldownError::Config(format!("Invalid period {}: {}", secs, e)))
    }

    pub fn daily(times: Vec<NaiveTime>) -> Result<Self> {
        DailyResetTimes::new(times).map(ResetPolicy::Daily)
    }

    /// When a call admitted at `now` is replenished.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ResetPolicy::Period(period) => {
                now + chrono::Duration::from_std(*period)
                    .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
            }
            ResetPolicy::Daily(times) => times.next_after(now),
        }
    }

    /// The fixed period; zero for daily resets.
    pub fn period(&self) -> Duration {
        match self {
            ResetPolicy::Period(period) => *period,
            ResetPolicy::Daily(_) => Duration::ZERO,
        }
    }

    /// The daily reset times; empty for fixed periods.
    pub fn reset_times(&self) -> &[NaiveTime] {
        match self {
            ResetPolicy::Period(_) => &[],
            ResetPolicy::Daily(times) => times.times(),
        }
    }
}

impl From<TimeWindow> for ResetPolicy {
    fn from(window: TimeWindow) -> Self {
        ResetPolicy::Period(window.duration())
    }
}

impl From<Duration> for ResetPolicy {
    fn from(period: Duration) -> Self {
        ResetPolicy::Period(period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 2, 14, h, m, s).unwrap()
    }

    fn time(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeWindow::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_period_next_reset() {
        let policy = ResetPolicy::from_secs_f64(1.5).unwrap();
        assert_eq!(
            policy.next_reset(at(3, 30, 0)),
            at(3, 30, 0) + chrono::Duration::milliseconds(1500)
        );
        assert!(ResetPolicy::from_secs_f64(-1.0).is_err());
    }

    #[test]
    fn test_daily_picks_soonest_time() {
        let times = DailyResetTimes::new(vec![time(3, 30, 3), time(3, 30, 1)]).unwrap();
        assert_eq!(times.next_after(at(3, 30, 0)), at(3, 30, 1));
        assert_eq!(times.next_after(at(3, 30, 2)), at(3, 30, 3));
    }

    #[test]
    fn test_daily_rolls_over_to_tomorrow() {
        let times = DailyResetTimes::new(vec![time(3, 30, 1)]).unwrap();
        let tomorrow = Utc.with_ymd_and_hms(2023, 2, 15, 3, 30, 1).unwrap();

        assert_eq!(times.next_after(at(3, 30, 1)), tomorrow);
        assert_eq!(times.next_after(at(12, 0, 0)), tomorrow);
    }

    #[test]
    fn test_daily_requires_times() {
        assert!(ResetPolicy::daily(Vec::new()).is_err());
    }

    #[test]
    fn test_parse_reset_times() {
        let times = DailyResetTimes::parse(&["03:30:01", "18:00"]).unwrap();
        assert_eq!(times.times(), &[time(3, 30, 1), time(18, 0, 0)]);

        let err = DailyResetTimes::parse(&["25:00"]).unwrap_err();
        assert!(matches!(err, CooldownError::Config(_)));
    }
}
