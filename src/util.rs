use chrono::{DateTime, Duration, FixedOffset, NaiveDate, SubsecRound, Utc};

/// Source of wall-clock time for the pipeline
///
/// Production code uses [`SystemClock`]; tests drive time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Readings are stored with second precision.
pub fn truncate_to_second(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(0)
}

/// Calendar day a timestamp belongs to, given the site's offset from UTC in minutes.
pub fn local_day(timestamp: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    match FixedOffset::east_opt(utc_offset_minutes * 60) {
        Some(offset) => timestamp.with_timezone(&offset).date_naive(),
        None => (timestamp + Duration::minutes(utc_offset_minutes as i64)).date_naive(),
    }
}

/// Round to three decimals, the precision kept for stored values.
pub fn round_milli(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
