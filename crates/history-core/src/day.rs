//! Calendar-day bucketing for grouping sessions.
//!
//! Sessions are grouped by the calendar day they started on, in a
//! reference timezone supplied by the caller. Day 0 is 1970-01-01; the
//! index is signed so pre-epoch instants stay well-defined.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A calendar day, counted in whole days from 1970-01-01 in a reference
/// timezone.
///
/// Two instants bucket to the same `ADay` exactly when they fall on the
/// same calendar date in that timezone. Comparisons between `ADay` values
/// computed with different offsets are meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ADay(i32);

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
}

impl ADay {
    /// The day `instant` falls on in `tz`.
    pub fn from_instant(instant: DateTime<Utc>, tz: FixedOffset) -> Self {
        let date = instant.with_timezone(&tz).date_naive();
        Self(date.signed_duration_since(epoch()).num_days() as i32)
    }

    /// Construct directly from a day index.
    pub fn from_index(index: i32) -> Self {
        Self(index)
    }

    /// Days since 1970-01-01.
    pub fn index(&self) -> i32 {
        self.0
    }

    /// Midnight at the start of this day in `tz`, as a UTC instant.
    pub fn start(&self, tz: FixedOffset) -> DateTime<Utc> {
        let date = epoch() + Duration::days(self.0 as i64);
        let local_midnight = date.and_hms_opt(0, 0, 0).unwrap();
        let utc_naive = local_midnight - Duration::seconds(tz.local_minus_utc() as i64);
        Utc.from_utc_datetime(&utc_naive)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn previous(&self) -> Self {
        Self(self.0 - 1)
    }
}
