//! Fetch window boundaries derived from an explicit reference instant.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOOKBACK_DAYS: u32 = 13;
pub const DEFAULT_OFFSET_DAYS: u32 = 1;
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Inclusive date span `[start_date, end_date]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl FetchWindow {
    /// Half-open `[start, end)` bounds for the windowed reader.
    pub fn fetch_bounds(&self) -> (NaiveDate, NaiveDate) {
        let end_exclusive = self
            .end_date
            .checked_add_days(Days::new(1))
            .unwrap_or(NaiveDate::MAX);
        (self.start_date, end_exclusive)
    }

    pub fn span_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    pub fn label(&self) -> String {
        format!(
            "{}-{}",
            self.start_date.format(DATE_FORMAT),
            self.end_date.format(DATE_FORMAT)
        )
    }
}

pub fn window_from(reference: NaiveDateTime, lookback_days: u32, offset_days: u32) -> FetchWindow {
    let reference_date = reference.date();
    let end_date = reference_date
        .checked_sub_days(Days::new(u64::from(offset_days)))
        .unwrap_or(NaiveDate::MIN);
    let start_date = end_date
        .checked_sub_days(Days::new(u64::from(lookback_days)))
        .unwrap_or(NaiveDate::MIN);

    FetchWindow {
        start_date,
        end_date,
    }
}

pub fn default_window_from(reference: NaiveDateTime) -> FetchWindow {
    window_from(reference, DEFAULT_LOOKBACK_DAYS, DEFAULT_OFFSET_DAYS)
}

/// Wall-clock time of `instant` in `tz`, used as the scheduling reference.
pub fn reference_in_timezone(instant: DateTime<Utc>, tz: Tz) -> NaiveDateTime {
    instant.with_timezone(&tz).naive_local()
}
