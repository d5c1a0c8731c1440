//! Timestamp normalization and calendar/time-of-day feature derivation.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::records::{
    NormalizedRecord, ParseWarning, RawReading, TimeParts, LEGACY_TIMESTAMP_FIELDS,
    TIMESTAMP_FIELD,
};

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const DATE_ONLY_FORMAT: &str = "%Y-%m-%d";
const MAX_LOGGED_WARNINGS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeriveReport {
    pub input_rows: u64,
    pub parsed_rows: u64,
    pub unparseable_rows: u64,
    pub legacy_field_renames: u64,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeriveError {
    #[error("{dataset}: none of the {rows} timestamps could be parsed")]
    AllTimestampsUnparseable { dataset: String, rows: u64 },
}

#[derive(Debug, Clone)]
pub struct TimeFeatureDeriver {
    dataset: String,
}

impl TimeFeatureDeriver {
    /// `dataset` names the batch in logs and errors (e.g. "bikes", "weather").
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
        }
    }

    pub fn derive(
        &self,
        records: Vec<RawReading>,
    ) -> Result<(Vec<NormalizedRecord>, DeriveReport), DeriveError> {
        let mut report = DeriveReport {
            input_rows: records.len() as u64,
            ..DeriveReport::default()
        };
        let mut out = Vec::with_capacity(records.len());

        for (idx, record) in records.into_iter().enumerate() {
            let RawReading {
                entity_id,
                mut timestamp,
                mut attributes,
            } = record;

            if timestamp.is_none() {
                if let Some(legacy) = LEGACY_TIMESTAMP_FIELDS
                    .iter()
                    .find_map(|field| attributes.remove(*field))
                {
                    timestamp = Some(legacy);
                    report.legacy_field_renames += 1;
                }
            }

            let parts = timestamp.as_deref().and_then(parse_timestamp).map(time_parts);
            match parts {
                Some(_) => report.parsed_rows += 1,
                None => {
                    report.unparseable_rows += 1;
                    let warning = ParseWarning {
                        row: idx,
                        field: TIMESTAMP_FIELD.to_string(),
                        value: timestamp.unwrap_or_default(),
                    };
                    if report.warnings.len() < MAX_LOGGED_WARNINGS {
                        warn!(
                            component = "time_features",
                            event = "time_features.parse_warning",
                            dataset = %self.dataset,
                            row = warning.row,
                            value = %warning.value
                        );
                    }
                    report.warnings.push(warning);
                }
            }

            out.push(NormalizedRecord {
                entity_id,
                parts,
                attributes,
            });
        }

        if report.input_rows > 0 && report.parsed_rows == 0 {
            return Err(DeriveError::AllTimestampsUnparseable {
                dataset: self.dataset.clone(),
                rows: report.input_rows,
            });
        }

        info!(
            component = "time_features",
            event = "time_features.derive.finish",
            dataset = %self.dataset,
            input_rows = report.input_rows,
            parsed_rows = report.parsed_rows,
            unparseable_rows = report.unparseable_rows,
            legacy_field_renames = report.legacy_field_renames
        );

        Ok((out, report))
    }
}

/// Parses the timestamp shapes seen in store rows and weather payloads.
///
/// Offsets are dropped after parsing; the wall-clock reading is kept so that
/// hourly buckets line up with the local-time weather series.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_local());
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt);
        }
    }

    NaiveDate::parse_from_str(trimmed, DATE_ONLY_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn time_parts(timestamp: NaiveDateTime) -> TimeParts {
    let date = timestamp.date();
    let time_of_day = time_of_day(timestamp);

    TimeParts {
        timestamp,
        time_of_day,
        year: date.year(),
        month: date.month(),
        day: date.day(),
        hour: time_of_day.hour(),
        minute: time_of_day.minute(),
    }
}

/// Whole-second time of day, taken from the clock component alone.
fn time_of_day(timestamp: NaiveDateTime) -> NaiveTime {
    let time = timestamp.time();
    time.with_nanosecond(0).unwrap_or(time)
}
