//! Typed records passed between pipeline stages.
//!
//! Stage boundaries:
//! - `Row` -> `RawReading` (store / CSV decode)
//! - `RawReading` -> `NormalizedRecord` (time feature derivation)
//! - `NormalizedRecord` x2 -> `FusedDataset` (hourly left join, reconciliation)
//! - `FusedDataset` -> `EnrichedDataset` (weekend flag, bike counts)

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat string-keyed row as produced by the reading store and the CSV decoder.
pub type Row = BTreeMap<String, String>;

pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const LEGACY_TIMESTAMP_FIELDS: [&str; 2] = ["Time", "time"];
pub const DEFAULT_ENTITY_FIELD: &str = "stationId";
pub const WEATHER_ENTITY_ID: &str = "weather";
pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
pub const TIME_OF_DAY_FORMAT: &str = "%H:%M:%S";

pub const YEAR_COLUMN: &str = "Year";
pub const MONTH_COLUMN: &str = "Month";
pub const DAY_COLUMN: &str = "Day";
pub const HOUR_COLUMN: &str = "Hour";
pub const MINUTE_COLUMN: &str = "Minute";
pub const TIME_OF_DAY_COLUMN: &str = "Time_of_Day";
pub const IS_WEEKEND_COLUMN: &str = "IsWeekend";
pub const TOTAL_AVAILABLE_BIKES_COLUMN: &str = "TotalAvailableBikes";
pub const BIKE_IDS_COLUMN: &str = "BikeIds";

pub const JOIN_KEYS: [&str; 4] = [YEAR_COLUMN, MONTH_COLUMN, DAY_COLUMN, HOUR_COLUMN];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{stage}: missing column '{column}'")]
    MissingColumn { stage: &'static str, column: String },
    #[error("join artifact column '{column}' is missing; join keys or column names do not match upstream")]
    MissingJoinArtifact { column: String },
    #[error("{stage}: row {row} is missing required field '{field}'")]
    MissingField {
        stage: &'static str,
        row: usize,
        field: String,
    },
}

/// Row-level parse problem. The row is retained with the field nulled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub row: usize,
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReading {
    pub entity_id: String,
    pub timestamp: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl RawReading {
    /// Lifts the entity and canonical timestamp fields out of a flat row.
    ///
    /// Returns `None` when the entity field is absent. Legacy timestamp labels
    /// stay in `attributes`; the deriver renames them.
    pub fn from_row(mut row: Row, entity_field: &str) -> Option<Self> {
        let entity_id = row.remove(entity_field)?;
        let timestamp = row.remove(TIMESTAMP_FIELD);
        Some(Self {
            entity_id,
            timestamp,
            attributes: row,
        })
    }

    pub fn weather(mut row: Row) -> Self {
        let timestamp = row.remove(TIMESTAMP_FIELD);
        Self {
            entity_id: WEATHER_ENTITY_ID.to_string(),
            timestamp,
            attributes: row,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeParts {
    pub timestamp: NaiveDateTime,
    pub time_of_day: NaiveTime,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl TimeParts {
    /// Value of a calendar join column; `None` for anything outside [`JOIN_KEYS`].
    pub fn calendar_value(&self, column: &str) -> Option<i64> {
        match column {
            YEAR_COLUMN => Some(i64::from(self.year)),
            MONTH_COLUMN => Some(i64::from(self.month)),
            DAY_COLUMN => Some(i64::from(self.day)),
            HOUR_COLUMN => Some(i64::from(self.hour)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub entity_id: String,
    /// `None` when the timestamp was missing or unparseable.
    pub parts: Option<TimeParts>,
    pub attributes: BTreeMap<String, String>,
}

impl NormalizedRecord {
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        self.parts.map(|parts| parts.timestamp)
    }

    /// Renders the record back into raw form with a canonical timestamp.
    pub fn to_raw(&self) -> RawReading {
        RawReading {
            entity_id: self.entity_id.clone(),
            timestamp: self
                .parts
                .map(|parts| parts.timestamp.format(CANONICAL_TIMESTAMP_FORMAT).to_string()),
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    TimeOfDay(NaiveTime),
}

impl Value {
    /// Infers a typed cell from attribute text. Empty text is `Null`.
    ///
    /// A number is only inferred when [`Value::render`] gives back `raw`
    /// exactly, so `"0123"` or `"15.0"` stay `Text` and survive a CSV round trip.
    pub fn infer(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::Null;
        }
        if let Ok(int) = raw.parse::<i64>() {
            if int.to_string() == raw {
                return Self::Int(int);
            }
        }
        match raw.parse::<f64>() {
            Ok(float) if float.is_finite() && float.to_string() == raw => Self::Float(float),
            _ => Self::Text(raw.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view; numeric text such as `"15.0"` counts too.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(v) => v.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Cell text used by the CSV encoder.
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Timestamp(ts) => ts.format(CANONICAL_TIMESTAMP_FORMAT).to_string(),
            Self::TimeOfDay(t) => t.format(TIME_OF_DAY_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedRecord {
    pub entity_id: String,
    pub columns: BTreeMap<String, Value>,
}

impl FusedRecord {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        self.columns
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_timestamp)
    }
}

/// Fused rows plus their ordered column schema (entity column excluded).
#[derive(Debug, Clone, PartialEq)]
pub struct FusedDataset {
    pub entity_column: String,
    pub columns: Vec<String>,
    pub records: Vec<FusedRecord>,
}

impl FusedDataset {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|existing| existing == column)
    }

    pub fn require_column(&self, stage: &'static str, column: &str) -> Result<(), SchemaError> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(SchemaError::MissingColumn {
                stage,
                column: column.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub entity_id: String,
    pub timestamp: NaiveDateTime,
    pub is_weekend: u8,
    /// `None` when the record carries no bike id collection.
    pub total_available_bikes: Option<i64>,
    pub columns: BTreeMap<String, Value>,
}

impl EnrichedRecord {
    pub fn value(&self, column: &str) -> Value {
        match column {
            IS_WEEKEND_COLUMN => Value::Int(i64::from(self.is_weekend)),
            TOTAL_AVAILABLE_BIKES_COLUMN => self
                .total_available_bikes
                .map(Value::Int)
                .unwrap_or(Value::Null),
            other => self.columns.get(other).cloned().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedDataset {
    pub entity_column: String,
    pub columns: Vec<String>,
    pub records: Vec<EnrichedRecord>,
}

impl EnrichedDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        column == self.entity_column || self.columns.iter().any(|existing| existing == column)
    }

    /// CSV header: entity column first, then the schema columns.
    pub fn header(&self) -> Vec<String> {
        std::iter::once(self.entity_column.clone())
            .chain(self.columns.iter().cloned())
            .collect()
    }

    pub fn cells(&self, record: &EnrichedRecord) -> Vec<Value> {
        std::iter::once(Value::Text(record.entity_id.clone()))
            .chain(self.columns.iter().map(|column| record.value(column)))
            .collect()
    }

    /// Same schema, different rows.
    pub fn with_records(&self, records: Vec<EnrichedRecord>) -> Self {
        Self {
            entity_column: self.entity_column.clone(),
            columns: self.columns.clone(),
            records,
        }
    }
}
