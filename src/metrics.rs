//! Aggregate chart metrics computed over one partition.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::partition::{DateRange, PartitionName, PartitionedDataset};
use crate::records::{EnrichedRecord, Value, IS_WEEKEND_COLUMN, TOTAL_AVAILABLE_BIKES_COLUMN};

pub const TEMPERATURE_COLUMN: &str = "Temperature";
pub const HUMIDITY_COLUMN: &str = "Humidity";
pub const WIND_SPEED_COLUMN: &str = "Wind_Speed";
pub const AVAILABLE_BIKES_COLUMN: &str = "AvailableBikes";

/// Candidate columns for the correlation matrix; absent ones are skipped.
pub const CORRELATION_COLUMNS: [&str; 15] = [
    AVAILABLE_BIKES_COLUMN,
    "Distance",
    "Long",
    "Lat",
    "Year",
    "Month",
    "Day",
    "Hour",
    TEMPERATURE_COLUMN,
    HUMIDITY_COLUMN,
    WIND_SPEED_COLUMN,
    "Precipitation",
    "Visibility",
    "Snowfall",
    IS_WEEKEND_COLUMN,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureExtreme {
    pub temperature: f64,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusiestTimestamp {
    pub timestamp: NaiveDateTime,
    pub readings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekendComparison {
    pub column: String,
    pub weekday_mean: Option<f64>,
    pub weekend_mean: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyWeather {
    pub hour_start: NaiveDateTime,
    pub humidity_mean: Option<f64>,
    pub wind_speed_mean: Option<f64>,
    pub temperature_mean: Option<f64>,
    pub total_available_bikes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub columns: Vec<String>,
    /// `values[i][j]`; `None` where a column has no variance.
    pub values: Vec<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub partition: PartitionName,
    pub date_range: DateRange,
    pub rows: usize,
    pub unique_entities: usize,
    pub warmest: Option<TemperatureExtreme>,
    pub coldest: Option<TemperatureExtreme>,
    pub busiest_timestamp: Option<BusiestTimestamp>,
    pub weekend_vs_weekday: Option<WeekendComparison>,
    pub weather_over_time: Vec<HourlyWeather>,
    pub correlation: CorrelationMatrix,
}

/// Returns `None` for an empty partition.
pub fn build_metric_snapshot(partition: &PartitionedDataset) -> Option<MetricSnapshot> {
    let date_range = partition.date_range?;
    let data = &partition.dataset;
    let records = &data.records;

    let unique_entities = records
        .iter()
        .map(|record| record.entity_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();

    let temperatures: Vec<(f64, NaiveDateTime)> = records
        .iter()
        .filter_map(|record| {
            numeric(record, TEMPERATURE_COLUMN).map(|temperature| (temperature, record.timestamp))
        })
        .collect();
    // First occurrence wins on ties.
    let warmest = temperatures
        .iter()
        .fold(None::<(f64, NaiveDateTime)>, |best, &(t, ts)| match best {
            Some((b, _)) if b >= t => best,
            _ => Some((t, ts)),
        })
        .map(|(temperature, timestamp)| TemperatureExtreme {
            temperature,
            timestamp,
        });
    let coldest = temperatures
        .iter()
        .fold(None::<(f64, NaiveDateTime)>, |best, &(t, ts)| match best {
            Some((b, _)) if b <= t => best,
            _ => Some((t, ts)),
        })
        .map(|(temperature, timestamp)| TemperatureExtreme {
            temperature,
            timestamp,
        });

    let weekend_vs_weekday = data
        .has_column(AVAILABLE_BIKES_COLUMN)
        .then(|| weekend_comparison(records, AVAILABLE_BIKES_COLUMN));

    let correlation_columns: Vec<String> = CORRELATION_COLUMNS
        .iter()
        .filter(|column| data.has_column(column))
        .map(|column| column.to_string())
        .collect();
    let correlation = correlation_matrix(records, correlation_columns);

    let snapshot = MetricSnapshot {
        partition: partition.name,
        date_range,
        rows: records.len(),
        unique_entities,
        warmest,
        coldest,
        busiest_timestamp: busiest_timestamp(records),
        weekend_vs_weekday,
        weather_over_time: weather_over_time(records),
        correlation,
    };

    info!(
        component = "metrics",
        event = "metrics.snapshot.built",
        partition = partition.name.file_stem(),
        rows = snapshot.rows,
        unique_entities = snapshot.unique_entities,
        hourly_buckets = snapshot.weather_over_time.len()
    );

    Some(snapshot)
}

fn numeric(record: &EnrichedRecord, column: &str) -> Option<f64> {
    record.value(column).as_f64()
}

/// Timestamp with the most readings; earliest wins on ties.
fn busiest_timestamp(records: &[EnrichedRecord]) -> Option<BusiestTimestamp> {
    let mut counts: BTreeMap<NaiveDateTime, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.timestamp).or_default() += 1;
    }
    counts
        .into_iter()
        .fold(None::<BusiestTimestamp>, |best, (timestamp, readings)| match best {
            Some(b) if b.readings >= readings => Some(b),
            _ => Some(BusiestTimestamp {
                timestamp,
                readings,
            }),
        })
}

fn weekend_comparison(records: &[EnrichedRecord], column: &str) -> WeekendComparison {
    let mut weekday = Vec::new();
    let mut weekend = Vec::new();
    for record in records {
        if let Some(value) = numeric(record, column) {
            if record.is_weekend == 1 {
                weekend.push(value);
            } else {
                weekday.push(value);
            }
        }
    }
    WeekendComparison {
        column: column.to_string(),
        weekday_mean: mean(&weekday),
        weekend_mean: mean(&weekend),
    }
}

/// Contiguous hourly buckets from the first to the last reading.
fn weather_over_time(records: &[EnrichedRecord]) -> Vec<HourlyWeather> {
    let mut buckets: BTreeMap<NaiveDateTime, Vec<&EnrichedRecord>> = BTreeMap::new();
    for record in records {
        if let Some(hour) = truncate_to_hour(record.timestamp) {
            buckets.entry(hour).or_default().push(record);
        }
    }
    let (Some(first), Some(last)) = (
        buckets.keys().next().copied(),
        buckets.keys().next_back().copied(),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut hour = first;
    while hour <= last {
        let rows = buckets.get(&hour).map(Vec::as_slice).unwrap_or(&[]);
        let column_mean = |column: &str| {
            let values: Vec<f64> = rows.iter().filter_map(|r| numeric(r, column)).collect();
            mean(&values)
        };
        out.push(HourlyWeather {
            hour_start: hour,
            humidity_mean: column_mean(HUMIDITY_COLUMN),
            wind_speed_mean: column_mean(WIND_SPEED_COLUMN),
            temperature_mean: column_mean(TEMPERATURE_COLUMN),
            total_available_bikes: rows
                .iter()
                .filter_map(|r| match r.value(TOTAL_AVAILABLE_BIKES_COLUMN) {
                    Value::Int(count) => Some(count),
                    _ => None,
                })
                .sum(),
        });
        hour += Duration::hours(1);
    }
    out
}

fn truncate_to_hour(timestamp: NaiveDateTime) -> Option<NaiveDateTime> {
    timestamp
        .date()
        .and_hms_opt(timestamp.time().hour(), 0, 0)
}

/// Pairwise-complete Pearson correlation.
fn correlation_matrix(records: &[EnrichedRecord], columns: Vec<String>) -> CorrelationMatrix {
    let series: Vec<Vec<Option<f64>>> = columns
        .iter()
        .map(|column| records.iter().map(|r| numeric(r, column)).collect())
        .collect();

    let values = series
        .iter()
        .map(|a| series.iter().map(|b| pearson(a, b)).collect())
        .collect();

    CorrelationMatrix { columns, values }
}

pub fn pearson(a: &[Option<f64>], b: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    if pairs.len() < 2 {
        return None;
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
