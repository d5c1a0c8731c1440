//! Fusion and training-split jobs wired over the injected collaborators.

use std::collections::BTreeMap;

use chrono::Datelike;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::enrich::{is_weekend, EnrichReport, FeatureEnricher};
use crate::merge::{ColumnReconciler, DatasetMerger, MergeError, MergeReport};
use crate::metrics::build_metric_snapshot;
use crate::partition::{DateRange, EntityPartitioner, PartitionName, PartitionedDataset};
use crate::reader::{FetchOutcome, ReadingStore, RetrievalError, WindowedReader};
use crate::records::{
    EnrichedDataset, EnrichedRecord, RawReading, SchemaError, Value,
    IS_WEEKEND_COLUMN, TIMESTAMP_FIELD, TOTAL_AVAILABLE_BIKES_COLUMN,
};
use crate::schedule::FetchWindow;
use crate::split::{SplitError, TrainTestSplitter};
use crate::storage::{
    decode_csv_table, encode_csv, encode_dataset, encode_matrix, encode_series, join_key,
    partition_csv_key, partition_key, put_json, split_key, ObjectStore, PartitionManifest,
    SplitSide, StorageError, MANIFEST_FILE, METRICS_FILE,
};
use crate::time_features::{parse_timestamp, DeriveError, DeriveReport, TimeFeatureDeriver};
use crate::weather::{WeatherError, WEATHER_TIME_LABEL};

pub const WEATHER_FILE: &str = "weather.csv";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Derive(#[from] DeriveError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Weather(#[from] WeatherError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("stored partition {key} is malformed: {reason}")]
    MalformedPartition { key: String, reason: String },
}

/// Expected "nothing to do" outcomes; reported, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EmptyResultNotice {
    NoBikeReadings,
    NoWeatherReadings,
    EmptyPartition(PartitionName),
    InsufficientRows(PartitionName),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedPartition {
    pub name: PartitionName,
    pub rows: usize,
    pub date_range: DateRange,
    pub data_key: String,
    pub manifest_key: String,
    pub metrics_key: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FusionReport {
    pub bike_rows: usize,
    pub weather_rows: usize,
    pub bike_derive: Option<DeriveReport>,
    pub weather_derive: Option<DeriveReport>,
    pub merge: Option<MergeReport>,
    pub enrich: Option<EnrichReport>,
    pub persisted: Vec<PersistedPartition>,
    pub notices: Vec<EmptyResultNotice>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FusionOutcome {
    pub report: FusionReport,
    pub partitions: BTreeMap<PartitionName, PartitionedDataset>,
}

/// Fetches bike readings for `window`, fuses them with `weather`, and
/// persists every non-empty partition with its manifest and metrics.
pub fn run_fusion(
    config: &PipelineConfig,
    window: &FetchWindow,
    store: &dyn ReadingStore,
    weather: Vec<RawReading>,
    objects: &dyn ObjectStore,
) -> Result<FusionOutcome, PipelineError> {
    let mut report = FusionReport {
        weather_rows: weather.len(),
        ..FusionReport::default()
    };

    info!(
        component = "pipeline",
        event = "pipeline.fusion.start",
        window = %window.label(),
        weather_rows = report.weather_rows
    );

    let reader = WindowedReader::new(store, config.reader_config());
    let (start, end) = window.fetch_bounds();
    let bikes = match reader.fetch(start, end)? {
        FetchOutcome::NoData => {
            warn!(
                component = "pipeline",
                event = "pipeline.fusion.no_bike_readings",
                window = %window.label()
            );
            report.notices.push(EmptyResultNotice::NoBikeReadings);
            return Ok(FusionOutcome {
                report,
                partitions: BTreeMap::new(),
            });
        }
        FetchOutcome::Rows(rows) => rows,
    };
    report.bike_rows = bikes.len();

    if weather.is_empty() {
        warn!(
            component = "pipeline",
            event = "pipeline.fusion.no_weather_readings",
            window = %window.label()
        );
        report.notices.push(EmptyResultNotice::NoWeatherReadings);
    }

    let (bikes, bike_derive) = TimeFeatureDeriver::new("bikes").derive(bikes)?;
    let (weather, weather_derive) = TimeFeatureDeriver::new("weather").derive(weather)?;
    report.bike_derive = Some(bike_derive);
    report.weather_derive = Some(weather_derive);

    let merger = DatasetMerger::new(config.merge_config());
    let (fused, merge_report) = merger.merge(&bikes, &weather)?;
    report.merge = Some(merge_report);

    let reconciled = ColumnReconciler::default().reconcile(fused)?;
    let (enriched, enrich_report) = FeatureEnricher::new().enrich(reconciled)?;
    report.enrich = Some(enrich_report);

    let partitions = EntityPartitioner::new().partition(enriched, &config.prefix_rule);

    for part in partitions.values() {
        match part.date_range {
            Some(range) => {
                let persisted = persist_partition(config, objects, part, range)?;
                report.persisted.push(persisted);
            }
            None => {
                info!(
                    component = "pipeline",
                    event = "pipeline.fusion.empty_partition",
                    partition = part.name.file_stem()
                );
                report.notices.push(EmptyResultNotice::EmptyPartition(part.name));
            }
        }
    }

    info!(
        component = "pipeline",
        event = "pipeline.fusion.finish",
        bike_rows = report.bike_rows,
        weather_rows = report.weather_rows,
        persisted = report.persisted.len(),
        notices = report.notices.len()
    );

    Ok(FusionOutcome { report, partitions })
}

/// Writes data, then metrics, then the manifest. A partition directory with
/// a manifest is complete; a failed run never leaves one behind.
fn persist_partition(
    config: &PipelineConfig,
    objects: &dyn ObjectStore,
    part: &PartitionedDataset,
    range: DateRange,
) -> Result<PersistedPartition, PipelineError> {
    // All encoding happens before the first write.
    let data = encode_dataset(&part.dataset)?;
    let manifest = PartitionManifest::new(part.name, &part.dataset, range);
    let snapshot = build_metric_snapshot(part);

    let data_key = partition_csv_key(&config.processed_prefix, part.name, &range);
    let manifest_key = partition_key(&config.processed_prefix, part.name, &range, MANIFEST_FILE);
    let metrics_key = partition_key(&config.metrics_prefix, part.name, &range, METRICS_FILE);

    objects.put(&config.bucket, &data_key, &data)?;
    if let Some(snapshot) = snapshot {
        put_json(objects, &config.bucket, &metrics_key, &snapshot)?;
    }
    put_json(objects, &config.bucket, &manifest_key, &manifest)?;

    info!(
        component = "pipeline",
        event = "pipeline.partition.persisted",
        partition = part.name.file_stem(),
        rows = part.len(),
        key = %data_key
    );

    Ok(PersistedPartition {
        name: part.name,
        rows: part.len(),
        date_range: range,
        data_key,
        manifest_key,
        metrics_key,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedSplit {
    pub name: PartitionName,
    pub train_rows: usize,
    pub test_rows: usize,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SplitReport {
    pub persisted: Vec<PersistedSplit>,
    pub notices: Vec<EmptyResultNotice>,
}

/// Splits and persists each partition. Partitions too small to split are
/// reported as notices; schema problems abort the run.
pub fn run_training_split(
    config: &PipelineConfig,
    partitions: &BTreeMap<PartitionName, PartitionedDataset>,
    objects: &dyn ObjectStore,
) -> Result<SplitReport, PipelineError> {
    let splitter = TrainTestSplitter::new();
    let mut report = SplitReport::default();

    for part in partitions.values() {
        let Some(range) = part.date_range else {
            report.notices.push(EmptyResultNotice::EmptyPartition(part.name));
            continue;
        };

        let split = match splitter.split(part, &config.target_column, config.test_fraction, config.seed) {
            Ok(split) => split,
            Err(SplitError::EmptyDataset) | Err(SplitError::InsufficientRows { .. }) => {
                warn!(
                    component = "pipeline",
                    event = "pipeline.split.skipped",
                    partition = part.name.file_stem(),
                    rows = part.len()
                );
                report.notices.push(EmptyResultNotice::InsufficientRows(part.name));
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let objects_to_write = [
            (SplitSide::Train, "X_train", encode_matrix(&split.x_train)?),
            (SplitSide::Train, "y_train", encode_series(&split.target, &split.y_train)?),
            (SplitSide::Test, "X_test", encode_matrix(&split.x_test)?),
            (SplitSide::Test, "y_test", encode_series(&split.target, &split.y_test)?),
        ];

        let mut keys = Vec::with_capacity(objects_to_write.len());
        for (side, file, bytes) in objects_to_write {
            let key = split_key(&config.training_prefix, side, &range, part.name, file);
            objects.put(&config.bucket, &key, &bytes)?;
            keys.push(key);
        }

        info!(
            component = "pipeline",
            event = "pipeline.split.persisted",
            partition = part.name.file_stem(),
            train_rows = split.x_train.len(),
            test_rows = split.x_test.len()
        );

        report.persisted.push(PersistedSplit {
            name: part.name,
            train_rows: split.x_train.len(),
            test_rows: split.x_test.len(),
            keys,
        });
    }

    Ok(report)
}

/// Reloads a persisted partition CSV into typed records.
pub fn load_partition(
    config: &PipelineConfig,
    objects: &dyn ObjectStore,
    name: PartitionName,
    range: DateRange,
) -> Result<PartitionedDataset, PipelineError> {
    let key = partition_csv_key(&config.processed_prefix, name, &range);
    let bytes = objects.get(&config.bucket, &key)?;
    let (header, rows) = decode_csv_table(&bytes)?;

    let malformed = |reason: String| PipelineError::MalformedPartition {
        key: key.clone(),
        reason,
    };

    let mut header = header.into_iter();
    let entity_column = header
        .next()
        .ok_or_else(|| malformed("empty header".to_string()))?;
    let mut columns: Vec<String> = header.collect();
    if !columns.iter().any(|column| column == TIMESTAMP_FIELD) {
        return Err(malformed(format!("no '{TIMESTAMP_FIELD}' column")));
    }
    if !columns.iter().any(|column| column == IS_WEEKEND_COLUMN) {
        columns.push(IS_WEEKEND_COLUMN.to_string());
    }

    let mut records = Vec::with_capacity(rows.len());
    for (idx, mut row) in rows.into_iter().enumerate() {
        let entity_id = row
            .remove(&entity_column)
            .ok_or_else(|| malformed(format!("row {idx} has no entity id")))?;
        let timestamp = row
            .get(TIMESTAMP_FIELD)
            .and_then(|raw| parse_timestamp(raw))
            .ok_or_else(|| malformed(format!("row {idx} has no parseable timestamp")))?;
        // The flag always follows the timestamp; a stored copy must agree.
        let weekend = u8::from(is_weekend(timestamp.weekday()));
        if let Some(stored) = row.remove(IS_WEEKEND_COLUMN) {
            if stored.trim().parse::<u8>().ok() != Some(weekend) {
                return Err(malformed(format!(
                    "row {idx} has {IS_WEEKEND_COLUMN}={stored:?} but {timestamp} is a {}",
                    timestamp.weekday()
                )));
            }
        }
        let total_available_bikes = row
            .remove(TOTAL_AVAILABLE_BIKES_COLUMN)
            .and_then(|raw| raw.trim().parse::<i64>().ok());

        let cells = row
            .into_iter()
            .map(|(column, raw)| {
                let value = if column == TIMESTAMP_FIELD {
                    Value::Timestamp(timestamp)
                } else {
                    Value::infer(&raw)
                };
                (column, value)
            })
            .collect();

        records.push(EnrichedRecord {
            entity_id,
            timestamp,
            is_weekend: weekend,
            total_available_bikes,
            columns: cells,
        });
    }

    Ok(PartitionedDataset {
        name,
        dataset: EnrichedDataset {
            entity_column,
            columns,
            records,
        },
        date_range: Some(range),
    })
}

/// Writes the raw hourly weather rows as `{weather_prefix}/{window}/weather.csv`.
pub fn persist_weather_readings(
    config: &PipelineConfig,
    objects: &dyn ObjectStore,
    window: &FetchWindow,
    readings: &[RawReading],
) -> Result<String, PipelineError> {
    let mut header = vec![WEATHER_TIME_LABEL.to_string()];
    for reading in readings {
        for column in reading.attributes.keys() {
            if !header.contains(column) {
                header.push(column.clone());
            }
        }
    }

    let rows = readings.iter().map(|reading| {
        header
            .iter()
            .map(|column| {
                let raw = if column == WEATHER_TIME_LABEL {
                    reading
                        .timestamp
                        .as_deref()
                        .or_else(|| reading.attributes.get(column).map(String::as_str))
                } else {
                    reading.attributes.get(column).map(String::as_str)
                };
                raw.map(|text| Value::Text(text.to_string()))
                    .unwrap_or(Value::Null)
            })
            .collect::<Vec<_>>()
    });
    let bytes = encode_csv(&header, rows)?;

    let key = join_key(&[&config.weather_prefix, &window.label(), WEATHER_FILE]);
    objects.put(&config.bucket, &key, &bytes)?;
    Ok(key)
}
