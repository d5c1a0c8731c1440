//! bikeprep core crate.
//!
//! Fuses bike-sharing station readings with hourly weather and prepares
//! partitioned training datasets:
//! - windowed retrieval from a paginated reading store
//! - timestamp normalization and calendar features
//! - hourly left join and join-artifact reconciliation
//! - weekend / bike-count enrichment, entity partitioning, seeded splits

mod config;
mod enrich;
mod merge;
mod metrics;
mod observability;
mod partition;
mod pipeline;
mod reader;
mod records;
mod schedule;
mod split;
mod sqlite_store;
mod storage;
#[cfg(test)]
mod test_env;
mod time_features;
mod weather;

pub use config::{pipeline_config_from_env, ConfigError, PipelineConfig, DEFAULT_TIMEZONE};
pub use enrich::{count_list_elements, is_weekend, EnrichReport, FeatureEnricher};
pub use merge::{
    ColumnReconciler, DatasetMerger, MergeConfig, MergeError, MergeReport, ReconcileConfig,
    UnmatchedPolicy, PRIMARY_SUFFIX, SECONDARY_SUFFIX,
};
pub use metrics::{
    build_metric_snapshot, pearson, BusiestTimestamp, CorrelationMatrix, HourlyWeather,
    MetricSnapshot, TemperatureExtreme, WeekendComparison, CORRELATION_COLUMNS,
};
pub use observability::{
    init_logging, log_job_finish, log_job_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use partition::{
    DateRange, EntityPartitioner, PartitionName, PartitionedDataset, DEFAULT_PREFIX_RULE,
};
pub use pipeline::{
    load_partition, persist_weather_readings, run_fusion, run_training_split, EmptyResultNotice,
    FusionOutcome, FusionReport, PersistedPartition, PersistedSplit, PipelineError, SplitReport,
};
pub use reader::{
    FetchOutcome, InMemoryReadingStore, ReaderConfig, ReadingStore, RetrievalError, ScanPage,
    StoreError, TimestampFilter, WindowedReader, DEFAULT_MAX_PAGES,
};
pub use records::{
    EnrichedDataset, EnrichedRecord, FusedDataset, FusedRecord, NormalizedRecord,
    ParseWarning, RawReading, Row, SchemaError, TimeParts, Value, BIKE_IDS_COLUMN,
    DEFAULT_ENTITY_FIELD, IS_WEEKEND_COLUMN, JOIN_KEYS, TIMESTAMP_FIELD,
    TOTAL_AVAILABLE_BIKES_COLUMN, WEATHER_ENTITY_ID,
};
pub use schedule::{
    default_window_from, reference_in_timezone, window_from, FetchWindow, DEFAULT_LOOKBACK_DAYS,
    DEFAULT_OFFSET_DAYS,
};
pub use split::{
    FeatureMatrix, SplitError, TrainTestSplit, TrainTestSplitter, DEFAULT_SEED,
    DEFAULT_TARGET_COLUMN, DEFAULT_TEST_FRACTION,
};
pub use sqlite_store::{SqliteReadingStore, DEFAULT_PAGE_SIZE};
pub use storage::{
    decode_csv_rows, decode_csv_table, encode_csv, encode_dataset, partition_csv_key,
    partition_key, schema_fingerprint, split_key, LocalObjectStore, ObjectStore,
    PartitionManifest, SplitSide, StorageError, MANIFEST_FILE, METRICS_FILE,
};
pub use time_features::{parse_timestamp, DeriveError, DeriveReport, TimeFeatureDeriver};
pub use weather::{
    fetch_weather_readings, weather_readings_from_hourly, weather_request_url, HttpJsonClient,
    ReqwestBlockingClient, WeatherError, WeatherQuery,
};
