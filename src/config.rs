//! Job configuration assembled from `BIKEPREP_*` environment variables.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merge::{MergeConfig, UnmatchedPolicy};
use crate::partition::DEFAULT_PREFIX_RULE;
use crate::reader::{ReaderConfig, DEFAULT_MAX_PAGES};
use crate::records::{DEFAULT_ENTITY_FIELD, JOIN_KEYS, TIMESTAMP_FIELD};
use crate::schedule::{DEFAULT_LOOKBACK_DAYS, DEFAULT_OFFSET_DAYS};
use crate::split::{DEFAULT_SEED, DEFAULT_TARGET_COLUMN, DEFAULT_TEST_FRACTION};
use crate::sqlite_store::DEFAULT_PAGE_SIZE;
use crate::weather::{
    WeatherQuery, DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_LATITUDE, DEFAULT_LONGITUDE,
    DEFAULT_WEATHER_BASE_URL,
};

pub const DEFAULT_TIMEZONE: &str = "Europe/Stockholm";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub store_path: PathBuf,
    pub storage_root: PathBuf,
    pub bucket: String,
    pub processed_prefix: String,
    pub training_prefix: String,
    pub metrics_prefix: String,
    pub weather_prefix: String,
    pub lookback_days: u32,
    pub offset_days: u32,
    pub timezone: String,
    pub prefix_rule: String,
    pub unmatched: UnmatchedPolicy,
    pub target_column: String,
    pub test_fraction: f64,
    pub seed: u64,
    pub weather_base_url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub http_timeout_ms: u64,
    pub page_size: usize,
    pub entity_field: String,
    pub max_pages: usize,
    pub join_keys: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/readings.sqlite"),
            storage_root: PathBuf::from("data/objects"),
            bucket: "bikeprep".to_string(),
            processed_prefix: "processed_data".to_string(),
            training_prefix: "training".to_string(),
            metrics_prefix: "graphs_data".to_string(),
            weather_prefix: "weather_data".to_string(),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            offset_days: DEFAULT_OFFSET_DAYS,
            timezone: DEFAULT_TIMEZONE.to_string(),
            prefix_rule: DEFAULT_PREFIX_RULE.to_string(),
            unmatched: UnmatchedPolicy::PadWithNulls,
            target_column: DEFAULT_TARGET_COLUMN.to_string(),
            test_fraction: DEFAULT_TEST_FRACTION,
            seed: DEFAULT_SEED,
            weather_base_url: DEFAULT_WEATHER_BASE_URL.to_string(),
            latitude: DEFAULT_LATITUDE,
            longitude: DEFAULT_LONGITUDE,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            page_size: DEFAULT_PAGE_SIZE,
            entity_field: DEFAULT_ENTITY_FIELD.to_string(),
            max_pages: DEFAULT_MAX_PAGES,
            join_keys: JOIN_KEYS.iter().map(|key| key.to_string()).collect(),
        }
    }
}

impl PipelineConfig {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        parse_timezone("BIKEPREP_TIMEZONE", &self.timezone)
    }

    pub fn weather_query(&self) -> WeatherQuery {
        WeatherQuery {
            base_url: self.weather_base_url.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            entity_field: self.entity_field.clone(),
            timestamp_field: TIMESTAMP_FIELD.to_string(),
            max_pages: self.max_pages,
        }
    }

    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            entity_column: self.entity_field.clone(),
            join_keys: self.join_keys.clone(),
            unmatched: self.unmatched,
        }
    }
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::default();

    if let Some(path) = env_string("BIKEPREP_STORE_PATH") {
        config.store_path = PathBuf::from(path);
    }
    if let Some(root) = env_string("BIKEPREP_STORAGE_ROOT") {
        config.storage_root = PathBuf::from(root);
    }
    if let Some(bucket) = env_string("BIKEPREP_BUCKET") {
        config.bucket = bucket;
    }
    if let Some(prefix) = env_string("BIKEPREP_PROCESSED_PREFIX") {
        config.processed_prefix = prefix;
    }
    if let Some(prefix) = env_string("BIKEPREP_TRAINING_PREFIX") {
        config.training_prefix = prefix;
    }
    if let Some(prefix) = env_string("BIKEPREP_METRICS_PREFIX") {
        config.metrics_prefix = prefix;
    }
    if let Some(prefix) = env_string("BIKEPREP_WEATHER_PREFIX") {
        config.weather_prefix = prefix;
    }
    if let Some(days) = env_parse("BIKEPREP_LOOKBACK_DAYS")? {
        config.lookback_days = days;
    }
    if let Some(days) = env_parse("BIKEPREP_OFFSET_DAYS")? {
        config.offset_days = days;
    }
    if let Some(timezone) = env_string("BIKEPREP_TIMEZONE") {
        parse_timezone("BIKEPREP_TIMEZONE", &timezone)?;
        config.timezone = timezone;
    }
    if let Some(rule) = env_string("BIKEPREP_PREFIX_RULE") {
        config.prefix_rule = rule;
    }
    if let Some(raw) = env_string("BIKEPREP_UNMATCHED_POLICY") {
        config.unmatched = parse_unmatched_policy(&raw).ok_or_else(|| ConfigError::Invalid {
            var: "BIKEPREP_UNMATCHED_POLICY",
            value: raw.clone(),
            reason: "expected 'pad' or 'drop'".to_string(),
        })?;
    }
    if let Some(target) = env_string("BIKEPREP_TARGET_COLUMN") {
        config.target_column = target;
    }
    if let Some(fraction) = env_parse::<f64>("BIKEPREP_TEST_FRACTION")? {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::Invalid {
                var: "BIKEPREP_TEST_FRACTION",
                value: fraction.to_string(),
                reason: "must be strictly between 0 and 1".to_string(),
            });
        }
        config.test_fraction = fraction;
    }
    if let Some(seed) = env_parse("BIKEPREP_SEED")? {
        config.seed = seed;
    }
    if let Some(url) = env_string("BIKEPREP_WEATHER_URL") {
        config.weather_base_url = url;
    }
    if let Some(latitude) = env_parse("BIKEPREP_LATITUDE")? {
        config.latitude = latitude;
    }
    if let Some(longitude) = env_parse("BIKEPREP_LONGITUDE")? {
        config.longitude = longitude;
    }
    if let Some(timeout) = env_parse("BIKEPREP_HTTP_TIMEOUT_MS")? {
        config.http_timeout_ms = timeout;
    }
    if let Some(page_size) = env_parse::<usize>("BIKEPREP_PAGE_SIZE")? {
        if page_size == 0 {
            return Err(ConfigError::Invalid {
                var: "BIKEPREP_PAGE_SIZE",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        config.page_size = page_size;
    }
    if let Some(field) = env_string("BIKEPREP_ENTITY_FIELD") {
        config.entity_field = field;
    }
    if let Some(max_pages) = env_parse::<usize>("BIKEPREP_MAX_PAGES")? {
        if max_pages == 0 {
            return Err(ConfigError::Invalid {
                var: "BIKEPREP_MAX_PAGES",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        config.max_pages = max_pages;
    }
    if let Some(raw) = env_string("BIKEPREP_JOIN_KEYS") {
        config.join_keys = parse_join_keys(&raw).ok_or_else(|| ConfigError::Invalid {
            var: "BIKEPREP_JOIN_KEYS",
            value: raw.clone(),
            reason: format!("expected a comma-separated subset of {}", JOIN_KEYS.join(",")),
        })?;
    }

    Ok(config)
}

fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn env_parse<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env_string(var) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid {
                var,
                value: raw,
                reason: err.to_string(),
            }),
    }
}

fn parse_timezone(var: &'static str, raw: &str) -> Result<Tz, ConfigError> {
    raw.parse::<Tz>().map_err(|err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn parse_unmatched_policy(raw: &str) -> Option<UnmatchedPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "pad" | "pad_with_nulls" | "keep" => Some(UnmatchedPolicy::PadWithNulls),
        "drop" => Some(UnmatchedPolicy::Drop),
        _ => None,
    }
}

fn parse_join_keys(raw: &str) -> Option<Vec<String>> {
    let keys: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect();
    let known = keys.iter().all(|key| JOIN_KEYS.contains(&key.as_str()));
    (known && !keys.is_empty()).then_some(keys)
}
