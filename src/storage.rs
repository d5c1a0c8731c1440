//! Object storage seam, local directory backend, and the tabular CSV codec.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::partition::{DateRange, PartitionName};
use crate::records::{EnrichedDataset, Row, Value};
use crate::split::FeatureMatrix;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const METRICS_FILE: &str = "data.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

pub trait ObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;
    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Objects stored as files under `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for part in [bucket, key] {
            let relative = Path::new(part);
            let valid = !part.is_empty()
                && relative
                    .components()
                    .all(|component| matches!(component, Component::Normal(_)));
            if !valid {
                return Err(StorageError::InvalidKey(format!("{bucket}/{key}")));
            }
            path.push(relative);
        }
        Ok(path)
    }
}

impl ObjectStore for LocalObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, bytes)?;
        debug!(
            component = "storage",
            event = "storage.put",
            bucket,
            key,
            bytes = bytes.len()
        );
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

/// `{prefix}/{sub}/{min}-{max}/{file}` with empty prefix segments skipped.
pub fn partition_key(prefix: &str, name: PartitionName, range: &DateRange, file: &str) -> String {
    join_key(&[prefix, name.sub_path(), &range.label(), file])
}

pub fn partition_csv_key(prefix: &str, name: PartitionName, range: &DateRange) -> String {
    partition_key(prefix, name, range, &format!("{}.csv", name.file_stem()))
}

/// `{prefix}/{train|test}/{min}-{max}/{sub}/{X_train|y_train|X_test|y_test}.csv`
pub fn split_key(prefix: &str, side: SplitSide, range: &DateRange, name: PartitionName, file: &str) -> String {
    join_key(&[
        prefix,
        side.as_str(),
        &range.label(),
        name.sub_path(),
        &format!("{file}.csv"),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitSide {
    Train,
    Test,
}

impl SplitSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn encode_csv<I>(header: &[String], rows: I) -> Result<Vec<u8>, StorageError>
where
    I: IntoIterator<Item = Vec<Value>>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row.iter().map(Value::render))?;
    }
    writer
        .into_inner()
        .map_err(|err| StorageError::Io(err.into_error()))
}

pub fn encode_dataset(dataset: &EnrichedDataset) -> Result<Vec<u8>, StorageError> {
    encode_csv(
        &dataset.header(),
        dataset.records.iter().map(|record| dataset.cells(record)),
    )
}

pub fn encode_matrix(matrix: &FeatureMatrix) -> Result<Vec<u8>, StorageError> {
    encode_csv(&matrix.columns, matrix.rows.iter().cloned())
}

pub fn encode_series(name: &str, values: &[Value]) -> Result<Vec<u8>, StorageError> {
    encode_csv(
        &[name.to_string()],
        values.iter().map(|value| vec![value.clone()]),
    )
}

/// Decodes a headed CSV object into rows keyed by header name.
pub fn decode_csv_rows(bytes: &[u8]) -> Result<Vec<Row>, StorageError> {
    decode_csv_table(bytes).map(|(_, rows)| rows)
}

/// Header in file order plus the decoded rows.
pub fn decode_csv_table(bytes: &[u8]) -> Result<(Vec<String>, Vec<Row>), StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, cell)| (header.to_string(), cell.to_string()))
            .collect();
        rows.push(row);
    }
    Ok((headers.iter().map(str::to_string).collect(), rows))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub partition: PartitionName,
    pub rows: usize,
    pub date_range: DateRange,
    pub columns: Vec<String>,
    pub schema_fingerprint: String,
}

impl PartitionManifest {
    pub fn new(name: PartitionName, dataset: &EnrichedDataset, date_range: DateRange) -> Self {
        let columns = dataset.header();
        Self {
            partition: name,
            rows: dataset.len(),
            date_range,
            schema_fingerprint: schema_fingerprint(&columns),
            columns,
        }
    }
}

/// SHA-256 over the ordered column names.
pub fn schema_fingerprint(columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub fn put_json<T: Serialize>(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.put(bucket, key, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn range() -> DateRange {
        DateRange {
            min_date: NaiveDate::from_ymd_opt(2023, 9, 10).unwrap(),
            max_date: NaiveDate::from_ymd_opt(2023, 9, 23).unwrap(),
        }
    }

    #[test]
    fn keys_follow_output_layout() {
        assert_eq!(
            partition_csv_key("processed_data", PartitionName::SingleBikes, &range()),
            "processed_data/single_bikes/2023-09-10-2023-09-23/SingleBikes.csv"
        );
        assert_eq!(
            partition_key("graphs_data/", PartitionName::Stations, &range(), METRICS_FILE),
            "graphs_data/station_bikes/2023-09-10-2023-09-23/data.json"
        );
        assert_eq!(
            split_key("training", SplitSide::Test, &range(), PartitionName::Stations, "y_test"),
            "training/test/2023-09-10-2023-09-23/station_bikes/y_test.csv"
        );
        assert_eq!(
            partition_key("", PartitionName::Stations, &range(), "a.csv"),
            "station_bikes/2023-09-10-2023-09-23/a.csv"
        );
    }

    #[test]
    fn local_store_roundtrips_and_reports_missing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store.put("bucket", "a/b/c.csv", b"x,y\n1,2\n").unwrap();
        assert_eq!(store.get("bucket", "a/b/c.csv").unwrap(), b"x,y\n1,2\n");
        assert!(dir.path().join("bucket/a/b/c.csv").exists());
        assert!(!dir.path().join("bucket/a/b/c.csv.tmp").exists());

        assert!(matches!(
            store.get("bucket", "missing.csv"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["../x.csv", "/etc/passwd", ""] {
            assert!(
                matches!(store.put("bucket", key, b""), Err(StorageError::InvalidKey(_))),
                "{key}"
            );
        }
    }

    #[test]
    fn csv_codec_keeps_header_order_and_null_cells() {
        let header = vec!["stationId".to_string(), "Temperature".to_string()];
        let bytes = encode_csv(
            &header,
            vec![
                vec![Value::Text("S1".to_string()), Value::Float(15.5)],
                vec![Value::Text("S, 2".to_string()), Value::Null],
            ],
        )
        .unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("stationId,Temperature\n"));

        let rows = decode_csv_rows(&bytes).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Temperature"], "15.5");
        assert_eq!(rows[1]["stationId"], "S, 2");
        assert_eq!(rows[1]["Temperature"], "");
    }

    #[test]
    fn fingerprint_depends_on_column_order() {
        let a = schema_fingerprint(&["a".to_string(), "b".to_string()]);
        let b = schema_fingerprint(&["b".to_string(), "a".to_string()]);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
