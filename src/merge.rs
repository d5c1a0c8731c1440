//! Hourly left join of bike and weather records, plus join-artifact cleanup.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::records::{
    FusedDataset, FusedRecord, NormalizedRecord, SchemaError, Value, DAY_COLUMN,
    DEFAULT_ENTITY_FIELD, HOUR_COLUMN, JOIN_KEYS, MINUTE_COLUMN, MONTH_COLUMN,
    TIMESTAMP_FIELD, TIME_OF_DAY_COLUMN, TimeParts, YEAR_COLUMN,
};

pub const PRIMARY_SUFFIX: &str = "_x";
pub const SECONDARY_SUFFIX: &str = "_y";

/// Per-side columns both inputs always carry; they collide on every join.
const SIDE_COLUMNS: [&str; 3] = [TIMESTAMP_FIELD, TIME_OF_DAY_COLUMN, MINUTE_COLUMN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmatchedPolicy {
    /// Keep the primary row with null secondary columns.
    PadWithNulls,
    /// Remove primary rows that found no secondary row.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    pub entity_column: String,
    /// Ordered calendar columns the buckets are keyed on; a subset of [`JOIN_KEYS`].
    pub join_keys: Vec<String>,
    pub unmatched: UnmatchedPolicy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            entity_column: DEFAULT_ENTITY_FIELD.to_string(),
            join_keys: JOIN_KEYS.iter().map(|key| key.to_string()).collect(),
            unmatched: UnmatchedPolicy::PadWithNulls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub primary_rows: u64,
    pub secondary_rows: u64,
    pub secondary_duplicates_dropped: u64,
    pub secondary_unparseable: u64,
    pub matched_rows: u64,
    pub unmatched_rows: u64,
    pub dropped_rows: u64,
    pub output_rows: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("primary dataset is empty; nothing to join")]
    EmptyPrimary,
    #[error("no join keys configured")]
    NoJoinKeys,
    #[error("'{0}' is not a calendar join key (expected one of Year, Month, Day, Hour)")]
    UnsupportedJoinKey(String),
}

#[derive(Debug, Clone, Default)]
pub struct DatasetMerger {
    config: MergeConfig,
}

impl DatasetMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn join_keys(&self) -> &[String] {
        &self.config.join_keys
    }

    fn validate_join_keys(&self) -> Result<(), MergeError> {
        if self.config.join_keys.is_empty() {
            return Err(MergeError::NoJoinKeys);
        }
        match self
            .config
            .join_keys
            .iter()
            .find(|key| !JOIN_KEYS.contains(&key.as_str()))
        {
            Some(key) => Err(MergeError::UnsupportedJoinKey(key.clone())),
            None => Ok(()),
        }
    }

    fn bucket(&self, parts: &TimeParts) -> Vec<i64> {
        self.config
            .join_keys
            .iter()
            .filter_map(|key| parts.calendar_value(key))
            .collect()
    }

    pub fn merge(
        &self,
        primary: &[NormalizedRecord],
        secondary: &[NormalizedRecord],
    ) -> Result<(FusedDataset, MergeReport), MergeError> {
        if primary.is_empty() {
            return Err(MergeError::EmptyPrimary);
        }
        self.validate_join_keys()?;

        let mut report = MergeReport {
            primary_rows: primary.len() as u64,
            secondary_rows: secondary.len() as u64,
            ..MergeReport::default()
        };

        // First occurrence per bucket wins.
        let mut lookup: HashMap<Vec<i64>, &NormalizedRecord> = HashMap::new();
        for record in secondary {
            match &record.parts {
                Some(parts) => {
                    let bucket = self.bucket(parts);
                    if lookup.contains_key(&bucket) {
                        report.secondary_duplicates_dropped += 1;
                    } else {
                        lookup.insert(bucket, record);
                    }
                }
                None => report.secondary_unparseable += 1,
            }
        }
        if report.secondary_duplicates_dropped > 0 {
            debug!(
                component = "merge",
                event = "merge.secondary.deduplicated",
                dropped = report.secondary_duplicates_dropped
            );
        }

        let primary_attrs = attribute_names(primary);
        let secondary_attrs = attribute_names(secondary);
        let layout = ColumnLayout::new(&primary_attrs, &secondary_attrs);

        let mut records = Vec::with_capacity(primary.len());
        for record in primary {
            let matched = record
                .parts
                .as_ref()
                .and_then(|parts| lookup.get(&self.bucket(parts)).copied());

            match matched {
                Some(_) => report.matched_rows += 1,
                None => {
                    report.unmatched_rows += 1;
                    if self.config.unmatched == UnmatchedPolicy::Drop {
                        report.dropped_rows += 1;
                        continue;
                    }
                }
            }

            records.push(layout.fuse(record, matched));
        }
        report.output_rows = records.len() as u64;

        if report.unmatched_rows > 0 {
            warn!(
                component = "merge",
                event = "merge.unmatched_rows",
                unmatched_rows = report.unmatched_rows,
                policy = ?self.config.unmatched
            );
        }
        info!(
            component = "merge",
            event = "merge.finish",
            primary_rows = report.primary_rows,
            secondary_rows = report.secondary_rows,
            matched_rows = report.matched_rows,
            output_rows = report.output_rows
        );

        Ok((
            FusedDataset {
                entity_column: self.config.entity_column.clone(),
                columns: layout.columns,
                records,
            },
            report,
        ))
    }
}

fn attribute_names(records: &[NormalizedRecord]) -> BTreeSet<String> {
    records
        .iter()
        .flat_map(|record| record.attributes.keys().cloned())
        .collect()
}

struct ColumnLayout {
    columns: Vec<String>,
    primary_names: Vec<(String, String)>,
    secondary_names: Vec<(String, String)>,
}

impl ColumnLayout {
    fn new(primary_attrs: &BTreeSet<String>, secondary_attrs: &BTreeSet<String>) -> Self {
        let primary_names: Vec<(String, String)> = primary_attrs
            .iter()
            .map(|name| {
                let output = if secondary_attrs.contains(name) {
                    format!("{name}{PRIMARY_SUFFIX}")
                } else {
                    name.clone()
                };
                (name.clone(), output)
            })
            .collect();
        let secondary_names: Vec<(String, String)> = secondary_attrs
            .iter()
            .map(|name| {
                let output = if primary_attrs.contains(name) {
                    format!("{name}{SECONDARY_SUFFIX}")
                } else {
                    name.clone()
                };
                (name.clone(), output)
            })
            .collect();

        let mut columns: Vec<String> = SIDE_COLUMNS
            .iter()
            .map(|base| format!("{base}{PRIMARY_SUFFIX}"))
            .collect();
        columns.extend(JOIN_KEYS.iter().map(|key| key.to_string()));
        columns.extend(primary_names.iter().map(|(_, output)| output.clone()));
        columns.extend(
            SIDE_COLUMNS
                .iter()
                .map(|base| format!("{base}{SECONDARY_SUFFIX}")),
        );
        columns.extend(secondary_names.iter().map(|(_, output)| output.clone()));

        Self {
            columns,
            primary_names,
            secondary_names,
        }
    }

    fn fuse(&self, primary: &NormalizedRecord, secondary: Option<&NormalizedRecord>) -> FusedRecord {
        let mut columns = BTreeMap::new();

        insert_side_columns(&mut columns, primary, PRIMARY_SUFFIX);
        let keys = match primary.parts {
            Some(parts) => [
                Value::Int(i64::from(parts.year)),
                Value::Int(i64::from(parts.month)),
                Value::Int(i64::from(parts.day)),
                Value::Int(i64::from(parts.hour)),
            ],
            None => [Value::Null, Value::Null, Value::Null, Value::Null],
        };
        for (name, value) in [YEAR_COLUMN, MONTH_COLUMN, DAY_COLUMN, HOUR_COLUMN]
            .into_iter()
            .zip(keys)
        {
            columns.insert(name.to_string(), value);
        }
        insert_attributes(&mut columns, &self.primary_names, Some(primary));

        match secondary {
            Some(record) => insert_side_columns(&mut columns, record, SECONDARY_SUFFIX),
            None => {
                for base in SIDE_COLUMNS {
                    columns.insert(format!("{base}{SECONDARY_SUFFIX}"), Value::Null);
                }
            }
        }
        insert_attributes(&mut columns, &self.secondary_names, secondary);

        FusedRecord {
            entity_id: primary.entity_id.clone(),
            columns,
        }
    }
}

fn insert_side_columns(columns: &mut BTreeMap<String, Value>, record: &NormalizedRecord, suffix: &str) {
    let (timestamp, time_of_day, minute) = match record.parts {
        Some(parts) => (
            Value::Timestamp(parts.timestamp),
            Value::TimeOfDay(parts.time_of_day),
            Value::Int(i64::from(parts.minute)),
        ),
        None => (Value::Null, Value::Null, Value::Null),
    };
    columns.insert(format!("{TIMESTAMP_FIELD}{suffix}"), timestamp);
    columns.insert(format!("{TIME_OF_DAY_COLUMN}{suffix}"), time_of_day);
    columns.insert(format!("{MINUTE_COLUMN}{suffix}"), minute);
}

fn insert_attributes(
    columns: &mut BTreeMap<String, Value>,
    names: &[(String, String)],
    record: Option<&NormalizedRecord>,
) {
    for (source, output) in names {
        let value = record
            .and_then(|record| record.attributes.get(source))
            .map(|raw| Value::infer(raw))
            .unwrap_or(Value::Null);
        columns.insert(output.clone(), value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Bases whose `_x`/`_y` pair must exist after the join.
    pub expected_artifacts: Vec<String>,
    /// Helper columns removed once reconciled.
    pub drop_after: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            expected_artifacts: SIDE_COLUMNS.iter().map(|base| base.to_string()).collect(),
            drop_after: vec![TIME_OF_DAY_COLUMN.to_string()],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ColumnReconciler {
    config: ReconcileConfig,
}

impl ColumnReconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn reconcile(&self, fused: FusedDataset) -> Result<FusedDataset, SchemaError> {
        for base in &self.config.expected_artifacts {
            for suffix in [PRIMARY_SUFFIX, SECONDARY_SUFFIX] {
                let column = format!("{base}{suffix}");
                if !fused.has_column(&column) {
                    return Err(SchemaError::MissingJoinArtifact { column });
                }
            }
        }

        let pairs: Vec<String> = fused
            .columns
            .iter()
            .filter_map(|column| column.strip_suffix(PRIMARY_SUFFIX))
            .filter(|base| fused.has_column(&format!("{base}{SECONDARY_SUFFIX}")))
            .map(str::to_string)
            .collect();

        let FusedDataset {
            entity_column,
            columns,
            mut records,
        } = fused;

        let mut out_columns = Vec::with_capacity(columns.len());
        for column in columns {
            if let Some(base) = column.strip_suffix(PRIMARY_SUFFIX) {
                if pairs.iter().any(|pair| pair == base) {
                    out_columns.push(base.to_string());
                    continue;
                }
            }
            if let Some(base) = column.strip_suffix(SECONDARY_SUFFIX) {
                if pairs.iter().any(|pair| pair == base) {
                    continue;
                }
            }
            out_columns.push(column);
        }
        out_columns.retain(|column| !self.config.drop_after.contains(column));

        for record in &mut records {
            for base in &pairs {
                record.columns.remove(&format!("{base}{SECONDARY_SUFFIX}"));
                if let Some(value) = record.columns.remove(&format!("{base}{PRIMARY_SUFFIX}")) {
                    record.columns.insert(base.clone(), value);
                }
            }
            for column in &self.config.drop_after {
                record.columns.remove(column);
            }
        }

        info!(
            component = "merge",
            event = "merge.reconcile.finish",
            reconciled_pairs = ?pairs,
            column_count = out_columns.len()
        );

        Ok(FusedDataset {
            entity_column,
            columns: out_columns,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RawReading;
    use crate::time_features::TimeFeatureDeriver;

    fn normalized(entity: &str, ts: &str, attrs: &[(&str, &str)]) -> NormalizedRecord {
        let raw = RawReading {
            entity_id: entity.to_string(),
            timestamp: Some(ts.to_string()),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let (mut rows, _) = TimeFeatureDeriver::new("test").derive(vec![raw]).unwrap();
        rows.remove(0)
    }

    fn unparsed(entity: &str) -> NormalizedRecord {
        NormalizedRecord {
            entity_id: entity.to_string(),
            parts: None,
            attributes: BTreeMap::new(),
        }
    }

    fn bikes() -> Vec<NormalizedRecord> {
        vec![
            normalized("S1", "2023-09-10T08:05:00", &[("Lat", "57.7")]),
            normalized("S2", "2023-09-10T08:55:00", &[("Lat", "57.8")]),
            normalized("S3", "2023-09-10T09:10:00", &[("Lat", "57.9")]),
            unparsed("S4"),
        ]
    }

    fn weather() -> Vec<NormalizedRecord> {
        vec![
            normalized("weather", "2023-09-10T08:00", &[("Temperature", "15")]),
            normalized("weather", "2023-09-10T08:30", &[("Temperature", "99")]),
        ]
    }

    #[test]
    fn left_join_keeps_every_primary_row_once_when_padding() {
        let merger = DatasetMerger::default();
        let (fused, report) = merger.merge(&bikes(), &weather()).unwrap();

        assert_eq!(fused.records.len(), 4);
        assert_eq!(report.matched_rows, 2);
        assert_eq!(report.unmatched_rows, 2);
        assert_eq!(report.secondary_duplicates_dropped, 1);

        let ids: Vec<&str> = fused.records.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S2", "S3", "S4"]);
        assert_eq!(fused.records[0].get("Temperature"), Some(&Value::Int(15)));
        assert_eq!(fused.records[1].get("Temperature"), Some(&Value::Int(15)));
        assert_eq!(fused.records[2].get("Temperature"), Some(&Value::Null));
        assert_eq!(fused.records[3].get("Year"), Some(&Value::Null));
    }

    #[test]
    fn drop_policy_removes_unmatched_primary_rows() {
        let merger = DatasetMerger::new(MergeConfig {
            unmatched: UnmatchedPolicy::Drop,
            ..MergeConfig::default()
        });
        let (fused, report) = merger.merge(&bikes(), &weather()).unwrap();

        assert_eq!(fused.records.len(), 2);
        assert_eq!(report.dropped_rows, 2);
        assert!(fused
            .records
            .iter()
            .all(|r| r.get("Temperature") == Some(&Value::Int(15))));
    }

    #[test]
    fn empty_primary_is_a_structural_error() {
        let err = DatasetMerger::default().merge(&[], &weather()).unwrap_err();
        assert_eq!(err, MergeError::EmptyPrimary);
    }

    #[test]
    fn empty_secondary_pads_everything() {
        let (fused, report) = DatasetMerger::default().merge(&bikes(), &[]).unwrap();
        assert_eq!(fused.records.len(), 4);
        assert_eq!(report.matched_rows, 0);
    }

    #[test]
    fn join_emits_suffixed_artifacts_and_reconciler_collapses_them() {
        let primary = vec![normalized("S1", "2023-09-10T08:05:00", &[("Name", "Central")])];
        let secondary = vec![normalized(
            "weather",
            "2023-09-10T08:00",
            &[("Name", "Station A"), ("Humidity", "80")],
        )];
        let (fused, _) = DatasetMerger::default().merge(&primary, &secondary).unwrap();
        for column in ["timestamp_x", "timestamp_y", "Minute_x", "Minute_y", "Name_x", "Name_y"] {
            assert!(fused.has_column(column), "{column} expected after join");
        }

        let reconciled = ColumnReconciler::default().reconcile(fused).unwrap();
        assert_eq!(
            reconciled.columns,
            vec!["timestamp", "Minute", "Year", "Month", "Day", "Hour", "Name", "Humidity"]
        );
        let record = &reconciled.records[0];
        assert_eq!(record.get("Name"), Some(&Value::Text("Central".to_string())));
        assert_eq!(record.get("Minute"), Some(&Value::Int(5)));
        assert!(record.timestamp().is_some());
        assert!(record.get("Time_of_Day").is_none());
        assert!(record.get("Name_y").is_none());
    }

    #[test]
    fn reconciler_fails_loudly_on_missing_artifact() {
        let (mut fused, _) = DatasetMerger::default().merge(&bikes(), &weather()).unwrap();
        fused.columns.retain(|column| column != "Minute_y");

        let err = ColumnReconciler::default().reconcile(fused).unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingJoinArtifact {
                column: "Minute_y".to_string()
            }
        );
    }

    #[test]
    fn coarser_join_keys_bucket_by_day() {
        let merger = DatasetMerger::new(MergeConfig {
            join_keys: vec!["Year".to_string(), "Month".to_string(), "Day".to_string()],
            ..MergeConfig::default()
        });
        let (fused, report) = merger.merge(&bikes(), &weather()).unwrap();

        assert_eq!(merger.join_keys().len(), 3);
        assert_eq!(report.matched_rows, 3);
        assert_eq!(report.unmatched_rows, 1);
        assert_eq!(fused.records[2].get("Temperature"), Some(&Value::Int(15)));
        assert_eq!(fused.records[2].get("Hour"), Some(&Value::Int(9)));
    }

    #[test]
    fn join_keys_must_be_calendar_columns() {
        let merger = DatasetMerger::new(MergeConfig {
            join_keys: vec!["Year".to_string(), "Minute".to_string()],
            ..MergeConfig::default()
        });
        assert_eq!(
            merger.merge(&bikes(), &weather()).unwrap_err(),
            MergeError::UnsupportedJoinKey("Minute".to_string())
        );

        let merger = DatasetMerger::new(MergeConfig {
            join_keys: Vec::new(),
            ..MergeConfig::default()
        });
        assert_eq!(
            merger.merge(&bikes(), &weather()).unwrap_err(),
            MergeError::NoJoinKeys
        );
    }
}
