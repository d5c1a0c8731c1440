//! Seeded train/test split of a partition into feature matrices and targets.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tracing::info;

use crate::partition::PartitionedDataset;
use crate::records::{SchemaError, Value, TOTAL_AVAILABLE_BIKES_COLUMN};

pub const DEFAULT_TARGET_COLUMN: &str = TOTAL_AVAILABLE_BIKES_COLUMN;
pub const DEFAULT_TEST_FRACTION: f64 = 0.2;
pub const DEFAULT_SEED: u64 = 42;

const STAGE: &str = "split";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|column| column == name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainTestSplit {
    pub target: String,
    pub x_train: FeatureMatrix,
    pub x_test: FeatureMatrix,
    pub y_train: Vec<Value>,
    pub y_test: Vec<Value>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("test fraction {0} must be strictly between 0 and 1")]
    TestFractionOutOfRange(f64),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("dataset is empty")]
    EmptyDataset,
    #[error("{rows} rows cannot be split into non-empty train and test sets ({test_rows} for test)")]
    InsufficientRows { rows: usize, test_rows: usize },
}

#[derive(Debug, Clone, Default)]
pub struct TrainTestSplitter;

impl TrainTestSplitter {
    pub fn new() -> Self {
        Self
    }

    pub fn split(
        &self,
        dataset: &PartitionedDataset,
        target: &str,
        test_fraction: f64,
        seed: u64,
    ) -> Result<TrainTestSplit, SplitError> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(SplitError::TestFractionOutOfRange(test_fraction));
        }

        let data = &dataset.dataset;
        if !data.has_column(target) {
            return Err(SchemaError::MissingColumn {
                stage: STAGE,
                column: target.to_string(),
            }
            .into());
        }

        let rows = data.len();
        if rows == 0 {
            return Err(SplitError::EmptyDataset);
        }
        let test_rows = (rows as f64 * test_fraction).ceil() as usize;
        if test_rows == 0 || test_rows >= rows {
            return Err(SplitError::InsufficientRows { rows, test_rows });
        }

        let header = data.header();
        let target_idx = header
            .iter()
            .position(|column| column == target)
            .ok_or_else(|| SchemaError::MissingColumn {
                stage: STAGE,
                column: target.to_string(),
            })?;
        let feature_columns: Vec<String> = header
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != target_idx)
            .map(|(_, column)| column.clone())
            .collect();

        let mut order: Vec<usize> = (0..rows).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let mut x_train = FeatureMatrix {
            columns: feature_columns.clone(),
            rows: Vec::with_capacity(rows - test_rows),
        };
        let mut x_test = FeatureMatrix {
            columns: feature_columns,
            rows: Vec::with_capacity(test_rows),
        };
        let mut y_train = Vec::with_capacity(rows - test_rows);
        let mut y_test = Vec::with_capacity(test_rows);

        for (position, idx) in order.into_iter().enumerate() {
            let mut cells = data.cells(&data.records[idx]);
            let y = cells.remove(target_idx);
            if position < test_rows {
                x_test.rows.push(cells);
                y_test.push(y);
            } else {
                x_train.rows.push(cells);
                y_train.push(y);
            }
        }

        info!(
            component = "split",
            event = "split.finish",
            partition = dataset.name.file_stem(),
            rows = rows,
            train_rows = x_train.len(),
            test_rows = x_test.len(),
            seed = seed
        );

        Ok(TrainTestSplit {
            target: target.to_string(),
            x_train,
            x_test,
            y_train,
            y_test,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionName;
    use crate::records::{EnrichedDataset, EnrichedRecord, DEFAULT_ENTITY_FIELD};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn partition(rows: usize) -> PartitionedDataset {
        let records = (0..rows)
            .map(|i| {
                let mut columns = BTreeMap::new();
                columns.insert("Temperature".to_string(), Value::Int(i as i64));
                EnrichedRecord {
                    entity_id: format!("S{i}"),
                    timestamp: NaiveDate::from_ymd_opt(2023, 9, 10)
                        .unwrap()
                        .and_hms_opt(8, 0, 0)
                        .unwrap(),
                    is_weekend: 1,
                    total_available_bikes: Some(i as i64 * 10),
                    columns,
                }
            })
            .collect();
        PartitionedDataset {
            name: PartitionName::Stations,
            dataset: EnrichedDataset {
                entity_column: DEFAULT_ENTITY_FIELD.to_string(),
                columns: vec![
                    "Temperature".to_string(),
                    "IsWeekend".to_string(),
                    TOTAL_AVAILABLE_BIKES_COLUMN.to_string(),
                ],
                records,
            },
            date_range: None,
        }
    }

    #[test]
    fn split_is_deterministic_and_sized_by_ceiling() {
        let data = partition(11);
        let splitter = TrainTestSplitter::new();
        let a = splitter
            .split(&data, DEFAULT_TARGET_COLUMN, DEFAULT_TEST_FRACTION, DEFAULT_SEED)
            .unwrap();
        let b = splitter
            .split(&data, DEFAULT_TARGET_COLUMN, DEFAULT_TEST_FRACTION, DEFAULT_SEED)
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.x_test.len(), 3);
        assert_eq!(a.x_train.len(), 8);
        assert_eq!(a.y_test.len(), 3);
        assert_eq!(
            a.x_train.columns,
            vec!["stationId", "Temperature", "IsWeekend"]
        );
    }

    #[test]
    fn targets_stay_aligned_with_features() {
        let split = TrainTestSplitter::new()
            .split(&partition(20), DEFAULT_TARGET_COLUMN, 0.25, 7)
            .unwrap();
        for (row, y) in split.x_train.rows.iter().zip(&split.y_train) {
            let temperature = row[1].as_f64().unwrap();
            assert_eq!(y.as_f64(), Some(temperature * 10.0));
        }
    }

    #[test]
    fn train_and_test_partition_the_rows() {
        let split = TrainTestSplitter::new()
            .split(&partition(10), DEFAULT_TARGET_COLUMN, 0.2, 1)
            .unwrap();
        let mut ids: Vec<String> = split
            .x_train
            .rows
            .iter()
            .chain(split.x_test.rows.iter())
            .map(|row| row[0].render())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn different_seeds_change_the_order() {
        let splitter = TrainTestSplitter::new();
        let data = partition(30);
        let a = splitter.split(&data, DEFAULT_TARGET_COLUMN, 0.2, 1).unwrap();
        let b = splitter.split(&data, DEFAULT_TARGET_COLUMN, 0.2, 2).unwrap();
        assert_ne!(a.y_test, b.y_test);
    }

    #[test]
    fn rejects_bad_inputs() {
        let splitter = TrainTestSplitter::new();
        assert_eq!(
            splitter.split(&partition(5), DEFAULT_TARGET_COLUMN, 1.0, 42),
            Err(SplitError::TestFractionOutOfRange(1.0))
        );
        assert!(matches!(
            splitter.split(&partition(5), "availableBikes", 0.2, 42),
            Err(SplitError::Schema(SchemaError::MissingColumn { .. }))
        ));
        assert_eq!(
            splitter.split(&partition(0), DEFAULT_TARGET_COLUMN, 0.2, 42),
            Err(SplitError::EmptyDataset)
        );
        assert_eq!(
            splitter.split(&partition(1), DEFAULT_TARGET_COLUMN, 0.2, 42),
            Err(SplitError::InsufficientRows {
                rows: 1,
                test_rows: 1
            })
        );
    }
}
