//! Splits enriched rows into single-bike and stationary-station datasets.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::records::EnrichedDataset;
use crate::schedule::DATE_FORMAT;

pub const DEFAULT_PREFIX_RULE: &str = "BIKE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartitionName {
    SingleBikes,
    Stations,
}

impl PartitionName {
    pub const ALL: [PartitionName; 2] = [PartitionName::SingleBikes, PartitionName::Stations];

    /// Directory under each output prefix.
    pub fn sub_path(self) -> &'static str {
        match self {
            Self::SingleBikes => "single_bikes",
            Self::Stations => "station_bikes",
        }
    }

    pub fn file_stem(self) -> &'static str {
        match self {
            Self::SingleBikes => "SingleBikes",
            Self::Stations => "StationaryStations",
        }
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
}

impl DateRange {
    pub fn label(&self) -> String {
        format!(
            "{}-{}",
            self.min_date.format(DATE_FORMAT),
            self.max_date.format(DATE_FORMAT)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionedDataset {
    pub name: PartitionName,
    pub dataset: EnrichedDataset,
    /// `None` iff the partition has no rows.
    pub date_range: Option<DateRange>,
}

impl PartitionedDataset {
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityPartitioner;

impl EntityPartitioner {
    pub fn new() -> Self {
        Self
    }

    pub fn partition(
        &self,
        dataset: EnrichedDataset,
        prefix_rule: &str,
    ) -> BTreeMap<PartitionName, PartitionedDataset> {
        let EnrichedDataset {
            entity_column,
            columns,
            records,
        } = dataset;
        let (bikes, stations): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| record.entity_id.starts_with(prefix_rule));
        let schema = EnrichedDataset {
            entity_column,
            columns,
            records: Vec::new(),
        };

        let mut out = BTreeMap::new();
        for (name, records) in [
            (PartitionName::SingleBikes, bikes),
            (PartitionName::Stations, stations),
        ] {
            let date_range = date_range_of(records.iter().map(|record| record.timestamp.date()));
            let part = PartitionedDataset {
                name,
                dataset: schema.with_records(records),
                date_range,
            };
            info!(
                component = "partition",
                event = "partition.built",
                partition = name.file_stem(),
                rows = part.len(),
                date_range = %part.date_range.map(|range| range.label()).unwrap_or_default()
            );
            out.insert(name, part);
        }
        out
    }
}

fn date_range_of(dates: impl Iterator<Item = NaiveDate>) -> Option<DateRange> {
    dates.fold(None, |acc, date| match acc {
        None => Some(DateRange {
            min_date: date,
            max_date: date,
        }),
        Some(range) => Some(DateRange {
            min_date: range.min_date.min(date),
            max_date: range.max_date.max(date),
        }),
    })
}
