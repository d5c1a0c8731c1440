//! Derived features on fused rows: weekend flag and available-bike counts.

use chrono::{Datelike, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::records::{
    EnrichedDataset, EnrichedRecord, FusedDataset, ParseWarning, SchemaError, Value,
    BIKE_IDS_COLUMN, IS_WEEKEND_COLUMN, TIMESTAMP_FIELD, TOTAL_AVAILABLE_BIKES_COLUMN,
};

const STAGE: &str = "enrich";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnrichReport {
    pub input_rows: u64,
    pub enriched_rows: u64,
    pub weekend_rows: u64,
    /// Input row indexes dropped for lacking a timestamp.
    pub rejected: Vec<usize>,
    pub bike_ids_present: bool,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureEnricher;

impl FeatureEnricher {
    pub fn new() -> Self {
        Self
    }

    pub fn enrich(&self, fused: FusedDataset) -> Result<(EnrichedDataset, EnrichReport), SchemaError> {
        fused.require_column(STAGE, TIMESTAMP_FIELD)?;

        let bike_ids_present = fused.has_column(BIKE_IDS_COLUMN);
        if !bike_ids_present {
            warn!(
                component = "enrich",
                event = "enrich.bike_ids_absent",
                column = BIKE_IDS_COLUMN
            );
        }

        let FusedDataset {
            entity_column,
            mut columns,
            records,
        } = fused;

        let mut report = EnrichReport {
            input_rows: records.len() as u64,
            bike_ids_present,
            ..EnrichReport::default()
        };

        let mut enriched = Vec::with_capacity(records.len());
        for (idx, record) in records.into_iter().enumerate() {
            let Some(timestamp) = record.timestamp() else {
                report.rejected.push(idx);
                continue;
            };

            let is_weekend = u8::from(is_weekend(timestamp.weekday()));
            report.weekend_rows += u64::from(is_weekend);

            let total_available_bikes = if bike_ids_present {
                let cell = record.get(BIKE_IDS_COLUMN).unwrap_or(&Value::Null);
                match count_bike_ids(cell) {
                    Some(count) => Some(count as i64),
                    None => {
                        report.warnings.push(ParseWarning {
                            row: idx,
                            field: BIKE_IDS_COLUMN.to_string(),
                            value: cell.render(),
                        });
                        None
                    }
                }
            } else {
                None
            };

            enriched.push(EnrichedRecord {
                entity_id: record.entity_id,
                timestamp,
                is_weekend,
                total_available_bikes,
                columns: record.columns,
            });
        }

        if !report.rejected.is_empty() {
            warn!(
                component = "enrich",
                event = "enrich.rejected_rows",
                rejected = report.rejected.len()
            );
        }
        if !report.warnings.is_empty() {
            warn!(
                component = "enrich",
                event = "enrich.bike_ids_unparseable",
                rows = report.warnings.len()
            );
        }

        columns.push(IS_WEEKEND_COLUMN.to_string());
        if bike_ids_present {
            columns.push(TOTAL_AVAILABLE_BIKES_COLUMN.to_string());
        }
        report.enriched_rows = enriched.len() as u64;

        info!(
            component = "enrich",
            event = "enrich.finish",
            input_rows = report.input_rows,
            enriched_rows = report.enriched_rows,
            weekend_rows = report.weekend_rows
        );

        Ok((
            EnrichedDataset {
                entity_column,
                columns,
                records: enriched,
            },
            report,
        ))
    }
}

pub fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

fn count_bike_ids(cell: &Value) -> Option<usize> {
    cell.as_text().and_then(count_list_elements)
}

/// Element count of a list literal, either JSON (`["a", "b"]`) or the
/// single-quoted form (`['a', 'b']`) older exports wrote.
pub fn count_list_elements(raw: &str) -> Option<usize> {
    let trimmed = raw.trim();
    if let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
        return Some(items.len());
    }

    let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?.trim();
    if inner.is_empty() {
        return Some(0);
    }

    let mut count = 1;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut pending_item = false;
    for ch in inner.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (Some(_), '\\') => escaped = true,
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => {
                quote = Some(ch);
                pending_item = true;
            }
            (None, ',') => {
                count += 1;
                pending_item = false;
            }
            (None, '[' | ']') => return None,
            (None, c) if c.is_whitespace() => {}
            (None, _) => pending_item = true,
        }
    }
    if quote.is_some() {
        return None;
    }
    // Trailing comma (`['a', 'b',]`) does not open a new element.
    if !pending_item {
        count -= 1;
    }
    Some(count)
}
