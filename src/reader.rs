//! Windowed retrieval of raw readings from a paginated key-value store.

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::records::{RawReading, Row, DEFAULT_ENTITY_FIELD, TIMESTAMP_FIELD};
use crate::schedule::DATE_FORMAT;

pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Lexicographic bounds on a timestamp field: `gte <= value < lt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampFilter {
    pub field: String,
    pub gte: Option<String>,
    pub lt: Option<String>,
}

impl TimestampFilter {
    pub fn all(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            gte: None,
            lt: None,
        }
    }

    pub fn window(field: impl Into<String>, start: NaiveDate, end_exclusive: NaiveDate) -> Self {
        Self {
            field: field.into(),
            gte: Some(start.format(DATE_FORMAT).to_string()),
            lt: Some(end_exclusive.format(DATE_FORMAT).to_string()),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.gte.is_none() && self.lt.is_none()
    }

    pub fn matches(&self, row: &Row) -> bool {
        if self.is_unbounded() {
            return true;
        }
        let Some(value) = row.get(&self.field) else {
            return false;
        };
        let above = self.gte.as_deref().map_or(true, |gte| value.as_str() >= gte);
        let below = self.lt.as_deref().map_or(true, |lt| value.as_str() < lt);
        above && below
    }
}

/// One page of a scan. `next` is the continuation token, if more pages exist.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanPage {
    pub rows: Vec<Row>,
    pub next: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid continuation token: {0}")]
    InvalidContinuation(String),
}

pub trait ReadingStore {
    fn scan(&self, filter: &TimestampFilter, start: Option<&str>) -> Result<ScanPage, StoreError>;
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("reading store failed: {0}")]
    Store(#[from] StoreError),
    #[error("invalid fetch window: start {start} must be before end {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },
    #[error("row {row} has no '{field}' field")]
    MalformedRow { row: usize, field: String },
    #[error("scan did not finish within {max_pages} pages")]
    PageLimitExceeded { max_pages: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Rows(Vec<RawReading>),
    NoData,
}

impl FetchOutcome {
    pub fn len(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::NoData => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::NoData)
    }

    pub fn into_rows(self) -> Vec<RawReading> {
        match self {
            Self::Rows(rows) => rows,
            Self::NoData => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    pub entity_field: String,
    pub timestamp_field: String,
    pub max_pages: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            entity_field: DEFAULT_ENTITY_FIELD.to_string(),
            timestamp_field: TIMESTAMP_FIELD.to_string(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

pub struct WindowedReader<'a> {
    store: &'a dyn ReadingStore,
    config: ReaderConfig,
}

impl<'a> WindowedReader<'a> {
    pub fn new(store: &'a dyn ReadingStore, config: ReaderConfig) -> Self {
        Self { store, config }
    }

    pub fn fetch(
        &self,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<FetchOutcome, RetrievalError> {
        if window_start >= window_end {
            return Err(RetrievalError::InvalidWindow {
                start: window_start,
                end: window_end,
            });
        }
        let filter =
            TimestampFilter::window(self.config.timestamp_field.clone(), window_start, window_end);
        self.scan_all(&filter)
    }

    pub fn fetch_all(&self) -> Result<FetchOutcome, RetrievalError> {
        let filter = TimestampFilter::all(self.config.timestamp_field.clone());
        self.scan_all(&filter)
    }

    fn scan_all(&self, filter: &TimestampFilter) -> Result<FetchOutcome, RetrievalError> {
        info!(
            component = "reader",
            event = "reader.fetch.start",
            gte = filter.gte.as_deref().unwrap_or(""),
            lt = filter.lt.as_deref().unwrap_or("")
        );

        let mut rows: Vec<Row> = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            if pages >= self.config.max_pages {
                warn!(
                    component = "reader",
                    event = "reader.fetch.page_limit",
                    max_pages = self.config.max_pages,
                    rows_so_far = rows.len()
                );
                return Err(RetrievalError::PageLimitExceeded {
                    max_pages: self.config.max_pages,
                });
            }

            let page = self.store.scan(filter, token.as_deref())?;
            pages += 1;
            debug!(
                component = "reader",
                event = "reader.fetch.page",
                page = pages,
                page_rows = page.rows.len(),
                has_next = page.next.is_some()
            );
            rows.extend(page.rows);

            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        if rows.is_empty() {
            info!(
                component = "reader",
                event = "reader.fetch.no_data",
                pages = pages
            );
            return Ok(FetchOutcome::NoData);
        }

        let mut readings = Vec::with_capacity(rows.len());
        for (idx, row) in rows.into_iter().enumerate() {
            let reading = RawReading::from_row(row, &self.config.entity_field).ok_or_else(|| {
                RetrievalError::MalformedRow {
                    row: idx,
                    field: self.config.entity_field.clone(),
                }
            })?;
            readings.push(reading);
        }

        info!(
            component = "reader",
            event = "reader.fetch.finish",
            pages = pages,
            rows = readings.len()
        );

        Ok(FetchOutcome::Rows(readings))
    }
}

/// Vector-backed store. Like a table scan, each page covers `page_size`
/// stored rows and the filter is applied within the page, so a page may be
/// empty while a continuation token is still returned.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReadingStore {
    rows: Vec<Row>,
    page_size: usize,
}

impl InMemoryReadingStore {
    pub fn new(rows: Vec<Row>, page_size: usize) -> Self {
        Self {
            rows,
            page_size: page_size.max(1),
        }
    }
}

impl ReadingStore for InMemoryReadingStore {
    fn scan(&self, filter: &TimestampFilter, start: Option<&str>) -> Result<ScanPage, StoreError> {
        let offset = match start {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| StoreError::InvalidContinuation(raw.to_string()))?,
            None => 0,
        };
        if offset > self.rows.len() {
            return Err(StoreError::InvalidContinuation(offset.to_string()));
        }

        let end = (offset + self.page_size.max(1)).min(self.rows.len());
        let rows = self.rows[offset..end]
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        let next = (end < self.rows.len()).then(|| end.to_string());

        Ok(ScanPage { rows, next })
    }
}
