//! SQLite-backed reading store with keyset pagination.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection};
use tracing::info;

use crate::reader::{ReadingStore, ScanPage, StoreError, TimestampFilter};
use crate::records::{RawReading, Row, DEFAULT_ENTITY_FIELD, TIMESTAMP_FIELD};

pub const DEFAULT_PAGE_SIZE: usize = 1_000;

pub struct SqliteReadingStore {
    conn: Connection,
    entity_field: String,
    page_size: usize,
}

impl SqliteReadingStore {
    pub fn open(path: &Path, page_size: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::with_connection(conn, page_size)
    }

    pub fn open_in_memory(page_size: usize) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, page_size)
    }

    fn with_connection(conn: Connection, page_size: usize) -> Result<Self, StoreError> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn,
            entity_field: DEFAULT_ENTITY_FIELD.to_string(),
            page_size: page_size.max(1),
        })
    }

    /// Field name under which entity ids are exposed in scanned rows.
    pub fn with_entity_field(mut self, entity_field: impl Into<String>) -> Self {
        self.entity_field = entity_field.into();
        self
    }

    pub fn upsert_readings(&mut self, readings: &[RawReading]) -> Result<usize, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO readings (entity_id, timestamp, attributes)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(entity_id, timestamp) DO UPDATE SET
                    attributes = excluded.attributes
                ",
            )?;

            for reading in readings {
                let timestamp = reading.timestamp.as_deref().ok_or_else(|| {
                    StoreError::Backend(format!(
                        "reading for {} has no timestamp",
                        reading.entity_id
                    ))
                })?;
                let attributes = serde_json::to_string(&reading.attributes)?;
                stmt.execute(params![reading.entity_id, timestamp, attributes])?;
            }
        }
        tx.commit()?;

        info!(
            component = "sqlite_store",
            event = "store.upsert.finish",
            rows = readings.len()
        );

        Ok(readings.len())
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

impl ReadingStore for SqliteReadingStore {
    fn scan(&self, filter: &TimestampFilter, start: Option<&str>) -> Result<ScanPage, StoreError> {
        if filter.field != TIMESTAMP_FIELD {
            return Err(StoreError::Backend(format!(
                "filtering on '{}' is not supported",
                filter.field
            )));
        }

        let cursor = start.map(decode_token).transpose()?;
        let (after_ts, after_id) = match &cursor {
            Some((ts, id)) => (Some(ts.as_str()), Some(id.as_str())),
            None => (None, None),
        };

        let mut stmt = self.conn.prepare_cached(
            "
            SELECT entity_id, timestamp, attributes
            FROM readings
            WHERE (?1 IS NULL OR timestamp >= ?1)
              AND (?2 IS NULL OR timestamp < ?2)
              AND (?3 IS NULL OR (timestamp, entity_id) > (?3, ?4))
            ORDER BY timestamp ASC, entity_id ASC
            LIMIT ?5
            ",
        )?;

        let limit = (self.page_size + 1) as i64;
        let mut rows = stmt.query(params![
            filter.gte.as_deref(),
            filter.lt.as_deref(),
            after_ts,
            after_id,
            limit
        ])?;

        let mut out: Vec<(String, String, Row)> = Vec::with_capacity(self.page_size);
        let mut has_more = false;
        while let Some(row) = rows.next()? {
            if out.len() == self.page_size {
                has_more = true;
                break;
            }
            let entity_id: String = row.get(0)?;
            let timestamp: String = row.get(1)?;
            let attributes_json: String = row.get(2)?;
            let attributes: BTreeMap<String, String> = serde_json::from_str(&attributes_json)?;

            let mut flat = attributes;
            flat.insert(self.entity_field.clone(), entity_id.clone());
            flat.insert(TIMESTAMP_FIELD.to_string(), timestamp.clone());
            out.push((timestamp, entity_id, flat));
        }

        let next = match out.last() {
            Some((ts, id, _)) if has_more => Some(encode_token(ts, id)?),
            _ => None,
        };

        Ok(ScanPage {
            rows: out.into_iter().map(|(_, _, row)| row).collect(),
            next,
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS readings (
            entity_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            attributes TEXT NOT NULL,
            PRIMARY KEY(entity_id, timestamp)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS readings_by_timestamp
            ON readings(timestamp, entity_id);
        ",
    )?;
    Ok(())
}

fn encode_token(timestamp: &str, entity_id: &str) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&(timestamp, entity_id))?)
}

fn decode_token(raw: &str) -> Result<(String, String), StoreError> {
    serde_json::from_str(raw).map_err(|_| StoreError::InvalidContinuation(raw.to_string()))
}
