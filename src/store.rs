//! Read-only access to the scan history database.
//!
//! The database belongs to another process that keeps appending rows. A
//! connection is opened per query with `SQLITE_OPEN_READ_ONLY` and dropped
//! straight after, so no lock is held between polls.

use crate::config::StoreConfig;
use crate::frame::RawPayload;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the external store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Fatal when hit at startup.
    #[error("store {path} unreachable: {reason}")]
    Unreachable { path: PathBuf, reason: String },
    #[error("store query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("store worker failed: {0}")]
    Worker(String),
}

/// One row of the scan history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRecord {
    pub id: i64,
    /// `None` when the column is NULL or empty.
    pub raw: Option<RawPayload>,
    pub timestamp: Option<String>,
}

fn raw_from_value(value: Value) -> Option<RawPayload> {
    let raw = match value {
        Value::Blob(bytes) => RawPayload::Bytes(bytes),
        Value::Text(text) => RawPayload::Hex(text),
        Value::Null | Value::Integer(_) | Value::Real(_) => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

fn timestamp_from_value(value: Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text),
        Value::Integer(n) => Some(n.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Blob(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Null => None,
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Handle to the scan history database.
#[derive(Debug, Clone)]
pub struct ScanStore {
    config: StoreConfig,
    max_id_sql: String,
    rows_after_sql: String,
}

impl ScanStore {
    pub fn new(config: StoreConfig) -> Self {
        let table = quote_ident(&config.table);
        let id = quote_ident(&config.id_column);
        let raw = quote_ident(&config.raw_column);
        let ts = quote_ident(&config.timestamp_column);

        Self {
            max_id_sql: format!("SELECT COALESCE(MAX({id}), 0) FROM {table}"),
            rows_after_sql: format!(
                "SELECT {id}, {raw}, {ts} FROM {table} WHERE {id} > ?1 ORDER BY {id} ASC"
            ),
            config,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    fn open(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            &self.config.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.config.busy_timeout())?;
        Ok(conn)
    }

    /// Open the store and read its current maximum id. Any failure here means
    /// the store is unusable.
    pub async fn connect(&self) -> Result<i64, StoreError> {
        if !self.config.path.is_file() {
            return Err(StoreError::Unreachable {
                path: self.config.path.clone(),
                reason: "no such database file".to_string(),
            });
        }
        self.max_id().await.map_err(|e| StoreError::Unreachable {
            path: self.config.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Largest id currently in the table (0 when empty).
    pub async fn max_id(&self) -> Result<i64, StoreError> {
        let store = self.clone();
        run_blocking(move || {
            let conn = store.open()?;
            let id = conn.query_row(&store.max_id_sql, [], |row| row.get::<_, i64>(0))?;
            Ok(id)
        })
        .await
    }

    /// All rows with id strictly greater than `after`, ascending.
    pub async fn rows_after(&self, after: i64) -> Result<Vec<PayloadRecord>, StoreError> {
        let store = self.clone();
        run_blocking(move || {
            let conn = store.open()?;
            let mut stmt = conn.prepare(&store.rows_after_sql)?;
            let rows = stmt.query_map([after], |row| {
                Ok(PayloadRecord {
                    id: row.get(0)?,
                    raw: raw_from_value(row.get(1)?),
                    timestamp: timestamp_from_value(row.get(2)?),
                })
            })?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
}
