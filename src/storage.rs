//! Persistent trace storage
//!
//! This module provides:
//! - `TraceStore` trait for abstracting backend implementations
//! - SQLite backend over a per-thread connection pool
//! - Keyset-paginated iteration over stored rows
//! - The process-wide default store used by trackers without an explicit one

use crate::annotations::AnnotationStore;
use crate::capture::{safe_deserialize, safe_serialize};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::trace::{format_timestamp, parse_timestamp, Trace, TraceContext};
use crate::types::{TraceId, TraceStatus};
use parking_lot::RwLock;
use rusqlite::types::ToSql;
use rusqlite::{Connection, Row};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::path::PathBuf;
use std::sync::Arc;

/// Lazy sequence of stored traces
pub type TraceIter<'a> = Box<dyn Iterator<Item = Result<Trace>> + 'a>;

/// Trait for persistent storage of traces
///
/// Calls are synchronous and may block on the database file; async callers
/// should move them onto a blocking thread.
pub trait TraceStore: Send + Sync {
    /// Persist a new trace
    fn save(&self, trace: &Trace) -> Result<()>;

    /// Load a trace by ID
    fn load(&self, id: &TraceId) -> Result<Option<Trace>>;

    /// List traces, most recent first
    fn list_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>>;

    /// Count traces, optionally only those with the given status
    fn count(&self, status: Option<TraceStatus>) -> Result<u64>;

    /// Iterate over every trace, oldest first
    fn iter_traces(&self) -> TraceIter<'_>;

    /// Delete every trace, returning how many were removed
    fn clear(&self) -> Result<u64>;

    /// Release resources held for the calling thread
    fn close(&self);
}

/// Filters and paging for [`TraceStore::list_traces`]
#[derive(Debug, Clone, PartialEq)]
pub struct TraceQuery {
    /// Maximum number of traces returned
    pub limit: usize,
    /// Number of traces skipped
    pub offset: usize,
    /// Only traces with this status
    pub status: Option<TraceStatus>,
}

impl Default for TraceQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            status: None,
        }
    }
}

impl TraceQuery {
    /// Create a query with default paging
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the offset
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Filter by status
    pub fn with_status(mut self, status: TraceStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// SQLite storage backend
pub struct SqliteStorage {
    pool: Arc<ConnectionPool>,
}

impl SqliteStorage {
    /// Create a storage backend for the given file
    ///
    /// Nothing is opened until the first operation.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self::from_settings(&Settings::new(db_path))
    }

    /// Create a storage backend and open it immediately
    ///
    /// Surfaces an unusable path or schema failure up front instead of on
    /// the first save.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let storage = Self::new(db_path);
        storage.pool.with_connection(|_| Ok(()))?;
        Ok(storage)
    }

    /// Create a storage backend from settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(settings.clone())),
        }
    }

    /// Annotation store sharing this backend's database file
    pub fn annotations(&self) -> AnnotationStore {
        AnnotationStore::new(Arc::clone(&self.pool))
    }

    /// Path of the database file
    pub fn db_path(&self) -> &std::path::Path {
        &self.pool.settings().db_path
    }

    /// Drop every thread's connection
    pub fn close_all(&self) -> usize {
        self.pool.close_all()
    }
}

const TRACE_COLUMNS: &str = "id, input, output, context, timestamp, duration_ms, status, error, metadata";

impl TraceStore for SqliteStorage {
    fn save(&self, trace: &Trace) -> Result<()> {
        if !trace.is_consistent() {
            return Err(Error::invalid_input(format!(
                "trace {} has status '{}' but error {:?}",
                trace.id, trace.status, trace.error
            )));
        }

        let context = trace
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = serde_json::to_string(&trace.metadata)?;

        self.pool.with_connection(|conn| {
            conn.execute(
                "INSERT INTO traces
                    (id, input, output, context, timestamp, duration_ms, status, error, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    trace.id.to_string(),
                    safe_serialize(&trace.input),
                    safe_serialize(&trace.output),
                    context,
                    format_timestamp(&trace.timestamp),
                    trace.duration_ms,
                    trace.status.as_str(),
                    trace.error,
                    metadata,
                ],
            )?;
            Ok(())
        })
    }

    fn load(&self, id: &TraceId) -> Result<Option<Trace>> {
        let sql = format!("SELECT {} FROM traces WHERE id = ?1", TRACE_COLUMNS);
        let id = id.to_string();
        let traces = self
            .pool
            .with_connection(|conn| query_traces(conn, &sql, rusqlite::params![id]))?;
        Ok(traces.into_iter().next())
    }

    fn list_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>> {
        let mut sql = format!("SELECT {} FROM traces", TRACE_COLUMNS);
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = query.status {
            params.push(Box::new(status.as_str()));
            sql.push_str(&format!(" WHERE status = ?{}", params.len()));
        }

        sql.push_str(" ORDER BY timestamp DESC, rowid DESC");
        params.push(Box::new(sql_count(query.limit)));
        sql.push_str(&format!(" LIMIT ?{}", params.len()));
        params.push(Box::new(sql_count(query.offset)));
        sql.push_str(&format!(" OFFSET ?{}", params.len()));

        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        self.pool
            .with_connection(|conn| query_traces(conn, &sql, &param_refs))
    }

    fn count(&self, status: Option<TraceStatus>) -> Result<u64> {
        self.pool.with_connection(|conn| {
            let count: i64 = match status {
                Some(status) => conn.query_row(
                    "SELECT COUNT(*) FROM traces WHERE status = ?1",
                    [status.as_str()],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM traces", [], |row| row.get(0))?,
            };
            Ok(count as u64)
        })
    }

    fn iter_traces(&self) -> TraceIter<'_> {
        let pool = &self.pool;
        let sql_first = format!(
            "SELECT {} FROM traces ORDER BY timestamp, id LIMIT ?1",
            TRACE_COLUMNS
        );
        let sql_next = format!(
            "SELECT {} FROM traces
             WHERE timestamp > ?1 OR (timestamp = ?1 AND id > ?2)
             ORDER BY timestamp, id LIMIT ?3",
            TRACE_COLUMNS
        );

        Box::new(KeysetIter::new(
            pool.settings().iter_batch_size,
            move |cursor, batch| {
                let batch = sql_count(batch);
                pool.with_connection(|conn| match cursor {
                    None => query_traces(conn, &sql_first, rusqlite::params![batch]),
                    Some((ts, id)) => {
                        query_traces(conn, &sql_next, rusqlite::params![ts, id, batch])
                    }
                })
            },
            |trace: &Trace| (trace.timestamp_string(), trace.id.to_string()),
        ))
    }

    fn clear(&self) -> Result<u64> {
        let removed = self
            .pool
            .with_connection(|conn| Ok(conn.execute("DELETE FROM traces", [])?))?;
        tracing::debug!(removed, "cleared trace store");
        Ok(removed as u64)
    }

    fn close(&self) {
        self.pool.close();
    }
}

struct TraceRow {
    id: String,
    input: String,
    output: String,
    context: Option<String>,
    timestamp: String,
    duration_ms: Option<f64>,
    status: String,
    error: Option<String>,
    metadata: Option<String>,
}

impl TraceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            input: row.get(1)?,
            output: row.get(2)?,
            context: row.get(3)?,
            timestamp: row.get(4)?,
            duration_ms: row.get(5)?,
            status: row.get(6)?,
            error: row.get(7)?,
            metadata: row.get(8)?,
        })
    }

    fn into_trace(self) -> Result<Trace> {
        let timestamp = parse_timestamp(&self.timestamp).ok_or_else(|| {
            Error::storage(format!(
                "trace {} has invalid timestamp '{}'",
                self.id, self.timestamp
            ))
        })?;

        let context = self.context.as_deref().map(|text| {
            serde_json::from_str::<TraceContext>(text)
                .unwrap_or_else(|_| TraceContext::from_value(&safe_deserialize(text)))
        });

        Ok(Trace {
            id: TraceId::parse(&self.id)?,
            input: safe_deserialize(&self.input),
            output: safe_deserialize(&self.output),
            context,
            timestamp,
            duration_ms: self.duration_ms,
            status: self.status.parse()?,
            error: self.error,
            metadata: decode_map(self.metadata.as_deref()),
        })
    }
}

fn query_traces(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Trace>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, TraceRow::read)?;

    let mut traces = Vec::new();
    for row in rows {
        traces.push(row?.into_trace()?);
    }
    Ok(traces)
}

/// Bind a row count or offset; values past `i64::MAX` saturate instead of
/// wrapping to SQLite's negative "no limit"
pub(crate) fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Decode a stored JSON object column; anything else is an empty map
pub(crate) fn decode_map(text: Option<&str>) -> Map<String, Value> {
    match text.map(safe_deserialize) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

type Cursor = (String, String);

/// Forward-only iterator that pages through a table by `(timestamp, id)`
///
/// Each batch resumes strictly after the last row seen, so rows inserted
/// behind the cursor are skipped and nothing is returned twice.
pub(crate) struct KeysetIter<'a, T> {
    fetch: Box<dyn FnMut(Option<&Cursor>, usize) -> Result<Vec<T>> + 'a>,
    key: fn(&T) -> Cursor,
    cursor: Option<Cursor>,
    buffer: VecDeque<T>,
    batch_size: usize,
    exhausted: bool,
}

impl<'a, T> KeysetIter<'a, T> {
    pub(crate) fn new(
        batch_size: usize,
        fetch: impl FnMut(Option<&Cursor>, usize) -> Result<Vec<T>> + 'a,
        key: fn(&T) -> Cursor,
    ) -> Self {
        Self {
            fetch: Box::new(fetch),
            key,
            cursor: None,
            buffer: VecDeque::new(),
            batch_size: batch_size.max(1),
            exhausted: false,
        }
    }
}

impl<T> Iterator for KeysetIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.buffer.pop_front() {
            return Some(Ok(item));
        }
        if self.exhausted {
            return None;
        }

        match (self.fetch)(self.cursor.as_ref(), self.batch_size) {
            Ok(batch) => {
                if batch.len() < self.batch_size {
                    self.exhausted = true;
                }
                if let Some(last) = batch.last() {
                    self.cursor = Some((self.key)(last));
                }
                self.buffer.extend(batch);
                self.buffer.pop_front().map(Ok)
            }
            Err(err) => {
                self.exhausted = true;
                self.buffer.clear();
                Some(Err(err))
            }
        }
    }
}

impl<T> FusedIterator for KeysetIter<'_, T> {}

static DEFAULT_STORAGE: RwLock<Option<Arc<dyn TraceStore>>> = RwLock::new(None);

/// Process-wide default store
///
/// Built on first use from [`Settings::load`]; configuration errors fall
/// back to the default settings.
pub fn get_storage() -> Arc<dyn TraceStore> {
    if let Some(storage) = DEFAULT_STORAGE.read().as_ref() {
        return Arc::clone(storage);
    }

    let mut slot = DEFAULT_STORAGE.write();
    if let Some(storage) = slot.as_ref() {
        return Arc::clone(storage);
    }

    let settings = Settings::load().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "invalid loopscope configuration, using defaults");
        Settings::default()
    });
    tracing::debug!(db_path = %settings.db_path.display(), "initializing default storage");

    let storage: Arc<dyn TraceStore> = Arc::new(SqliteStorage::from_settings(&settings));
    *slot = Some(Arc::clone(&storage));
    storage
}

/// Replace the process-wide default store
pub fn set_storage(storage: Arc<dyn TraceStore>) {
    *DEFAULT_STORAGE.write() = Some(storage);
}

/// Drop the process-wide default store; the next access rebuilds it
pub fn reset_storage() {
    DEFAULT_STORAGE.write().take();
}
