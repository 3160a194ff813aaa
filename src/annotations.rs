//! Human Pass/Fail annotations on traces
//!
//! Annotations live in their own table in the trace database. A reviewer
//! records a binary judgment, a critique explaining it, and free-form tags;
//! tags on failing annotations roll up into a failure taxonomy.

use crate::capture::safe_deserialize;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::storage::{decode_map, sql_count, KeysetIter};
use crate::trace::{format_timestamp, now, parse_timestamp, timestamp_format};
use crate::types::{AnnotationId, Judgment, TraceId};
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Annotator recorded when none is given
pub const DEFAULT_ANNOTATOR: &str = "default";

/// A reviewer's judgment on one trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Unique annotation identifier
    pub id: AnnotationId,
    /// Trace being judged (not required to exist)
    pub trace_id: TraceId,
    /// Pass or fail
    pub judgment: Judgment,
    /// Reasoning behind the judgment
    pub critique: String,
    /// Failure categories and other labels
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Who made the judgment
    pub annotator: String,
    /// When the judgment was made
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    /// Review-session data
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Annotation {
    /// Create an annotation
    pub fn new(trace_id: TraceId, judgment: Judgment, critique: impl Into<String>) -> Self {
        Self {
            id: AnnotationId::new(),
            trace_id,
            judgment,
            critique: critique.into(),
            tags: BTreeSet::new(),
            annotator: DEFAULT_ANNOTATOR.to_string(),
            timestamp: now(),
            metadata: Map::new(),
        }
    }

    /// Create a passing annotation
    pub fn pass(trace_id: TraceId, critique: impl Into<String>) -> Self {
        Self::new(trace_id, Judgment::Pass, critique)
    }

    /// Create a failing annotation
    pub fn fail(trace_id: TraceId, critique: impl Into<String>) -> Self {
        Self::new(trace_id, Judgment::Fail, critique)
    }

    /// Add a tag; blank tags are ignored
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag: String = tag.into();
        let tag = tag.trim();
        if !tag.is_empty() {
            self.tags.insert(tag.to_string());
        }
        self
    }

    /// Add several tags
    pub fn with_tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tags.into_iter().fold(self, |annotation, tag| annotation.with_tag(tag))
    }

    /// Set the annotator
    pub fn with_annotator(mut self, annotator: impl Into<String>) -> Self {
        self.annotator = annotator.into();
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the judgment is pass
    pub fn is_pass(&self) -> bool {
        self.judgment == Judgment::Pass
    }

    /// Whether the judgment is fail
    pub fn is_fail(&self) -> bool {
        self.judgment == Judgment::Fail
    }

    fn validate(&self) -> Result<()> {
        if self.annotator.trim().is_empty() {
            return Err(Error::invalid_input("annotator must not be empty"));
        }
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(Error::invalid_input("tags must not be blank"));
        }
        Ok(())
    }
}

/// Filters and paging for [`AnnotationStore::list`]
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationQuery {
    /// Maximum number of annotations returned
    pub limit: usize,
    /// Number of annotations skipped
    pub offset: usize,
    /// Only this judgment
    pub judgment: Option<Judgment>,
    /// Only this annotator
    pub annotator: Option<String>,
    /// Only annotations carrying this tag
    pub tag: Option<String>,
}

impl Default for AnnotationQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            judgment: None,
            annotator: None,
            tag: None,
        }
    }
}

impl AnnotationQuery {
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

    /// Filter by judgment
    pub fn with_judgment(mut self, judgment: Judgment) -> Self {
        self.judgment = Some(judgment);
        self
    }

    /// Filter by annotator
    pub fn with_annotator(mut self, annotator: impl Into<String>) -> Self {
        self.annotator = Some(annotator.into());
        self
    }

    /// Filter by tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Pass/fail tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgmentCounts {
    /// Passing annotations
    pub pass: u64,
    /// Failing annotations
    pub fail: u64,
}

impl JudgmentCounts {
    /// Total judged
    pub fn total(&self) -> u64 {
        self.pass + self.fail
    }

    fn add(&mut self, judgment: Judgment, count: u64) {
        match judgment {
            Judgment::Pass => self.pass += count,
            Judgment::Fail => self.fail += count,
        }
    }
}

/// Aggregate view over every annotation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationStats {
    /// Number of annotations
    pub total: u64,
    /// Passing annotations
    pub pass: u64,
    /// Failing annotations
    pub fail: u64,
    /// Pass percentage, one decimal
    pub pass_rate: f64,
    /// Tally per annotator
    pub by_annotator: BTreeMap<String, JudgmentCounts>,
    /// Tally per tag
    pub by_tag: BTreeMap<String, JudgmentCounts>,
    /// Tag counts over failing annotations, most frequent first
    pub failure_taxonomy: Vec<(String, u64)>,
}

/// Pass percentage rounded to one decimal; 0.0 when nothing was judged
pub fn pass_rate(pass: u64, fail: u64) -> f64 {
    let judged = pass + fail;
    if judged == 0 {
        return 0.0;
    }
    let rate = pass as f64 / judged as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

/// Annotation storage sharing a trace store's database
///
/// Obtained from [`SqliteStorage::annotations`](crate::storage::SqliteStorage::annotations).
#[derive(Clone)]
pub struct AnnotationStore {
    pool: Arc<ConnectionPool>,
}

const ANNOTATION_COLUMNS: &str = "id, trace_id, judgment, critique, tags, annotator, timestamp, metadata";

impl AnnotationStore {
    pub(crate) fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Save an annotation, replacing any earlier version with the same ID
    pub fn save(&self, annotation: &Annotation) -> Result<()> {
        annotation.validate()?;

        let tags = serde_json::to_string(&annotation.tags)?;
        let metadata = if annotation.metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&annotation.metadata)?)
        };

        self.pool.with_connection(|conn| {
            conn.execute(
                "INSERT INTO annotations
                    (id, trace_id, judgment, critique, tags, annotator, timestamp, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    trace_id = excluded.trace_id,
                    judgment = excluded.judgment,
                    critique = excluded.critique,
                    tags = excluded.tags,
                    annotator = excluded.annotator,
                    timestamp = excluded.timestamp,
                    metadata = excluded.metadata",
                rusqlite::params![
                    annotation.id.to_string(),
                    annotation.trace_id.to_string(),
                    annotation.judgment.as_str(),
                    annotation.critique,
                    tags,
                    annotation.annotator,
                    format_timestamp(&annotation.timestamp),
                    metadata,
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(
            annotation_id = %annotation.id,
            trace_id = %annotation.trace_id,
            judgment = %annotation.judgment,
            "saved annotation"
        );
        Ok(())
    }

    /// Load an annotation by ID
    pub fn load(&self, id: &AnnotationId) -> Result<Option<Annotation>> {
        let sql = format!("SELECT {} FROM annotations WHERE id = ?1", ANNOTATION_COLUMNS);
        let id = id.to_string();
        let found = self
            .pool
            .with_connection(|conn| query_annotations(conn, &sql, rusqlite::params![id]))?;
        Ok(found.into_iter().next())
    }

    /// Delete an annotation, returning whether it existed
    pub fn delete(&self, id: &AnnotationId) -> Result<bool> {
        let id = id.to_string();
        let removed = self.pool.with_connection(|conn| {
            Ok(conn.execute("DELETE FROM annotations WHERE id = ?1", [&id])?)
        })?;
        Ok(removed > 0)
    }

    /// Every annotation on a trace, most recent first
    pub fn for_trace(&self, trace_id: &TraceId) -> Result<Vec<Annotation>> {
        let sql = format!(
            "SELECT {} FROM annotations WHERE trace_id = ?1 ORDER BY timestamp DESC, rowid DESC",
            ANNOTATION_COLUMNS
        );
        let trace_id = trace_id.to_string();
        self.pool
            .with_connection(|conn| query_annotations(conn, &sql, rusqlite::params![trace_id]))
    }

    /// List annotations, most recent first
    pub fn list(&self, query: &AnnotationQuery) -> Result<Vec<Annotation>> {
        let mut sql = format!("SELECT {} FROM annotations WHERE 1=1", ANNOTATION_COLUMNS);
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(judgment) = query.judgment {
            params.push(Box::new(judgment.as_str()));
            sql.push_str(&format!(" AND judgment = ?{}", params.len()));
        }
        if let Some(annotator) = &query.annotator {
            params.push(Box::new(annotator.clone()));
            sql.push_str(&format!(" AND annotator = ?{}", params.len()));
        }
        if let Some(tag) = &query.tag {
            params.push(Box::new(tag.clone()));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(annotations.tags) WHERE value = ?{})",
                params.len()
            ));
        }

        sql.push_str(" ORDER BY timestamp DESC, rowid DESC");
        params.push(Box::new(sql_count(query.limit)));
        sql.push_str(&format!(" LIMIT ?{}", params.len()));
        params.push(Box::new(sql_count(query.offset)));
        sql.push_str(&format!(" OFFSET ?{}", params.len()));

        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        self.pool
            .with_connection(|conn| query_annotations(conn, &sql, &param_refs))
    }

    /// Count annotations, optionally filtered
    pub fn count(&self, judgment: Option<Judgment>, annotator: Option<&str>) -> Result<u64> {
        let mut sql = String::from("SELECT COUNT(*) FROM annotations WHERE 1=1");
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(judgment) = judgment {
            params.push(Box::new(judgment.as_str()));
            sql.push_str(&format!(" AND judgment = ?{}", params.len()));
        }
        if let Some(annotator) = annotator {
            params.push(Box::new(annotator.to_string()));
            sql.push_str(&format!(" AND annotator = ?{}", params.len()));
        }

        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count: i64 = self.pool.with_connection(|conn| {
            Ok(conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?)
        })?;
        Ok(count as u64)
    }

    /// Iterate over every annotation, oldest first
    pub fn iter(&self) -> impl Iterator<Item = Result<Annotation>> + '_ {
        let pool = &self.pool;
        let sql_first = format!(
            "SELECT {} FROM annotations ORDER BY timestamp, id LIMIT ?1",
            ANNOTATION_COLUMNS
        );
        let sql_next = format!(
            "SELECT {} FROM annotations
             WHERE timestamp > ?1 OR (timestamp = ?1 AND id > ?2)
             ORDER BY timestamp, id LIMIT ?3",
            ANNOTATION_COLUMNS
        );

        KeysetIter::new(
            pool.settings().iter_batch_size,
            move |cursor, batch| {
                let batch = sql_count(batch);
                pool.with_connection(|conn| match cursor {
                    None => query_annotations(conn, &sql_first, rusqlite::params![batch]),
                    Some((ts, id)) => {
                        query_annotations(conn, &sql_next, rusqlite::params![ts, id, batch])
                    }
                })
            },
            |annotation: &Annotation| {
                (format_timestamp(&annotation.timestamp), annotation.id.to_string())
            },
        )
    }

    /// Traces nobody has annotated yet, most recent first
    pub fn unannotated_traces(&self, limit: usize) -> Result<Vec<TraceId>> {
        let ids: Vec<String> = self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id FROM traces t
                 WHERE NOT EXISTS (SELECT 1 FROM annotations a WHERE a.trace_id = t.id)
                 ORDER BY t.timestamp DESC, t.rowid DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([sql_count(limit)], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })?;

        ids.iter().map(|id| TraceId::parse(id)).collect()
    }

    /// Number of traces without any annotation
    pub fn unannotated_count(&self) -> Result<u64> {
        let count: i64 = self.pool.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM traces t
                 WHERE NOT EXISTS (SELECT 1 FROM annotations a WHERE a.trace_id = t.id)",
                [],
                |row| row.get(0),
            )?)
        })?;
        Ok(count as u64)
    }

    /// Tag counts over failing annotations
    ///
    /// Sorted by count descending, then tag name.
    pub fn failure_taxonomy(&self) -> Result<Vec<(String, u64)>> {
        self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tag.value, COUNT(*) AS n
                 FROM annotations a, json_each(a.tags) AS tag
                 WHERE a.judgment = 'fail'
                 GROUP BY tag.value
                 ORDER BY n DESC, tag.value ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Aggregate statistics over every annotation
    pub fn get_stats(&self) -> Result<AnnotationStats> {
        let by_annotator = self.grouped_counts(
            "SELECT annotator, judgment, COUNT(*) FROM annotations GROUP BY annotator, judgment",
        )?;
        let by_tag = self.grouped_counts(
            "SELECT tag.value, a.judgment, COUNT(*)
             FROM annotations a, json_each(a.tags) AS tag
             GROUP BY tag.value, a.judgment",
        )?;

        let (pass, fail) = by_annotator
            .values()
            .fold((0, 0), |(pass, fail), counts| (pass + counts.pass, fail + counts.fail));

        Ok(AnnotationStats {
            total: pass + fail,
            pass,
            fail,
            pass_rate: pass_rate(pass, fail),
            by_annotator,
            by_tag,
            failure_taxonomy: self.failure_taxonomy()?,
        })
    }

    /// Delete every annotation, returning how many were removed
    pub fn clear(&self) -> Result<u64> {
        let removed = self
            .pool
            .with_connection(|conn| Ok(conn.execute("DELETE FROM annotations", [])?))?;
        Ok(removed as u64)
    }

    fn grouped_counts(&self, sql: &str) -> Result<BTreeMap<String, JudgmentCounts>> {
        let rows: Vec<(String, String, i64)> = self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;

        let mut grouped: BTreeMap<String, JudgmentCounts> = BTreeMap::new();
        for (key, judgment, count) in rows {
            let judgment: Judgment = judgment.parse()?;
            grouped.entry(key).or_default().add(judgment, count as u64);
        }
        Ok(grouped)
    }
}

struct AnnotationRow {
    id: String,
    trace_id: String,
    judgment: String,
    critique: String,
    tags: String,
    annotator: String,
    timestamp: String,
    metadata: Option<String>,
}

impl AnnotationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            trace_id: row.get(1)?,
            judgment: row.get(2)?,
            critique: row.get(3)?,
            tags: row.get(4)?,
            annotator: row.get(5)?,
            timestamp: row.get(6)?,
            metadata: row.get(7)?,
        })
    }

    fn into_annotation(self) -> Result<Annotation> {
        let timestamp = parse_timestamp(&self.timestamp).ok_or_else(|| {
            Error::storage(format!(
                "annotation {} has invalid timestamp '{}'",
                self.id, self.timestamp
            ))
        })?;

        let tags = match safe_deserialize(&self.tags) {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => BTreeSet::new(),
        };

        Ok(Annotation {
            id: AnnotationId::parse(&self.id)?,
            trace_id: TraceId::parse(&self.trace_id)?,
            judgment: self.judgment.parse()?,
            critique: self.critique,
            tags,
            annotator: self.annotator,
            timestamp,
            metadata: decode_map(self.metadata.as_deref()),
        })
    }
}

fn query_annotations(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Annotation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, AnnotationRow::read)?;

    let mut annotations = Vec::new();
    for row in rows {
        annotations.push(row?.into_annotation()?);
    }
    Ok(annotations)
}
