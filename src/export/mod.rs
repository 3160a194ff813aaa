//! Flat exports of traces and annotations
//!
//! CSV for spreadsheets, JSON for notebooks and judge few-shot prompts. Every
//! exporter writes to any `io::Write` and returns the number of records
//! written.

pub mod csv;
pub mod json;

pub use self::csv::{export_annotations_csv, export_traces_csv};
pub use self::json::{export_annotations_json, export_judge_training, export_traces_json};

use crate::annotations::AnnotationQuery;
use crate::error::{Error, Result};
use crate::storage::{SqliteStorage, TraceQuery};
use crate::types::{Judgment, TraceStatus};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// Version tag written into every JSON document
pub const EXPORT_VERSION: &str = "1.0";

/// What to export and how much
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    /// Maximum number of records
    pub limit: usize,
    /// Only traces with this status
    pub status: Option<TraceStatus>,
    /// Only annotations with this judgment
    pub judgment: Option<Judgment>,
    /// Add the context column to trace CSVs
    pub include_context: bool,
    /// Add the judged trace's data to annotation exports
    pub include_trace_data: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            limit: 10_000,
            status: None,
            judgment: None,
            include_context: true,
            include_trace_data: false,
        }
    }
}

impl ExportOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Filter traces by status
    pub fn with_status(mut self, status: TraceStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter annotations by judgment
    pub fn with_judgment(mut self, judgment: Judgment) -> Self {
        self.judgment = Some(judgment);
        self
    }

    /// Toggle the trace context column
    pub fn with_context(mut self, include: bool) -> Self {
        self.include_context = include;
        self
    }

    /// Toggle embedding trace data in annotation exports
    pub fn with_trace_data(mut self, include: bool) -> Self {
        self.include_trace_data = include;
        self
    }

    pub(crate) fn trace_query(&self) -> TraceQuery {
        TraceQuery {
            limit: self.limit,
            offset: 0,
            status: self.status,
        }
    }

    pub(crate) fn annotation_query(&self) -> AnnotationQuery {
        AnnotationQuery {
            limit: self.limit,
            judgment: self.judgment,
            ..AnnotationQuery::default()
        }
    }
}

/// Output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Comma-separated values with a header row
    Csv,
    /// Pretty-printed JSON document
    Json,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Csv => "csv",
            Self::Json => "json",
        })
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(Error::invalid_input(format!(
                "unknown export format '{}' (expected csv or json)",
                other
            ))),
        }
    }
}

/// Which records to export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// Traces
    Traces,
    /// Annotations
    Annotations,
    /// Judge training examples (JSON only)
    JudgeTraining,
}

/// Export into a newly created file
pub fn export_to_path(
    path: impl AsRef<Path>,
    format: ExportFormat,
    kind: ExportKind,
    storage: &SqliteStorage,
    options: &ExportOptions,
) -> Result<usize> {
    if format == ExportFormat::Csv && kind == ExportKind::JudgeTraining {
        return Err(Error::invalid_input("judge training data is only exported as JSON"));
    }

    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    let annotations = storage.annotations();

    let count = match (format, kind) {
        (ExportFormat::Csv, ExportKind::Traces) => export_traces_csv(&mut writer, storage, options)?,
        (ExportFormat::Csv, ExportKind::Annotations) => {
            export_annotations_csv(&mut writer, &annotations, storage, options)?
        }
        (ExportFormat::Json, ExportKind::Traces) => export_traces_json(&mut writer, storage, options)?,
        (ExportFormat::Json, ExportKind::Annotations) => {
            export_annotations_json(&mut writer, &annotations, storage, options)?
        }
        (_, ExportKind::JudgeTraining) => {
            export_judge_training(&mut writer, &annotations, storage, options.limit)?
        }
    };
    writer.flush()?;

    tracing::info!(path = %path.display(), %format, count, "export written");
    Ok(count)
}
