//! CSV export

use super::ExportOptions;
use crate::annotations::AnnotationStore;
use crate::error::Result;
use crate::storage::TraceStore;
use serde_json::Value;
use std::io::Write;

/// Render a captured value as a CSV cell
///
/// Strings are written raw, `null` as an empty cell, everything else as JSON.
pub fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write traces as CSV, most recent first
///
/// Columns: `id, timestamp, status, duration_ms, input, output, error,
/// [context], metadata`.
pub fn export_traces_csv<W: Write>(
    writer: W,
    storage: &dyn TraceStore,
    options: &ExportOptions,
) -> Result<usize> {
    let traces = storage.list_traces(&options.trace_query())?;
    let mut out = ::csv::Writer::from_writer(writer);

    let mut header = vec![
        "id",
        "timestamp",
        "status",
        "duration_ms",
        "input",
        "output",
        "error",
    ];
    if options.include_context {
        header.push("context");
    }
    header.push("metadata");
    out.write_record(&header)?;

    for trace in &traces {
        let mut row = vec![
            trace.id.to_string(),
            trace.timestamp_string(),
            trace.status.to_string(),
            trace.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
            cell(&trace.input),
            cell(&trace.output),
            trace.error.clone().unwrap_or_default(),
        ];
        if options.include_context {
            let context = match &trace.context {
                Some(context) => serde_json::to_string(context)?,
                None => String::new(),
            };
            row.push(context);
        }
        row.push(if trace.metadata.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&trace.metadata)?
        });
        out.write_record(&row)?;
    }

    out.flush()?;
    Ok(traces.len())
}

/// Write annotations as CSV, most recent first
///
/// Tags are comma-joined. With `include_trace_data` the judged trace's
/// input and output are appended; missing traces leave those cells empty.
pub fn export_annotations_csv<W: Write>(
    writer: W,
    annotations: &AnnotationStore,
    traces: &dyn TraceStore,
    options: &ExportOptions,
) -> Result<usize> {
    let rows = annotations.list(&options.annotation_query())?;
    let mut out = ::csv::Writer::from_writer(writer);

    let mut header = vec![
        "id",
        "trace_id",
        "judgment",
        "critique",
        "tags",
        "annotator",
        "timestamp",
    ];
    if options.include_trace_data {
        header.extend(["trace_input", "trace_output"]);
    }
    out.write_record(&header)?;

    for annotation in &rows {
        let mut row = vec![
            annotation.id.to_string(),
            annotation.trace_id.to_string(),
            annotation.judgment.to_string(),
            annotation.critique.clone(),
            annotation
                .tags
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
            annotation.annotator.clone(),
            crate::trace::format_timestamp(&annotation.timestamp),
        ];
        if options.include_trace_data {
            match traces.load(&annotation.trace_id)? {
                Some(trace) => {
                    row.push(cell(&trace.input));
                    row.push(cell(&trace.output));
                }
                None => row.extend([String::new(), String::new()]),
            }
        }
        out.write_record(&row)?;
    }

    out.flush()?;
    Ok(rows.len())
}
