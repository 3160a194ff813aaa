//! JSON export
//!
//! Every document carries `version`, `type` and `count` so consumers can
//! tell the shapes apart without looking at the file name.

use super::{ExportOptions, EXPORT_VERSION};
use crate::annotations::{Annotation, AnnotationQuery, AnnotationStats, AnnotationStore};
use crate::error::Result;
use crate::storage::TraceStore;
use crate::trace::{Trace, TraceContext};
use crate::types::Judgment;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::Write;

#[derive(Serialize)]
struct TracesDocument<'a> {
    version: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    count: usize,
    traces: &'a [Trace],
}

#[derive(Serialize)]
struct AnnotationEntry<'a> {
    #[serde(flatten)]
    annotation: &'a Annotation,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Trace>,
}

#[derive(Serialize)]
struct AnnotationsDocument<'a> {
    version: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    count: usize,
    stats: AnnotationStats,
    annotations: Vec<AnnotationEntry<'a>>,
}

/// One judged example for few-shot judge prompts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeExample {
    /// Trace input
    pub input: Value,
    /// Trace output
    pub output: Value,
    /// Trace context
    pub context: Option<TraceContext>,
    /// Human judgment
    pub judgment: Judgment,
    /// Human critique
    pub critique: String,
    /// Annotation tags
    pub tags: BTreeSet<String>,
}

#[derive(Serialize)]
struct JudgeDocument {
    version: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    count: usize,
    pass_count: usize,
    fail_count: usize,
    examples: Vec<JudgeExample>,
}

/// Write traces as a JSON document, most recent first
pub fn export_traces_json<W: Write>(
    writer: W,
    storage: &dyn TraceStore,
    options: &ExportOptions,
) -> Result<usize> {
    let traces = storage.list_traces(&options.trace_query())?;
    let document = TracesDocument {
        version: EXPORT_VERSION,
        kind: "traces",
        count: traces.len(),
        traces: &traces,
    };

    serde_json::to_writer_pretty(writer, &document)?;
    Ok(traces.len())
}

/// Write annotations and their aggregate stats as a JSON document
///
/// With `include_trace_data` each annotation embeds its trace under
/// `trace` when the trace still exists.
pub fn export_annotations_json<W: Write>(
    writer: W,
    annotations: &AnnotationStore,
    traces: &dyn TraceStore,
    options: &ExportOptions,
) -> Result<usize> {
    let rows = annotations.list(&options.annotation_query())?;

    let mut entries = Vec::with_capacity(rows.len());
    for annotation in &rows {
        let trace = if options.include_trace_data {
            traces.load(&annotation.trace_id)?
        } else {
            None
        };
        entries.push(AnnotationEntry { annotation, trace });
    }

    let document = AnnotationsDocument {
        version: EXPORT_VERSION,
        kind: "annotations",
        count: rows.len(),
        stats: annotations.get_stats()?,
        annotations: entries,
    };

    serde_json::to_writer_pretty(writer, &document)?;
    Ok(rows.len())
}

/// Build judge training examples
///
/// Takes up to `limit / 2` of the most recent pass annotations and as many
/// fail annotations, skipping those whose trace no longer exists.
pub fn judge_examples(
    annotations: &AnnotationStore,
    traces: &dyn TraceStore,
    limit: usize,
) -> Result<Vec<JudgeExample>> {
    let per_judgment = limit / 2;
    let mut examples = Vec::new();

    for judgment in [Judgment::Pass, Judgment::Fail] {
        let query = AnnotationQuery::new()
            .with_limit(per_judgment)
            .with_judgment(judgment);
        for annotation in annotations.list(&query)? {
            let Some(trace) = traces.load(&annotation.trace_id)? else {
                tracing::debug!(
                    annotation_id = %annotation.id,
                    trace_id = %annotation.trace_id,
                    "skipping annotation whose trace is gone"
                );
                continue;
            };
            examples.push(JudgeExample {
                input: trace.input,
                output: trace.output,
                context: trace.context,
                judgment: annotation.judgment,
                critique: annotation.critique,
                tags: annotation.tags,
            });
        }
    }

    Ok(examples)
}

/// Write judge training examples as a JSON document
pub fn export_judge_training<W: Write>(
    writer: W,
    annotations: &AnnotationStore,
    traces: &dyn TraceStore,
    limit: usize,
) -> Result<usize> {
    let examples = judge_examples(annotations, traces, limit)?;
    let pass_count = examples
        .iter()
        .filter(|e| e.judgment == Judgment::Pass)
        .count();

    let document = JudgeDocument {
        version: EXPORT_VERSION,
        kind: "judge_training",
        count: examples.len(),
        pass_count,
        fail_count: examples.len() - pass_count,
        examples,
    };

    serde_json::to_writer_pretty(writer, &document)?;
    Ok(document.count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use crate::types::{TraceId, TraceStatus};
    use serde_json::json;

    fn storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("json.db")).unwrap();
        (dir, storage)
    }

    fn parse(buf: Vec<u8>) -> Value {
        serde_json::from_slice(&buf).unwrap()
    }

    #[test]
    fn test_traces_document_shape() {
        let (_dir, storage) = storage();
        storage.save(&Trace::success(json!({"q": 1}), json!("a"))).unwrap();
        storage.save(&Trace::failure(json!({"q": 2}), "bad")).unwrap();

        let mut buf = Vec::new();
        let options = ExportOptions::new().with_status(TraceStatus::Success);
        assert_eq!(export_traces_json(&mut buf, &storage, &options).unwrap(), 1);

        let doc = parse(buf);
        assert_eq!(doc["version"], json!("1.0"));
        assert_eq!(doc["type"], json!("traces"));
        assert_eq!(doc["count"], json!(1));
        assert_eq!(doc["traces"][0]["input"], json!({"q": 1}));
        assert_eq!(doc["traces"][0]["status"], json!("success"));
    }

    #[test]
    fn test_annotations_document_embeds_traces_and_stats() {
        let (_dir, storage) = storage();
        let trace = Trace::success(json!("q"), json!("a"));
        storage.save(&trace).unwrap();
        let annotations = storage.annotations();
        annotations
            .save(&Annotation::fail(trace.id, "wrong").with_tag("tone"))
            .unwrap();
        annotations
            .save(&Annotation::pass(TraceId::new(), "orphan"))
            .unwrap();

        let mut buf = Vec::new();
        let options = ExportOptions::new().with_trace_data(true);
        assert_eq!(
            export_annotations_json(&mut buf, &annotations, &storage, &options).unwrap(),
            2
        );

        let doc = parse(buf);
        assert_eq!(doc["type"], json!("annotations"));
        assert_eq!(doc["stats"]["pass_rate"], json!(50.0));
        let entries = doc["annotations"].as_array().unwrap();
        let failed = entries.iter().find(|e| e["judgment"] == json!("fail")).unwrap();
        assert_eq!(failed["trace"]["output"], json!("a"));
        assert_eq!(failed["tags"], json!(["tone"]));
        let orphan = entries.iter().find(|e| e["judgment"] == json!("pass")).unwrap();
        assert!(orphan.get("trace").is_none());
    }

    #[test]
    fn test_judge_training_balances_and_skips_orphans() {
        let (_dir, storage) = storage();
        let annotations = storage.annotations();
        for i in 0..3 {
            let trace = Trace::success(json!(i), json!(i * 10));
            storage.save(&trace).unwrap();
            annotations.save(&Annotation::pass(trace.id, "good")).unwrap();
        }
        let failed = Trace::success(json!("f"), json!("wrong"));
        storage.save(&failed).unwrap();
        annotations
            .save(&Annotation::fail(failed.id, "bad discount").with_tag("wrong_discount"))
            .unwrap();
        annotations
            .save(&Annotation::fail(TraceId::new(), "trace deleted"))
            .unwrap();

        let mut buf = Vec::new();
        let count = export_judge_training(&mut buf, &annotations, &storage, 4).unwrap();
        assert_eq!(count, 3);

        let doc = parse(buf);
        assert_eq!(doc["type"], json!("judge_training"));
        assert_eq!(doc["pass_count"], json!(2));
        assert_eq!(doc["fail_count"], json!(1));
        let fail = doc["examples"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["judgment"] == json!("fail"))
            .unwrap();
        assert_eq!(fail["input"], json!("f"));
        assert_eq!(fail["tags"], json!(["wrong_discount"]));
        assert_eq!(fail["context"], Value::Null);
    }
}
