//! Capture, annotate, then export for a judge

use loopscope::export::{export_to_path, ExportFormat, ExportKind, ExportOptions};
use loopscope::{Annotation, AnnotationQuery, Judgment, Monitor, SqliteStorage, TraceQuery, TraceStore};
use serde_json::{json, Value};
use std::sync::Arc;

#[test]
fn test_capture_annotate_export() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(dir.path().join("review.db")).unwrap());
    let agent = Monitor::new("discounts")
        .with_storage(storage.clone())
        .wrap(|price: f64| price * 0.9);

    for price in [100.0, 50.0, 20.0, 10.0] {
        agent(price);
    }

    let annotations = storage.annotations();
    let traces = storage.list_traces(&TraceQuery::new()).unwrap();
    for (i, trace) in traces.iter().enumerate() {
        let annotation = if i % 2 == 0 {
            Annotation::pass(trace.id, "correct discount")
        } else {
            Annotation::fail(trace.id, "discount should not apply").with_tag("wrong_discount")
        };
        annotations.save(&annotation.with_annotator("alice")).unwrap();
    }

    assert_eq!(annotations.count(Some(Judgment::Fail), Some("alice")).unwrap(), 2);
    assert_eq!(annotations.unannotated_count().unwrap(), 0);
    let stats = annotations.get_stats().unwrap();
    assert_eq!(stats.pass_rate, 50.0);
    assert_eq!(stats.failure_taxonomy, vec![("wrong_discount".to_string(), 2)]);
    assert_eq!(
        annotations
            .list(&AnnotationQuery::new().with_tag("wrong_discount"))
            .unwrap()
            .len(),
        2
    );

    let csv_path = dir.path().join("traces.csv");
    let written = export_to_path(
        &csv_path,
        ExportFormat::Csv,
        ExportKind::Traces,
        &storage,
        &ExportOptions::default(),
    )
    .unwrap();
    assert_eq!(written, 4);
    let csv = std::fs::read_to_string(&csv_path).unwrap();
    assert_eq!(csv.lines().count(), 5);

    let judge_path = dir.path().join("judge.json");
    let examples = export_to_path(
        &judge_path,
        ExportFormat::Json,
        ExportKind::JudgeTraining,
        &storage,
        &ExportOptions::new().with_limit(2),
    )
    .unwrap();
    assert_eq!(examples, 2);
    let doc: Value = serde_json::from_str(&std::fs::read_to_string(&judge_path).unwrap()).unwrap();
    assert_eq!(doc["pass_count"], json!(1));
    assert_eq!(doc["fail_count"], json!(1));
}
