//! Simple Q&A agent example: capture, annotate, export

use loopscope::export::{export_to_path, ExportFormat, ExportKind, ExportOptions};
use loopscope::prelude::*;
use loopscope::AnnotationQuery;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Serialize)]
struct Question {
    user_id: String,
    text: String,
}

fn answer(question: Question) -> std::result::Result<String, String> {
    let balance = if question.user_id == "u-42" { 100 } else { 0 };
    set_context(
        TraceContext::from_value(&json!({ "balance": balance, "currency": "EUR" }))
            .with_source("accounts_api"),
    );

    let text = question.text.to_lowercase();
    if text.contains("balance") {
        Ok(format!("Your balance is {} EUR.", balance))
    } else if text.contains("refund") {
        Ok("Refunds are processed within 5 business days.".to_string())
    } else {
        Err(format!("no answer for '{}'", question.text))
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("=== Loopscope Simple Q&A Example ===\n");

    let storage = Arc::new(SqliteStorage::open("loopscope_demo.db")?);
    let agent = Monitor::new("support_agent")
        .with_metadata("version", json!("v1"))
        .with_storage(storage.clone())
        .wrap_fallible(answer);

    for (user, text) in [
        ("u-42", "What is my balance?"),
        ("u-7", "How do refunds work?"),
        ("u-7", "Can I adopt a cat?"),
    ] {
        let question = Question {
            user_id: user.to_string(),
            text: text.to_string(),
        };
        match agent(question) {
            Ok(reply) => println!("✓ {} -> {}", text, reply),
            Err(err) => println!("✗ {} -> {}", text, err),
        }
    }

    // Review the most recent traces
    let annotations = storage.annotations();
    for trace in storage.list_traces(&loopscope::TraceQuery::new().with_limit(3))? {
        let annotation = if trace.is_success() {
            Annotation::pass(trace.id, "answered from policy")
        } else {
            Annotation::fail(trace.id, "should hand off unknown questions").with_tag("no_handoff")
        };
        annotations.save(&annotation.with_annotator("demo"))?;
    }

    let stats = annotations.get_stats()?;
    println!("\n📊 Annotations: {} ({:.1}% pass)", stats.total, stats.pass_rate);
    for (tag, count) in &stats.failure_taxonomy {
        println!("  - {}: {}", tag, count);
    }
    let failing = annotations.list(&AnnotationQuery::new().with_judgment(Judgment::Fail))?;
    println!("  - failing annotations: {}", failing.len());

    let count = export_to_path(
        "loopscope_demo_traces.csv",
        ExportFormat::Csv,
        ExportKind::Traces,
        &storage,
        &ExportOptions::default(),
    )?;
    println!("\n📤 Exported {} traces to loopscope_demo_traces.csv", count);

    Ok(())
}
