//! loopscope - inspect, annotate and export captured agent traces

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loopscope::export::{export_to_path, ExportFormat, ExportKind, ExportOptions};
use loopscope::{
    safe_serialize, Annotation, Judgment, Settings, SqliteStorage, TraceId, TraceQuery,
    TraceStatus, TraceStore,
};
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const PREVIEW_CHARS: usize = 60;

#[derive(Parser)]
#[command(
    name = "loopscope",
    about = "Inspect, annotate and export agent traces",
    version,
    long_about = None
)]
struct Cli {
    /// SQLite database file (defaults to the configured db_path)
    #[arg(long, global = true, value_name = "PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recent traces
    List {
        /// Maximum number of traces
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Number of traces to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Only traces with this status (success or error)
        #[arg(short, long)]
        status: Option<TraceStatus>,
    },

    /// Show one trace with its annotations
    Show {
        /// Trace id
        trace_id: TraceId,
    },

    /// Trace and annotation statistics
    Stats,

    /// Record a pass/fail judgment for a trace
    Annotate {
        /// Trace id
        trace_id: TraceId,

        /// pass or fail
        #[arg(short, long)]
        judgment: Judgment,

        /// Reviewer critique
        #[arg(short, long)]
        critique: String,

        /// Reviewer name
        #[arg(short, long, default_value = loopscope::DEFAULT_ANNOTATOR)]
        annotator: String,

        /// Tag for the failure taxonomy (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },

    /// Export traces or annotations to a file
    Export {
        /// csv or json
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Export annotations instead of traces
        #[arg(long, conflicts_with = "judge")]
        annotations_only: bool,

        /// Export judge training examples (JSON only)
        #[arg(long)]
        judge: bool,

        /// Embed trace data in annotation exports
        #[arg(long)]
        include_traces: bool,

        /// Maximum number of records
        #[arg(short, long, default_value_t = 10_000)]
        limit: usize,

        /// Only traces with this status
        #[arg(short, long)]
        status: Option<TraceStatus>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loopscope=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::load().context("failed to load settings")?;
    if let Some(db_path) = cli.db_path {
        settings = settings.with_db_path(db_path);
    }
    let storage = SqliteStorage::from_settings(&settings);

    match cli.command {
        Commands::List {
            limit,
            offset,
            status,
        } => list(&storage, limit, offset, status),
        Commands::Show { trace_id } => show(&storage, trace_id),
        Commands::Stats => stats(&storage),
        Commands::Annotate {
            trace_id,
            judgment,
            critique,
            annotator,
            tags,
        } => {
            let annotation = Annotation::new(trace_id, judgment, critique)
                .with_annotator(annotator)
                .with_tags(tags);
            annotate(&storage, annotation)
        }
        Commands::Export {
            format,
            output,
            annotations_only,
            judge,
            include_traces,
            limit,
            status,
        } => {
            let kind = if judge {
                ExportKind::JudgeTraining
            } else if annotations_only {
                ExportKind::Annotations
            } else {
                ExportKind::Traces
            };
            let mut options = ExportOptions::new()
                .with_limit(limit)
                .with_trace_data(include_traces);
            if let Some(status) = status {
                options = options.with_status(status);
            }

            let count = export_to_path(&output, format, kind, &storage, &options)?;
            println!("Exported {} records to {}", count, output.display());
            Ok(())
        }
    }
}

fn list(
    storage: &SqliteStorage,
    limit: usize,
    offset: usize,
    status: Option<TraceStatus>,
) -> Result<()> {
    let mut query = TraceQuery::new().with_limit(limit).with_offset(offset);
    if let Some(status) = status {
        query = query.with_status(status);
    }

    let traces = storage.list_traces(&query)?;
    if traces.is_empty() {
        println!("No traces found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<27}  {:<7}  {:>10}  INPUT",
        "ID", "TIMESTAMP", "STATUS", "MS"
    );
    for trace in &traces {
        let duration = trace
            .duration_ms
            .map(|ms| format!("{:.1}", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<27}  {:<7}  {:>10}  {}",
            trace.id,
            trace.timestamp_string(),
            trace.status,
            duration,
            preview(&safe_serialize(&trace.input)),
        );
    }
    Ok(())
}

fn show(storage: &SqliteStorage, trace_id: TraceId) -> Result<()> {
    let Some(trace) = storage.load(&trace_id)? else {
        bail!("trace {} not found", trace_id);
    };
    let annotations = storage.annotations().for_trace(&trace_id)?;

    let document = json!({
        "trace": trace,
        "annotations": annotations,
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

/// Per-status trace counts; the total is their sum so the lines always agree
#[derive(Debug, PartialEq)]
struct TraceCounts {
    success: u64,
    error: u64,
}

impl TraceCounts {
    fn read(storage: &dyn TraceStore) -> Result<Self> {
        Ok(Self {
            success: storage.count(Some(TraceStatus::Success))?,
            error: storage.count(Some(TraceStatus::Error))?,
        })
    }

    fn total(&self) -> u64 {
        self.success + self.error
    }
}

fn stats(storage: &SqliteStorage) -> Result<()> {
    let annotations = storage.annotations();
    let traces = TraceCounts::read(storage)?;
    let annotation_stats = annotations.get_stats()?;

    println!("Traces:       {}", traces.total());
    println!("  success:    {}", traces.success);
    println!("  error:      {}", traces.error);
    println!("Unannotated:  {}", annotations.unannotated_count()?);
    println!("Annotations:  {}", annotation_stats.total);
    println!("  pass:       {}", annotation_stats.pass);
    println!("  fail:       {}", annotation_stats.fail);
    println!("  pass rate:  {:.1}%", annotation_stats.pass_rate);

    if !annotation_stats.by_annotator.is_empty() {
        println!("By annotator:");
        for (annotator, counts) in &annotation_stats.by_annotator {
            println!("  {:<20} pass {:>5}  fail {:>5}", annotator, counts.pass, counts.fail);
        }
    }
    if !annotation_stats.failure_taxonomy.is_empty() {
        println!("Failure taxonomy:");
        for (tag, count) in &annotation_stats.failure_taxonomy {
            println!("  {:<20} {:>5}", tag, count);
        }
    }
    Ok(())
}

fn annotate(storage: &SqliteStorage, annotation: Annotation) -> Result<()> {
    if storage.load(&annotation.trace_id)?.is_none() {
        tracing::warn!(trace_id = %annotation.trace_id, "annotating a trace that is not in the store");
    }
    storage
        .annotations()
        .save(&annotation)
        .with_context(|| format!("failed to annotate trace {}", annotation.trace_id))?;

    println!("Saved annotation {} ({})", annotation.id, annotation.judgment);
    Ok(())
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(PREVIEW_CHARS - 3).collect();
    format!("{}...", cut)
}
