//! # Loopscope
//!
//! Lightweight trace capture, human annotation and export for AI agent calls.
//!
//! ## Features
//!
//! - **Fail-open capture**: wrapped functions and agents behave exactly as
//!   before; storage problems are logged, never raised
//! - **Context side-channel**: the traced body attaches business data to its
//!   own trace with [`set_context`]
//! - **Embedded storage**: one SQLite file, one connection per thread
//! - **Annotations**: pass/fail judgments with critiques and a failure taxonomy
//! - **Export**: CSV and JSON, plus judge training examples
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loopscope::{monitor, set_context, SqliteStorage, TraceContext, TraceStore};
//! use serde_json::json;
//!
//! fn main() -> loopscope::Result<()> {
//!     let answer = monitor(|question: String| {
//!         set_context(TraceContext::from_value(&json!({"docs": 3})).with_source("kb"));
//!         format!("You asked: {}", question)
//!     });
//!
//!     println!("{}", answer("What is the refund policy?".to_string()));
//!
//!     let storage = SqliteStorage::open("loopscope.db")?;
//!     println!("{} traces captured", storage.count(None)?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod annotations;
pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod pool;
pub mod storage;
pub mod trace;
pub mod tracker;
pub mod types;

// Re-exports for convenience
pub use agent::{wrap, AsyncInvoke, Invoke, StreamInvoke, TracedStream, Wrapped};
pub use annotations::{
    Annotation, AnnotationQuery, AnnotationStats, AnnotationStore, JudgmentCounts,
    DEFAULT_ANNOTATOR,
};
pub use capture::{capture_debug, capture_error, capture_value, merge_chunks, safe_deserialize, safe_serialize, Message};
pub use config::Settings;
pub use context::{clear_context, get_context, in_traced_call, set_context};
pub use error::{Error, Result};
pub use export::{ExportFormat, ExportKind, ExportOptions};
pub use storage::{get_storage, reset_storage, set_storage, SqliteStorage, TraceQuery, TraceStore};
pub use trace::{Trace, TraceContext};
pub use tracker::{
    log, monitor, monitor_async, monitor_fallible, persist, LogOptions, Monitor, Persisted,
    CANCELLED_ERROR,
};
pub use types::{AnnotationId, Judgment, TraceId, TraceStatus};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::agent::{wrap, AsyncInvoke, Invoke, StreamInvoke};
    pub use crate::annotations::Annotation;
    pub use crate::context::{get_context, set_context};
    pub use crate::error::{Error, Result};
    pub use crate::storage::{SqliteStorage, TraceStore};
    pub use crate::trace::{Trace, TraceContext};
    pub use crate::tracker::{log, monitor, monitor_async, monitor_fallible, LogOptions, Monitor};
    pub use crate::types::{Judgment, TraceStatus};
}
