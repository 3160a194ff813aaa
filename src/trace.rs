//! Trace model: one record per traced agent invocation

use crate::capture::capture_value;
use crate::types::{TraceId, TraceStatus};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Side-channel data attached to a trace by the traced code itself
///
/// Typically API responses or database rows the agent looked at, kept so the
/// output can later be judged against what the agent actually knew.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Arbitrary contextual data
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Where the data came from
    #[serde(default)]
    pub source: Option<String>,
}

impl TraceContext {
    /// Create a context from a data map
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data, source: None }
    }

    /// Create a context from any serializable value
    ///
    /// Objects become the data map directly; anything else is stored under
    /// the `value` key.
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Self {
        match capture_value(value) {
            Value::Object(data) => Self::new(data),
            Value::Null => Self::default(),
            other => {
                let mut data = Map::new();
                data.insert("value".to_string(), other);
                Self::new(data)
            }
        }
    }

    /// Set the source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add a single data entry
    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Persisted record of one agent invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Unique trace identifier
    pub id: TraceId,
    /// Captured input
    pub input: Value,
    /// Captured output (`null` for failed calls)
    pub output: Value,
    /// Context attached by the traced code
    pub context: Option<TraceContext>,
    /// Creation time
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration of the call
    pub duration_ms: Option<f64>,
    /// Whether the call succeeded
    pub status: TraceStatus,
    /// Failure description, present iff `status` is `Error`
    pub error: Option<String>,
    /// Caller-supplied metadata, returned verbatim
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Trace {
    /// Create a successful trace
    pub fn success(input: Value, output: Value) -> Self {
        Self {
            id: TraceId::new(),
            input,
            output,
            context: None,
            timestamp: now(),
            duration_ms: None,
            status: TraceStatus::Success,
            error: None,
            metadata: Map::new(),
        }
    }

    /// Create a failed trace
    ///
    /// An empty message is replaced so the error column is never blank.
    pub fn failure(input: Value, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unspecified error".to_string();
        }
        Self {
            id: TraceId::new(),
            input,
            output: Value::Null,
            context: None,
            timestamp: now(),
            duration_ms: None,
            status: TraceStatus::Error,
            error: Some(error),
            metadata: Map::new(),
        }
    }

    /// Set the output
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    /// Attach context
    pub fn with_context(mut self, context: Option<TraceContext>) -> Self {
        self.context = context;
        self
    }

    /// Set the duration in milliseconds
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms.max(0.0));
        self
    }

    /// Replace the metadata
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether the traced call succeeded
    pub fn is_success(&self) -> bool {
        self.status == TraceStatus::Success
    }

    /// Check the status/error invariant
    pub fn is_consistent(&self) -> bool {
        match self.status {
            TraceStatus::Success => self.error.is_none(),
            TraceStatus::Error => self
                .error
                .as_deref()
                .is_some_and(|e| !e.trim().is_empty()),
        }
    }

    /// Timestamp in its stored form
    pub fn timestamp_string(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

/// Current time at stored precision (microseconds)
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Render a timestamp the way it is stored
///
/// Fixed-width RFC 3339 in UTC, so text order matches time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

pub(crate) mod timestamp_format {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_timestamp(&s).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", s)))
    }
}
