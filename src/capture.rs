//! Never-failing conversion of call inputs and outputs to JSON
//!
//! Tracing must not change the behavior of the traced code, so every helper
//! here degrades to a placeholder instead of returning an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Debug, Display, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Placeholder stored when a value refuses to serialize
pub fn unserializable_placeholder<T: ?Sized>() -> Value {
    Value::String(format!("<unserializable: {}>", std::any::type_name::<T>()))
}

/// Convert any serializable value to JSON
///
/// Records, sequences and enums are converted field by field through their
/// `Serialize` impl. Values that fail (non-string map keys, a custom impl
/// that errors or panics) become a placeholder string.
pub fn capture_value<T: Serialize + ?Sized>(value: &T) -> Value {
    match catch_unwind(AssertUnwindSafe(|| serde_json::to_value(value))) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            tracing::debug!(
                value_type = std::any::type_name::<T>(),
                error = %err,
                "value could not be serialized for trace"
            );
            unserializable_placeholder::<T>()
        }
        Err(_) => unserializable_placeholder::<T>(),
    }
}

/// Best-effort rendering for values that do not implement `Serialize`
pub fn capture_debug<T: Debug + ?Sized>(value: &T) -> Value {
    match catch_unwind(AssertUnwindSafe(|| format!("{:?}", value))) {
        Ok(rendered) => Value::String(rendered),
        Err(_) => unserializable_placeholder::<T>(),
    }
}

/// Render a failure for the trace's error column
///
/// A `Display` impl that returns `fmt::Error` or panics yields a placeholder
/// naming the type, so recording the failure never raises a new one.
pub fn capture_error<E: Display + ?Sized>(err: &E) -> String {
    let rendered = catch_unwind(AssertUnwindSafe(|| {
        let mut out = String::new();
        write!(out, "{}", err).map(|_| out)
    }));
    match rendered {
        Ok(Ok(message)) => message,
        _ => format!("<unrenderable error: {}>", std::any::type_name::<E>()),
    }
}

/// Encode a JSON value as stored text
pub fn safe_serialize(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"<serialization_failed>\"".to_string())
}

/// Decode stored text back into JSON
///
/// Empty text is `null`; text that is not valid JSON comes back as a string.
pub fn safe_deserialize(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Merge streamed chunks into a single output value
///
/// When every chunk is an object the chunks are merged key by key, with
/// array values concatenated and other values overwritten by later chunks.
/// Otherwise the last chunk is the output.
pub fn merge_chunks(chunks: &[Value]) -> Value {
    let Some(last) = chunks.last() else {
        return Value::Null;
    };

    if !chunks.iter().all(Value::is_object) {
        return last.clone();
    }

    let mut merged = Map::new();
    for chunk in chunks {
        let Value::Object(fields) = chunk else {
            continue;
        };
        for (key, value) in fields {
            match (merged.get_mut(key), value) {
                (Some(Value::Array(existing)), Value::Array(items)) => {
                    existing.extend(items.iter().cloned());
                }
                _ => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
    }
    Value::Object(merged)
}

/// A chat-style message exchanged with an agent
///
/// Serializes with a `type` tag so message histories captured from different
/// agent frameworks look alike in stored traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind (`human`, `ai`, `system`, `tool`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Message text
    pub content: String,
    /// Framework-specific extra fields
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional_kwargs: Map<String, Value>,
}

impl Message {
    /// Create a message of the given kind
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            additional_kwargs: Map::new(),
        }
    }

    /// Create a human message
    pub fn human(content: impl Into<String>) -> Self {
        Self::new("human", content)
    }

    /// Create an AI message
    pub fn ai(content: impl Into<String>) -> Self {
        Self::new("ai", content)
    }

    /// Attach an extra field
    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.additional_kwargs.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct Query {
        question: String,
        top_k: u32,
    }

    struct Exploding;

    impl Serialize for Exploding {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("boom"))
        }
    }

    #[test]
    fn test_capture_structured_values() {
        let query = Query {
            question: "balance?".to_string(),
            top_k: 3,
        };
        assert_eq!(
            capture_value(&query),
            json!({"question": "balance?", "top_k": 3})
        );
        assert_eq!(capture_value(&(1, "two")), json!([1, "two"]));
        assert_eq!(capture_value(&21), json!(21));
    }

    #[test]
    fn test_capture_failures_degrade_to_placeholder() {
        let mut tuple_keys = HashMap::new();
        tuple_keys.insert((1, 2), "x");
        let value = capture_value(&tuple_keys);
        assert!(value.as_str().unwrap().starts_with("<unserializable:"));

        let value = capture_value(&Exploding);
        assert!(value.as_str().unwrap().contains("Exploding"));
    }

    #[test]
    fn test_capture_debug() {
        #[derive(Debug)]
        struct Opaque {
            _n: u8,
        }
        assert_eq!(capture_debug(&Opaque { _n: 7 }), json!("Opaque { _n: 7 }"));
    }

    #[test]
    fn test_safe_deserialize_fallbacks() {
        assert_eq!(safe_deserialize(""), Value::Null);
        assert_eq!(safe_deserialize("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(safe_deserialize("not json"), json!("not json"));
    }

    #[test]
    fn test_merge_object_chunks() {
        let chunks = vec![
            json!({"messages": [{"content": "a"}], "step": 1}),
            json!({"messages": [{"content": "b"}], "step": 2}),
        ];
        assert_eq!(
            merge_chunks(&chunks),
            json!({"messages": [{"content": "a"}, {"content": "b"}], "step": 2})
        );
        // the input chunks are left untouched
        assert_eq!(chunks[0]["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_merge_mixed_chunks_keeps_last() {
        let chunks = vec![json!("tok"), json!({"done": true})];
        assert_eq!(merge_chunks(&chunks), json!({"done": true}));
        assert_eq!(merge_chunks(&[]), Value::Null);
    }

    #[test]
    fn test_message_is_tagged() {
        let msg = Message::human("hi").with_kwarg("name", json!("maria"));
        assert_eq!(
            capture_value(&msg),
            json!({"type": "human", "content": "hi", "additional_kwargs": {"name": "maria"}})
        );
    }

    struct Unrenderable;

    impl Display for Unrenderable {
        fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Err(std::fmt::Error)
        }
    }

    struct PanicsOnDisplay;

    impl Display for PanicsOnDisplay {
        fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            panic!("display exploded")
        }
    }

    #[test]
    fn test_capture_error_never_fails() {
        assert_eq!(capture_error(&"disk full"), "disk full");

        let message = capture_error(&Unrenderable);
        assert!(message.starts_with("<unrenderable error:"));
        assert!(message.contains("Unrenderable"));

        assert!(capture_error(&PanicsOnDisplay).contains("PanicsOnDisplay"));
    }

    #[test]
    fn test_floats_survive_text_round_trip() {
        for x in [1.079907802215119e-66, 0.1 + 0.2, f64::MIN_POSITIVE, 1e308] {
            let value = json!({"x": x});
            assert_eq!(safe_deserialize(&safe_serialize(&value)), value);
            assert_eq!(safe_deserialize(&safe_serialize(&value))["x"].as_f64(), Some(x));
        }
    }
}
