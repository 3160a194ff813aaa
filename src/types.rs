//! Core type definitions for loopscope

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Uuid);

impl TraceId {
    /// Create a new random trace ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a trace ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse a trace ID from its textual form
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::invalid_input(format!("invalid trace id '{}': {}", s, e)))
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TraceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Unique identifier for an annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationId(Uuid);

impl AnnotationId {
    /// Create a new random annotation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an annotation ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse an annotation ID from its textual form
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::invalid_input(format!("invalid annotation id '{}': {}", s, e)))
    }
}

impl Default for AnnotationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AnnotationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Outcome of a traced call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// The call returned normally
    #[default]
    Success,
    /// The call failed (error value or panic)
    Error,
}

impl TraceStatus {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(Error::invalid_input(format!(
                "unknown trace status '{}' (expected success or error)",
                other
            ))),
        }
    }
}

/// Binary human judgment on a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Judgment {
    /// The agent achieved the desired outcome
    Pass,
    /// The agent did not achieve the desired outcome
    Fail,
}

impl Judgment {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for Judgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Judgment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            other => Err(Error::invalid_input(format!(
                "unknown judgment '{}' (expected pass or fail)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_parse() {
        let id = TraceId::new();
        let parsed = TraceId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);

        assert!(matches!(
            TraceId::parse("not-a-uuid"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("success".parse::<TraceStatus>().unwrap(), TraceStatus::Success);
        assert_eq!(" ERROR ".parse::<TraceStatus>().unwrap(), TraceStatus::Error);
        assert!("pending".parse::<TraceStatus>().is_err());
    }

    #[test]
    fn test_judgment_serde() {
        assert_eq!(serde_json::to_string(&Judgment::Fail).unwrap(), "\"fail\"");
        assert_eq!("Pass".parse::<Judgment>().unwrap(), Judgment::Pass);
        assert!("skip".parse::<Judgment>().is_err());
    }
}
