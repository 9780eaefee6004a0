//! Server → Client event envelopes

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Event tag carried in the envelope's `type` field.
///
/// Tags this crate does not know about are kept verbatim in `Other` so
/// producers can add event types without breaking older consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
    Connected,
    Status,
    Progress,
    Finish,
    Completed,
    Error,
    Other(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeKind::Connected => "connected",
            EnvelopeKind::Status => "status",
            EnvelopeKind::Progress => "progress",
            EnvelopeKind::Finish => "finish",
            EnvelopeKind::Completed => "completed",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Other(tag) => tag,
        }
    }

    /// Whether this tag ends a generation job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::Finish | EnvelopeKind::Completed | EnvelopeKind::Error
        )
    }
}

impl From<String> for EnvelopeKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "connected" => EnvelopeKind::Connected,
            "status" => EnvelopeKind::Status,
            "progress" => EnvelopeKind::Progress,
            "finish" => EnvelopeKind::Finish,
            "completed" => EnvelopeKind::Completed,
            "error" => EnvelopeKind::Error,
            _ => EnvelopeKind::Other(tag),
        }
    }
}

impl From<&str> for EnvelopeKind {
    fn from(tag: &str) -> Self {
        EnvelopeKind::from(tag.to_string())
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        match kind {
            EnvelopeKind::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event delivered over a channel.
///
/// Only `type` is required. Every other field is optional and meaning depends
/// on the tag. Fields not modelled here are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub url: Option<String>,
    /// Either a plain message or a structured error object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build a bare envelope with only a tag set.
    pub fn new(kind: impl Into<EnvelopeKind>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            project_id: None,
            request_id: None,
            status: None,
            progress: None,
            url: None,
            error: None,
            data: None,
            object: None,
            extra: Map::new(),
        }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Progress clamped to 0..=100. Non-finite values read as absent.
    pub fn progress_percent(&self) -> Option<f64> {
        self.progress
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0))
    }

    /// Key identifying the job this envelope belongs to.
    pub fn job_key(&self) -> Option<&str> {
        self.request_id.as_deref().or(self.id.as_deref())
    }

    /// Human-readable error text, whether `error` is a string or an object
    /// with a `message` field.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(message) => Some(message.clone()),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(Value::Object(map.clone()).to_string())),
            other => Some(other.to_string()),
        }
    }

    /// Result payload, preferring `data` over `object`.
    pub fn payload(&self) -> Option<&Value> {
        self.data.as_ref().or(self.object.as_ref())
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}
