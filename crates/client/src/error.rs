//! Error types
//!
//! None of these cross the subscribe boundary. The store logs them and
//! reflects transport failures through `ConnectionStatus` only.

use std::path::PathBuf;

use thiserror::Error;

/// Failures opening or reading a channel transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect timed out after {0} ms")]
    Timeout(u64),

    #[error("Handshake rejected with HTTP {status}")]
    Handshake { status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed by server")]
    Closed,
}

impl TransportError {
    /// Fatal errors end a self-reconnecting transport instead of triggering
    /// another retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Handshake { .. } | TransportError::InvalidRequest(_) => true,
            TransportError::Http(e) => e.is_builder(),
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => TransportError::Handshake {
                status: response.status().as_u16(),
            },
            WsError::Url(e) => TransportError::InvalidRequest(e.to_string()),
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::WebSocket(Box::new(other)),
        }
    }
}

/// A frame that could not be turned into an envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope ({payload_bytes} bytes): {source}")]
    Malformed {
        payload_bytes: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Envelope has an empty type tag")]
    EmptyType,
}

/// Failure reported by an event handler
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Endpoint resolution failures
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("No {kind} endpoint configured")]
    NotConfigured { kind: &'static str },

    #[error("Channel id is empty")]
    EmptyChannel,
}

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Store construction failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No tokio runtime available to drive transports")]
    NoRuntime,
}
