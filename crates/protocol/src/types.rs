//! Core types shared across the protocol

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier scoping a stream of events to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `project.<id>`
    pub fn project(id: impl fmt::Display) -> Self {
        Self(format!("project.{id}"))
    }

    /// `file.<id>`
    pub fn file(id: impl fmt::Display) -> Self {
        Self(format!("file.{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Channel {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Transport lifecycle state for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Observable connection state plus reconnect bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Failed attempts since the last successful open.
    pub attempts: u32,
    /// Zero when the transport reconnects on its own.
    pub max_attempts: u32,
    /// Set once the driver stopped for good. The next subscription to the
    /// channel starts a fresh transport and clears it.
    #[serde(default)]
    pub gave_up: bool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether the transport stopped and will not come back on its own,
    /// either because the retry budget is spent or because a self-healing
    /// transport ended.
    pub fn is_exhausted(&self) -> bool {
        self.gave_up && self.state == ConnectionState::Disconnected
    }
}

/// Per-channel row of [`DebugInfo`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDebug {
    pub channel: Channel,
    pub handlers: usize,
    pub owners: usize,
    pub status: ConnectionStatus,
    pub transport_live: bool,
}

/// Read-only snapshot of a connection store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub transport: String,
    pub total_handlers: usize,
    pub channels: Vec<ChannelDebug>,
    pub states: BTreeMap<Channel, ConnectionState>,
    /// Transports opened over the store's lifetime, reconnects included.
    pub transports_opened: u64,
    pub open_transports: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_constructors() {
        assert_eq!(Channel::project(42).as_str(), "project.42");
        assert_eq!(Channel::file("abc").as_str(), "file.abc");
        assert!(Channel::new("  ").is_empty());
    }

    #[test]
    fn connection_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Connecting).expect("serialize");
        assert_eq!(json, "\"connecting\"");
    }

    #[test]
    fn exhausted_only_after_giving_up() {
        let mut status = ConnectionStatus {
            state: ConnectionState::Disconnected,
            attempts: 3,
            max_attempts: 3,
            gave_up: false,
        };
        assert!(!status.is_exhausted(), "last retry may still be pending");

        status.gave_up = true;
        assert!(status.is_exhausted());

        status.state = ConnectionState::Connecting;
        assert!(!status.is_exhausted());

        let native = ConnectionStatus {
            gave_up: true,
            ..ConnectionStatus::default()
        };
        assert!(native.is_exhausted());
        assert!(!ConnectionStatus::default().is_exhausted());
    }

    #[test]
    fn status_without_gave_up_field_parses() {
        let status: ConnectionStatus =
            serde_json::from_str(r#"{"state":"connected","attempts":0,"maxAttempts":3}"#)
                .expect("parse");
        assert!(status.is_connected());
        assert!(!status.gave_up);
    }

    #[test]
    fn debug_info_uses_camel_case_and_channel_keys() {
        let mut info = DebugInfo {
            transport: "sse".into(),
            total_handlers: 1,
            ..Default::default()
        };
        info.states
            .insert(Channel::file(1), ConnectionState::Connected);

        let json = serde_json::to_value(&info).expect("serialize");
        assert_eq!(json["totalHandlers"], 1);
        assert_eq!(json["states"]["file.1"], "connected");
    }
}
