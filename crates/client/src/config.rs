//! Client configuration
//!
//! Layering: defaults < TOML file < `GENSTREAM_*` environment variables.
//! The binary applies CLI flags on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reconnect::{BackoffPolicy, ReconnectPolicy};
use crate::transport::TransportKind;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_SSE_RETRY_MS: u64 = 3_000;
pub const DEFAULT_LEAK_THRESHOLD: usize = 5;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

const MAX_RECONNECT_ATTEMPTS_CEILING: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL for server-push streams; the channel id is appended.
    pub sse_base_url: String,
    /// Socket endpoint; the channel is bound by the subscribe message.
    pub ws_url: String,
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    /// Reconnect delay for push streams when the server sends no `retry:`.
    pub sse_retry_ms: u64,
    /// Handlers per channel above which the store force-cleans. 0 disables.
    pub leak_threshold: usize,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sse_base_url: "http://127.0.0.1:3000/api/events".to_string(),
            ws_url: "ws://127.0.0.1:3001/ws".to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            sse_retry_ms: DEFAULT_SSE_RETRY_MS,
            leak_threshold: DEFAULT_LEAK_THRESHOLD,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Overlay `GENSTREAM_*` environment variables.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("GENSTREAM_SSE_BASE_URL") {
            self.sse_base_url = v;
        }
        if let Some(v) = lookup("GENSTREAM_WS_URL") {
            self.ws_url = v;
        }
        if let Some(v) = lookup("GENSTREAM_MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = parse_var("max_reconnect_attempts", &v)?;
        }
        if let Some(v) = lookup("GENSTREAM_BACKOFF_BASE_MS") {
            self.backoff_base_ms = parse_var("backoff_base_ms", &v)?;
        }
        if let Some(v) = lookup("GENSTREAM_SSE_RETRY_MS") {
            self.sse_retry_ms = parse_var("sse_retry_ms", &v)?;
        }
        if let Some(v) = lookup("GENSTREAM_LEAK_THRESHOLD") {
            self.leak_threshold = parse_var("leak_threshold", &v)?;
        }
        if let Some(v) = lookup("GENSTREAM_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_var("connect_timeout_ms", &v)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sse_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "sse_base_url",
                reason: "must not be empty".into(),
            });
        }
        if self.ws_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "ws_url",
                reason: "must not be empty".into(),
            });
        }
        if self.max_reconnect_attempts > MAX_RECONNECT_ATTEMPTS_CEILING {
            return Err(ConfigError::Invalid {
                key: "max_reconnect_attempts",
                reason: format!("must be at most {MAX_RECONNECT_ATTEMPTS_CEILING}"),
            });
        }
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "backoff_base_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sse_retry(&self) -> Duration {
        Duration::from_millis(self.sse_retry_ms)
    }

    /// Reconnect policy for a transport kind.
    pub fn reconnect_policy(&self, kind: TransportKind) -> ReconnectPolicy {
        match kind {
            TransportKind::Sse => ReconnectPolicy::Native,
            TransportKind::WebSocket => ReconnectPolicy::Backoff(BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                max_attempts: self.max_reconnect_attempts,
            }),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("{value:?}: {e}"),
    })
}
