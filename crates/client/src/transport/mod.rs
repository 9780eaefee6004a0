//! Channel transports
//!
//! A transport opens one long-lived stream bound to a channel and yields
//! lifecycle events plus raw text frames. Decoding and fan-out happen in the
//! connection store.

pub mod sse;
pub mod websocket;

use std::fmt;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use genstream_protocol::Channel;

use crate::error::TransportError;

pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Read-only server-push stream that reconnects by itself.
    Sse,
    /// Bidirectional socket; reconnects are scheduled by the store.
    WebSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Sse => "sse",
            TransportKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a transport needs to open a channel.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub channel: Channel,
    pub url: String,
    /// Diagnostic only; sent as `x-correlation-id`.
    pub correlation_id: Option<String>,
}

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Items yielded by an open transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The stream is (re)established.
    Open,
    /// One text frame.
    Message(String),
    /// The stream broke. A self-reconnecting transport may yield `Open`
    /// again later; otherwise the stream ends after this.
    Error(TransportError),
}

/// Ends when the transport is closed for good.
pub type TransportStream = BoxStream<'static, TransportEvent>;

pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Open a stream for `request.channel`. Resolves once the handshake
    /// succeeds; the first item of the returned stream is `Open`.
    fn open(&self, request: OpenRequest) -> BoxFuture<'static, Result<TransportStream, TransportError>>;
}
