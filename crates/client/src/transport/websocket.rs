//! Bidirectional socket transport
//!
//! Sends `{"type":"subscribe","projectId":<channel>}` once per open, then
//! yields text frames until the socket closes or errors. No reconnection
//! happens here; the store's backoff policy owns retries.

use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::stream;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{OpenRequest, Transport, TransportEvent, TransportKind, TransportStream, CORRELATION_HEADER};
use crate::codec::encode_subscribe;
use crate::config::DEFAULT_CONNECT_TIMEOUT_MS;
use crate::error::TransportError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS))
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn open(&self, request: OpenRequest) -> BoxFuture<'static, Result<TransportStream, TransportError>> {
        let timeout = self.connect_timeout;
        async move {
            let mut ws_request = request.url.as_str().into_client_request()?;
            if let Some(id) = &request.correlation_id {
                let value = HeaderValue::from_str(id)
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                ws_request.headers_mut().insert(CORRELATION_HEADER, value);
            }

            let (mut socket, _response) = tokio::time::timeout(timeout, connect_async(ws_request))
                .await
                .map_err(|_| TransportError::Timeout(timeout.as_millis() as u64))??;

            let subscribe = encode_subscribe(request.channel.as_str())?;
            socket.send(Message::Text(subscribe.into())).await?;

            info!(
                component = "transport",
                event = "ws.subscribe.sent",
                channel = %request.channel,
                url = %request.url,
                "WebSocket opened and subscribe sent"
            );

            let channel = request.channel;
            let frames = stream::unfold(Some(socket), move |state| {
                let channel = channel.clone();
                async move {
                    let mut socket = state?;
                    next_frame(&mut socket, &channel)
                        .await
                        .map(|(event, keep_open)| (event, keep_open.then_some(socket)))
                }
            });

            let events: TransportStream = stream::once(future::ready(TransportEvent::Open))
                .chain(frames)
                .boxed();
            Ok::<_, TransportError>(events)
        }
        .boxed()
    }
}

/// Read until the next event worth surfacing. Returns `None` on a clean
/// close; the flag is false after an error so the stream ends.
async fn next_frame(
    socket: &mut Socket,
    channel: &genstream_protocol::Channel,
) -> Option<(TransportEvent, bool)> {
    loop {
        match socket.next().await? {
            Ok(Message::Text(text)) => {
                return Some((TransportEvent::Message(text.to_string()), true));
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => return Some((TransportEvent::Message(text), true)),
                Err(e) => {
                    warn!(
                        component = "transport",
                        event = "ws.frame.invalid_utf8",
                        channel = %channel,
                        error = %e,
                        "Dropping binary frame that is not UTF-8"
                    );
                }
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    component = "transport",
                    event = "ws.close_frame",
                    channel = %channel,
                    reason = ?frame,
                    "Server sent close frame"
                );
                return None;
            }
            Ok(_) => {}
            Err(e) => return Some((TransportEvent::Error(e.into()), false)),
        }
    }
}
