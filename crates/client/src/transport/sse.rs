//! Server-push stream transport
//!
//! Reconnects by itself after transient loss, the way a browser event source
//! does: waits the server-advertised `retry:` delay (or the configured
//! default), resends `Last-Event-ID`, and yields `Open` again. A non-2xx
//! response ends the stream for good.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::future::{self, BoxFuture};
use futures::stream;
use futures::{FutureExt, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{OpenRequest, Transport, TransportEvent, TransportKind, TransportStream, CORRELATION_HEADER};
use crate::config::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_SSE_RETRY_MS};
use crate::error::TransportError;

const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const EVENT_BUFFER: usize = 64;
/// Longest line the decoder buffers before discarding it.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    default_retry: Duration,
    connect_timeout: Duration,
}

impl SseTransport {
    pub fn new(client: reqwest::Client, default_retry: Duration, connect_timeout: Duration) -> Self {
        Self {
            client,
            default_retry,
            connect_timeout,
        }
    }
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new(
            reqwest::Client::new(),
            Duration::from_millis(DEFAULT_SSE_RETRY_MS),
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        )
    }
}

impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn open(&self, request: OpenRequest) -> BoxFuture<'static, Result<TransportStream, TransportError>> {
        let client = self.client.clone();
        let default_retry = self.default_retry;
        let connect_timeout = self.connect_timeout;
        async move {
            let response = connect(&client, &request, connect_timeout, None).await?;
            info!(
                component = "transport",
                event = "sse.opened",
                channel = %request.channel,
                url = %request.url,
                "Event stream opened"
            );

            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            tokio::spawn(pump(
                client,
                request,
                response,
                default_retry,
                connect_timeout,
                tx,
            ));

            let events = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            let events: TransportStream = stream::once(future::ready(TransportEvent::Open))
                .chain(events)
                .boxed();
            Ok::<_, TransportError>(events)
        }
        .boxed()
    }
}

/// Send the request and wait for response headers, bounded by `timeout`. The
/// body is streamed afterwards without a deadline.
async fn connect(
    client: &reqwest::Client,
    request: &OpenRequest,
    timeout: Duration,
    last_event_id: Option<&str>,
) -> Result<reqwest::Response, TransportError> {
    let mut builder = client
        .get(request.url.as_str())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache");
    if let Some(id) = &request.correlation_id {
        builder = builder.header(CORRELATION_HEADER, id.as_str());
    }
    if let Some(id) = last_event_id {
        builder = builder.header(LAST_EVENT_ID_HEADER, id);
    }

    let response = tokio::time::timeout(timeout, builder.send())
        .await
        .map_err(|_| TransportError::Timeout(timeout.as_millis() as u64))??;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Handshake {
            status: status.as_u16(),
        });
    }
    Ok(response)
}

/// Feed decoded events to the store until the receiver goes away or the
/// server rejects a reconnect.
async fn pump(
    client: reqwest::Client,
    request: OpenRequest,
    first: reqwest::Response,
    default_retry: Duration,
    connect_timeout: Duration,
    tx: mpsc::Sender<TransportEvent>,
) {
    let mut decoder = SseDecoder::default();
    let mut response = first;

    loop {
        let Some(failure) = read_events(response, &mut decoder, &tx).await else {
            return;
        };
        decoder.reset_pending();
        warn!(
            component = "transport",
            event = "sse.interrupted",
            channel = %request.channel,
            error = %failure,
            "Event stream interrupted, waiting to reconnect"
        );
        if tx.send(TransportEvent::Error(failure)).await.is_err() {
            return;
        }

        response = loop {
            let delay = decoder.retry().unwrap_or(default_retry);
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match connect(&client, &request, connect_timeout, decoder.last_event_id()).await {
                Ok(response) => break response,
                Err(e) if e.is_fatal() => {
                    warn!(
                        component = "transport",
                        event = "sse.reconnect.rejected",
                        channel = %request.channel,
                        error = %e,
                        "Server rejected event stream reconnect"
                    );
                    let _ = tx.send(TransportEvent::Error(e)).await;
                    return;
                }
                Err(e) => {
                    debug!(
                        component = "transport",
                        event = "sse.reconnect.failed",
                        channel = %request.channel,
                        error = %e,
                        "Event stream reconnect failed, retrying"
                    );
                    if tx.send(TransportEvent::Error(e)).await.is_err() {
                        return;
                    }
                }
            }
        };

        info!(
            component = "transport",
            event = "sse.reconnected",
            channel = %request.channel,
            last_event_id = ?decoder.last_event_id(),
            "Event stream re-established"
        );
        if tx.send(TransportEvent::Open).await.is_err() {
            return;
        }
    }
}

/// Returns the failure that ended the body, or `None` if the receiver closed.
async fn read_events(
    response: reqwest::Response,
    decoder: &mut SseDecoder,
    tx: &mpsc::Sender<TransportEvent>,
) -> Option<TransportError> {
    let mut body = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => return None,
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in decoder.feed(&bytes) {
                    if tx.send(TransportEvent::Message(event.data)).await.is_err() {
                        return None;
                    }
                }
            }
            Some(Err(e)) => return Some(e.into()),
            None => return Some(TransportError::Closed),
        }
    }
}

// ---------------------------------------------------------------------------
// Event-stream decoding
// ---------------------------------------------------------------------------

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` decoder.
///
/// Handles chunk boundaries anywhere (including inside a UTF-8 sequence),
/// `\n`, `\r\n` and bare `\r` line endings, comments, multi-line `data:`,
/// `id:` and `retry:` fields. A line longer than the configured cap is
/// dropped whole.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to hold no terminator.
    scanned: usize,
    /// Previous line ended in `\r`; a leading `\n` belongs to it.
    skip_lf: bool,
    /// Inside an oversized line; everything up to the next terminator goes.
    discarding: bool,
    max_line: usize,
    data: String,
    has_data: bool,
    event: Option<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
    seen_first_line: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            skip_lf: false,
            discarding: false,
            max_line,
            data: String::new(),
            has_data: false,
            event: None,
            last_event_id: None,
            retry: None,
            seen_first_line: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            if self.skip_lf {
                let Some(&first) = self.buffer.first() else {
                    break;
                };
                self.skip_lf = false;
                if first == b'\n' {
                    self.buffer.advance(1);
                }
            }

            let Some(offset) = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n' || b == b'\r')
            else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_line {
                    warn!(
                        component = "transport",
                        event = "sse.line.oversized",
                        buffered = self.buffer.len(),
                        max_line = self.max_line,
                        "Discarding oversized event-stream line"
                    );
                    self.buffer.clear();
                    self.scanned = 0;
                    self.discarding = true;
                }
                break;
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            self.skip_lf = self.buffer[end] == b'\r';
            let mut line = self.buffer.split_to(end + 1);
            line.truncate(end);

            if std::mem::take(&mut self.discarding) || line.len() > self.max_line {
                continue;
            }
            let Ok(text) = std::str::from_utf8(&line) else {
                continue;
            };
            let text = if self.seen_first_line {
                text
            } else {
                self.seen_first_line = true;
                text.strip_prefix('\u{feff}').unwrap_or(text)
            };
            if let Some(event) = self.process_line(text) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        Some(SseEvent {
            event,
            data,
            id: self.last_event_id.clone(),
        })
    }

    /// Drop a half-received event after the connection broke. The last event
    /// id and retry delay survive.
    pub fn reset_pending(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.skip_lf = false;
        self.discarding = false;
        self.data.clear();
        self.has_data = false;
        self.event = None;
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }
}
