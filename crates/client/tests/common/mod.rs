#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::{stream, FutureExt, StreamExt};
use genstream_client::error::{EndpointError, TransportError};
use genstream_client::transport::OpenRequest;
use genstream_client::{
    BackoffPolicy, Channel, ConnectionStore, Envelope, EndpointResolver, EventHandler,
    ReconnectPolicy, StoreOptions, Transport, TransportEvent, TransportKind, TransportStream,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One opened mock transport. Dropping `tx` ends the stream.
pub struct Link {
    pub request: OpenRequest,
    pub tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Link {
    pub fn send(&self, frame: &str) {
        self.tx
            .send(TransportEvent::Message(frame.to_string()))
            .expect("transport stream dropped");
    }
}

/// In-memory transport that hands every opened stream to the test.
pub struct MockTransport {
    kind: TransportKind,
    fail_opens: AtomicBool,
    opens: Mutex<Vec<Instant>>,
    links: mpsc::UnboundedSender<Link>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> (Arc<Self>, mpsc::UnboundedReceiver<Link>) {
        let (links, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            kind,
            fail_opens: AtomicBool::new(false),
            opens: Mutex::new(Vec::new()),
            links,
        });
        (transport, rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_opens.store(failing, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open(&self, request: OpenRequest) -> BoxFuture<'static, Result<TransportStream, TransportError>> {
        self.opens.lock().push(Instant::now());
        if self.fail_opens.load(Ordering::SeqCst) {
            return future::ready(Err(TransportError::Closed)).boxed();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.links.send(Link { request, tx });
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        let events: TransportStream = stream::once(future::ready(TransportEvent::Open))
            .chain(events)
            .boxed();
        future::ready(Ok(events)).boxed()
    }
}

pub fn resolver() -> Arc<dyn EndpointResolver> {
    Arc::new(|channel: &Channel, _kind: TransportKind| {
        Ok::<_, EndpointError>(format!("mem://{channel}"))
    })
}

pub fn websocket_store() -> (ConnectionStore, Arc<MockTransport>, mpsc::UnboundedReceiver<Link>) {
    store_with(TransportKind::WebSocket, ReconnectPolicy::Backoff(BackoffPolicy::default()), 5)
}

pub fn sse_store() -> (ConnectionStore, Arc<MockTransport>, mpsc::UnboundedReceiver<Link>) {
    store_with(TransportKind::Sse, ReconnectPolicy::Native, 5)
}

pub fn store_with(
    kind: TransportKind,
    policy: ReconnectPolicy,
    leak_threshold: usize,
) -> (ConnectionStore, Arc<MockTransport>, mpsc::UnboundedReceiver<Link>) {
    let (transport, links) = MockTransport::new(kind);
    let store = ConnectionStore::new(
        transport.clone(),
        resolver(),
        StoreOptions {
            policy,
            leak_threshold,
            runtime: None,
        },
    )
    .expect("store");
    (store, transport, links)
}

/// A handler that forwards every envelope it receives.
pub fn recorder() -> (EventHandler, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = EventHandler::from_fn(move |envelope| {
        let _ = tx.send(envelope.clone());
    });
    (handler, rx)
}

pub async fn next_link(links: &mut mpsc::UnboundedReceiver<Link>) -> Link {
    tokio::time::timeout(Duration::from_secs(5), links.recv())
        .await
        .expect("timed out waiting for transport open")
        .expect("transport dropped")
}

pub async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("handler dropped")
}
