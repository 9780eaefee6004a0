//! Connection store
//!
//! Owns at most one live transport per channel and fans inbound envelopes out
//! to every handler registered for that channel. Callers never see transport
//! errors; they observe `ConnectionStatus` instead.
//!
//! Lifecycle: a channel's transport is opened by the first `init_connection`
//! for it and torn down when its last handler is removed. Each live channel
//! runs one driver task that opens the transport, dispatches frames in
//! arrival order, and applies the reconnect policy.
//!
//! Locking: the registry sits behind a re-entrant lock so handlers may
//! subscribe or disconnect from inside a dispatch. When both locks are
//! needed the registry lock is always taken before the channel table lock,
//! and listeners are notified with the channel table unlocked.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use genstream_protocol::{Channel, ChannelDebug, ConnectionState, ConnectionStatus, DebugInfo};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::codec::{decode_envelope, truncate_for_log};
use crate::config::{ClientConfig, DEFAULT_LEAK_THRESHOLD};
use crate::endpoint::{EndpointResolver, StaticEndpoints};
use crate::error::StoreError;
use crate::handler::{EventHandler, OwnerTag};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::registry::HandlerRegistry;
use crate::subscription::{SubscribeOptions, Subscription};
use crate::transport::{
    OpenRequest, SseTransport, Transport, TransportEvent, TransportKind, WebSocketTransport,
};

/// Connection-state observer
pub type ConnectionListener = Arc<dyn Fn(&Channel, &ConnectionStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct StoreOptions {
    pub policy: ReconnectPolicy,
    /// Handlers per channel above which the store force-cleans. 0 disables.
    pub leak_threshold: usize,
    /// Runtime that drives transports. Defaults to the current one.
    pub runtime: Option<Handle>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::Native,
            leak_threshold: DEFAULT_LEAK_THRESHOLD,
            runtime: None,
        }
    }
}

/// Handle to a connection store (cheap to Clone).
#[derive(Clone)]
pub struct ConnectionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn EndpointResolver>,
    policy: ReconnectPolicy,
    leak_threshold: usize,
    runtime: Handle,
    registry: ReentrantMutex<RefCell<HandlerRegistry>>,
    channels: Mutex<HashMap<Channel, ChannelEntry>>,
    listeners: Mutex<Vec<(ListenerId, ConnectionListener)>>,
    next_listener: AtomicU64,
    next_generation: AtomicU64,
    transports_opened: AtomicU64,
}

struct ChannelEntry {
    /// Distinguishes drivers across teardown and restart of the same channel.
    generation: u64,
    status: watch::Sender<ConnectionStatus>,
    driver: Option<JoinHandle<()>>,
    /// False once the driver gave up; the next `init_connection` restarts it.
    active: bool,
    correlation_id: Option<String>,
}

impl ConnectionStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn EndpointResolver>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let runtime = match options.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| StoreError::NoRuntime)?,
        };
        Ok(Self {
            inner: Arc::new(StoreInner {
                transport,
                resolver,
                policy: options.policy,
                leak_threshold: options.leak_threshold,
                runtime,
                registry: ReentrantMutex::new(RefCell::new(HandlerRegistry::new())),
                channels: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                transports_opened: AtomicU64::new(0),
            }),
        })
    }

    /// Build the store for `kind` with the stock transport and static
    /// endpoints from `config`.
    pub fn from_config(kind: TransportKind, config: &ClientConfig) -> Result<Self, StoreError> {
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Sse => Arc::new(SseTransport::new(
                reqwest::Client::new(),
                config.sse_retry(),
                config.connect_timeout(),
            )),
            TransportKind::WebSocket => Arc::new(WebSocketTransport::new(config.connect_timeout())),
        };
        Self::new(
            transport,
            Arc::new(StaticEndpoints::from_config(config)),
            StoreOptions {
                policy: config.reconnect_policy(kind),
                leak_threshold: config.leak_threshold,
                runtime: None,
            },
        )
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Declare interest in `channel`. The returned handle removes exactly its
    /// own handlers when disconnected or dropped.
    pub fn subscribe(
        &self,
        channel: impl Into<Channel>,
        handlers: Vec<EventHandler>,
        options: SubscribeOptions,
    ) -> Subscription {
        Subscription::new(self.clone(), channel.into(), handlers, options)
    }

    /// Register `handlers` for `owner` on `channel`, opening the channel's
    /// transport if none is live. Never opens a second transport for a
    /// channel. `correlation_id` only tags the transport for diagnostics.
    pub fn init_connection(
        &self,
        channel: &Channel,
        handlers: &[EventHandler],
        owner: &OwnerTag,
        correlation_id: Option<&str>,
    ) {
        if channel.is_empty() || handlers.is_empty() {
            debug!(
                component = "store",
                event = "store.init.skipped",
                channel = %channel,
                handlers = handlers.len(),
                "Nothing to register"
            );
            return;
        }

        let guard = self.inner.registry.lock();
        guard.borrow_mut().register(channel, owner, handlers);
        let count = guard.borrow().count(channel);

        let threshold = self.inner.leak_threshold;
        if threshold > 0 && count > threshold {
            error!(
                component = "store",
                event = "store.leak_detected",
                channel = %channel,
                handlers = count,
                threshold,
                owner = %owner,
                "Handler count above safety threshold, forcing cleanup"
            );
            self.force_cleanup();
            guard.borrow_mut().register(channel, owner, handlers);
        }

        self.inner.ensure_transport(channel, correlation_id);
    }

    /// Remove `owner`'s handlers on every channel (all of them when
    /// `handlers` is empty). Channels left without handlers are closed.
    /// Returns how many handlers were removed.
    pub fn remove_project_handlers(&self, owner: &OwnerTag, handlers: &[EventHandler]) -> usize {
        let guard = self.inner.registry.lock();
        let channels = guard.borrow().channels_of(owner);
        let mut removed = 0;
        for channel in &channels {
            removed += guard
                .borrow_mut()
                .unregister_handlers(channel, owner, handlers);
            if guard.borrow().count(channel) == 0 {
                self.inner.close_channel(channel);
            }
        }
        if removed > 0 {
            info!(
                component = "store",
                event = "store.owner.removed",
                owner = %owner,
                channels = channels.len(),
                handlers_removed = removed,
                "Removed owner handlers"
            );
        }
        removed
    }

    /// Same as [`remove_project_handlers`](Self::remove_project_handlers),
    /// scoped to one channel.
    pub fn remove_channel_handlers(
        &self,
        channel: &Channel,
        owner: &OwnerTag,
        handlers: &[EventHandler],
    ) -> usize {
        let guard = self.inner.registry.lock();
        let removed = guard
            .borrow_mut()
            .unregister_handlers(channel, owner, handlers);
        if removed > 0 && guard.borrow().count(channel) == 0 {
            self.inner.close_channel(channel);
        }
        debug!(
            component = "store",
            event = "store.handlers.removed",
            channel = %channel,
            owner = %owner,
            handlers_removed = removed,
            "Removed channel handlers"
        );
        removed
    }

    /// Emergency eviction: drop every registration and close every
    /// transport.
    pub fn force_cleanup(&self) {
        let guard = self.inner.registry.lock();
        let handlers_removed = guard.borrow_mut().clear();
        let entries: Vec<(Channel, ChannelEntry)> = self.inner.channels.lock().drain().collect();
        let transports_closed = entries.len();
        for (channel, entry) in entries {
            self.inner.shutdown_entry(&channel, entry);
        }
        error!(
            component = "store",
            event = "store.force_cleanup",
            transport = %self.kind(),
            handlers_removed,
            transports_closed,
            "Forced cleanup of all handlers and transports"
        );
    }

    pub fn add_connection_handler<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Channel, &ConnectionStatus) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was not registered.
    pub fn remove_connection_handler(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Current status of `channel`; disconnected if no transport exists.
    pub fn status(&self, channel: &Channel) -> ConnectionStatus {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|entry| *entry.status.borrow())
            .unwrap_or_else(|| self.inner.idle_status())
    }

    /// Status updates for `channel` while its transport exists.
    pub fn watch_status(&self, channel: &Channel) -> Option<watch::Receiver<ConnectionStatus>> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|entry| entry.status.subscribe())
    }

    /// Whether any of `handlers` is still registered for `owner` on
    /// `channel`. False after a forced cleanup evicted them.
    pub fn is_registered(&self, channel: &Channel, owner: &OwnerTag, handlers: &[EventHandler]) -> bool {
        let guard = self.inner.registry.lock();
        let registry = guard.borrow();
        handlers
            .iter()
            .any(|handler| registry.is_registered(channel, owner, handler))
    }

    pub fn handler_count(&self, channel: &Channel) -> usize {
        self.inner.registry.lock().borrow().count(channel)
    }

    /// Read-only introspection.
    pub fn debug_info(&self) -> DebugInfo {
        let guard = self.inner.registry.lock();
        let registry = guard.borrow();
        let channels = self.inner.channels.lock();

        let names: BTreeSet<Channel> = registry
            .channels()
            .into_iter()
            .chain(channels.keys().cloned())
            .collect();

        let mut info = DebugInfo {
            transport: self.kind().to_string(),
            total_handlers: registry.total(),
            transports_opened: self.inner.transports_opened.load(Ordering::Relaxed),
            ..Default::default()
        };
        for channel in names {
            let entry = channels.get(&channel);
            let status = entry
                .map(|e| *e.status.borrow())
                .unwrap_or_else(|| self.inner.idle_status());
            let transport_live = entry.is_some_and(|e| e.active);
            if transport_live {
                info.open_transports += 1;
            }
            info.states.insert(channel.clone(), status.state);
            info.channels.push(ChannelDebug {
                handlers: registry.count(&channel),
                owners: registry.owner_count(&channel),
                channel,
                status,
                transport_live,
            });
        }
        info
    }
}

impl StoreInner {
    fn idle_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts: self.policy.max_attempts(),
            gave_up: false,
        }
    }

    fn ensure_transport(self: &Arc<Self>, channel: &Channel, correlation_id: Option<&str>) {
        let mut channels = self.channels.lock();
        if let Some(entry) = channels.get(channel) {
            if entry.active {
                trace!(
                    component = "store",
                    event = "store.transport.reused",
                    channel = %channel,
                    "Reusing live transport"
                );
                return;
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let correlation_id = correlation_id.map(str::to_string);
        let driver = self.runtime.spawn(
            drive_channel(
                Arc::downgrade(self),
                channel.clone(),
                generation,
                correlation_id.clone(),
            )
            .instrument(info_span!(
                "channel",
                channel = %channel,
                transport = %self.transport.kind(),
                correlation_id = ?correlation_id,
                generation
            )),
        );

        match channels.get_mut(channel) {
            Some(entry) => {
                info!(
                    component = "store",
                    event = "store.transport.restarted",
                    channel = %channel,
                    previous_attempts = entry.status.borrow().attempts,
                    "Restarting transport after retries were exhausted"
                );
                if let Some(old) = entry.driver.take() {
                    old.abort();
                }
                entry.generation = generation;
                entry.active = true;
                entry.correlation_id = correlation_id;
                entry.driver = Some(driver);
                entry.status.send_modify(|status| {
                    status.attempts = 0;
                    status.gave_up = false;
                });
            }
            None => {
                info!(
                    component = "store",
                    event = "store.transport.opening",
                    channel = %channel,
                    "Opening transport"
                );
                let (status, _) = watch::channel(self.idle_status());
                channels.insert(
                    channel.clone(),
                    ChannelEntry {
                        generation,
                        status,
                        driver: Some(driver),
                        active: true,
                        correlation_id,
                    },
                );
            }
        }
    }

    /// Tear down `channel`'s transport. Caller holds the registry lock.
    fn close_channel(&self, channel: &Channel) {
        let entry = self.channels.lock().remove(channel);
        if let Some(entry) = entry {
            self.shutdown_entry(channel, entry);
        }
    }

    fn shutdown_entry(&self, channel: &Channel, mut entry: ChannelEntry) {
        if let Some(driver) = entry.driver.take() {
            driver.abort();
        }
        let mut closed = None;
        entry.status.send_if_modified(|status| {
            if status.state == ConnectionState::Disconnected {
                return false;
            }
            status.state = ConnectionState::Disconnected;
            closed = Some(*status);
            true
        });
        info!(
            component = "store",
            event = "store.transport.closed",
            channel = %channel,
            correlation_id = ?entry.correlation_id,
            "Closed transport"
        );
        if let Some(status) = closed {
            self.notify(channel, &status);
        }
    }

    /// Apply `update` to the status of the driver's entry. Returns false if
    /// the entry is gone or belongs to a newer driver, meaning this driver
    /// should stop.
    fn transition(
        &self,
        channel: &Channel,
        generation: u64,
        deactivate: bool,
        update: impl FnOnce(&mut ConnectionStatus),
    ) -> bool {
        let changed = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(channel) else {
                return false;
            };
            if entry.generation != generation {
                return false;
            }
            if deactivate {
                entry.active = false;
            }
            let mut changed = None;
            entry.status.send_if_modified(|status| {
                let before = *status;
                update(status);
                if *status == before {
                    return false;
                }
                changed = Some(*status);
                true
            });
            changed
        };
        if let Some(status) = changed {
            self.notify(channel, &status);
        }
        true
    }

    fn current_status(&self, channel: &Channel, generation: u64) -> Option<ConnectionStatus> {
        self.channels
            .lock()
            .get(channel)
            .filter(|entry| entry.generation == generation)
            .map(|entry| *entry.status.borrow())
    }

    fn notify(&self, channel: &Channel, status: &ConnectionStatus) {
        let listeners: Vec<ConnectionListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(channel, status))).is_err() {
                error!(
                    component = "store",
                    event = "store.listener.panicked",
                    channel = %channel,
                    "Connection listener panicked"
                );
            }
        }
    }

    /// Decode one frame and dispatch it. Bad frames are dropped.
    fn deliver(&self, channel: &Channel, generation: u64, frame: &str) {
        let envelope = match decode_envelope(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    component = "store",
                    event = "store.envelope.parse_failed",
                    channel = %channel,
                    error = %e,
                    payload_preview = %truncate_for_log(frame, 240),
                    "Dropping malformed envelope"
                );
                return;
            }
        };

        let guard = self.registry.lock();
        if self.current_status(channel, generation).is_none() {
            return;
        }
        let report = HandlerRegistry::dispatch_shared(&guard, channel, &envelope);
        trace!(
            component = "store",
            event = "store.envelope.dispatched",
            channel = %channel,
            envelope_type = %envelope.kind,
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "Dispatched envelope"
        );
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for entry in self.channels.get_mut().values_mut() {
            if let Some(driver) = entry.driver.take() {
                driver.abort();
            }
        }
    }
}

/// One channel's transport loop: open, pump frames, apply the reconnect
/// policy, repeat. Holds only a weak reference so a dropped store stops it.
async fn drive_channel(
    store: Weak<StoreInner>,
    channel: Channel,
    generation: u64,
    correlation_id: Option<String>,
) {
    loop {
        let (transport, request) = {
            let Some(inner) = store.upgrade() else {
                return;
            };
            if !inner.transition(&channel, generation, false, |s| {
                s.state = ConnectionState::Connecting;
                s.gave_up = false;
            }) {
                return;
            }
            let url = match inner.resolver.resolve(&channel, inner.transport.kind()) {
                Ok(url) => url,
                Err(e) => {
                    error!(
                        component = "store",
                        event = "store.endpoint.unresolved",
                        channel = %channel,
                        error = %e,
                        "Cannot resolve endpoint for channel"
                    );
                    inner.transition(&channel, generation, true, |s| {
                        s.state = ConnectionState::Disconnected;
                        s.gave_up = true;
                    });
                    return;
                }
            };
            inner.transports_opened.fetch_add(1, Ordering::Relaxed);
            (
                inner.transport.clone(),
                OpenRequest {
                    channel: channel.clone(),
                    url,
                    correlation_id: correlation_id.clone(),
                },
            )
        };

        match transport.open(request).await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    let Some(inner) = store.upgrade() else {
                        return;
                    };
                    match event {
                        TransportEvent::Open => {
                            info!(
                                component = "store",
                                event = "store.transport.connected",
                                channel = %channel,
                                "Transport connected"
                            );
                            if !inner.transition(&channel, generation, false, |s| {
                                s.state = ConnectionState::Connected;
                                s.attempts = 0;
                            }) {
                                return;
                            }
                        }
                        TransportEvent::Message(frame) => inner.deliver(&channel, generation, &frame),
                        TransportEvent::Error(e) => {
                            warn!(
                                component = "store",
                                event = "store.transport.error",
                                channel = %channel,
                                error = %e,
                                "Transport error"
                            );
                            if !inner.transition(&channel, generation, false, |s| {
                                s.state = ConnectionState::Disconnected;
                            }) {
                                return;
                            }
                        }
                    }
                }
                debug!(
                    component = "store",
                    event = "store.transport.ended",
                    channel = %channel,
                    "Transport stream ended"
                );
            }
            Err(e) => {
                warn!(
                    component = "store",
                    event = "store.transport.open_failed",
                    channel = %channel,
                    error = %e,
                    "Failed to open transport"
                );
            }
        }

        let Some(inner) = store.upgrade() else {
            return;
        };
        let Some(status) = inner.current_status(&channel, generation) else {
            return;
        };
        match inner.policy.next(status.attempts) {
            ReconnectDecision::Retry { attempt, delay } => {
                if !inner.transition(&channel, generation, false, |s| {
                    s.state = ConnectionState::Disconnected;
                    s.attempts = attempt;
                }) {
                    return;
                }
                info!(
                    component = "store",
                    event = "store.reconnect.scheduled",
                    channel = %channel,
                    attempt,
                    max_attempts = inner.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                drop(inner);
                tokio::time::sleep(delay).await;
            }
            ReconnectDecision::GiveUp { attempts } => {
                inner.transition(&channel, generation, true, |s| {
                    s.state = ConnectionState::Disconnected;
                    s.attempts = attempts;
                    s.gave_up = true;
                });
                warn!(
                    component = "store",
                    event = "store.reconnect.exhausted",
                    channel = %channel,
                    attempts,
                    "Giving up on transport until the next subscription"
                );
                return;
            }
        }
    }
}

/// The two stores an application needs, one per transport kind.
///
/// Created once and passed to whoever subscribes, so every caller shares the
/// same per-channel transports.
#[derive(Clone)]
pub struct Stores {
    sse: ConnectionStore,
    websocket: ConnectionStore,
}

impl Stores {
    pub fn new(config: &ClientConfig) -> Result<Self, StoreError> {
        Ok(Self {
            sse: ConnectionStore::from_config(TransportKind::Sse, config)?,
            websocket: ConnectionStore::from_config(TransportKind::WebSocket, config)?,
        })
    }

    pub fn get(&self, kind: TransportKind) -> &ConnectionStore {
        match kind {
            TransportKind::Sse => &self.sse,
            TransportKind::WebSocket => &self.websocket,
        }
    }

    pub fn subscribe(
        &self,
        kind: TransportKind,
        channel: impl Into<Channel>,
        handlers: Vec<EventHandler>,
        options: SubscribeOptions,
    ) -> Subscription {
        self.get(kind).subscribe(channel, handlers, options)
    }

    pub fn debug_info(&self) -> Vec<DebugInfo> {
        vec![self.sse.debug_info(), self.websocket.debug_info()]
    }
}
