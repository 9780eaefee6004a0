//! Subscription handles
//!
//! A `Subscription` is one caller's claim on a channel. Dropping it, or
//! calling [`Subscription::disconnect`], removes exactly the handlers it
//! registered; other subscribers on the same channel keep receiving.

use std::sync::atomic::{AtomicBool, Ordering};

use genstream_protocol::{Channel, ConnectionStatus};
use tokio::sync::watch;
use tracing::debug;

use crate::handler::{EventHandler, OwnerTag};
use crate::store::ConnectionStore;

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// A disabled subscription registers nothing and opens nothing.
    pub enabled: bool,
    /// Diagnostic tag attached to the transport and its logs.
    pub correlation_id: Option<String>,
    /// Owner tag for the handlers. A fresh unique tag is used when unset.
    pub owner: Option<OwnerTag>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            correlation_id: None,
            owner: None,
        }
    }
}

impl SubscribeOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<OwnerTag>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

pub struct Subscription {
    store: ConnectionStore,
    channel: Channel,
    owner: OwnerTag,
    handlers: Vec<EventHandler>,
    correlation_id: Option<String>,
    enabled: bool,
    registered: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        store: ConnectionStore,
        channel: Channel,
        handlers: Vec<EventHandler>,
        options: SubscribeOptions,
    ) -> Self {
        let subscription = Self {
            store,
            channel,
            owner: options.owner.unwrap_or_else(OwnerTag::unique),
            handlers,
            correlation_id: options.correlation_id,
            enabled: options.enabled,
            registered: AtomicBool::new(false),
        };
        subscription.register();
        subscription
    }

    fn register(&self) {
        if !self.enabled || self.channel.is_empty() || self.handlers.is_empty() {
            debug!(
                component = "subscription",
                event = "subscription.inactive",
                channel = %self.channel,
                enabled = self.enabled,
                "Subscription is inactive"
            );
            return;
        }
        self.store.init_connection(
            &self.channel,
            &self.handlers,
            &self.owner,
            self.correlation_id.as_deref(),
        );
        self.registered.store(true, Ordering::Release);
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn owner(&self) -> &OwnerTag {
        &self.owner
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether this handle currently holds registrations. Turns false when
    /// the store evicted them in a forced cleanup; [`reconnect`](Self::reconnect)
    /// registers again.
    pub fn is_active(&self) -> bool {
        self.registered.load(Ordering::Acquire)
            && self
                .store
                .is_registered(&self.channel, &self.owner, &self.handlers)
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.is_active() {
            self.store.status(&self.channel)
        } else {
            ConnectionStatus {
                max_attempts: self.max_attempts(),
                ..ConnectionStatus::default()
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn connection_attempts(&self) -> u32 {
        self.status().attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.store.policy().max_attempts()
    }

    /// Status updates for the channel's current transport. The receiver goes
    /// stale once that transport is torn down.
    pub fn watch_status(&self) -> Option<watch::Receiver<ConnectionStatus>> {
        if !self.is_active() {
            return None;
        }
        self.store.watch_status(&self.channel)
    }

    /// Remove this handle's handlers. Safe to call repeatedly and from
    /// inside one of its own handlers; no handler of this handle runs after
    /// it returns.
    pub fn disconnect(&self) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return;
        }
        self.store
            .remove_channel_handlers(&self.channel, &self.owner, &self.handlers);
    }

    /// Move this handle to `channel`, dropping the old registration first.
    pub fn resubscribe(&mut self, channel: impl Into<Channel>) {
        self.disconnect();
        self.channel = channel.into();
        self.register();
    }

    /// Re-register under the current channel, e.g. after a forced cleanup
    /// or after the transport gave up.
    pub fn reconnect(&self) {
        self.disconnect();
        self.register();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            self.register();
        } else {
            self.disconnect();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("owner", &self.owner)
            .field("handlers", &self.handlers.len())
            .field("enabled", &self.enabled)
            .field("active", &self.is_active())
            .finish()
    }
}
