//! Handler registry
//!
//! Bookkeeping of which handlers are interested in which channel, tagged by
//! owner. Dispatch order is registration order. Removal is always scoped to
//! one owner so an owner can never drop another owner's handlers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use genstream_protocol::{Channel, Envelope};
use tracing::{error, warn};

use crate::handler::{EventHandler, OwnerTag};

#[derive(Debug)]
struct Registration {
    owner: OwnerTag,
    handlers: Vec<EventHandler>,
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Handlers removed by an earlier handler during the same dispatch.
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    channels: HashMap<Channel, Vec<Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handlers` for `owner` on `channel`. Registration is additive; a
    /// handler already registered by the same owner is not added twice.
    /// Returns how many handlers were added.
    pub fn register(
        &mut self,
        channel: &Channel,
        owner: &OwnerTag,
        handlers: &[EventHandler],
    ) -> usize {
        if handlers.is_empty() {
            return 0;
        }
        let registrations = self.channels.entry(channel.clone()).or_default();
        let idx = match registrations.iter().position(|r| &r.owner == owner) {
            Some(idx) => idx,
            None => {
                registrations.push(Registration {
                    owner: owner.clone(),
                    handlers: Vec::new(),
                });
                registrations.len() - 1
            }
        };
        let existing = &mut registrations[idx].handlers;
        let mut added = 0;
        for handler in handlers {
            if !existing.contains(handler) {
                existing.push(handler.clone());
                added += 1;
            }
        }
        added
    }

    /// Remove every handler `owner` has on `channel`. Unknown owners are a
    /// no-op. Returns how many handlers were removed.
    pub fn unregister(&mut self, channel: &Channel, owner: &OwnerTag) -> usize {
        self.unregister_handlers(channel, owner, &[])
    }

    /// Remove the given handlers of `owner` on `channel`; an empty slice
    /// removes all of the owner's handlers there.
    pub fn unregister_handlers(
        &mut self,
        channel: &Channel,
        owner: &OwnerTag,
        handlers: &[EventHandler],
    ) -> usize {
        let Some(registrations) = self.channels.get_mut(channel) else {
            return 0;
        };
        let mut removed = 0;
        registrations.retain_mut(|registration| {
            if &registration.owner != owner {
                return true;
            }
            let before = registration.handlers.len();
            if handlers.is_empty() {
                registration.handlers.clear();
            } else {
                registration.handlers.retain(|h| !handlers.contains(h));
            }
            removed += before - registration.handlers.len();
            !registration.handlers.is_empty()
        });
        if registrations.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Channels on which `owner` holds registrations.
    pub fn channels_of(&self, owner: &OwnerTag) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .channels
            .iter()
            .filter(|(_, regs)| regs.iter().any(|r| &r.owner == owner))
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    pub fn count(&self, channel: &Channel) -> usize {
        self.channels
            .get(channel)
            .map(|regs| regs.iter().map(|r| r.handlers.len()).sum())
            .unwrap_or(0)
    }

    pub fn owner_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map(Vec::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.channels.keys().map(|c| self.count(c)).sum()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_registered(&self, channel: &Channel, owner: &OwnerTag, handler: &EventHandler) -> bool {
        self.channels.get(channel).is_some_and(|regs| {
            regs.iter()
                .any(|r| &r.owner == owner && r.handlers.contains(handler))
        })
    }

    /// Handlers for `channel` in dispatch order.
    pub fn snapshot(&self, channel: &Channel) -> Vec<(OwnerTag, EventHandler)> {
        self.channels
            .get(channel)
            .map(|regs| {
                regs.iter()
                    .flat_map(|r| r.handlers.iter().map(|h| (r.owner.clone(), h.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every registration. Returns how many handlers were removed.
    pub fn clear(&mut self) -> usize {
        let total = self.total();
        self.channels.clear();
        total
    }

    /// Invoke every handler for `channel`. A failing or panicking handler is
    /// logged and does not stop delivery to the rest.
    pub fn dispatch(&self, channel: &Channel, envelope: &Envelope) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (owner, handler) in self.snapshot(channel) {
            if invoke_isolated(channel, &owner, &handler, envelope) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Dispatch through a shared cell so handlers may mutate the registry
    /// while being called. No borrow is held across a handler call, and each
    /// handler is re-checked right before it runs, so a handler removed
    /// mid-dispatch is skipped.
    pub fn dispatch_shared(
        cell: &RefCell<HandlerRegistry>,
        channel: &Channel,
        envelope: &Envelope,
    ) -> DispatchReport {
        let snapshot = cell.borrow().snapshot(channel);
        let mut report = DispatchReport::default();
        for (owner, handler) in snapshot {
            if !cell.borrow().is_registered(channel, &owner, &handler) {
                report.skipped += 1;
                continue;
            }
            if invoke_isolated(channel, &owner, &handler, envelope) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }
}

fn invoke_isolated(
    channel: &Channel,
    owner: &OwnerTag,
    handler: &EventHandler,
    envelope: &Envelope,
) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.call(envelope))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(
                component = "registry",
                event = "registry.handler.failed",
                channel = %channel,
                owner = %owner,
                envelope_type = %envelope.kind,
                error = %e,
                "Event handler returned an error"
            );
            false
        }
        Err(payload) => {
            error!(
                component = "registry",
                event = "registry.handler.panicked",
                channel = %channel,
                owner = %owner,
                envelope_type = %envelope.kind,
                panic = %panic_message(payload.as_ref()),
                "Event handler panicked"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
