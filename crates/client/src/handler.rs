//! Event handlers and owner tags

use std::fmt;
use std::sync::Arc;

use genstream_protocol::Envelope;

use crate::error::HandlerError;

pub type HandlerResult = Result<(), HandlerError>;

type HandlerFn = dyn Fn(&Envelope) -> HandlerResult + Send + Sync;

/// Callback receiving envelopes for a channel.
///
/// Cheap to clone. Two handlers are equal only if they are clones of the same
/// registration, so removal never matches a different closure that happens to
/// do the same thing.
#[derive(Clone)]
pub struct EventHandler {
    f: Arc<HandlerFn>,
}

impl EventHandler {
    /// Wrap a fallible callback. Errors are logged by the dispatcher.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Wrap a callback that cannot fail.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        Self::new(move |envelope| {
            f(envelope);
            Ok(())
        })
    }

    pub fn call(&self, envelope: &Envelope) -> HandlerResult {
        (self.f)(envelope)
    }

    pub fn ptr_eq(&self, other: &EventHandler) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

impl PartialEq for EventHandler {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EventHandler {}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("ptr", &Arc::as_ptr(&self.f).cast::<()>())
            .finish()
    }
}

/// Identifies the logical owner of a set of registrations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerTag(String);

impl OwnerTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Fresh tag for one subscription.
    pub fn unique() -> Self {
        Self(format!("sub-{}", genstream_protocol::new_id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for OwnerTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}
