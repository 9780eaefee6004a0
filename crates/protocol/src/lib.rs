//! genstream Protocol
//!
//! Shared types for generation-event channels.
//! Envelopes arrive as JSON over a server-push stream or a WebSocket.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::ControlMessage;
pub use server::{Envelope, EnvelopeKind};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
