//! Wire frame decoding

use genstream_protocol::{ControlMessage, Envelope, EnvelopeKind};

use crate::error::EnvelopeError;

/// Parse one inbound frame. Unknown tags pass through untouched.
pub fn decode_envelope(frame: &str) -> Result<Envelope, EnvelopeError> {
    let envelope = Envelope::from_json(frame).map_err(|source| EnvelopeError::Malformed {
        payload_bytes: frame.len(),
        source,
    })?;
    if let EnvelopeKind::Other(tag) = &envelope.kind {
        if tag.trim().is_empty() {
            return Err(EnvelopeError::EmptyType);
        }
    }
    Ok(envelope)
}

/// Serialize the subscribe message sent when a socket opens.
pub fn encode_subscribe(channel: &str) -> serde_json::Result<String> {
    serde_json::to_string(&ControlMessage::subscribe(channel))
}

pub(crate) fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
