//! Client → Server control messages

use serde::{Deserialize, Serialize};

/// Messages sent from client to server over the socket transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sent once per socket establishment to bind it to a channel.
    Subscribe {
        #[serde(rename = "projectId")]
        project_id: String,
    },
}

impl ControlMessage {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        ControlMessage::Subscribe {
            project_id: channel.into(),
        }
    }
}
