//! Endpoint resolution

use genstream_protocol::Channel;

use crate::error::EndpointError;
use crate::transport::TransportKind;

/// Maps a channel to the URL a transport should open.
pub trait EndpointResolver: Send + Sync + 'static {
    fn resolve(&self, channel: &Channel, kind: TransportKind) -> Result<String, EndpointError>;
}

impl<F> EndpointResolver for F
where
    F: Fn(&Channel, TransportKind) -> Result<String, EndpointError> + Send + Sync + 'static,
{
    fn resolve(&self, channel: &Channel, kind: TransportKind) -> Result<String, EndpointError> {
        (self)(channel, kind)
    }
}

/// Fixed base URLs from configuration.
///
/// Push streams open `<sse_base>/<channel>`; sockets all share `ws_url` and
/// bind to a channel with the subscribe message.
#[derive(Debug, Clone)]
pub struct StaticEndpoints {
    pub sse_base: String,
    pub ws_url: String,
}

impl StaticEndpoints {
    pub fn new(sse_base: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            sse_base: sse_base.into(),
            ws_url: ws_url.into(),
        }
    }

    pub fn from_config(config: &crate::config::ClientConfig) -> Self {
        Self::new(config.sse_base_url.clone(), config.ws_url.clone())
    }
}

impl EndpointResolver for StaticEndpoints {
    fn resolve(&self, channel: &Channel, kind: TransportKind) -> Result<String, EndpointError> {
        if channel.is_empty() {
            return Err(EndpointError::EmptyChannel);
        }
        match kind {
            TransportKind::Sse => {
                let base = self.sse_base.trim().trim_end_matches('/');
                if base.is_empty() {
                    return Err(EndpointError::NotConfigured { kind: "sse" });
                }
                Ok(format!("{base}/{}", urlencoding::encode(channel.as_str())))
            }
            TransportKind::WebSocket => {
                let url = self.ws_url.trim();
                if url.is_empty() {
                    return Err(EndpointError::NotConfigured { kind: "websocket" });
                }
                Ok(url.to_string())
            }
        }
    }
}
