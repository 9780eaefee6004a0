//! genstream client
//!
//! Real-time delivery of generation events. Any number of subscribers may
//! watch a channel; the store keeps exactly one transport per channel and
//! fans every envelope out to all of them.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use genstream_client::{ClientConfig, EventHandler, Stores, SubscribeOptions, TransportKind};
//!
//! let stores = Stores::new(&ClientConfig::default())?;
//! let sub = stores.subscribe(
//!     TransportKind::WebSocket,
//!     "file.123",
//!     vec![EventHandler::from_fn(|env| println!("{}", env.kind))],
//!     SubscribeOptions::default(),
//! );
//! // ...
//! sub.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod jobs;
pub mod reconnect;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod transport;

pub use config::ClientConfig;
pub use endpoint::{EndpointResolver, StaticEndpoints};
pub use error::{ConfigError, EndpointError, EnvelopeError, HandlerError, StoreError, TransportError};
pub use handler::{EventHandler, HandlerResult, OwnerTag};
pub use jobs::{Job, JobState, JobTracker};
pub use reconnect::{BackoffPolicy, ReconnectDecision, ReconnectPolicy};
pub use registry::{DispatchReport, HandlerRegistry};
pub use store::{ConnectionListener, ConnectionStore, ListenerId, StoreOptions, Stores};
pub use subscription::{SubscribeOptions, Subscription};
pub use transport::{Transport, TransportEvent, TransportKind, TransportStream};

pub use genstream_protocol as protocol;
pub use genstream_protocol::{Channel, ConnectionState, ConnectionStatus, DebugInfo, Envelope, EnvelopeKind};
