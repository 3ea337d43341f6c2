//! Optimistic chat synchronization for the campus app, with an in-memory
//! backend, a WebSocket relay and a WebSocket client transport.

pub mod backend;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod models;
pub mod server;
pub mod synchronizer;
pub mod transport;
pub mod view;
pub mod ws_client;

pub use backend::{Backend, LocalTransport};
pub use config::{ClientConfig, RelayConfig, SyncConfig};
pub use error::{ConfigError, SyncError, TransportError};
pub use models::{default_channels, Channel, ChannelKind, LocalUser, Message, MessageId, Origin, SenderProfile};
pub use synchronizer::{MessageSynchronizer, Notification};
pub use transport::{ChannelTransport, Subscription};
pub use ws_client::WsTransport;
