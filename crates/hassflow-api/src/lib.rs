// hassflow-api: Async Rust client for the Home Assistant WebSocket and REST APIs

pub mod entities;
pub mod error;
pub mod rest;
pub mod transport;
pub mod websocket;

pub use entities::{Context, EntityMap, HassEntity};
pub use error::Error;
pub use rest::{ApiStatus, InstanceConfig, RestClient};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{EntityFeed, HassSocket, ReconnectConfig, SocketConfig};
