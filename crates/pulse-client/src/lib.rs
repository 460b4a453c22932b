pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod monitor;
pub mod snapshot;
pub mod subscriptions;

pub use client::PulseClient;
pub use config::{ClientConfig, ConfigError, HeartbeatPolicy, PolicyFile, ReconnectPolicy};
pub use connection::{ConnError, ConnectionManager, ConnectionStatus, ReadyState};
pub use dispatcher::{ConnectionEvent, Dispatch, EventDispatcher, HandlerId, Topic};
pub use snapshot::{SnapshotClient, SnapshotError};
