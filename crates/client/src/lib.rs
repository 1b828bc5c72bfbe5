//! Relay connection layer for the Nostr messaging engine.
//!
//! This crate provides:
//! - `RelayConnection`: one WebSocket session to one relay
//! - `RelayPool`: N connections, merged inbound stream, fan-out publishing
//! - Wire frame types (`ClientMessage`, `RelayMessage`, `Filter`)
//! - Recovery primitives (`CircuitBreaker`, `ExponentialBackoff`)

pub mod connection;
pub mod error;
pub mod message;
pub mod pool;
pub mod recovery;
pub mod subscription;

pub use connection::{ConnectionConfig, ConnectionState, RelayConnection};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use pool::{PoolEvent, RelayPool};
pub use recovery::{BreakerSnapshot, CircuitBreaker, CircuitState, ExponentialBackoff};
pub use subscription::{generate_subscription_id, SubscriptionBuilder, SubscriptionTracker};
