//! Collaborator interfaces consumed by the engine.
//!
//! The engine does not own identity, trust decisions, or the requests
//! inbox; those are injected. `RelayTransport` is the capability interface
//! over the relay pool so test doubles can stand in for real sockets.

use nostr_client::{ClientError, ConnectionState, Filter, PoolEvent, RelayPool};
use nostr_core::Event;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::broadcast;

/// Source of the local identity's key material.
///
/// `secret_key` returns `None` while the identity is locked; the engine
/// treats that as "send unavailable", never as an error to panic on.
pub trait IdentityProvider: Send + Sync {
    /// X-only public key, lowercase hex. `None` when no identity is set.
    fn public_key(&self) -> Option<String>;
    /// Secret key bytes. `None` when locked or absent.
    fn secret_key(&self) -> Option<[u8; 32]>;
}

/// Sender classification: accepted contacts and blocklist.
pub trait TrustProvider: Send + Sync {
    fn is_accepted(&self, pubkey: &str) -> bool;
    fn is_blocked(&self, pubkey: &str) -> bool;
}

/// Destination for messages from unknown (non-accepted) senders.
pub trait RequestsInbox: Send + Sync {
    fn upsert_incoming(&self, sender: &str, preview: &str, timestamp: u64);
}

/// Capability interface over the relay pool.
///
/// One concrete implementation wraps `RelayPool`; tests implement the same
/// interface with scripted behavior.
pub trait RelayTransport: Send + Sync + 'static {
    /// Subscribe to the merged inbound event stream.
    fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent>;

    /// Publish an event to every open relay; returns how many accepted the
    /// write locally (zero open relays is a no-op, not an error).
    fn broadcast_event(&self, event: &Event) -> impl Future<Output = usize> + Send;

    /// Open a subscription on every open relay.
    fn subscribe_with_id(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Close a subscription on every relay.
    fn unsubscribe(&self, subscription_id: &str) -> impl Future<Output = ()> + Send;

    /// Number of currently open connections.
    fn connected_count(&self) -> impl Future<Output = usize> + Send;

    /// Live snapshot of per-relay connection states.
    fn connection_states(&self) -> impl Future<Output = HashMap<String, ConnectionState>> + Send;
}

impl RelayTransport for RelayPool {
    fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.subscribe()
    }

    async fn broadcast_event(&self, event: &Event) -> usize {
        RelayPool::broadcast_event(self, event).await
    }

    async fn subscribe_with_id(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> Result<(), ClientError> {
        RelayPool::subscribe_with_id(self, subscription_id, filters).await
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        RelayPool::unsubscribe(self, subscription_id).await
    }

    async fn connected_count(&self) -> usize {
        RelayPool::connected_count(self).await
    }

    async fn connection_states(&self) -> HashMap<String, ConnectionState> {
        RelayPool::states(self).await
    }
}
