//! Relay pool: aggregates connections to multiple relays.
//!
//! The pool merges inbound frames from every connection into one broadcast
//! stream tagged with the originating relay URL, fans outgoing frames to
//! every open connection, and schedules reconnect attempts with backoff when
//! a connection drops unexpectedly.

use crate::connection::{ConnectionState, RelayConnection};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::recovery::ExponentialBackoff;
use crate::subscription::{generate_subscription_id, SubscriptionTracker};
use nostr_core::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Events emitted by the relay pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A relay connected
    Connected { relay_url: String },
    /// A relay disconnected
    Disconnected { relay_url: String },
    /// An event was received from a relay
    Event {
        relay_url: String,
        subscription_id: String,
        event: Event,
    },
    /// EOSE received for a subscription on a relay
    Eose {
        relay_url: String,
        subscription_id: String,
    },
    /// All relays have sent EOSE for a subscription
    AllEose { subscription_id: String },
    /// OK response for a published event
    Ok {
        relay_url: String,
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// Notice from a relay
    Notice { relay_url: String, message: String },
    /// Connection error
    Error { relay_url: String, error: String },
}

/// A pool of relay connections.
#[derive(Clone)]
pub struct RelayPool {
    /// Connections indexed by URL
    connections: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,
    /// Subscription trackers indexed by subscription ID
    subscriptions: Arc<RwLock<HashMap<String, SubscriptionTracker>>>,
    /// Broadcast channel for pool events
    events_tx: broadcast::Sender<PoolEvent>,
    /// Set during disconnect_all to suppress reconnect attempts
    shutdown: Arc<AtomicBool>,
}

impl RelayPool {
    /// Create a new relay pool.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1000);
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    /// Get all relay URLs in the pool.
    pub async fn relay_urls(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Get connection states for all relays.
    pub async fn states(&self) -> HashMap<String, ConnectionState> {
        let conns = self.connections.read().await;
        conns
            .iter()
            .map(|(url, conn)| (url.clone(), conn.state()))
            .collect()
    }

    /// Get the number of open connections.
    pub async fn connected_count(&self) -> usize {
        let conns = self.connections.read().await;
        conns.values().filter(|c| c.is_open()).count()
    }

    /// Check if a relay is connected.
    pub async fn is_connected(&self, url: &str) -> bool {
        self.connections
            .read()
            .await
            .get(url)
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Add a relay to the pool without connecting.
    pub async fn add_relay(&self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        info!("Adding relay to pool: {}", url);

        let conn = Arc::new(RelayConnection::new(&url)?);
        self.connections.write().await.insert(url, conn);
        Ok(())
    }

    /// Remove a relay from the pool and disconnect it.
    pub async fn remove_relay(&self, url: &str) {
        info!("Removing relay from pool: {}", url);

        let conn = self.connections.write().await.remove(url);
        if let Some(conn) = conn {
            conn.disconnect().await;
        }

        let mut subs = self.subscriptions.write().await;
        for tracker in subs.values_mut() {
            tracker.remove_relay(url);
        }
    }

    /// Add and connect to a set of relays.
    pub async fn connect(&self, urls: &[String]) -> Vec<(String, Result<()>)> {
        self.shutdown.store(false, Ordering::SeqCst);

        let mut results = Vec::new();
        for url in urls {
            if let Err(e) = self.add_relay(url.clone()).await {
                results.push((url.clone(), Err(e)));
                continue;
            }
            let result = self.connect_relay(url).await;
            if let Err(ref e) = result {
                let _ = self.events_tx.send(PoolEvent::Error {
                    relay_url: url.clone(),
                    error: e.to_string(),
                });
            }
            results.push((url.clone(), result));
        }
        results
    }

    /// Connect to one relay already in the pool (added if missing).
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        debug!("Connecting to relay: {}", url);

        let conn = {
            let mut conns = self.connections.write().await;
            match conns.get(url) {
                Some(c) => Arc::clone(c),
                None => {
                    let c = Arc::new(RelayConnection::new(url)?);
                    conns.insert(url.to_string(), Arc::clone(&c));
                    c
                }
            }
        };

        conn.connect().await?;
        self.spawn_message_forwarder(&conn, url.to_string());

        // Re-issue active subscriptions on the fresh session
        let active: Vec<(String, Vec<Filter>)> = {
            let subs = self.subscriptions.read().await;
            subs.values()
                .map(|t| (t.id.clone(), t.filters.clone()))
                .collect()
        };
        for (id, filters) in active {
            match conn.subscribe(&id, filters).await {
                Ok(()) => {
                    let mut subs = self.subscriptions.write().await;
                    if let Some(tracker) = subs.get_mut(&id) {
                        tracker.add_relay(url);
                    }
                }
                Err(e) => warn!("Failed to resubscribe {} on {}: {}", id, url, e),
            }
        }

        let _ = self.events_tx.send(PoolEvent::Connected {
            relay_url: url.to_string(),
        });
        Ok(())
    }

    /// Spawn a task forwarding one connection's frames into pool events.
    ///
    /// When the connection leaves the open state, the task emits
    /// `Disconnected` and schedules reconnect attempts with backoff unless
    /// the relay was removed or the pool is shutting down.
    fn spawn_message_forwarder(&self, conn: &Arc<RelayConnection>, relay_url: String) {
        let mut rx = conn.subscribe_messages();
        let mut state_rx = conn.watch_state();
        let pool = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let msg = match msg {
                            Ok(m) => m,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Pool forwarder for {} lagged by {} frames", relay_url, n);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        pool.forward_message(&relay_url, msg).await;
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *state_rx.borrow();
                        if state == ConnectionState::Closed || state == ConnectionState::Error {
                            break;
                        }
                    }
                }
            }

            let _ = pool.events_tx.send(PoolEvent::Disconnected {
                relay_url: relay_url.clone(),
            });

            let removed = !pool.connections.read().await.contains_key(&relay_url);
            if !removed && !pool.shutdown.load(Ordering::SeqCst) {
                pool.spawn_reconnect(relay_url);
            }
        });
    }

    /// Map one inbound frame to pool events.
    async fn forward_message(&self, relay_url: &str, msg: RelayMessage) {
        let event = match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => PoolEvent::Event {
                relay_url: relay_url.to_string(),
                subscription_id,
                event,
            },
            RelayMessage::Eose { subscription_id } => {
                let all_eose = {
                    let mut subs = self.subscriptions.write().await;
                    match subs.get_mut(&subscription_id) {
                        Some(tracker) => {
                            tracker.mark_eose(relay_url);
                            tracker.all_eose
                        }
                        None => false,
                    }
                };

                let _ = self.events_tx.send(PoolEvent::Eose {
                    relay_url: relay_url.to_string(),
                    subscription_id: subscription_id.clone(),
                });

                if all_eose {
                    PoolEvent::AllEose { subscription_id }
                } else {
                    return;
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => PoolEvent::Ok {
                relay_url: relay_url.to_string(),
                event_id,
                accepted,
                message,
            },
            RelayMessage::Notice { message } => PoolEvent::Notice {
                relay_url: relay_url.to_string(),
                message,
            },
        };

        let _ = self.events_tx.send(event);
    }

    /// Spawn a reconnect loop for a dropped relay.
    fn spawn_reconnect(&self, url: String) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut backoff =
                ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300), 0);
            loop {
                let delay = match backoff.next_delay() {
                    Some(d) => d,
                    None => break,
                };
                tokio::time::sleep(delay).await;

                if pool.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if !pool.connections.read().await.contains_key(&url) {
                    break;
                }

                match pool.connect_relay(&url).await {
                    Ok(()) => break,
                    Err(ClientError::AlreadyConnected) => break,
                    Err(e) => debug!("Reconnect to {} failed: {}", url, e),
                }
            }
        });
    }

    /// Disconnect from all relays and stop reconnecting.
    pub async fn disconnect_all(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let conns = self.connections.read().await;
        for conn in conns.values() {
            conn.disconnect().await;
        }
    }

    /// Send a frame to every open connection.
    ///
    /// Fire-and-forget: zero open connections is not an error here, the
    /// caller sees it in the returned count and compensates (offline queue).
    pub async fn send_to_open(&self, msg: &ClientMessage) -> usize {
        let conns = self.connections.read().await;
        let mut sent = 0;
        for (url, conn) in conns.iter() {
            if !conn.is_open() {
                continue;
            }
            match conn.send_frame(msg).await {
                Ok(()) => sent += 1,
                Err(e) => debug!("Send to {} failed: {}", url, e),
            }
        }
        sent
    }

    /// Publish an event to every open connection.
    pub async fn broadcast_event(&self, event: &Event) -> usize {
        self.send_to_open(&ClientMessage::Event(event.clone())).await
    }

    /// Subscribe on all open relays with a generated ID.
    pub async fn subscribe_all(&self, filters: Vec<Filter>) -> Result<String> {
        let subscription_id = generate_subscription_id();
        self.subscribe_with_id(&subscription_id, filters).await?;
        Ok(subscription_id)
    }

    /// Subscribe on all open relays with a specific subscription ID.
    pub async fn subscribe_with_id(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> Result<()> {
        info!(
            "Creating subscription {} with {} filters",
            subscription_id,
            filters.len()
        );

        let mut tracker = SubscriptionTracker::new(subscription_id, filters.clone());

        let conns = self.connections.read().await;
        for (url, conn) in conns.iter() {
            if !conn.is_open() {
                continue;
            }
            match conn.subscribe(subscription_id, filters.clone()).await {
                Ok(()) => {
                    tracker.add_relay(url);
                }
                Err(e) => warn!("Failed to subscribe on {}: {}", url, e),
            }
        }
        drop(conns);

        self.subscriptions
            .write()
            .await
            .insert(subscription_id.to_string(), tracker);
        Ok(())
    }

    /// Close a subscription on all relays.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        info!("Closing subscription {}", subscription_id);

        self.subscriptions.write().await.remove(subscription_id);

        let conns = self.connections.read().await;
        for (url, conn) in conns.iter() {
            if !conn.is_open() {
                continue;
            }
            if let Err(e) = conn.unsubscribe(subscription_id).await {
                debug!("Failed to unsubscribe {} on {}: {}", subscription_id, url, e);
            }
        }
    }

    /// Get active subscription IDs.
    pub async fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}
