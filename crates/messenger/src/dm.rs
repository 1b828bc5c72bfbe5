//! DM protocol controller.
//!
//! Orchestrates encrypted direct messages end to end: subscribes to the
//! relay pool, verifies and decrypts inbound events, classifies senders
//! (trusted, unknown, blocked), persists through the message store, and
//! drives the offline outbox through the retry manager.
//!
//! Nothing in the receive pipeline throws: malformed, unverifiable or
//! undecryptable events are dropped where detected, so a hostile relay
//! cannot crash the client.

use crate::cache::{ConversationCache, RecentIds};
use crate::error::{EngineError, Result};
use crate::message::{
    now_unix, now_unix_millis, Message, MessageStatus, OutgoingMessage,
};
use crate::retry::{RetryDecision, RetryManager};
use crate::store::{MessageQuery, MessageStore};
use crate::traits::{IdentityProvider, RelayTransport, RequestsInbox, TrustProvider};
use nostr_client::recovery::BreakerSnapshot;
use nostr_client::{
    generate_subscription_id, ConnectionState, Filter, PoolEvent, SubscriptionBuilder,
};
use nostr_core::{
    decrypt_dm, encrypt_dm, is_valid_pubkey_hex, sign_event, verify_event, Event, EventTemplate,
    KIND_ENCRYPTED_DM,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Plaintext safety limit in characters
    pub max_plaintext_len: usize,
    /// REQ limit for the standing DM subscription
    pub dm_subscription_limit: u64,
    /// How long to wait for a relay OK before queueing
    pub ack_timeout: Duration,
    /// Preview length handed to the requests inbox
    pub preview_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_plaintext_len: 4000,
            dm_subscription_limit: 100,
            ack_timeout: Duration::from_secs(10),
            preview_len: 80,
        }
    }
}

/// Controller lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// Created, not yet subscribed
    Idle,
    /// Subscribed and processing
    Ready,
    /// Unrecoverable configuration fault (e.g. no identity)
    Error,
}

/// Events emitted by the engine for consumers (UI, logs).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A message was appended to a conversation (incoming, or an optimistic
    /// outgoing append)
    MessageAdded { message: Message },
    /// A message's delivery status changed
    MessageStatus {
        message_id: String,
        status: MessageStatus,
    },
    /// A message from an unknown sender was routed to the requests inbox
    RequestReceived { sender: String },
    /// A relay connected or disconnected
    NetworkChanged { relay_url: String, connected: bool },
    /// A missed-message sync subscription finished its backlog
    SyncCompleted { subscription_id: String },
    /// A group's metadata or membership state changed
    GroupUpdated { group_id: String },
    /// A chat message arrived on a group timeline
    GroupMessage { group_id: String, message: Message },
}

#[derive(Debug)]
struct AckResult {
    accepted: bool,
    message: String,
}

/// The DM protocol controller.
///
/// Generic over the transport so tests can drive it without sockets. All
/// shared state lives behind locks; clones share the same state.
pub struct DmController<T: RelayTransport> {
    transport: Arc<T>,
    identity: Arc<dyn IdentityProvider>,
    trust: Arc<dyn TrustProvider>,
    requests: Arc<dyn RequestsInbox>,
    store: Arc<MessageStore>,
    retry: Arc<RetryManager>,
    config: EngineConfig,
    cache: Arc<RwLock<ConversationCache>>,
    status: Arc<StdRwLock<ControllerStatus>>,
    dm_subscription: Arc<StdRwLock<Option<String>>>,
    sync_subscriptions: Arc<StdRwLock<HashSet<String>>>,
    seen_ids: Arc<StdRwLock<RecentIds>>,
    pending_acks: Arc<Mutex<HashMap<String, oneshot::Sender<AckResult>>>>,
    events_tx: broadcast::Sender<EngineEvent>,
}

impl<T: RelayTransport> Clone for DmController<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            identity: Arc::clone(&self.identity),
            trust: Arc::clone(&self.trust),
            requests: Arc::clone(&self.requests),
            store: Arc::clone(&self.store),
            retry: Arc::clone(&self.retry),
            config: self.config.clone(),
            cache: Arc::clone(&self.cache),
            status: Arc::clone(&self.status),
            dm_subscription: Arc::clone(&self.dm_subscription),
            sync_subscriptions: Arc::clone(&self.sync_subscriptions),
            seen_ids: Arc::clone(&self.seen_ids),
            pending_acks: Arc::clone(&self.pending_acks),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<T: RelayTransport> DmController<T> {
    pub fn new(
        transport: Arc<T>,
        identity: Arc<dyn IdentityProvider>,
        trust: Arc<dyn TrustProvider>,
        requests: Arc<dyn RequestsInbox>,
        store: Arc<MessageStore>,
        retry: Arc<RetryManager>,
        config: EngineConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(1000);
        Self {
            transport,
            identity,
            trust,
            requests,
            store,
            retry,
            config,
            cache: Arc::new(RwLock::new(ConversationCache::default())),
            status: Arc::new(StdRwLock::new(ControllerStatus::Idle)),
            dm_subscription: Arc::new(StdRwLock::new(None)),
            sync_subscriptions: Arc::new(StdRwLock::new(HashSet::new())),
            seen_ids: Arc::new(StdRwLock::new(RecentIds::default())),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// The engine event sender, shared with sibling controllers so consumers
    /// observe one stream.
    pub fn events_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.events_tx.clone()
    }

    /// Current controller status.
    pub fn status(&self) -> ControllerStatus {
        *self.status.read().unwrap()
    }

    fn set_status(&self, status: ControllerStatus) {
        *self.status.write().unwrap() = status;
    }

    /// Start processing: spawn the pool event handler and open the standing
    /// DM subscription.
    pub async fn start(&self) -> Result<()> {
        self.spawn_event_handler();
        self.subscribe_to_incoming_dms().await
    }

    /// Issue the standing DM subscription (kind 4, `p` = our pubkey).
    /// Idempotent: re-issuing while subscribed is a no-op.
    pub async fn subscribe_to_incoming_dms(&self) -> Result<()> {
        let pubkey = match self.identity.public_key() {
            Some(pk) => pk,
            None => {
                self.set_status(ControllerStatus::Error);
                return Err(EngineError::NoIdentity);
            }
        };

        if self.dm_subscription.read().unwrap().is_some() {
            debug!("DM subscription already active");
            return Ok(());
        }

        let subscription_id = generate_subscription_id();
        let filters = SubscriptionBuilder::new()
            .incoming_dms(pubkey, self.config.dm_subscription_limit)
            .build();

        self.transport
            .subscribe_with_id(&subscription_id, filters)
            .await
            .map_err(|e| EngineError::Subscription(e.to_string()))?;

        *self.dm_subscription.write().unwrap() = Some(subscription_id);
        self.set_status(ControllerStatus::Ready);
        Ok(())
    }

    /// Tear down the standing DM subscription. Resets the idempotence guard
    /// so a later subscribe starts fresh.
    pub async fn unsubscribe_from_dms(&self) {
        let id = self.dm_subscription.write().unwrap().take();
        if let Some(id) = id {
            self.transport.unsubscribe(&id).await;
        }
    }

    /// Issue a time-bounded catch-up subscription after reconnection.
    ///
    /// Results flow through the normal receive pipeline, so backlog and live
    /// events share one classification/dedup path. The subscription closes
    /// itself once every relay reports end-of-stored-events.
    pub async fn sync_missed_messages(&self, since: Option<u64>) -> Result<String> {
        let pubkey = self.identity.public_key().ok_or(EngineError::NoIdentity)?;

        let since = match since {
            Some(s) => Some(s),
            None => self.store.latest_incoming_timestamp()?,
        };

        let mut filter = Filter::new()
            .kinds(vec![KIND_ENCRYPTED_DM])
            .pubkey_refs(vec![pubkey]);
        if let Some(s) = since {
            filter = filter.since(s);
        }

        let subscription_id = generate_subscription_id();
        self.sync_subscriptions
            .write()
            .unwrap()
            .insert(subscription_id.clone());
        self.transport
            .subscribe_with_id(&subscription_id, vec![filter])
            .await
            .map_err(|e| EngineError::Subscription(e.to_string()))?;

        info!("Syncing missed messages (since {:?})", since);
        Ok(subscription_id)
    }

    /// Drop a conversation: evict from cache, forget its seen ids, cancel
    /// pending retries, and remove its queued sends.
    pub async fn remove_conversation(&self, conversation_id: &str) -> Result<()> {
        for id in self.store.queued_ids_for_conversation(conversation_id)? {
            self.retry.cancel_retry(&id).await;
            self.store.remove_from_queue(&id)?;
        }
        self.cache.write().await.remove_conversation(conversation_id);
        self.seen_ids.write().unwrap().remove_scope(conversation_id);
        Ok(())
    }

    /// Messages for a conversation, newest-first. Served from the cache when
    /// warm, loaded from the store otherwise.
    pub async fn conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        {
            let mut cache = self.cache.write().await;
            if let Some(messages) = cache.get(conversation_id) {
                return Ok(messages);
            }
        }

        let messages = self
            .store
            .get_messages(conversation_id, &MessageQuery::default())?;
        let mut cache = self.cache.write().await;
        for msg in &messages {
            cache.insert(msg.clone());
        }
        Ok(messages)
    }

    /// Live per-relay connection states.
    pub async fn network_state(&self) -> HashMap<String, ConnectionState> {
        self.transport.connection_states().await
    }

    /// Per-relay circuit breaker snapshots.
    pub fn relay_health(&self) -> HashMap<String, BreakerSnapshot> {
        self.retry.relay_health()
    }

    // --- send pipeline ---

    /// Send an encrypted DM.
    ///
    /// Validates, encrypts, signs, optimistically appends with status
    /// `Sending`, and publishes. A relay OK moves the message to `Accepted`;
    /// an explicit NACK to `Rejected`; no reachable or confirming relay
    /// queues it for retry and returns `EngineError::Offline`.
    pub async fn send_dm(&self, recipient: &str, plaintext: &str) -> Result<Message> {
        if !is_valid_pubkey_hex(recipient) {
            return Err(EngineError::InvalidRecipient(recipient.to_string()));
        }
        let len = plaintext.chars().count();
        if len > self.config.max_plaintext_len {
            return Err(EngineError::MessageTooLong {
                len,
                max: self.config.max_plaintext_len,
            });
        }

        let pubkey = self.identity.public_key().ok_or(EngineError::NoIdentity)?;
        let secret = self.identity.secret_key().ok_or(EngineError::SendUnavailable)?;

        let ciphertext = encrypt_dm(plaintext, &secret, recipient)?;
        let template = EventTemplate {
            created_at: now_unix(),
            kind: KIND_ENCRYPTED_DM,
            tags: vec![vec!["p".to_string(), recipient.to_string()]],
            content: ciphertext,
        };
        let event = sign_event(&template, &secret)?;

        let mut message = Message::outgoing(
            event.id.clone(),
            pubkey,
            recipient,
            plaintext,
            event.created_at,
        );

        // Optimistic local append
        self.store.persist_message(&message)?;
        self.cache.write().await.insert(message.clone());
        self.seen_ids
            .write()
            .unwrap()
            .insert(&message.id, &message.conversation_id);
        let _ = self.events_tx.send(EngineEvent::MessageAdded {
            message: message.clone(),
        });

        let ack_rx = self.register_ack(&event.id).await;
        let sent = self.transport.broadcast_event(&event).await;

        if sent == 0 {
            self.discard_ack(&event.id).await;
            self.queue_for_retry(&message.id, recipient, plaintext, event, 0)
                .await?;
            self.transition(&message.id, &message.conversation_id, MessageStatus::Queued)
                .await?;
            return Err(EngineError::Offline(message.id));
        }

        match timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(ack)) if ack.accepted => {
                self.transition(&message.id, &message.conversation_id, MessageStatus::Accepted)
                    .await?;
                message.status = MessageStatus::Accepted;
                Ok(message)
            }
            Ok(Ok(ack)) => {
                self.transition(&message.id, &message.conversation_id, MessageStatus::Rejected)
                    .await?;
                Err(EngineError::Rejected {
                    message_id: message.id,
                    reason: ack.message,
                })
            }
            _ => {
                // No confirmation in time: treat as unreachable and queue
                self.discard_ack(&event.id).await;
                self.queue_for_retry(&message.id, recipient, plaintext, event, 0)
                    .await?;
                self.transition(&message.id, &message.conversation_id, MessageStatus::Queued)
                    .await?;
                Err(EngineError::Offline(message.id))
            }
        }
    }

    /// Drain the offline queue: attempt redelivery of every queued entry.
    /// Returns how many were accepted.
    ///
    /// An explicit drain flushes the whole queue rather than only due
    /// entries; the caller signals the network is back, so waiting out
    /// backoff timers would just delay delivery.
    pub async fn process_offline_queue(&self) -> Result<usize> {
        let due = self.store.get_queued_messages(u64::MAX)?;
        if due.is_empty() {
            return Ok(0);
        }
        info!("Processing offline queue: {} entries", due.len());

        let mut delivered = 0;
        for entry in due {
            if self.redeliver(&entry).await? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// One redelivery attempt for a queued entry.
    async fn redeliver(&self, entry: &OutgoingMessage) -> Result<bool> {
        let event = match &entry.event {
            Some(e) => e.clone(),
            None => {
                warn!("Queued message {} has no signed event, dropping", entry.id);
                self.store.remove_from_queue(&entry.id)?;
                self.transition(&entry.id, &entry.conversation_id, MessageStatus::Failed)
                    .await?;
                return Ok(false);
            }
        };

        let ack_rx = self.register_ack(&event.id).await;
        let sent = self.transport.broadcast_event(&event).await;

        let confirmed = if sent == 0 {
            None
        } else {
            match timeout(self.config.ack_timeout, ack_rx).await {
                Ok(Ok(ack)) => Some(ack),
                _ => None,
            }
        };

        match confirmed {
            Some(ack) if ack.accepted => {
                self.store.remove_from_queue(&entry.id)?;
                self.retry.cancel_retry(&entry.id).await;
                self.transition(&entry.id, &entry.conversation_id, MessageStatus::Accepted)
                    .await?;
                Ok(true)
            }
            Some(ack) => {
                self.discard_ack(&event.id).await;
                self.store.remove_from_queue(&entry.id)?;
                self.retry.cancel_retry(&entry.id).await;
                self.transition(&entry.id, &entry.conversation_id, MessageStatus::Rejected)
                    .await?;
                debug!("Message {} rejected on redelivery: {}", entry.id, ack.message);
                Ok(false)
            }
            None => {
                self.discard_ack(&event.id).await;
                let new_count = entry.retry_count + 1;
                match self.retry.should_retry(new_count) {
                    RetryDecision::GiveUp => {
                        self.store.remove_from_queue(&entry.id)?;
                        self.retry.cancel_retry(&entry.id).await;
                        self.transition(&entry.id, &entry.conversation_id, MessageStatus::Failed)
                            .await?;
                        self.store.update_message_retry_count(&entry.id, new_count)?;
                        Ok(false)
                    }
                    RetryDecision::RetryAt(at) => {
                        let at_ms = instant_to_unix_ms(at);
                        self.store.update_queue_retry(&entry.id, new_count, at_ms)?;
                        self.store.update_message_retry_count(&entry.id, new_count)?;
                        self.schedule_queue_drain(&entry.id, at).await;
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Re-queue a failed or rejected message for a fresh delivery attempt.
    ///
    /// The content is encrypted and signed fresh (nonce and timestamp must
    /// not be replayed), so the retried message gets a new id; the old
    /// record keeps its terminal status.
    pub async fn retry_failed_message(&self, message_id: &str) -> Result<Message> {
        let old = self
            .store
            .get_message(message_id)?
            .ok_or_else(|| EngineError::MessageNotFound(message_id.to_string()))?;
        if old.status != MessageStatus::Failed && old.status != MessageStatus::Rejected {
            return Err(EngineError::NotPermitted(format!(
                "message {} is not failed or rejected",
                message_id
            )));
        }

        self.cache.write().await.remove_conversation(&old.conversation_id);
        self.send_dm(&old.recipient_key, &old.content).await
    }

    // --- internals ---

    async fn register_ack(&self, event_id: &str) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .await
            .insert(event_id.to_string(), tx);
        rx
    }

    async fn discard_ack(&self, event_id: &str) {
        self.pending_acks.lock().await.remove(event_id);
    }

    /// Persist + cache + emit a status transition.
    async fn transition(
        &self,
        message_id: &str,
        conversation_id: &str,
        status: MessageStatus,
    ) -> Result<()> {
        self.store.update_message_status(message_id, status)?;
        self.cache
            .write()
            .await
            .update_status(conversation_id, message_id, status);
        let _ = self.events_tx.send(EngineEvent::MessageStatus {
            message_id: message_id.to_string(),
            status,
        });
        Ok(())
    }

    /// Place a message in the outbox and arm its retry timer.
    async fn queue_for_retry(
        &self,
        message_id: &str,
        recipient: &str,
        plaintext: &str,
        event: Event,
        retry_count: u32,
    ) -> Result<()> {
        let at = match self.retry.should_retry(retry_count) {
            RetryDecision::RetryAt(at) => at,
            RetryDecision::GiveUp => {
                self.store.remove_from_queue(message_id)?;
                return self
                    .transition(message_id, recipient, MessageStatus::Failed)
                    .await;
            }
        };

        let entry = OutgoingMessage {
            id: message_id.to_string(),
            conversation_id: recipient.to_string(),
            content: plaintext.to_string(),
            recipient_key: recipient.to_string(),
            created_at: now_unix(),
            retry_count,
            next_retry_at: instant_to_unix_ms(at),
            event: Some(event),
        };
        self.store.queue_outgoing(&entry)?;
        self.schedule_queue_drain(message_id, at).await;
        Ok(())
    }

    /// Arm a timer that drains the offline queue when this entry comes due.
    fn schedule_queue_drain<'a>(
        &'a self,
        message_id: &'a str,
        at: Instant,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let ctrl = self.clone();
            let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
                if let Err(e) = ctrl.process_offline_queue().await {
                    warn!("Offline queue processing failed: {}", e);
                }
            });
            self.retry.schedule_retry(message_id, at, task).await;
        })
    }

    // --- receive pipeline ---

    /// Spawn the task consuming pool events.
    pub fn spawn_event_handler(&self) {
        let ctrl = self.clone();
        let mut rx = self.transport.subscribe_events();

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Engine event handler lagged by {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                ctrl.handle_pool_event(event).await;
            }
            debug!("Engine event handler stopped");
        });
    }

    async fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Event { event, .. } => {
                self.handle_incoming_event(event).await;
            }
            PoolEvent::Ok {
                relay_url,
                event_id,
                accepted,
                message,
            } => {
                if accepted {
                    self.retry.record_relay_success(&relay_url);
                }
                let sender = self.pending_acks.lock().await.remove(&event_id);
                if let Some(tx) = sender {
                    let _ = tx.send(AckResult { accepted, message });
                }
            }
            PoolEvent::Connected { relay_url } => {
                self.retry.record_relay_success(&relay_url);
                let _ = self.events_tx.send(EngineEvent::NetworkChanged {
                    relay_url,
                    connected: true,
                });
            }
            PoolEvent::Disconnected { relay_url } => {
                self.retry.record_relay_failure(&relay_url);
                let _ = self.events_tx.send(EngineEvent::NetworkChanged {
                    relay_url,
                    connected: false,
                });
            }
            PoolEvent::Error { relay_url, error } => {
                debug!("Relay {} error: {}", relay_url, error);
                self.retry.record_relay_failure(&relay_url);
            }
            PoolEvent::AllEose { subscription_id } => {
                let was_sync = self
                    .sync_subscriptions
                    .write()
                    .unwrap()
                    .remove(&subscription_id);
                if was_sync {
                    self.transport.unsubscribe(&subscription_id).await;
                    let _ = self
                        .events_tx
                        .send(EngineEvent::SyncCompleted { subscription_id });
                }
            }
            PoolEvent::Notice { relay_url, message } => {
                debug!("Notice from {}: {}", relay_url, message);
            }
            PoolEvent::Eose { .. } => {}
        }
    }

    /// The receive pipeline: parse/validate, verify, decrypt, classify,
    /// persist. Every failure short-circuits to a silent drop.
    async fn handle_incoming_event(&self, event: Event) {
        let my_pubkey = match self.identity.public_key() {
            Some(pk) => pk,
            None => return,
        };

        // 1. Shape: must be a DM addressed to us
        if event.kind != KIND_ENCRYPTED_DM {
            return;
        }
        // Clients may tag additional recipients, so ours need not be first
        if !event.tag_values("p").any(|v| v == my_pubkey) {
            debug!("Dropping DM not addressed to us: {}", event.id);
            return;
        }

        // Dedup by event id across relays and replays
        if self.seen_ids.read().unwrap().contains(&event.id) {
            return;
        }

        // 2. Signature
        match verify_event(&event) {
            Ok(true) => {}
            _ => {
                debug!("Dropping event with invalid signature: {}", event.id);
                return;
            }
        }

        // 3. Decrypt; failures are dropped, the sender cannot transparently
        // be asked to resend
        let secret = match self.identity.secret_key() {
            Some(sk) => sk,
            None => {
                debug!("Identity locked, dropping incoming DM {}", event.id);
                return;
            }
        };
        let plaintext = match decrypt_dm(&event.content, &secret, &event.pubkey) {
            Ok(p) => p,
            Err(e) => {
                debug!("Undecryptable DM {} from {}: {}", event.id, event.pubkey, e);
                return;
            }
        };

        // 4. Classify
        if self.trust.is_blocked(&event.pubkey) {
            debug!("Dropping DM from blocked sender {}", event.pubkey);
            return;
        }
        if !self.trust.is_accepted(&event.pubkey) {
            let preview: String = plaintext.chars().take(self.config.preview_len).collect();
            self.requests
                .upsert_incoming(&event.pubkey, &preview, event.created_at);
            self.seen_ids
                .write()
                .unwrap()
                .insert(&event.id, &event.pubkey);
            let _ = self.events_tx.send(EngineEvent::RequestReceived {
                sender: event.pubkey.clone(),
            });
            return;
        }

        let message = Message::incoming(
            event.id.clone(),
            event.pubkey.clone(),
            my_pubkey,
            plaintext,
            event.created_at,
        );
        if let Err(e) = self.store.persist_message(&message) {
            warn!("Failed to persist incoming message {}: {}", message.id, e);
            return;
        }
        self.seen_ids
            .write()
            .unwrap()
            .insert(&event.id, &event.pubkey);
        self.cache.write().await.insert(message.clone());
        let _ = self.events_tx.send(EngineEvent::MessageAdded { message });
    }
}

fn instant_to_unix_ms(at: Instant) -> u64 {
    now_unix_millis() + at.saturating_duration_since(Instant::now()).as_millis() as u64
}
