//! End-to-end engine scenarios over a scripted transport.

use nostr_core::{encrypt_dm, generate_secret_key, public_key_hex, sign_event, EventTemplate};
use nostr_messenger::dm::{DmController, EngineConfig, EngineEvent};
use nostr_messenger::retry::{RetryConfig, RetryManager};
use nostr_messenger::store::{MessageStore, StoreConfig};
use nostr_messenger::traits::{IdentityProvider, RelayTransport, RequestsInbox, TrustProvider};
use nostr_messenger::{EngineError, MessageDirection, MessageStatus};
use nostr_client::{ClientError, ConnectionState, Filter, PoolEvent};
use nostr_core::Event;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Transport double: counts published events and optionally answers each
/// publish with a scripted OK frame.
struct MockTransport {
    events_tx: broadcast::Sender<PoolEvent>,
    open_relays: AtomicUsize,
    /// `Some(accepted)` answers every publish with an OK; `None` stays silent
    ok_response: Mutex<Option<bool>>,
    published: Mutex<Vec<Event>>,
}

impl MockTransport {
    fn new(open_relays: usize, ok_response: Option<bool>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            events_tx,
            open_relays: AtomicUsize::new(open_relays),
            ok_response: Mutex::new(ok_response),
            published: Mutex::new(Vec::new()),
        }
    }

    fn set_open_relays(&self, n: usize) {
        self.open_relays.store(n, Ordering::SeqCst);
    }

    fn set_ok_response(&self, response: Option<bool>) {
        *self.ok_response.lock().unwrap() = response;
    }

    fn published_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    fn inject(&self, event: PoolEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl RelayTransport for MockTransport {
    fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    async fn broadcast_event(&self, event: &Event) -> usize {
        let open = self.open_relays.load(Ordering::SeqCst);
        if open == 0 {
            return 0;
        }
        self.published.lock().unwrap().push(event.clone());
        if let Some(accepted) = *self.ok_response.lock().unwrap() {
            let _ = self.events_tx.send(PoolEvent::Ok {
                relay_url: "wss://mock.relay".to_string(),
                event_id: event.id.clone(),
                accepted,
                message: if accepted {
                    String::new()
                } else {
                    "blocked: mock rejection".to_string()
                },
            });
        }
        open
    }

    async fn subscribe_with_id(
        &self,
        _subscription_id: &str,
        _filters: Vec<Filter>,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn unsubscribe(&self, _subscription_id: &str) {}

    async fn connected_count(&self) -> usize {
        self.open_relays.load(Ordering::SeqCst)
    }

    async fn connection_states(&self) -> HashMap<String, ConnectionState> {
        HashMap::new()
    }
}

struct StaticIdentity {
    secret: [u8; 32],
    pubkey: String,
}

impl StaticIdentity {
    fn generate() -> Self {
        let secret = generate_secret_key();
        let pubkey = public_key_hex(&secret).unwrap();
        Self { secret, pubkey }
    }
}

impl IdentityProvider for StaticIdentity {
    fn public_key(&self) -> Option<String> {
        Some(self.pubkey.clone())
    }
    fn secret_key(&self) -> Option<[u8; 32]> {
        Some(self.secret)
    }
}

#[derive(Default)]
struct StaticTrust {
    accepted: HashSet<String>,
    blocked: HashSet<String>,
}

impl TrustProvider for StaticTrust {
    fn is_accepted(&self, pubkey: &str) -> bool {
        self.accepted.contains(pubkey)
    }
    fn is_blocked(&self, pubkey: &str) -> bool {
        self.blocked.contains(pubkey)
    }
}

#[derive(Default)]
struct RecordingInbox {
    entries: Mutex<Vec<(String, String, u64)>>,
}

impl RequestsInbox for RecordingInbox {
    fn upsert_incoming(&self, sender: &str, preview: &str, timestamp: u64) {
        self.entries
            .lock()
            .unwrap()
            .push((sender.to_string(), preview.to_string(), timestamp));
    }
}

struct Harness {
    ctrl: DmController<MockTransport>,
    transport: Arc<MockTransport>,
    me: Arc<StaticIdentity>,
    inbox: Arc<RecordingInbox>,
    store: Arc<MessageStore>,
    _tmp: tempfile::TempDir,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(transport: MockTransport, trust: StaticTrust, retry: RetryConfig) -> Harness {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let me = Arc::new(StaticIdentity::generate());
    let store = Arc::new(
        MessageStore::open(
            StoreConfig {
                path: tmp.path().join("engine.db"),
                ..StoreConfig::default()
            },
            &me.pubkey,
        )
        .unwrap(),
    );
    let transport = Arc::new(transport);
    let inbox = Arc::new(RecordingInbox::default());

    let ctrl = DmController::new(
        Arc::clone(&transport),
        me.clone(),
        Arc::new(trust),
        inbox.clone(),
        Arc::clone(&store),
        Arc::new(RetryManager::new(retry)),
        EngineConfig {
            ack_timeout: Duration::from_millis(200),
            ..EngineConfig::default()
        },
    );
    ctrl.spawn_event_handler();

    Harness {
        ctrl,
        transport,
        me,
        inbox,
        store,
        _tmp: tmp,
    }
}

fn trusting(peer: &StaticIdentity) -> StaticTrust {
    let mut trust = StaticTrust::default();
    trust.accepted.insert(peer.pubkey.clone());
    trust
}

/// Build a signed kind-4 event from `sender` to `recipient`.
fn incoming_dm(sender: &StaticIdentity, recipient: &str, plaintext: &str, created_at: u64) -> Event {
    let ciphertext = encrypt_dm(plaintext, &sender.secret, recipient).unwrap();
    sign_event(
        &EventTemplate {
            created_at,
            kind: 4,
            tags: vec![vec!["p".to_string(), recipient.to_string()]],
            content: ciphertext,
        },
        &sender.secret,
    )
    .unwrap()
}

fn wrap(event: Event) -> PoolEvent {
    PoolEvent::Event {
        relay_url: "wss://mock.relay".to_string(),
        subscription_id: "sub1".to_string(),
        event,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_send_accepted_on_relay_ok() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(true)), trusting(&alice), RetryConfig::default());

    let msg = h.ctrl.send_dm(&alice.pubkey, "hello alice").await.unwrap();
    assert_eq!(msg.status, MessageStatus::Accepted);
    assert_eq!(h.transport.published_count(), 1);

    let stored = h.store.get_message(&msg.id).unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Accepted);
    assert_eq!(stored.direction, MessageDirection::Outgoing);
    // Confirmed messages never enter the outbox
    assert!(h.store.get_queued_messages(u64::MAX).unwrap().is_empty());
}

#[tokio::test]
async fn test_send_rejected_on_relay_nack() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(false)), trusting(&alice), RetryConfig::default());

    let err = h.ctrl.send_dm(&alice.pubkey, "hello").await.unwrap_err();
    match err {
        EngineError::Rejected { message_id, reason } => {
            assert!(reason.contains("mock rejection"));
            let stored = h.store.get_message(&message_id).unwrap().unwrap();
            assert_eq!(stored.status, MessageStatus::Rejected);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_with_no_relays_queues() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(0, None), trusting(&alice), RetryConfig::default());

    let err = h.ctrl.send_dm(&alice.pubkey, "are you there").await.unwrap_err();
    let id = match err {
        EngineError::Offline(id) => id,
        other => panic!("expected Offline, got {other:?}"),
    };

    let stored = h.store.get_message(&id).unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Queued);
    let queued = h.store.get_queued_messages(u64::MAX).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, id);
}

#[tokio::test]
async fn test_offline_queue_drains_when_relays_return() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(0, None), trusting(&alice), RetryConfig::default());

    let err = h.ctrl.send_dm(&alice.pubkey, "queued message").await.unwrap_err();
    let id = match err {
        EngineError::Offline(id) => id,
        other => panic!("expected Offline, got {other:?}"),
    };

    h.transport.set_open_relays(1);
    h.transport.set_ok_response(Some(true));

    let delivered = h.ctrl.process_offline_queue().await.unwrap();
    assert_eq!(delivered, 1);

    let stored = h.store.get_message(&id).unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Accepted);
    assert!(h.store.get_queued_messages(u64::MAX).unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_exhaustion_marks_failed() {
    let alice = StaticIdentity::generate();
    let retry = RetryConfig {
        max_retries: 1,
        ..RetryConfig::default()
    };
    let h = harness(MockTransport::new(0, None), trusting(&alice), retry);

    let err = h.ctrl.send_dm(&alice.pubkey, "doomed").await.unwrap_err();
    let id = match err {
        EngineError::Offline(id) => id,
        other => panic!("expected Offline, got {other:?}"),
    };

    // Relays stay down; the single retry attempt spends the budget
    let delivered = h.ctrl.process_offline_queue().await.unwrap();
    assert_eq!(delivered, 0);

    let stored = h.store.get_message(&id).unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert!(h.store.get_queued_messages(u64::MAX).unwrap().is_empty());
}

#[tokio::test]
async fn test_incoming_dm_from_accepted_sender_is_stored() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(true)), trusting(&alice), RetryConfig::default());

    h.transport
        .inject(wrap(incoming_dm(&alice, &h.me.pubkey, "hi bob", 1000)));
    settle().await;

    let messages = h.ctrl.conversation(&alice.pubkey).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hi bob");
    assert_eq!(messages[0].direction, MessageDirection::Incoming);
    assert!(h.inbox.entries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_event_stored_once() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(true)), trusting(&alice), RetryConfig::default());

    let event = incoming_dm(&alice, &h.me.pubkey, "only once", 1000);
    h.transport.inject(wrap(event.clone()));
    h.transport.inject(wrap(event));
    settle().await;

    let messages = h.ctrl.conversation(&alice.pubkey).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_removed_conversation_accepts_replayed_events() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(true)), trusting(&alice), RetryConfig::default());
    let mut events = h.ctrl.subscribe();

    let event = incoming_dm(&alice, &h.me.pubkey, "hello again", 1000);
    h.transport.inject(wrap(event.clone()));
    settle().await;

    h.ctrl.remove_conversation(&alice.pubkey).await.unwrap();

    // Removal forgets the conversation's seen ids, so a relay replay runs
    // the full pipeline again instead of being dropped as a duplicate
    h.transport.inject(wrap(event));
    settle().await;

    let mut added = 0;
    while let Ok(ev) = events.try_recv() {
        if matches!(ev, EngineEvent::MessageAdded { .. }) {
            added += 1;
        }
    }
    assert_eq!(added, 2);
}

#[tokio::test]
async fn test_dm_with_extra_recipient_tags_accepted() {
    let alice = StaticIdentity::generate();
    let cc = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(true)), trusting(&alice), RetryConfig::default());

    // Some clients tag additional recipients; ours need not be the first p tag
    let ciphertext = encrypt_dm("hello both", &alice.secret, &h.me.pubkey).unwrap();
    let event = sign_event(
        &EventTemplate {
            created_at: 1000,
            kind: 4,
            tags: vec![
                vec!["p".to_string(), cc.pubkey.clone()],
                vec!["p".to_string(), h.me.pubkey.clone()],
            ],
            content: ciphertext,
        },
        &alice.secret,
    )
    .unwrap();
    h.transport.inject(wrap(event));
    settle().await;

    let messages = h.ctrl.conversation(&alice.pubkey).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello both");
}

#[tokio::test]
async fn test_unknown_sender_routed_to_requests_inbox() {
    let stranger = StaticIdentity::generate();
    let h = harness(
        MockTransport::new(1, Some(true)),
        StaticTrust::default(),
        RetryConfig::default(),
    );

    h.transport
        .inject(wrap(incoming_dm(&stranger, &h.me.pubkey, "you won a prize", 1000)));
    settle().await;

    let entries = h.inbox.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, stranger.pubkey);
    assert_eq!(entries[0].1, "you won a prize");
    drop(entries);

    // Not stored as a conversation message
    let messages = h.ctrl.conversation(&stranger.pubkey).await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_blocked_sender_dropped_entirely() {
    let enemy = StaticIdentity::generate();
    let mut trust = StaticTrust::default();
    trust.blocked.insert(enemy.pubkey.clone());
    let h = harness(MockTransport::new(1, Some(true)), trust, RetryConfig::default());

    h.transport
        .inject(wrap(incoming_dm(&enemy, &h.me.pubkey, "let me in", 1000)));
    settle().await;

    assert!(h.inbox.entries.lock().unwrap().is_empty());
    assert!(h.ctrl.conversation(&enemy.pubkey).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tampered_event_dropped() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(true)), trusting(&alice), RetryConfig::default());

    let mut event = incoming_dm(&alice, &h.me.pubkey, "genuine", 1000);
    event.created_at += 1;
    h.transport.inject(wrap(event));
    settle().await;

    assert!(h.ctrl.conversation(&alice.pubkey).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dm_not_addressed_to_us_dropped() {
    let alice = StaticIdentity::generate();
    let other = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(true)), trusting(&alice), RetryConfig::default());

    h.transport
        .inject(wrap(incoming_dm(&alice, &other.pubkey, "for someone else", 1000)));
    settle().await;

    assert!(h.ctrl.conversation(&alice.pubkey).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_send_validation_rejects_bad_input() {
    let alice = StaticIdentity::generate();
    let h = harness(MockTransport::new(1, Some(true)), trusting(&alice), RetryConfig::default());

    assert!(matches!(
        h.ctrl.send_dm("not-a-key", "hi").await.unwrap_err(),
        EngineError::InvalidRecipient(_)
    ));

    let oversized = "x".repeat(4001);
    assert!(matches!(
        h.ctrl.send_dm(&alice.pubkey, &oversized).await.unwrap_err(),
        EngineError::MessageTooLong { .. }
    ));
    // Nothing was published or stored
    assert_eq!(h.transport.published_count(), 0);
}

#[tokio::test]
async fn test_retry_failed_message_resends() {
    let alice = StaticIdentity::generate();
    let retry = RetryConfig {
        max_retries: 1,
        ..RetryConfig::default()
    };
    let h = harness(MockTransport::new(0, None), trusting(&alice), retry);

    let err = h.ctrl.send_dm(&alice.pubkey, "try again later").await.unwrap_err();
    let id = match err {
        EngineError::Offline(id) => id,
        other => panic!("expected Offline, got {other:?}"),
    };
    h.ctrl.process_offline_queue().await.unwrap();
    assert_eq!(
        h.store.get_message(&id).unwrap().unwrap().status,
        MessageStatus::Failed
    );

    h.transport.set_open_relays(1);
    h.transport.set_ok_response(Some(true));

    let resent = h.ctrl.retry_failed_message(&id).await.unwrap();
    assert_eq!(resent.status, MessageStatus::Accepted);
    assert_eq!(resent.content, "try again later");
    // Re-signed as a fresh event
    assert_ne!(resent.id, id);
}
