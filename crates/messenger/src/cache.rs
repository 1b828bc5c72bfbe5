//! In-memory conversation cache.
//!
//! LRU-by-access-time over whole conversations: at most K conversations and
//! a global cap on total cached messages. Exceeding either limit evicts the
//! least-recently-accessed conversation. Performance cache only; the durable
//! store remains authoritative.

use crate::message::{Message, MessageStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::debug;

/// Bounded window of recently seen event ids, each keyed back to the
/// conversation or group it arrived on.
///
/// Dedup only needs a recent window: the store's idempotent upsert makes a
/// replay of an evicted id harmless, so the window caps memory instead of
/// growing with every event ever seen.
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    scopes: HashMap<String, String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            scopes: HashMap::new(),
        }
    }

    /// Record an id under its scope, evicting the oldest id past capacity.
    /// Returns false if the id was already present.
    pub fn insert(&mut self, id: &str, scope: &str) -> bool {
        if self.scopes.contains_key(id) {
            return false;
        }
        self.scopes.insert(id.to_string(), scope.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.scopes.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scopes.contains_key(id)
    }

    /// Forget every id recorded under the given scope.
    pub fn remove_scope(&mut self, scope: &str) {
        let scopes = &self.scopes;
        self.order
            .retain(|id| scopes.get(id).map(|s| s != scope).unwrap_or(false));
        self.scopes.retain(|_, s| s != scope);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Cache limits.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached conversations
    pub max_conversations: usize,
    /// Maximum total cached messages across all conversations
    pub max_total_messages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_conversations: 20,
            max_total_messages: 2000,
        }
    }
}

struct CachedConversation {
    messages: Vec<Message>,
    ids: HashSet<String>,
    last_access: Instant,
}

/// LRU cache of conversation message lists.
pub struct ConversationCache {
    config: CacheConfig,
    conversations: HashMap<String, CachedConversation>,
    total_messages: usize,
}

impl ConversationCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            conversations: HashMap::new(),
            total_messages: 0,
        }
    }

    /// Insert a message into its conversation, deduplicated by id.
    /// Returns false if the id was already cached.
    pub fn insert(&mut self, message: Message) -> bool {
        let convo = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_insert_with(|| CachedConversation {
                messages: Vec::new(),
                ids: HashSet::new(),
                last_access: Instant::now(),
            });
        convo.last_access = Instant::now();

        if !convo.ids.insert(message.id.clone()) {
            return false;
        }
        convo.messages.push(message);
        self.total_messages += 1;
        self.evict_if_needed();
        true
    }

    /// Messages for a conversation sorted newest-first for display.
    /// Touches the conversation's access time.
    pub fn get(&mut self, conversation_id: &str) -> Option<Vec<Message>> {
        let convo = self.conversations.get_mut(conversation_id)?;
        convo.last_access = Instant::now();

        let mut messages = convo.messages.clone();
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        Some(messages)
    }

    /// Check whether a message id is cached anywhere.
    pub fn contains(&self, conversation_id: &str, message_id: &str) -> bool {
        self.conversations
            .get(conversation_id)
            .map(|c| c.ids.contains(message_id))
            .unwrap_or(false)
    }

    /// Update a cached message's status in place.
    pub fn update_status(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> bool {
        let convo = match self.conversations.get_mut(conversation_id) {
            Some(c) => c,
            None => return false,
        };
        for msg in convo.messages.iter_mut() {
            if msg.id == message_id {
                msg.status = status;
                return true;
            }
        }
        false
    }

    /// Drop a conversation from the cache.
    pub fn remove_conversation(&mut self, conversation_id: &str) {
        if let Some(convo) = self.conversations.remove(conversation_id) {
            self.total_messages -= convo.messages.len();
        }
    }

    /// Number of cached conversations.
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Total cached messages.
    pub fn total_messages(&self) -> usize {
        self.total_messages
    }

    fn evict_if_needed(&mut self) {
        while self.conversations.len() > self.config.max_conversations
            || self.total_messages > self.config.max_total_messages
        {
            let oldest = self
                .conversations
                .iter()
                .min_by_key(|(_, c)| c.last_access)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    debug!("Evicting conversation {} from cache", id);
                    self.remove_conversation(&id);
                }
                None => break,
            }
        }
    }
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, convo: &str, timestamp: u64) -> Message {
        Message::incoming(id, convo, "me", "hi", timestamp)
    }

    #[test]
    fn test_insert_and_get_sorted() {
        let mut cache = ConversationCache::default();
        cache.insert(msg("id1", "alice", 1000));
        cache.insert(msg("id2", "alice", 3000));
        cache.insert(msg("id3", "alice", 2000));

        let messages = cache.get("alice").unwrap();
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["id2", "id3", "id1"]);
    }

    #[test]
    fn test_insert_deduplicates_by_id() {
        let mut cache = ConversationCache::default();
        assert!(cache.insert(msg("id1", "alice", 1000)));
        assert!(!cache.insert(msg("id1", "alice", 1000)));
        assert_eq!(cache.total_messages(), 1);
    }

    #[test]
    fn test_update_status() {
        let mut cache = ConversationCache::default();
        cache.insert(Message::outgoing("id1", "me", "alice", "hi", 1000));

        assert!(cache.update_status("alice", "id1", MessageStatus::Accepted));
        let messages = cache.get("alice").unwrap();
        assert_eq!(messages[0].status, MessageStatus::Accepted);

        assert!(!cache.update_status("alice", "missing", MessageStatus::Failed));
        assert!(!cache.update_status("missing", "id1", MessageStatus::Failed));
    }

    #[test]
    fn test_conversation_limit_evicts_lru() {
        let mut cache = ConversationCache::new(CacheConfig {
            max_conversations: 2,
            max_total_messages: 100,
        });

        cache.insert(msg("id1", "alice", 1000));
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert(msg("id2", "bob", 1000));
        std::thread::sleep(std::time::Duration::from_millis(2));

        // Touch alice so bob becomes least-recently-accessed
        cache.get("alice");
        std::thread::sleep(std::time::Duration::from_millis(2));

        cache.insert(msg("id3", "carol", 1000));
        assert_eq!(cache.conversation_count(), 2);
        assert!(cache.get("bob").is_none());
        assert!(cache.get("alice").is_some());
        assert!(cache.get("carol").is_some());
    }

    #[test]
    fn test_total_message_limit_evicts() {
        let mut cache = ConversationCache::new(CacheConfig {
            max_conversations: 10,
            max_total_messages: 3,
        });

        cache.insert(msg("id1", "alice", 1000));
        cache.insert(msg("id2", "alice", 1001));
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert(msg("id3", "bob", 1000));
        std::thread::sleep(std::time::Duration::from_millis(2));
        // Exceeds the total cap; alice (least recently accessed) is evicted
        cache.insert(msg("id4", "bob", 1001));

        assert!(cache.get("alice").is_none());
        assert_eq!(cache.total_messages(), 2);
    }

    #[test]
    fn test_remove_conversation() {
        let mut cache = ConversationCache::default();
        cache.insert(msg("id1", "alice", 1000));
        cache.remove_conversation("alice");
        assert_eq!(cache.total_messages(), 0);
        assert!(cache.get("alice").is_none());
    }

    #[test]
    fn test_recent_ids_dedup_and_cap() {
        let mut seen = RecentIds::new(2);
        assert!(seen.insert("a", "alice"));
        assert!(!seen.insert("a", "alice"));
        assert!(seen.insert("b", "bob"));
        assert!(seen.insert("c", "carol"));

        // Oldest id fell out of the window
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("c"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_recent_ids_remove_scope() {
        let mut seen = RecentIds::new(10);
        seen.insert("a1", "alice");
        seen.insert("a2", "alice");
        seen.insert("b1", "bob");

        seen.remove_scope("alice");
        assert!(!seen.contains("a1"));
        assert!(!seen.contains("a2"));
        assert!(seen.contains("b1"));
        assert_eq!(seen.len(), 1);
    }
}
