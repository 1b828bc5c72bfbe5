//! Subscription management across relay connections.

use crate::message::Filter;
use std::collections::HashSet;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Builder for creating subscription filters.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBuilder {
    filters: Vec<Filter>,
}

impl SubscriptionBuilder {
    /// Create a new subscription builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the subscription.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a filter for specific event kinds.
    pub fn kinds(self, kinds: Vec<u16>) -> Self {
        self.filter(Filter::new().kinds(kinds))
    }

    /// Add a filter for events from specific authors.
    pub fn authors(self, authors: Vec<String>) -> Self {
        self.filter(Filter::new().authors(authors))
    }

    /// Add a filter for encrypted DMs addressed to a recipient.
    pub fn incoming_dms(self, recipient_pubkey: String, limit: u64) -> Self {
        self.filter(
            Filter::new()
                .kinds(vec![nostr_core::KIND_ENCRYPTED_DM])
                .pubkey_refs(vec![recipient_pubkey])
                .limit(limit),
        )
    }

    /// Add filters for a group's timeline and membership events.
    ///
    /// Moderation and chat kinds carry the group id in an `h` tag; the
    /// relay-published metadata/admins/members lists are addressable events
    /// keyed by a `d` tag, so two filters are needed.
    pub fn group_feed(self, group_id: String) -> Self {
        self.filter(
            Filter::new()
                .kinds(vec![
                    nostr_core::KIND_GROUP_MESSAGE,
                    nostr_core::KIND_GROUP_PUT_USER,
                    nostr_core::KIND_GROUP_REMOVE_USER,
                    nostr_core::KIND_GROUP_JOIN_REQUEST,
                ])
                .group_refs(vec![group_id.clone()]),
        )
        .filter(
            Filter::new()
                .kinds(vec![
                    nostr_core::KIND_GROUP_METADATA,
                    nostr_core::KIND_GROUP_ADMINS,
                    nostr_core::KIND_GROUP_MEMBERS,
                ])
                .tag("d", vec![group_id]),
        )
    }

    /// Build the subscription filters.
    pub fn build(self) -> Vec<Filter> {
        self.filters
    }
}

/// Tracks which relays have a specific subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Subscription ID
    pub id: String,
    /// Filters for this subscription
    pub filters: Vec<Filter>,
    /// Relays that have this subscription
    pub relays: HashSet<String>,
    /// Whether EOSE has been received from all relays
    pub all_eose: bool,
    /// Relays that have sent EOSE
    pub eose_relays: HashSet<String>,
}

impl SubscriptionTracker {
    /// Create a new subscription tracker.
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
            relays: HashSet::new(),
            all_eose: false,
            eose_relays: HashSet::new(),
        }
    }

    /// Add a relay to this subscription.
    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays.insert(relay_url.into());
        self.update_all_eose();
    }

    /// Remove a relay from this subscription.
    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.eose_relays.remove(relay_url);
        self.update_all_eose();
    }

    /// Mark EOSE received from a relay.
    pub fn mark_eose(&mut self, relay_url: impl Into<String>) {
        self.eose_relays.insert(relay_url.into());
        self.update_all_eose();
    }

    fn update_all_eose(&mut self) {
        self.all_eose = !self.relays.is_empty() && self.relays.len() == self.eose_relays.len();
    }

    /// Check if a relay has this subscription.
    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relays.contains(relay_url)
    }

    /// Get the number of relays with this subscription.
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_subscription_id() {
        let id1 = generate_subscription_id();
        let id2 = generate_subscription_id();

        assert_eq!(id1.len(), 8);
        assert_eq!(id2.len(), 8);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_subscription_builder_incoming_dms() {
        let filters = SubscriptionBuilder::new()
            .incoming_dms("mypubkey".to_string(), 100)
            .build();

        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].kinds, Some(vec![4]));
        assert_eq!(filters[0].limit, Some(100));
        assert_eq!(
            filters[0].tags.get("#p"),
            Some(&vec!["mypubkey".to_string()])
        );
    }

    #[test]
    fn test_subscription_builder_group_feed() {
        let filters = SubscriptionBuilder::new()
            .group_feed("group1".to_string())
            .build();

        assert_eq!(filters.len(), 2);
        assert!(filters[0].tags.contains_key("#h"));
        let kinds = filters[0].kinds.as_ref().unwrap();
        assert!(kinds.contains(&9));
        assert!(kinds.contains(&9000));
        assert!(kinds.contains(&9021));

        assert!(filters[1].tags.contains_key("#d"));
        let kinds = filters[1].kinds.as_ref().unwrap();
        assert!(kinds.contains(&39000));
        assert!(kinds.contains(&39002));
    }

    #[test]
    fn test_subscription_builder_multiple_filters() {
        let filters = SubscriptionBuilder::new()
            .kinds(vec![4])
            .authors(vec!["author1".to_string()])
            .build();

        assert_eq!(filters.len(), 2);
    }

    #[test]
    fn test_subscription_tracker_add_remove() {
        let mut tracker = SubscriptionTracker::new("sub1", vec![]);

        tracker.add_relay("wss://relay1.com");
        tracker.add_relay("wss://relay2.com");
        assert_eq!(tracker.relay_count(), 2);
        assert!(tracker.has_relay("wss://relay1.com"));

        tracker.remove_relay("wss://relay1.com");
        assert_eq!(tracker.relay_count(), 1);
        assert!(!tracker.has_relay("wss://relay1.com"));
    }

    #[test]
    fn test_subscription_tracker_eose() {
        let mut tracker = SubscriptionTracker::new("sub1", vec![]);

        tracker.add_relay("wss://relay1.com");
        tracker.add_relay("wss://relay2.com");
        assert!(!tracker.all_eose);

        tracker.mark_eose("wss://relay1.com");
        assert!(!tracker.all_eose);

        tracker.mark_eose("wss://relay2.com");
        assert!(tracker.all_eose);
    }

    #[test]
    fn test_subscription_tracker_eose_after_add() {
        let mut tracker = SubscriptionTracker::new("sub1", vec![]);

        tracker.add_relay("wss://relay1.com");
        tracker.mark_eose("wss://relay1.com");
        assert!(tracker.all_eose);

        tracker.add_relay("wss://relay2.com");
        assert!(!tracker.all_eose);
    }
}
