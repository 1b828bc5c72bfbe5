//! Group membership state machine.
//!
//! Tracks per-group role and membership status from relay-signed events.
//! The relay is the source of truth: state is derived from the events it
//! publishes and reconciled on every fresh membership list. The client
//! never asserts a role it cannot cite an event for, and moderation
//! actions are only authoritative once the relay accepts the signed event.

use crate::cache::RecentIds;
use crate::dm::EngineEvent;
use crate::error::{EngineError, Result};
use crate::message::{now_unix, Message};
use crate::store::MessageStore;
use crate::traits::{IdentityProvider, RelayTransport};
use nostr_client::{generate_subscription_id, PoolEvent, SubscriptionBuilder};
use nostr_core::{
    sign_event, verify_event, Event, EventTemplate, KIND_GROUP_ADMINS, KIND_GROUP_JOIN_REQUEST,
    KIND_GROUP_MEMBERS, KIND_GROUP_MESSAGE, KIND_GROUP_METADATA, KIND_GROUP_PUT_USER,
    KIND_GROUP_REMOVE_USER,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Role within a group, read off relay-signed role grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    Owner,
    Moderator,
    Member,
    Guest,
}

impl GroupRole {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Some(GroupRole::Owner),
            "moderator" | "admin" => Some(GroupRole::Moderator),
            "member" => Some(GroupRole::Member),
            "guest" => Some(GroupRole::Guest),
            _ => None,
        }
    }

    /// Whether this role may act on join requests.
    pub fn can_moderate(&self) -> bool {
        matches!(self, GroupRole::Owner | GroupRole::Moderator)
    }
}

/// Our membership status in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MembershipStatus {
    /// Not a member, no request outstanding
    #[default]
    None,
    /// Join request published, not yet approved
    Requested,
    /// Named by the relay's membership evidence
    Member,
}

/// Group metadata from the relay's kind 39000 event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMetadata {
    pub name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
}

#[derive(Default)]
struct GroupState {
    metadata: GroupMetadata,
    metadata_at: u64,
    admins: HashMap<String, GroupRole>,
    admins_at: u64,
    members: HashSet<String>,
    members_at: u64,
    my_status: MembershipStatus,
    /// Outstanding join requests by pubkey, for moderation
    join_requests: HashMap<String, u64>,
    seen_message_ids: RecentIds,
    subscription_id: Option<String>,
}

/// Read-only snapshot of a group for display.
#[derive(Debug, Clone)]
pub struct GroupView {
    pub group_id: String,
    pub metadata: GroupMetadata,
    pub my_status: MembershipStatus,
    pub my_role: GroupRole,
    pub member_count: usize,
    pub join_requests: Vec<String>,
}

/// Directory of tracked groups, fed by relay events.
pub struct GroupDirectory<T: RelayTransport> {
    transport: Arc<T>,
    identity: Arc<dyn IdentityProvider>,
    store: Arc<MessageStore>,
    groups: Arc<RwLock<HashMap<String, GroupState>>>,
    events_tx: broadcast::Sender<EngineEvent>,
}

impl<T: RelayTransport> Clone for GroupDirectory<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            identity: Arc::clone(&self.identity),
            store: Arc::clone(&self.store),
            groups: Arc::clone(&self.groups),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<T: RelayTransport> GroupDirectory<T> {
    pub fn new(
        transport: Arc<T>,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<MessageStore>,
        events_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            transport,
            identity,
            store,
            groups: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    /// Start tracking a group: subscribe to its timeline and membership
    /// feed. Idempotent per group.
    pub async fn track_group(&self, group_id: &str) -> Result<()> {
        {
            let groups = self.groups.read().await;
            if groups
                .get(group_id)
                .map(|g| g.subscription_id.is_some())
                .unwrap_or(false)
            {
                return Ok(());
            }
        }

        let subscription_id = generate_subscription_id();
        let filters = SubscriptionBuilder::new()
            .group_feed(group_id.to_string())
            .build();
        self.transport
            .subscribe_with_id(&subscription_id, filters)
            .await
            .map_err(|e| EngineError::Subscription(e.to_string()))?;

        let mut groups = self.groups.write().await;
        let state = groups.entry(group_id.to_string()).or_default();
        state.subscription_id = Some(subscription_id);
        info!("Tracking group {}", group_id);
        Ok(())
    }

    /// Stop tracking a group and close its subscription.
    pub async fn untrack_group(&self, group_id: &str) {
        let sub = {
            let mut groups = self.groups.write().await;
            groups.remove(group_id).and_then(|g| g.subscription_id)
        };
        if let Some(id) = sub {
            self.transport.unsubscribe(&id).await;
        }
    }

    /// Snapshot of a tracked group.
    pub async fn group(&self, group_id: &str) -> Option<GroupView> {
        let my_pubkey = self.identity.public_key();
        let groups = self.groups.read().await;
        let state = groups.get(group_id)?;
        Some(GroupView {
            group_id: group_id.to_string(),
            metadata: state.metadata.clone(),
            my_status: state.my_status,
            my_role: my_pubkey
                .as_deref()
                .map(|pk| Self::role_of(state, pk))
                .unwrap_or(GroupRole::Guest),
            member_count: state.members.len(),
            join_requests: state.join_requests.keys().cloned().collect(),
        })
    }

    /// Tracked group ids.
    pub async fn group_ids(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }

    /// Publish a kind 9021 join request and move to `Requested`.
    ///
    /// `Requested` persists until the relay supplies approval or removal
    /// evidence; there is no timeout.
    pub async fn request_join(&self, group_id: &str) -> Result<()> {
        let secret = self.identity.secret_key().ok_or(EngineError::SendUnavailable)?;

        let event = self.sign_group_event(
            &secret,
            KIND_GROUP_JOIN_REQUEST,
            group_id,
            Vec::new(),
            String::new(),
        )?;
        let sent = self.transport.broadcast_event(&event).await;
        if sent == 0 {
            return Err(EngineError::Offline(event.id));
        }

        let mut groups = self.groups.write().await;
        let state = groups.entry(group_id.to_string()).or_default();
        if state.my_status == MembershipStatus::None {
            state.my_status = MembershipStatus::Requested;
        }
        drop(groups);
        self.emit_updated(group_id);
        Ok(())
    }

    /// Approve a pending join request by publishing a put-user event.
    ///
    /// Gated on our locally-evidenced role; the approval is authoritative
    /// only once the relay accepts the event.
    pub async fn approve_join(&self, group_id: &str, pubkey: &str) -> Result<()> {
        self.require_moderator(group_id).await?;
        let secret = self.identity.secret_key().ok_or(EngineError::SendUnavailable)?;

        let event = self.sign_group_event(
            &secret,
            KIND_GROUP_PUT_USER,
            group_id,
            vec![vec!["p".to_string(), pubkey.to_string()]],
            String::new(),
        )?;
        let sent = self.transport.broadcast_event(&event).await;
        if sent == 0 {
            return Err(EngineError::Offline(event.id));
        }

        // Optimistic: the relay's own put-user or members list confirms
        let mut groups = self.groups.write().await;
        if let Some(state) = groups.get_mut(group_id) {
            state.join_requests.remove(pubkey);
        }
        drop(groups);
        self.emit_updated(group_id);
        Ok(())
    }

    /// Deny a pending join request: publish a remove-user event naming the
    /// requester and drop the tracked request.
    pub async fn deny_join(&self, group_id: &str, pubkey: &str) -> Result<()> {
        self.require_moderator(group_id).await?;
        let secret = self.identity.secret_key().ok_or(EngineError::SendUnavailable)?;

        let event = self.sign_group_event(
            &secret,
            KIND_GROUP_REMOVE_USER,
            group_id,
            vec![vec!["p".to_string(), pubkey.to_string()]],
            String::new(),
        )?;
        let sent = self.transport.broadcast_event(&event).await;
        if sent == 0 {
            return Err(EngineError::Offline(event.id));
        }

        let mut groups = self.groups.write().await;
        if let Some(state) = groups.get_mut(group_id) {
            state.join_requests.remove(pubkey);
        }
        drop(groups);
        self.emit_updated(group_id);
        Ok(())
    }

    /// Post a kind 9 chat message to a group timeline.
    pub async fn send_group_message(&self, group_id: &str, content: &str) -> Result<Message> {
        let pubkey = self.identity.public_key().ok_or(EngineError::NoIdentity)?;
        let secret = self.identity.secret_key().ok_or(EngineError::SendUnavailable)?;

        {
            let groups = self.groups.read().await;
            let is_member = groups
                .get(group_id)
                .map(|g| g.my_status == MembershipStatus::Member)
                .unwrap_or(false);
            if !is_member {
                return Err(EngineError::NotPermitted(format!(
                    "not a member of group {}",
                    group_id
                )));
            }
        }

        let event = self.sign_group_event(
            &secret,
            KIND_GROUP_MESSAGE,
            group_id,
            Vec::new(),
            content.to_string(),
        )?;

        let mut message = Message::outgoing(
            event.id.clone(),
            pubkey,
            group_id,
            content,
            event.created_at,
        );
        message.conversation_id = group_id.to_string();
        self.store.persist_message(&message)?;

        let sent = self.transport.broadcast_event(&event).await;
        if sent == 0 {
            return Err(EngineError::Offline(message.id));
        }

        {
            let mut groups = self.groups.write().await;
            if let Some(state) = groups.get_mut(group_id) {
                state.seen_message_ids.insert(&message.id, group_id);
            }
        }
        let _ = self.events_tx.send(EngineEvent::GroupMessage {
            group_id: group_id.to_string(),
            message: message.clone(),
        });
        Ok(message)
    }

    /// Spawn the task consuming pool events for tracked groups.
    pub fn spawn_event_handler(&self) {
        let dir = self.clone();
        let mut rx = self.transport.subscribe_events();

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(PoolEvent::Event { event, .. }) => event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Group event handler lagged by {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                dir.apply_event(&event).await;
            }
            debug!("Group event handler stopped");
        });
    }

    /// Apply one relay event to group state. Non-group kinds, unknown
    /// groups, and invalid signatures are ignored.
    pub async fn apply_event(&self, event: &Event) {
        let group_id = match Self::group_id_of(event) {
            Some(id) => id.to_string(),
            None => return,
        };
        {
            let groups = self.groups.read().await;
            if !groups.contains_key(&group_id) {
                return;
            }
        }
        match verify_event(event) {
            Ok(true) => {}
            _ => {
                debug!("Dropping group event with invalid signature: {}", event.id);
                return;
            }
        }

        let changed = match event.kind {
            KIND_GROUP_METADATA => self.apply_metadata(&group_id, event).await,
            KIND_GROUP_ADMINS => self.apply_admins(&group_id, event).await,
            KIND_GROUP_MEMBERS => self.apply_members(&group_id, event).await,
            KIND_GROUP_PUT_USER => self.apply_put_user(&group_id, event).await,
            KIND_GROUP_REMOVE_USER => self.apply_remove_user(&group_id, event).await,
            KIND_GROUP_JOIN_REQUEST => self.apply_join_request(&group_id, event).await,
            KIND_GROUP_MESSAGE => {
                self.apply_chat_message(&group_id, event).await;
                false
            }
            _ => false,
        };
        if changed {
            self.emit_updated(&group_id);
        }
    }

    // --- state transitions ---

    async fn apply_metadata(&self, group_id: &str, event: &Event) -> bool {
        let mut groups = self.groups.write().await;
        let state = match groups.get_mut(group_id) {
            Some(s) => s,
            None => return false,
        };
        // Addressable event: only the freshest replacement applies
        if event.created_at < state.metadata_at {
            return false;
        }
        state.metadata_at = event.created_at;
        state.metadata = GroupMetadata {
            name: event.tag_value("name").map(String::from),
            about: event.tag_value("about").map(String::from),
            picture: event.tag_value("picture").map(String::from),
        };
        true
    }

    async fn apply_admins(&self, group_id: &str, event: &Event) -> bool {
        let mut groups = self.groups.write().await;
        let state = match groups.get_mut(group_id) {
            Some(s) => s,
            None => return false,
        };
        if event.created_at < state.admins_at {
            return false;
        }
        state.admins_at = event.created_at;
        state.admins.clear();
        for tag in &event.tags {
            if tag.len() >= 2 && tag[0] == "p" {
                let role = tag
                    .get(2)
                    .and_then(|r| GroupRole::parse(r))
                    .unwrap_or(GroupRole::Moderator);
                state.admins.insert(tag[1].clone(), role);
            }
        }
        true
    }

    /// A fresh members list replaces the previous one wholesale. Absence
    /// from the list is removal evidence, so a member no longer named drops
    /// back to `None`; an outstanding request stays `Requested`.
    async fn apply_members(&self, group_id: &str, event: &Event) -> bool {
        let my_pubkey = self.identity.public_key();
        let mut groups = self.groups.write().await;
        let state = match groups.get_mut(group_id) {
            Some(s) => s,
            None => return false,
        };
        if event.created_at < state.members_at {
            return false;
        }
        state.members_at = event.created_at;
        state.members = event.tag_values("p").map(String::from).collect();

        if let Some(pk) = my_pubkey.as_deref() {
            if state.members.contains(pk) {
                state.my_status = MembershipStatus::Member;
                state.join_requests.remove(pk);
            } else if state.my_status == MembershipStatus::Member {
                state.my_status = MembershipStatus::None;
            }
        }
        true
    }

    /// Put-user is approval evidence, applied only when its author is a
    /// locally-known owner or moderator.
    async fn apply_put_user(&self, group_id: &str, event: &Event) -> bool {
        let my_pubkey = self.identity.public_key();
        let mut groups = self.groups.write().await;
        let state = match groups.get_mut(group_id) {
            Some(s) => s,
            None => return false,
        };
        if !Self::author_can_moderate(state, &event.pubkey) {
            debug!(
                "Ignoring put-user from non-moderator {} in {}",
                event.pubkey, group_id
            );
            return false;
        }

        let mut changed = false;
        for added in event.tag_values("p") {
            if state.members.insert(added.to_string()) {
                changed = true;
            }
            state.join_requests.remove(added);
            if my_pubkey.as_deref() == Some(added) {
                state.my_status = MembershipStatus::Member;
                changed = true;
            }
        }
        changed
    }

    async fn apply_remove_user(&self, group_id: &str, event: &Event) -> bool {
        let my_pubkey = self.identity.public_key();
        let mut groups = self.groups.write().await;
        let state = match groups.get_mut(group_id) {
            Some(s) => s,
            None => return false,
        };
        if !Self::author_can_moderate(state, &event.pubkey) {
            debug!(
                "Ignoring remove-user from non-moderator {} in {}",
                event.pubkey, group_id
            );
            return false;
        }

        let mut changed = false;
        for removed in event.tag_values("p") {
            if state.members.remove(removed) {
                changed = true;
            }
            state.admins.remove(removed);
            state.join_requests.remove(removed);
            if my_pubkey.as_deref() == Some(removed)
                && state.my_status == MembershipStatus::Member
            {
                state.my_status = MembershipStatus::None;
                changed = true;
            }
        }
        changed
    }

    async fn apply_join_request(&self, group_id: &str, event: &Event) -> bool {
        let my_pubkey = self.identity.public_key();
        let mut groups = self.groups.write().await;
        let state = match groups.get_mut(group_id) {
            Some(s) => s,
            None => return false,
        };
        state
            .join_requests
            .insert(event.pubkey.clone(), event.created_at);
        // Our own request echoed back from another device
        if my_pubkey.as_deref() == Some(event.pubkey.as_str())
            && state.my_status == MembershipStatus::None
        {
            state.my_status = MembershipStatus::Requested;
        }
        true
    }

    async fn apply_chat_message(&self, group_id: &str, event: &Event) {
        let my_pubkey = self.identity.public_key().unwrap_or_default();
        {
            let mut groups = self.groups.write().await;
            let state = match groups.get_mut(group_id) {
                Some(s) => s,
                None => return,
            };
            if !state.seen_message_ids.insert(&event.id, group_id) {
                return;
            }
        }

        let mut message = Message::incoming(
            event.id.clone(),
            event.pubkey.clone(),
            my_pubkey,
            event.content.clone(),
            event.created_at,
        );
        message.conversation_id = group_id.to_string();
        if let Err(e) = self.store.persist_message(&message) {
            warn!("Failed to persist group message {}: {}", message.id, e);
            return;
        }
        let _ = self.events_tx.send(EngineEvent::GroupMessage {
            group_id: group_id.to_string(),
            message,
        });
    }

    // --- helpers ---

    fn role_of(state: &GroupState, pubkey: &str) -> GroupRole {
        if let Some(role) = state.admins.get(pubkey) {
            *role
        } else if state.members.contains(pubkey) {
            GroupRole::Member
        } else {
            GroupRole::Guest
        }
    }

    fn author_can_moderate(state: &GroupState, pubkey: &str) -> bool {
        state
            .admins
            .get(pubkey)
            .map(|r| r.can_moderate())
            .unwrap_or(false)
    }

    async fn require_moderator(&self, group_id: &str) -> Result<()> {
        let pubkey = self.identity.public_key().ok_or(EngineError::NoIdentity)?;
        let groups = self.groups.read().await;
        let role = groups
            .get(group_id)
            .map(|s| Self::role_of(s, &pubkey))
            .unwrap_or(GroupRole::Guest);
        if !role.can_moderate() {
            return Err(EngineError::NotPermitted(format!(
                "requires owner or moderator role in group {}",
                group_id
            )));
        }
        Ok(())
    }

    fn sign_group_event(
        &self,
        secret: &[u8; 32],
        kind: u16,
        group_id: &str,
        extra_tags: Vec<Vec<String>>,
        content: String,
    ) -> Result<Event> {
        let mut tags = vec![vec!["h".to_string(), group_id.to_string()]];
        tags.extend(extra_tags);
        let template = EventTemplate {
            created_at: now_unix(),
            kind,
            tags,
            content,
        };
        Ok(sign_event(&template, secret)?)
    }

    fn group_id_of(event: &Event) -> Option<&str> {
        match event.kind {
            KIND_GROUP_METADATA | KIND_GROUP_ADMINS | KIND_GROUP_MEMBERS => event.tag_value("d"),
            KIND_GROUP_MESSAGE | KIND_GROUP_PUT_USER | KIND_GROUP_REMOVE_USER
            | KIND_GROUP_JOIN_REQUEST => event.tag_value("h"),
            _ => None,
        }
    }

    fn emit_updated(&self, group_id: &str) {
        let _ = self.events_tx.send(EngineEvent::GroupUpdated {
            group_id: group_id.to_string(),
        });
    }
}
