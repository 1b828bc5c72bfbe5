//! Engine-level message model.
//!
//! `Message` is the decrypted, engine-side view of a DM or group post. The
//! durable store owns these for its identity scope; controllers hold
//! transient views only.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Delivery status state machine for outgoing messages.
///
/// `Accepted` means a relay confirmed storage with OK; it is the practical
/// success terminal. `Delivered` requires evidence the recipient processed
/// the message, which the protocol does not guarantee, so the two are kept
/// distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Publish in flight, no relay response yet
    Sending,
    /// At least one relay acknowledged storage (OK true)
    Accepted,
    /// The recipient demonstrably processed the message
    Delivered,
    /// No relay reachable or confirmed; waiting in the offline queue
    Queued,
    /// A relay explicitly refused the event (OK false)
    Rejected,
    /// Retry budget exhausted
    Failed,
}

impl MessageStatus {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Accepted => "accepted",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Queued => "queued",
            MessageStatus::Rejected => "rejected",
            MessageStatus::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(MessageStatus::Sending),
            "accepted" => Some(MessageStatus::Accepted),
            "delivered" => Some(MessageStatus::Delivered),
            "queued" => Some(MessageStatus::Queued),
            "rejected" => Some(MessageStatus::Rejected),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// Message direction relative to the local identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Incoming => "incoming",
            MessageDirection::Outgoing => "outgoing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(MessageDirection::Incoming),
            "outgoing" => Some(MessageDirection::Outgoing),
            _ => None,
        }
    }
}

/// Attachment reference carried inside a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime_type: String,
}

/// A reaction to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub pubkey: String,
    pub emoji: String,
}

/// Decrypted engine-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Event id once sent/received
    pub id: String,
    /// Conversation this message belongs to (peer pubkey for DMs, group id
    /// for group posts)
    pub conversation_id: String,
    /// Plaintext content
    pub content: String,
    /// Unix seconds
    pub timestamp: u64,
    pub direction: MessageDirection,
    pub status: MessageStatus,
    pub sender_key: String,
    pub recipient_key: String,
    pub retry_count: u32,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<String>,
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Build an outgoing DM in the `Sending` state.
    pub fn outgoing(
        id: impl Into<String>,
        sender_key: impl Into<String>,
        recipient_key: impl Into<String>,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        let recipient_key = recipient_key.into();
        Self {
            id: id.into(),
            conversation_id: recipient_key.clone(),
            content: content.into(),
            timestamp,
            direction: MessageDirection::Outgoing,
            status: MessageStatus::Sending,
            sender_key: sender_key.into(),
            recipient_key,
            retry_count: 0,
            attachment: None,
            reply_to: None,
            reactions: Vec::new(),
        }
    }

    /// Build an incoming DM.
    pub fn incoming(
        id: impl Into<String>,
        sender_key: impl Into<String>,
        recipient_key: impl Into<String>,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        let sender_key = sender_key.into();
        Self {
            id: id.into(),
            conversation_id: sender_key.clone(),
            content: content.into(),
            timestamp,
            direction: MessageDirection::Incoming,
            status: MessageStatus::Delivered,
            sender_key,
            recipient_key: recipient_key.into(),
            retry_count: 0,
            attachment: None,
            reply_to: None,
            reactions: Vec::new(),
        }
    }
}

/// Queued unit of work in the offline outbox.
///
/// Created when a send attempt cannot be confirmed; destroyed when the
/// message is published or its retry budget is exhausted.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub recipient_key: String,
    /// Unix seconds when first queued
    pub created_at: u64,
    pub retry_count: u32,
    /// Unix milliseconds of the earliest next attempt
    pub next_retry_at: u64,
    /// Pre-signed event, reused on redelivery so the id stays stable
    pub event: Option<nostr_core::Event>,
}

/// Current unix time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time in milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            MessageStatus::Sending,
            MessageStatus::Accepted,
            MessageStatus::Delivered,
            MessageStatus::Queued,
            MessageStatus::Rejected,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("bogus"), None);
    }

    #[test]
    fn test_direction_roundtrip() {
        assert_eq!(
            MessageDirection::parse("incoming"),
            Some(MessageDirection::Incoming)
        );
        assert_eq!(
            MessageDirection::parse("outgoing"),
            Some(MessageDirection::Outgoing)
        );
        assert_eq!(MessageDirection::parse(""), None);
    }

    #[test]
    fn test_outgoing_message_defaults() {
        let msg = Message::outgoing("id1", "alice", "bob", "hi", 1000);
        assert_eq!(msg.conversation_id, "bob");
        assert_eq!(msg.status, MessageStatus::Sending);
        assert_eq!(msg.direction, MessageDirection::Outgoing);
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn test_incoming_message_conversation_is_sender() {
        let msg = Message::incoming("id1", "alice", "bob", "hi", 1000);
        assert_eq!(msg.conversation_id, "alice");
        assert_eq!(msg.direction, MessageDirection::Incoming);
        assert_eq!(msg.status, MessageStatus::Delivered);
    }
}
