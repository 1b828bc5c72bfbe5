//! Engine error types

use nostr_core::{DmCryptoError, EventError};
use thiserror::Error;

/// Errors surfaced by the messaging engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No identity configured
    #[error("no identity set")]
    NoIdentity,

    /// Identity is locked, sending unavailable
    #[error("identity locked, sending unavailable")]
    SendUnavailable,

    /// Recipient key failed validation
    #[error("invalid recipient key: {0}")]
    InvalidRecipient(String),

    /// Plaintext exceeds the safety limit
    #[error("message too long: {len} chars (max {max})")]
    MessageTooLong { len: usize, max: usize },

    /// DM payload crypto failure
    #[error("crypto error: {0}")]
    Crypto(#[from] DmCryptoError),

    /// Event construction or signing failure
    #[error("event error: {0}")]
    Event(#[from] EventError),

    /// Storage failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No relay accepted the message; it was queued for retry
    #[error("no relay reachable, message {0} queued")]
    Offline(String),

    /// A relay explicitly rejected the message
    #[error("message {message_id} rejected: {reason}")]
    Rejected { message_id: String, reason: String },

    /// Subscription failure
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Message not found
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// Group operation not permitted for our role
    #[error("not permitted: {0}")]
    NotPermitted(String),
}

/// Errors from the durable message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("at-rest encryption failed")]
    Encrypt,

    #[error("at-rest decryption failed")]
    Decrypt,

    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;
