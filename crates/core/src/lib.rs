//! Core Nostr protocol types for the messaging engine.
//!
//! This crate provides:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical event serialization and hashing
//! - Event signing with Schnorr signatures and verification
//! - Key generation and validation helpers
//! - Encrypted direct-message payload crypto (ECDH + XChaCha20-Poly1305)

mod dm;
mod event;
mod keys;

pub use dm::{DmCryptoError, decrypt_dm, encrypt_dm};
pub use event::{
    Event, EventError, EventTemplate, UnsignedEvent, compute_event_id, serialize_for_hash,
    sign_event, sort_events, validate_event_shape, verify_event,
};
pub use event::{
    KIND_ENCRYPTED_DM, KIND_GROUP_ADMINS, KIND_GROUP_JOIN_REQUEST, KIND_GROUP_MEMBERS,
    KIND_GROUP_MESSAGE, KIND_GROUP_METADATA, KIND_GROUP_PUT_USER, KIND_GROUP_REMOVE_USER,
};
pub use keys::{
    KeyError, generate_secret_key, is_valid_pubkey_hex, public_key_hex, xonly_to_compressed,
};
