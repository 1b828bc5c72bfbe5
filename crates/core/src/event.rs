//! Nostr event model and signing.
//!
//! Events are content-addressed: the `id` is the sha256 of the canonical
//! serialization `[0, pubkey, created_at, kind, tags, content]` and the
//! signature is a BIP-340 Schnorr signature over that id. Events are
//! immutable once constructed; an edit means a new event.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encrypted direct message (NIP-04 style).
pub const KIND_ENCRYPTED_DM: u16 = 4;
/// Group chat message (NIP-29), `h` tag carries the group id.
pub const KIND_GROUP_MESSAGE: u16 = 9;
/// Relay-signed membership grant (NIP-29 put-user).
pub const KIND_GROUP_PUT_USER: u16 = 9000;
/// Relay-signed membership removal (NIP-29 remove-user).
pub const KIND_GROUP_REMOVE_USER: u16 = 9001;
/// Join request published by a prospective member.
pub const KIND_GROUP_JOIN_REQUEST: u16 = 9021;
/// Replaceable group metadata (name, about).
pub const KIND_GROUP_METADATA: u16 = 39000;
/// Replaceable list of group admins and their roles.
pub const KIND_GROUP_ADMINS: u16 = 39001;
/// Replaceable list of group members.
pub const KIND_GROUP_MEMBERS: u16 = 39002;

/// Errors that can occur constructing, signing or verifying events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content (plaintext or ciphertext depending on kind)
    pub content: String,
    /// 64-bytes lowercase hex Schnorr signature
    pub sig: String,
}

impl Event {
    /// First value of the first tag with the given name, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// All values of tags with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }
}

/// An event before signing (pubkey already fixed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey is derived from the signing
/// key, so templates don't carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Serialize an unsigned event into its canonical hashing form.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_for_hash(event: &UnsignedEvent) -> Result<String, EventError> {
    if !is_hex_of_len(&event.pubkey, 64) {
        return Err(EventError::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| EventError::Serialization(e.to_string()))
}

/// Compute the event id (hex sha256 of the canonical serialization).
pub fn compute_event_id(event: &UnsignedEvent) -> Result<String, EventError> {
    let serialized = serialize_for_hash(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

/// Structural validation of a signed event (hex field lengths only; does
/// not verify the signature).
pub fn validate_event_shape(event: &Event) -> bool {
    is_hex_of_len(&event.id, 64) && is_hex_of_len(&event.pubkey, 64) && is_hex_of_len(&event.sig, 128)
}

/// Sign an event template, producing a complete signed event.
///
/// The id is computed deterministically before signing, so the resulting
/// event satisfies `id == sha256(canonical serialization)`.
pub fn sign_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event, EventError> {
    let secp = Secp256k1::new();

    let sk = SecretKey::from_slice(secret_key).map_err(|e| EventError::Signing(e.to_string()))?;
    let (xonly_pk, _parity) = sk.x_only_public_key(&secp);
    let pubkey = hex::encode(xonly_pk.serialize());

    let unsigned = UnsignedEvent {
        pubkey: pubkey.clone(),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    let id = compute_event_id(&unsigned)?;

    let id_bytes =
        hex::decode(&id).map_err(|e| EventError::Signing(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Signing(format!("invalid message: {}", e)))?;

    let keypair = Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id,
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify an event's id and signature.
///
/// Returns `Ok(false)` for any event whose shape, id or signature does not
/// check out; `Err` is reserved for malformed hex that prevents the check
/// from running at all.
pub fn verify_event(event: &Event) -> Result<bool, EventError> {
    if !validate_event_shape(event) {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };

    let computed_id = compute_event_id(&unsigned)?;
    if computed_id != event.id {
        return Ok(false);
    }

    let secp = Secp256k1::verification_only();

    let id_bytes = hex::decode(&event.id)
        .map_err(|e| EventError::Verification(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Verification(format!("invalid message: {}", e)))?;

    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| EventError::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = match schnorr::Signature::from_slice(&sig_bytes) {
        Ok(s) => s,
        Err(_) => return Ok(false),
    };

    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| EventError::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = match XOnlyPublicKey::from_slice(&pubkey_bytes) {
        Ok(p) => p,
        Err(_) => return Ok(false),
    };

    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}

/// Sort events newest-first by `created_at`, id ascending as tiebreak.
///
/// Display ordering only; correctness never depends on it.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_secret_key, public_key_hex};

    fn test_secret_key() -> [u8; 32] {
        let bytes =
            hex::decode("d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf")
                .unwrap();
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        key
    }

    fn template(content: &str) -> EventTemplate {
        EventTemplate {
            created_at: 1617932115,
            kind: KIND_ENCRYPTED_DM,
            tags: vec![],
            content: content.to_string(),
        }
    }

    #[test]
    fn test_serialize_for_hash_format() {
        let pubkey = public_key_hex(&test_secret_key()).unwrap();
        let unsigned = UnsignedEvent {
            pubkey: pubkey.clone(),
            created_at: 1617932115,
            kind: 4,
            tags: vec![],
            content: "hi".to_string(),
        };

        let serialized = serialize_for_hash(&unsigned).unwrap();
        assert_eq!(
            serialized,
            format!("[0,\"{}\",1617932115,4,[],\"hi\"]", pubkey)
        );
    }

    #[test]
    fn test_serialize_rejects_bad_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: "not-a-key".to_string(),
            created_at: 0,
            kind: 4,
            tags: vec![],
            content: String::new(),
        };
        assert!(serialize_for_hash(&unsigned).is_err());
    }

    #[test]
    fn test_sign_event_produces_valid_event() {
        let sk = test_secret_key();
        let event = sign_event(&template("Hello, world!"), &sk).unwrap();

        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert_eq!(event.pubkey, public_key_hex(&sk).unwrap());
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let sk = test_secret_key();
        let a = sign_event(&template("same"), &sk).unwrap();
        let b = sign_event(&template("same"), &sk).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_verify_rejects_tampered_content() {
        let sk = test_secret_key();
        let mut event = sign_event(&template("original"), &sk).unwrap();
        event.content = "tampered".to_string();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_rejects_tampered_signature() {
        let sk = test_secret_key();
        let mut event = sign_event(&template("original"), &sk).unwrap();
        let mut sig: Vec<char> = event.sig.chars().collect();
        sig[0] = if sig[0] == '0' { '1' } else { '0' };
        event.sig = sig.into_iter().collect();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_rejects_wrong_pubkey() {
        let mut event = sign_event(&template("original"), &test_secret_key()).unwrap();
        event.pubkey = public_key_hex(&generate_secret_key()).unwrap();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_rejects_tampered_id() {
        let mut event = sign_event(&template("original"), &test_secret_key()).unwrap();
        let mut id: Vec<char> = event.id.chars().collect();
        id[0] = if id[0] == 'a' { 'b' } else { 'a' };
        event.id = id.into_iter().collect();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_event_with_tags_roundtrips_json() {
        let sk = test_secret_key();
        let event = sign_event(
            &EventTemplate {
                created_at: 1617932115,
                kind: KIND_ENCRYPTED_DM,
                tags: vec![vec!["p".to_string(), "a".repeat(64)]],
                content: "tagged".to_string(),
            },
            &sk,
        )
        .unwrap();

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert!(verify_event(&back).unwrap());
        assert_eq!(back.tag_value("p"), Some("a".repeat(64).as_str()));
    }

    #[test]
    fn test_special_characters_survive_signing() {
        let sk = test_secret_key();
        let event = sign_event(&template("line\nbreak \"quotes\" \\slash 世界"), &sk).unwrap();
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_sort_events_newest_first() {
        let mk = |id: &str, at: u64| Event {
            id: id.to_string(),
            pubkey: "a".repeat(64),
            created_at: at,
            kind: 4,
            tags: vec![],
            content: String::new(),
            sig: "a".repeat(128),
        };
        let mut events = vec![mk("ccc", 10), mk("bbb", 20), mk("aaa", 20)];
        sort_events(&mut events);
        assert_eq!(events[0].id, "aaa");
        assert_eq!(events[1].id, "bbb");
        assert_eq!(events[2].id, "ccc");
    }
}
