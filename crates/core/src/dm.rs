//! Encrypted direct-message payload crypto.
//!
//! A DM payload is encrypted with XChaCha20-Poly1305 under a key derived
//! from an ECDH shared secret between the sender's secret key and the
//! recipient's public key. The random 24-byte nonce is prefixed to the
//! ciphertext and the whole payload is base64-encoded for transport in the
//! event `content` field.
//!
//! Secret keys are normalized to even parity before ECDH so that both
//! parties derive the same shared secret from x-only public keys.

use crate::keys::xonly_to_compressed;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Parity, PublicKey, SecretKey, ecdh::SharedSecret};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
const NONCE_SIZE: usize = 24;

/// Errors from DM payload encryption and decryption.
///
/// All failure modes are typed; malformed key material or ciphertext fails
/// closed and never yields garbage plaintext.
#[derive(Debug, Error)]
pub enum DmCryptoError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,
}

/// Derive the symmetric key for a (secret key, peer pubkey) pair.
fn conversation_key(
    own_secret: &[u8; 32],
    peer_pubkey_hex: &str,
) -> Result<[u8; 32], DmCryptoError> {
    let secp = Secp256k1::new();

    let mut sk = SecretKey::from_slice(own_secret)
        .map_err(|e| DmCryptoError::InvalidSecretKey(e.to_string()))?;
    // Normalize to the key whose public point has even parity, matching the
    // even-parity lift applied to the peer's x-only key.
    let (_xonly, parity) = sk.x_only_public_key(&secp);
    if parity == Parity::Odd {
        sk = sk.negate();
    }

    let compressed = xonly_to_compressed(peer_pubkey_hex)
        .map_err(|e| DmCryptoError::InvalidPublicKey(e.to_string()))?;
    let pk = PublicKey::from_slice(&compressed)
        .map_err(|e| DmCryptoError::InvalidPublicKey(e.to_string()))?;

    Ok(SharedSecret::new(&pk, &sk).secret_bytes())
}

/// Encrypt a DM payload from sender to recipient.
pub fn encrypt_dm(
    plaintext: &str,
    sender_secret: &[u8; 32],
    recipient_pubkey_hex: &str,
) -> Result<String, DmCryptoError> {
    let key = conversation_key(sender_secret, recipient_pubkey_hex)?;
    let cipher = XChaCha20Poly1305::new((&key).into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| DmCryptoError::Encrypt)?;

    let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(payload))
}

/// Decrypt a DM payload received from a sender.
pub fn decrypt_dm(
    payload: &str,
    recipient_secret: &[u8; 32],
    sender_pubkey_hex: &str,
) -> Result<String, DmCryptoError> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| DmCryptoError::InvalidPayload(e.to_string()))?;
    if bytes.len() <= NONCE_SIZE {
        return Err(DmCryptoError::InvalidPayload(
            "payload shorter than nonce".to_string(),
        ));
    }

    let key = conversation_key(recipient_secret, sender_pubkey_hex)?;
    let cipher = XChaCha20Poly1305::new((&key).into());

    let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| DmCryptoError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| DmCryptoError::Decrypt)
}
