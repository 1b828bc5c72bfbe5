//! Key generation and format helpers.

use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::SecretKey;
use rand::RngCore;
use thiserror::Error;

/// Errors produced by key parsing and derivation.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Derive the x-only public key (lowercase hex) from a secret key.
pub fn public_key_hex(secret_key: &[u8; 32]) -> Result<String, KeyError> {
    let secp = Secp256k1::new();
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(hex::encode(xonly.serialize()))
}

/// Check that a string is a plausible x-only public key: 64 lowercase hex
/// characters.
pub fn is_valid_pubkey_hex(pubkey: &str) -> bool {
    pubkey.len() == 64
        && pubkey
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Lift an x-only public key (hex) to a 33-byte compressed key with even
/// parity, the form the ECDH routines expect.
pub fn xonly_to_compressed(pubkey_hex: &str) -> Result<[u8; 33], KeyError> {
    if !is_valid_pubkey_hex(pubkey_hex) {
        return Err(KeyError::InvalidPublicKey(format!(
            "expected 64 lowercase hex characters, got {:?}",
            pubkey_hex
        )));
    }
    let bytes = hex::decode(pubkey_hex).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&bytes);
    Ok(compressed)
}
