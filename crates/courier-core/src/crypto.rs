//! Payload encryption using ChaCha20-Poly1305 AEAD
//!
//! Every message payload is encrypted under its conversation's symmetric
//! session key. The AEAD tag makes tampering detectable: decryption of a
//! modified ciphertext fails with [`CourierError::AuthenticationFailed`].
//!
//! ## Wire Format
//!
//! Encrypted data format: `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`

use crate::error::CourierError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size appended by the AEAD (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Cipher instance bound to one symmetric session key.
///
/// A fresh random nonce is generated per encryption and prepended to the
/// output, so the same plaintext never produces the same ciphertext twice.
///
/// # Example
///
/// ```
/// use courier_core::crypto::PayloadCrypto;
///
/// let key = PayloadCrypto::generate_key();
/// let crypto = PayloadCrypto::new(&key);
///
/// let ciphertext = crypto.encrypt(b"hi").unwrap();
/// assert_eq!(crypto.decrypt(&ciphertext).unwrap(), b"hi");
/// ```
pub struct PayloadCrypto {
    cipher: ChaCha20Poly1305,
}

impl PayloadCrypto {
    /// Create a cipher instance for the given 32-byte key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte session key
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt a payload.
    ///
    /// Output format: `[nonce (12 bytes)] + [ciphertext + tag]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CourierError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CourierError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt a nonce-prepended payload.
    ///
    /// Fails with [`CourierError::AuthenticationFailed`] if the data was
    /// truncated, tampered with, or encrypted under a different key.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CourierError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CourierError::AuthenticationFailed(
                "ciphertext too short".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|_| CourierError::AuthenticationFailed("AEAD tag mismatch".to_string()))
    }
}

/// One-shot helpers for callers that hold a key but no cipher instance.
///
/// For repeated operations with the same key, prefer [`PayloadCrypto`].
pub mod stateless {
    use super::*;

    /// Encrypt with a temporary cipher instance
    pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CourierError> {
        PayloadCrypto::new(key).encrypt(plaintext)
    }

    /// Decrypt with a temporary cipher instance
    pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CourierError> {
        PayloadCrypto::new(key).decrypt(data)
    }
}
