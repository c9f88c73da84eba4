//! Device identity: long-lived asymmetric keypair and peer id derivation
//!
//! Each device owns one static encryption keypair used exclusively for
//! session establishment: a hybrid of classical X25519 and post-quantum
//! ML-KEM-768. The private side never leaves the key store; the public
//! side is published to the relay as a [`PublicKeyBundle`].
//!
//! The peer id is derived from the public bundle:
//!
//! ```text
//! peer_id = base58(blake3(x25519_pk || mlkem_pk)[..20])
//! ```
//!
//! so a bundle fetched from the relay can be checked against the peer id
//! it claims to belong to.

use crate::encoding::{b64, b64_array};
use crate::error::CourierError;
use crate::types::{now_millis, PeerId};

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{PublicKey as KemPublicKey, SecretKey as KemSecretKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::Zeroizing;

/// Number of blake3 output bytes used for the peer id
const PEER_ID_LEN: usize = 20;

/// A device's long-lived encryption keypair.
///
/// Created once, persisted in the key store, never transmitted
/// private-side. Session keys are wrapped to the public half of every
/// participant's keypair during establishment.
pub struct DeviceKeypair {
    x25519_secret: X25519StaticSecret,
    mlkem_public: kyber768::PublicKey,
    mlkem_secret: kyber768::SecretKey,
    created_at: i64,
}

impl DeviceKeypair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("system RNG unavailable");
        let x25519_secret = X25519StaticSecret::from(seed);
        let (mlkem_public, mlkem_secret) = kyber768::keypair();

        Self {
            x25519_secret,
            mlkem_public,
            mlkem_secret,
            created_at: now_millis(),
        }
    }

    /// The peer id derived from this keypair's public half
    pub fn peer_id(&self) -> PeerId {
        derive_peer_id(
            X25519PublicKey::from(&self.x25519_secret).as_bytes(),
            self.mlkem_public.as_bytes(),
        )
    }

    /// The X25519 static secret (session unsealing)
    pub(crate) fn x25519_secret(&self) -> &X25519StaticSecret {
        &self.x25519_secret
    }

    /// The ML-KEM secret key (session unsealing)
    pub(crate) fn mlkem_secret(&self) -> &kyber768::SecretKey {
        &self.mlkem_secret
    }

    /// Build the publishable bundle, valid for `valid_for_millis` from now
    pub fn public_bundle(&self, valid_for_millis: i64) -> PublicKeyBundle {
        let now = now_millis();
        PublicKeyBundle {
            x25519: *X25519PublicKey::from(&self.x25519_secret).as_bytes(),
            mlkem: self.mlkem_public.as_bytes().to_vec(),
            created_at: now,
            expires_at: now + valid_for_millis,
        }
    }

    /// Serialize for the key store (postcard)
    pub fn to_bytes(&self) -> Vec<u8> {
        let stored = StoredKeypair {
            x25519: self.x25519_secret.to_bytes(),
            mlkem_public: self.mlkem_public.as_bytes().to_vec(),
            mlkem_secret: self.mlkem_secret.as_bytes().to_vec(),
            created_at: self.created_at,
        };
        let bytes = postcard::to_allocvec(&stored).expect("keypair serialization is infallible");
        // Clear the intermediate secret copy before returning
        drop(Zeroizing::new(stored.mlkem_secret));
        bytes
    }

    /// Deserialize from key store bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CourierError> {
        let stored: StoredKeypair = postcard::from_bytes(bytes)
            .map_err(|e| CourierError::Corrupt(format!("identity keypair: {}", e)))?;

        let mlkem_public = kyber768::PublicKey::from_bytes(&stored.mlkem_public)
            .map_err(|_| CourierError::Corrupt("ML-KEM public key".to_string()))?;
        let mlkem_secret = kyber768::SecretKey::from_bytes(&stored.mlkem_secret)
            .map_err(|_| CourierError::Corrupt("ML-KEM secret key".to_string()))?;

        Ok(Self {
            x25519_secret: X25519StaticSecret::from(stored.x25519),
            mlkem_public,
            mlkem_secret,
            created_at: stored.created_at,
        })
    }

    /// Unix timestamp in milliseconds of keypair creation
    pub fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// Persisted form of the keypair
#[derive(Serialize, Deserialize)]
struct StoredKeypair {
    x25519: [u8; 32],
    mlkem_public: Vec<u8>,
    mlkem_secret: Vec<u8>,
    created_at: i64,
}

/// The publishable public half of a device keypair.
///
/// This is what the relay stores and what participants resolve before
/// wrapping a session key for us. Byte fields travel as base64 in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBundle {
    /// X25519 public key
    #[serde(with = "b64_array")]
    pub x25519: [u8; 32],
    /// ML-KEM-768 public key
    #[serde(with = "b64")]
    pub mlkem: Vec<u8>,
    /// Unix timestamp in milliseconds of publication
    pub created_at: i64,
    /// Unix timestamp in milliseconds after which the bundle is stale
    pub expires_at: i64,
}

impl PublicKeyBundle {
    /// The peer id this bundle belongs to
    pub fn peer_id(&self) -> PeerId {
        derive_peer_id(&self.x25519, &self.mlkem)
    }

    /// Whether the bundle is still within its validity window
    pub fn is_valid_at(&self, now: i64) -> bool {
        now < self.expires_at
    }

    /// Short hex fingerprint for logs and CLI display
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.x25519);
        hasher.update(&self.mlkem);
        hex::encode(&hasher.finalize().as_bytes()[..8])
    }

    /// The X25519 public key, typed
    pub(crate) fn x25519_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.x25519)
    }

    /// The ML-KEM public key, typed
    pub(crate) fn mlkem_public(&self) -> Result<kyber768::PublicKey, CourierError> {
        kyber768::PublicKey::from_bytes(&self.mlkem)
            .map_err(|_| CourierError::Corrupt("ML-KEM public key".to_string()))
    }
}

fn derive_peer_id(x25519: &[u8], mlkem: &[u8]) -> PeerId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(x25519);
    hasher.update(mlkem);
    let hash = hasher.finalize();
    PeerId::from_string(bs58::encode(&hash.as_bytes()[..PEER_ID_LEN]).into_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct_identities() {
        let a = DeviceKeypair::generate();
        let b = DeviceKeypair::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_bundle_peer_id_matches_keypair() {
        let keypair = DeviceKeypair::generate();
        let bundle = keypair.public_bundle(1_000);
        assert_eq!(bundle.peer_id(), keypair.peer_id());
    }

    #[test]
    fn test_keypair_storage_roundtrip() {
        let keypair = DeviceKeypair::generate();
        let bytes = keypair.to_bytes();
        let restored = DeviceKeypair::from_bytes(&bytes).unwrap();
        assert_eq!(restored.peer_id(), keypair.peer_id());
        assert_eq!(restored.created_at(), keypair.created_at());
    }

    #[test]
    fn test_keypair_from_garbage_fails() {
        let result = DeviceKeypair::from_bytes(&[0u8; 16]);
        assert!(matches!(result, Err(CourierError::Corrupt(_))));
    }

    #[test]
    fn test_bundle_json_roundtrip() {
        let keypair = DeviceKeypair::generate();
        let bundle = keypair.public_bundle(7 * 24 * 3600 * 1000);
        let json = serde_json::to_string(&bundle).unwrap();
        let restored: PublicKeyBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(bundle, restored);
    }

    #[test]
    fn test_bundle_fingerprint_stable() {
        let keypair = DeviceKeypair::generate();
        let a = keypair.public_bundle(1_000).fingerprint();
        let b = keypair.public_bundle(2_000).fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_bundle_validity_window() {
        let keypair = DeviceKeypair::generate();
        let bundle = keypair.public_bundle(1_000);
        assert!(bundle.is_valid_at(bundle.created_at));
        assert!(!bundle.is_valid_at(bundle.expires_at + 1));
    }
}
