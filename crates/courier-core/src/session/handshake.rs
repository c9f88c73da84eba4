//! Session key wrapping for the establishment handshake
//!
//! A freshly generated symmetric session key is wrapped once per
//! participant using a hybrid key exchange that combines classical X25519
//! with post-quantum ML-KEM-768:
//!
//! ```text
//! 1. X25519: ss1 = x25519(ephemeral_sk, recipient_pk)
//! 2. ML-KEM: (ss2, ciphertext) = ml_kem_encapsulate(recipient_mlkem_pk)
//! 3. Derive: k1 = HKDF(ss1, "x25519"), k2 = HKDF(ss2, "mlkem")
//! 4. Wrap: session key encrypted under both k1 and k2
//! ```
//!
//! A recipient must decrypt both wrappings and verify they agree, so the
//! wrap is secure as long as **either** exchange is. The resulting
//! [`SessionProposal`] is the wire body of the handshake; the relay fans
//! it out to the conversation's participants.

use crate::crypto::stateless;
use crate::encoding::{b64, b64_array};
use crate::error::CourierError;
use crate::identity::{DeviceKeypair, PublicKeyBundle};
use crate::types::{ConversationId, PeerId, SessionKeyId};

use hkdf::Hkdf;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext, SharedSecret};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"courier-session-wrap-v1";

/// One participant's wrapped copy of a session key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSessionKey {
    /// Recipient's peer id (for lookup)
    pub recipient: PeerId,
    /// X25519 ephemeral public key used for this recipient
    #[serde(with = "b64_array")]
    pub x25519_ephemeral_pk: [u8; 32],
    /// Session key encrypted under the X25519-derived key
    #[serde(with = "b64")]
    pub x25519_encrypted_key: Vec<u8>,
    /// ML-KEM encapsulated key
    #[serde(with = "b64")]
    pub mlkem_ciphertext: Vec<u8>,
    /// Session key encrypted under the ML-KEM-derived key
    #[serde(with = "b64")]
    pub mlkem_encrypted_key: Vec<u8>,
}

impl SealedSessionKey {
    /// Wrap a session key for one recipient.
    pub fn seal_for(
        session_key: &[u8; 32],
        recipient: &PublicKeyBundle,
    ) -> Result<Self, CourierError> {
        // Ephemeral X25519 exchange
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| CourierError::Crypto(format!("ephemeral key generation: {}", e)))?;
        let ephemeral_secret = X25519StaticSecret::from(seed);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        let x25519_shared = ephemeral_secret.diffie_hellman(&recipient.x25519_public());
        let x25519_derived = derive_key(x25519_shared.as_bytes(), b"x25519");
        let x25519_encrypted_key = stateless::encrypt(&x25519_derived, session_key)?;

        // ML-KEM encapsulation
        let (mlkem_shared, mlkem_ct) = kyber768::encapsulate(&recipient.mlkem_public()?);
        let mlkem_derived = derive_key(mlkem_shared.as_bytes(), b"mlkem");
        let mlkem_encrypted_key = stateless::encrypt(&mlkem_derived, session_key)?;

        Ok(Self {
            recipient: recipient.peer_id(),
            x25519_ephemeral_pk: *ephemeral_public.as_bytes(),
            x25519_encrypted_key,
            mlkem_ciphertext: mlkem_ct.as_bytes().to_vec(),
            mlkem_encrypted_key,
        })
    }

    /// Recover the session key with the recipient's device keypair.
    ///
    /// Both wrappings must decrypt and agree; a mismatch means a malformed
    /// or manipulated proposal.
    pub fn unseal(&self, keys: &DeviceKeypair) -> Result<[u8; 32], CourierError> {
        let ephemeral_public = X25519PublicKey::from(self.x25519_ephemeral_pk);
        let x25519_shared = keys.x25519_secret().diffie_hellman(&ephemeral_public);
        let x25519_derived = derive_key(x25519_shared.as_bytes(), b"x25519");
        let x25519_key = stateless::decrypt(&x25519_derived, &self.x25519_encrypted_key)?;

        let mlkem_ct = kyber768::Ciphertext::from_bytes(&self.mlkem_ciphertext)
            .map_err(|_| CourierError::Crypto("invalid ML-KEM ciphertext".to_string()))?;
        let mlkem_shared = kyber768::decapsulate(&mlkem_ct, keys.mlkem_secret());
        let mlkem_derived = derive_key(mlkem_shared.as_bytes(), b"mlkem");
        let mlkem_key = stateless::decrypt(&mlkem_derived, &self.mlkem_encrypted_key)?;

        if x25519_key.len() != 32 || x25519_key != mlkem_key {
            return Err(CourierError::Crypto(
                "wrapped session key halves disagree".to_string(),
            ));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&x25519_key);
        Ok(key)
    }
}

/// A proposed session key for a conversation, wrapped per participant.
///
/// This is the handshake wire body: posted to the relay and fanned out to
/// participants over the live channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposal {
    /// Conversation the key belongs to
    pub conversation_id: ConversationId,
    /// Proposing participant
    pub sender: PeerId,
    /// Identifier of the proposed key
    pub key_id: SessionKeyId,
    /// One wrapped copy per participant, proposer included
    pub sealed_keys: Vec<SealedSessionKey>,
    /// Unix timestamp in milliseconds of proposal
    pub created_at: i64,
    /// Unix timestamp in milliseconds after which the key must rotate
    pub expires_at: i64,
}

impl SessionProposal {
    /// Build a proposal wrapping a fresh session key for every recipient.
    pub fn build(
        conversation_id: ConversationId,
        sender: PeerId,
        session_key: &[u8; 32],
        recipients: &[PublicKeyBundle],
        created_at: i64,
        expires_at: i64,
    ) -> Result<Self, CourierError> {
        if recipients.is_empty() {
            return Err(CourierError::Crypto(
                "cannot propose a session to zero recipients".to_string(),
            ));
        }

        let sealed_keys = recipients
            .iter()
            .map(|r| SealedSessionKey::seal_for(session_key, r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            conversation_id,
            sender,
            key_id: SessionKeyId::new(),
            sealed_keys,
            created_at,
            expires_at,
        })
    }

    /// Recover the session key addressed to the given device.
    pub fn unseal_for(&self, keys: &DeviceKeypair) -> Result<[u8; 32], CourierError> {
        let my_id = keys.peer_id();
        let sealed = self
            .sealed_keys
            .iter()
            .find(|sk| sk.recipient == my_id)
            .ok_or_else(|| {
                CourierError::Crypto("proposal has no key for this recipient".to_string())
            })?;
        sealed.unseal(keys)
    }

    /// Whether the proposal addresses the given peer
    pub fn is_addressed_to(&self, peer: &PeerId) -> bool {
        self.sealed_keys.iter().any(|sk| &sk.recipient == peer)
    }
}

/// Derive a 32-byte wrapping key from a shared secret using HKDF-SHA256.
fn derive_key(shared_secret: &[u8], context: &[u8]) -> [u8; 32] {
    let mut info = Vec::with_capacity(HKDF_INFO.len() + context.len());
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(context);

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(&info, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}
