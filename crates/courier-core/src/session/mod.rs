//! Crypto session manager: identity lifecycle and per-conversation sessions
//!
//! The session manager is the sole owner of key material. Everything else
//! references keys by [`SessionKeyId`]; resolving an identifier to bytes
//! happens only here.
//!
//! ## Session lifecycle
//!
//! ```text
//! ensure_session ──▶ active key valid? ──yes──▶ reuse
//!        │                  no
//!        ▼
//! resolve participant bundles (relay, cache fallback)
//!        ▼
//! fresh 32-byte key, wrapped per participant (handshake::SessionProposal)
//!        ▼
//! propose to relay ──rejected──▶ HandshakeRejected, nothing stored
//!        │ accepted
//!        ▼
//! supersede old key, persist + activate new one
//! ```
//!
//! Superseded keys stay in the store for a bounded retention window so
//! in-flight ciphertexts can still drain, then are securely erased.
//! Establishment is serialized per conversation: at most one in-flight
//! handshake at a time.

mod handshake;
mod keystore;

pub use handshake::{SealedSessionKey, SessionProposal};
pub use keystore::{KeyStore, SessionRecord};

use crate::crypto::PayloadCrypto;
use crate::error::{CourierError, CourierResult};
use crate::identity::{DeviceKeypair, PublicKeyBundle};
use crate::types::{now_millis, Conversation, ConversationId, PeerId, SessionKeyId};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Resolves and publishes peer public key bundles.
///
/// Implemented by the relay's REST client and by in-memory test doubles.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Resolve a peer's current public key bundle
    async fn resolve(&self, peer: &PeerId) -> CourierResult<PublicKeyBundle>;

    /// Publish our own public key bundle
    async fn publish(&self, peer: &PeerId, bundle: &PublicKeyBundle) -> CourierResult<()>;
}

/// Delivers a session proposal to the conversation's participants.
#[async_trait]
pub trait ProposalSink: Send + Sync {
    /// Submit the proposal; a relay rejection maps to `HandshakeRejected`
    async fn propose(&self, proposal: &SessionProposal) -> CourierResult<()>;
}

/// Owner of all key material: device identity and conversation sessions.
pub struct SessionManager {
    keystore: KeyStore,
    identity: DeviceKeypair,
    validity_millis: i64,
    retention_millis: i64,
    /// Per-conversation handshake locks (one in-flight handshake at a time)
    handshake_locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl SessionManager {
    /// Create a session manager over the given key store.
    ///
    /// Loads the device identity, generating and persisting one on first
    /// use.
    pub fn new(
        keystore: KeyStore,
        validity_millis: i64,
        retention_millis: i64,
    ) -> CourierResult<Self> {
        let identity = match keystore.load_identity()? {
            Some(identity) => identity,
            None => {
                let identity = DeviceKeypair::generate();
                keystore.save_identity(&identity)?;
                info!(peer_id = %identity.peer_id(), "Generated new device identity");
                identity
            }
        };

        Ok(Self {
            keystore,
            identity,
            validity_millis,
            retention_millis,
            handshake_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Our peer id
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Our publishable key bundle
    pub fn public_bundle(&self) -> PublicKeyBundle {
        self.identity.public_bundle(self.validity_millis)
    }

    /// Publish our key bundle to the directory.
    pub async fn publish_identity(&self, directory: &dyn KeyDirectory) -> CourierResult<()> {
        directory
            .publish(&self.peer_id(), &self.public_bundle())
            .await
    }

    /// Return a valid session for the conversation, establishing one if the
    /// active key is missing or its validity window has elapsed.
    pub async fn ensure_session(
        &self,
        conversation: &Conversation,
        directory: &dyn KeyDirectory,
        sink: &dyn ProposalSink,
    ) -> CourierResult<SessionRecord> {
        let lock = self.handshake_lock(conversation.id).await;
        let _guard = lock.lock().await;

        let now = now_millis();
        if let Some(record) = self.keystore.active_session(&conversation.id)? {
            if record.is_active_at(now) {
                return Ok(record);
            }
            debug!(conversation_id = %conversation.id, key_id = %record.id,
                   "Active session key expired, rotating");
        }

        self.establish_locked(conversation, directory, sink, now)
            .await
    }

    /// Supersede the active key and negotiate a fresh one immediately.
    ///
    /// Called on membership change; the old key only drains in-flight
    /// ciphertexts from here on.
    pub async fn rotate_session(
        &self,
        conversation: &Conversation,
        directory: &dyn KeyDirectory,
        sink: &dyn ProposalSink,
    ) -> CourierResult<SessionRecord> {
        let lock = self.handshake_lock(conversation.id).await;
        let _guard = lock.lock().await;

        let now = now_millis();
        self.keystore.supersede_active(&conversation.id, now)?;
        self.establish_locked(conversation, directory, sink, now)
            .await
    }

    /// Handshake body: resolve bundles, wrap a fresh key, propose, persist.
    ///
    /// Caller must hold the conversation's handshake lock.
    async fn establish_locked(
        &self,
        conversation: &Conversation,
        directory: &dyn KeyDirectory,
        sink: &dyn ProposalSink,
        now: i64,
    ) -> CourierResult<SessionRecord> {
        let my_id = self.peer_id();
        let mut bundles = Vec::with_capacity(conversation.participants.len());
        for peer in &conversation.participants {
            if *peer == my_id {
                bundles.push(self.public_bundle());
            } else {
                bundles.push(self.resolve_bundle(peer, directory).await?);
            }
        }

        let key = PayloadCrypto::generate_key();
        let proposal = SessionProposal::build(
            conversation.id,
            my_id,
            &key,
            &bundles,
            now,
            now + self.validity_millis,
        )?;

        // Nothing is stored until the relay accepts the proposal
        sink.propose(&proposal).await?;

        self.keystore.supersede_active(&conversation.id, now)?;
        let record = SessionRecord {
            id: proposal.key_id,
            conversation_id: conversation.id,
            key,
            created_at: now,
            expires_at: now + self.validity_millis,
            superseded_at: None,
        };
        self.keystore.save_session(&record)?;
        self.keystore.set_active(&conversation.id, &record.id)?;

        info!(conversation_id = %conversation.id, key_id = %record.id,
              participants = conversation.participants.len(),
              "Established session key");
        Ok(record)
    }

    /// Resolve a peer bundle via the directory, falling back to the local
    /// cache when the relay is unreachable.
    async fn resolve_bundle(
        &self,
        peer: &PeerId,
        directory: &dyn KeyDirectory,
    ) -> CourierResult<PublicKeyBundle> {
        match directory.resolve(peer).await {
            Ok(bundle) => {
                if bundle.peer_id() != *peer {
                    return Err(CourierError::PeerKeyUnavailable(format!(
                        "bundle for {} fails its peer id check",
                        peer
                    )));
                }
                self.keystore.cache_peer_bundle(peer, &bundle)?;
                Ok(bundle)
            }
            Err(CourierError::Transport(e)) if e.is_retriable() => {
                match self.keystore.cached_peer_bundle(peer)? {
                    Some(bundle) => {
                        debug!(%peer, "Relay unreachable, using cached key bundle");
                        Ok(bundle)
                    }
                    None => Err(CourierError::PeerKeyUnavailable(peer.to_string())),
                }
            }
            Err(CourierError::PeerKeyUnavailable(_)) => {
                match self.keystore.cached_peer_bundle(peer)? {
                    Some(bundle) => Ok(bundle),
                    None => Err(CourierError::PeerKeyUnavailable(peer.to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Store a session key proposed by another participant.
    ///
    /// Activates the key unless a newer one is already active; an older
    /// proposal is retained superseded so its in-flight ciphertexts still
    /// decrypt.
    pub fn accept_proposal(&self, proposal: &SessionProposal) -> CourierResult<SessionRecord> {
        let key = proposal.unseal_for(&self.identity)?;

        let mut record = SessionRecord {
            id: proposal.key_id,
            conversation_id: proposal.conversation_id,
            key,
            created_at: proposal.created_at,
            expires_at: proposal.expires_at,
            superseded_at: None,
        };

        let current = self.keystore.active_session(&proposal.conversation_id)?;
        match current {
            Some(active) if active.created_at > proposal.created_at => {
                // Lost a rotation race; keep the newer key active
                warn!(conversation_id = %proposal.conversation_id, key_id = %proposal.key_id,
                      "Accepted proposal is older than active key, retaining superseded");
                record.superseded_at = Some(active.created_at);
                self.keystore.save_session(&record)?;
            }
            _ => {
                self.keystore
                    .supersede_active(&proposal.conversation_id, now_millis())?;
                self.keystore.save_session(&record)?;
                self.keystore.set_active(&proposal.conversation_id, &record.id)?;
                debug!(conversation_id = %proposal.conversation_id, key_id = %record.id,
                       "Activated proposed session key");
            }
        }

        Ok(record)
    }

    /// Encrypt a payload under the referenced session key.
    pub fn encrypt(&self, key_id: &SessionKeyId, plaintext: &[u8]) -> CourierResult<Vec<u8>> {
        let record = self
            .keystore
            .load_session(key_id)?
            .ok_or_else(|| CourierError::KeyExpired(key_id.to_string()))?;
        PayloadCrypto::new(&record.key).encrypt(plaintext)
    }

    /// Decrypt a payload under the referenced session key.
    ///
    /// Fails with `KeyExpired` if the key is no longer retained (signal the
    /// caller to renegotiate) and `AuthenticationFailed` on tampering.
    pub fn decrypt(&self, key_id: &SessionKeyId, ciphertext: &[u8]) -> CourierResult<Vec<u8>> {
        let record = self
            .keystore
            .load_session(key_id)?
            .ok_or_else(|| CourierError::KeyExpired(key_id.to_string()))?;
        PayloadCrypto::new(&record.key).decrypt(ciphertext)
    }

    /// Erase superseded keys whose retention window has elapsed.
    pub fn sweep(&self, now: i64) -> CourierResult<usize> {
        let removed = self.keystore.purge_superseded(now, self.retention_millis)?;
        if removed > 0 {
            debug!(removed, "Erased superseded session keys");
        }
        Ok(removed)
    }

    /// The conversation's currently active session, if any.
    pub fn active_session(
        &self,
        conversation_id: &ConversationId,
    ) -> CourierResult<Option<SessionRecord>> {
        self.keystore.active_session(conversation_id)
    }

    async fn handshake_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.handshake_locks.lock().await;
        locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use tempfile::TempDir;

    const WEEK_MS: i64 = 7 * 24 * 3600 * 1000;
    const DAY_MS: i64 = 24 * 3600 * 1000;

    /// In-memory directory + sink used as the relay stand-in
    #[derive(Default)]
    struct FakeRelay {
        bundles: SyncMutex<HashMap<PeerId, PublicKeyBundle>>,
        proposals: SyncMutex<Vec<SessionProposal>>,
        reject_proposals: SyncMutex<bool>,
        offline: SyncMutex<bool>,
    }

    #[async_trait]
    impl KeyDirectory for FakeRelay {
        async fn resolve(&self, peer: &PeerId) -> CourierResult<PublicKeyBundle> {
            if *self.offline.lock() {
                return Err(crate::error::TransportError::Transient("offline".into()).into());
            }
            self.bundles
                .lock()
                .get(peer)
                .cloned()
                .ok_or_else(|| CourierError::PeerKeyUnavailable(peer.to_string()))
        }

        async fn publish(&self, peer: &PeerId, bundle: &PublicKeyBundle) -> CourierResult<()> {
            self.bundles.lock().insert(peer.clone(), bundle.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl ProposalSink for FakeRelay {
        async fn propose(&self, proposal: &SessionProposal) -> CourierResult<()> {
            if *self.reject_proposals.lock() {
                return Err(CourierError::HandshakeRejected(
                    "conflicting proposal in flight".to_string(),
                ));
            }
            self.proposals.lock().push(proposal.clone());
            Ok(())
        }
    }

    fn manager_in(temp: &TempDir, name: &str) -> SessionManager {
        let store = KeyStore::new(temp.path().join(name)).unwrap();
        SessionManager::new(store, WEEK_MS, DAY_MS).unwrap()
    }

    fn two_party_setup(temp: &TempDir) -> (SessionManager, SessionManager, Conversation, FakeRelay) {
        let alice = manager_in(temp, "alice.redb");
        let bob = manager_in(temp, "bob.redb");
        let relay = FakeRelay::default();
        relay
            .bundles
            .lock()
            .insert(bob.peer_id(), bob.public_bundle());
        let conversation = Conversation::new(vec![alice.peer_id(), bob.peer_id()]);
        (alice, bob, conversation, relay)
    }

    #[tokio::test]
    async fn test_identity_created_once() {
        let temp = TempDir::new().unwrap();
        let store = KeyStore::new(temp.path().join("keys.redb")).unwrap();
        let first = SessionManager::new(store.clone(), WEEK_MS, DAY_MS).unwrap();
        let peer_id = first.peer_id();
        drop(first);

        let second = SessionManager::new(store, WEEK_MS, DAY_MS).unwrap();
        assert_eq!(second.peer_id(), peer_id);
    }

    #[tokio::test]
    async fn test_ensure_session_establishes_and_reuses() {
        let temp = TempDir::new().unwrap();
        let (alice, _bob, conversation, relay) = two_party_setup(&temp);

        let first = alice
            .ensure_session(&conversation, &relay, &relay)
            .await
            .unwrap();
        let second = alice
            .ensure_session(&conversation, &relay, &relay)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(relay.proposals.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_session_unknown_peer_fails() {
        let temp = TempDir::new().unwrap();
        let alice = manager_in(&temp, "alice.redb");
        let relay = FakeRelay::default();
        let conversation = Conversation::new(vec![
            alice.peer_id(),
            PeerId::from_string("nobody-we-know"),
        ]);

        let result = alice.ensure_session(&conversation, &relay, &relay).await;
        assert!(matches!(result, Err(CourierError::PeerKeyUnavailable(_))));
    }

    #[tokio::test]
    async fn test_rejected_proposal_stores_nothing() {
        let temp = TempDir::new().unwrap();
        let (alice, _bob, conversation, relay) = two_party_setup(&temp);
        *relay.reject_proposals.lock() = true;

        let result = alice.ensure_session(&conversation, &relay, &relay).await;
        assert!(matches!(result, Err(CourierError::HandshakeRejected(_))));
        assert!(alice.active_session(&conversation.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_accepts_proposal_and_decrypts() {
        let temp = TempDir::new().unwrap();
        let (alice, bob, conversation, relay) = two_party_setup(&temp);

        let record = alice
            .ensure_session(&conversation, &relay, &relay)
            .await
            .unwrap();
        let proposal = relay.proposals.lock().last().cloned().unwrap();

        let bob_record = bob.accept_proposal(&proposal).unwrap();
        assert_eq!(bob_record.id, record.id);

        let ciphertext = alice.encrypt(&record.id, b"hi bob").unwrap();
        assert_eq!(bob.decrypt(&record.id, &ciphertext).unwrap(), b"hi bob");
    }

    #[tokio::test]
    async fn test_rotation_supersedes_but_drains() {
        let temp = TempDir::new().unwrap();
        let (alice, _bob, conversation, relay) = two_party_setup(&temp);

        let old = alice
            .ensure_session(&conversation, &relay, &relay)
            .await
            .unwrap();
        let ciphertext = alice.encrypt(&old.id, b"in flight").unwrap();

        let new = alice
            .rotate_session(&conversation, &relay, &relay)
            .await
            .unwrap();
        assert_ne!(old.id, new.id);

        // Old key still drains until the retention window elapses
        assert_eq!(alice.decrypt(&old.id, &ciphertext).unwrap(), b"in flight");

        let far_future = now_millis() + 2 * DAY_MS;
        alice.sweep(far_future).unwrap();
        assert!(matches!(
            alice.decrypt(&old.id, &ciphertext),
            Err(CourierError::KeyExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_decrypt_unknown_key_is_key_expired() {
        let temp = TempDir::new().unwrap();
        let alice = manager_in(&temp, "alice.redb");
        let result = alice.decrypt(&SessionKeyId::new(), &[0u8; 64]);
        assert!(matches!(result, Err(CourierError::KeyExpired(_))));
    }

    #[tokio::test]
    async fn test_offline_establishment_uses_cached_bundle() {
        let temp = TempDir::new().unwrap();
        let (alice, _bob, conversation, relay) = two_party_setup(&temp);

        // First establishment caches bob's bundle
        alice
            .ensure_session(&conversation, &relay, &relay)
            .await
            .unwrap();

        // Relay goes unreachable; rotation still succeeds from cache
        *relay.offline.lock() = true;
        let rotated = alice.rotate_session(&conversation, &relay, &relay).await;
        assert!(rotated.is_ok());
    }

    #[tokio::test]
    async fn test_older_proposal_does_not_displace_newer_key() {
        let temp = TempDir::new().unwrap();
        let (alice, bob, conversation, relay) = two_party_setup(&temp);
        relay
            .bundles
            .lock()
            .insert(alice.peer_id(), alice.public_bundle());

        let current = alice
            .ensure_session(&conversation, &relay, &relay)
            .await
            .unwrap();

        // A proposal dated before the active key arrives late
        let stale_key = PayloadCrypto::generate_key();
        let stale = SessionProposal::build(
            conversation.id,
            bob.peer_id(),
            &stale_key,
            &[alice.public_bundle(), bob.public_bundle()],
            current.created_at - 1_000,
            current.created_at - 1_000 + WEEK_MS,
        )
        .unwrap();

        alice.accept_proposal(&stale).unwrap();
        let active = alice.active_session(&conversation.id).unwrap().unwrap();
        assert_eq!(active.id, current.id);

        // The stale key is retained superseded, so ciphertexts under it
        // still drain rather than reporting KeyExpired
        bob.accept_proposal(&stale).unwrap();
        let under_stale = bob.encrypt(&stale.key_id, b"late").unwrap();
        assert_eq!(alice.decrypt(&stale.key_id, &under_stale).unwrap(), b"late");
    }
}
