//! Durable key material store, physically separate from the message ledger
//!
//! Holds the device identity keypair, symmetric session keys, and cached
//! peer key bundles in its own redb database file. The message ledger never
//! sees key bytes, so a dump of the message store alone discloses nothing.

use crate::error::CourierError;
use crate::identity::{DeviceKeypair, PublicKeyBundle};
use crate::types::{ConversationId, SessionKeyId};

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroize;

// Table definitions
const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const ACTIVE_SESSIONS_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("active_sessions");
const PEER_BUNDLES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peer_bundles");

/// Identity storage key (one identity per device)
const IDENTITY_KEY: &str = "device_identity";

/// A symmetric session key with its validity window.
///
/// `superseded_at` is set when the key is rotated out; the record is then
/// retained only long enough to drain in-flight ciphertexts before
/// [`KeyStore::purge_superseded`] erases it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Key identifier, referenced by conversations and message records
    pub id: SessionKeyId,
    /// Conversation the key belongs to
    pub conversation_id: ConversationId,
    /// The 32-byte symmetric key
    pub key: [u8; 32],
    /// Unix timestamp in milliseconds of negotiation
    pub created_at: i64,
    /// Unix timestamp in milliseconds after which the key must rotate
    pub expires_at: i64,
    /// Set when a newer key replaced this one
    pub superseded_at: Option<i64>,
}

impl SessionRecord {
    /// Whether this key may encrypt new messages at `now`
    pub fn is_active_at(&self, now: i64) -> bool {
        self.superseded_at.is_none() && now < self.expires_at
    }
}

impl Drop for SessionRecord {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Key store backed by redb.
///
/// All mutations commit before returning.
#[derive(Clone)]
pub struct KeyStore {
    db: Arc<RwLock<Database>>,
}

impl KeyStore {
    /// Open or create the key store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CourierError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(ACTIVE_SESSIONS_TABLE)?;
            let _ = write_txn.open_table(PEER_BUNDLES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist the device identity keypair.
    pub fn save_identity(&self, keypair: &DeviceKeypair) -> Result<(), CourierError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            let mut data = keypair.to_bytes();
            table.insert(IDENTITY_KEY, data.as_slice())?;
            data.zeroize();
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the device identity keypair, if one exists.
    pub fn load_identity(&self) -> Result<Option<DeviceKeypair>, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(IDENTITY_KEY)? {
            Some(v) => Ok(Some(DeviceKeypair::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    /// Check if a device identity exists.
    pub fn has_identity(&self) -> Result<bool, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;
        Ok(table.get(IDENTITY_KEY)?.is_some())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Session Key Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a session record, keyed by its key id.
    pub fn save_session(&self, record: &SessionRecord) -> Result<(), CourierError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let mut data = postcard::to_allocvec(record)
                .map_err(|e| CourierError::Serialization(e.to_string()))?;
            let key = record.id.to_string();
            table.insert(key.as_str(), data.as_slice())?;
            data.zeroize();
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a session record by key id.
    pub fn load_session(&self, id: &SessionKeyId) -> Result<Option<SessionRecord>, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        let key = id.to_string();

        match table.get(key.as_str())? {
            Some(v) => {
                let record: SessionRecord = postcard::from_bytes(v.value())
                    .map_err(|e| CourierError::Corrupt(format!("session record: {}", e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Mark a conversation's active session key.
    pub fn set_active(
        &self,
        conversation_id: &ConversationId,
        key_id: &SessionKeyId,
    ) -> Result<(), CourierError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ACTIVE_SESSIONS_TABLE)?;
            let conv = conversation_id.to_string();
            let key = key_id.to_string();
            table.insert(conv.as_str(), key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a conversation's active session record, if any.
    pub fn active_session(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<SessionRecord>, CourierError> {
        let key_id = {
            let db = self.db.read();
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(ACTIVE_SESSIONS_TABLE)?;
            let conv = conversation_id.to_string();
            match table.get(conv.as_str())? {
                Some(v) => Some(
                    SessionKeyId::from_string(v.value())
                        .map_err(|e| CourierError::Corrupt(format!("active key id: {}", e)))?,
                ),
                None => None,
            }
        };

        match key_id {
            Some(id) => self.load_session(&id),
            None => Ok(None),
        }
    }

    /// Mark the conversation's active key as superseded at `at`.
    ///
    /// The record stays in the store (for draining in-flight ciphertexts)
    /// until [`purge_superseded`](Self::purge_superseded) removes it.
    pub fn supersede_active(
        &self,
        conversation_id: &ConversationId,
        at: i64,
    ) -> Result<Option<SessionKeyId>, CourierError> {
        let Some(mut record) = self.active_session(conversation_id)? else {
            return Ok(None);
        };

        record.superseded_at = Some(at);
        self.save_session(&record)?;

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ACTIVE_SESSIONS_TABLE)?;
            let conv = conversation_id.to_string();
            table.remove(conv.as_str())?;
        }
        write_txn.commit()?;
        Ok(Some(record.id))
    }

    /// All session records for a conversation (active and superseded).
    pub fn sessions_for(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<SessionRecord>, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: SessionRecord = postcard::from_bytes(value.value())
                .map_err(|e| CourierError::Corrupt(format!("session record: {}", e)))?;
            if record.conversation_id == *conversation_id {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Erase superseded sessions whose retention window has elapsed.
    ///
    /// Returns the number of records removed.
    pub fn purge_superseded(&self, now: i64, retention_millis: i64) -> Result<usize, CourierError> {
        let expired: Vec<String> = {
            let db = self.db.read();
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let record: SessionRecord = postcard::from_bytes(value.value())
                    .map_err(|e| CourierError::Corrupt(format!("session record: {}", e)))?;
                if let Some(superseded_at) = record.superseded_at {
                    if now >= superseded_at + retention_millis {
                        ids.push(key.value().to_string());
                    }
                }
            }
            ids
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            for id in &expired {
                table.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(expired.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peer Bundle Cache
    // ═══════════════════════════════════════════════════════════════════════

    /// Cache a resolved peer key bundle for offline session establishment.
    pub fn cache_peer_bundle(
        &self,
        peer: &crate::types::PeerId,
        bundle: &PublicKeyBundle,
    ) -> Result<(), CourierError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PEER_BUNDLES_TABLE)?;
            let data = serde_json::to_vec(bundle)
                .map_err(|e| CourierError::Serialization(e.to_string()))?;
            table.insert(peer.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a cached peer key bundle.
    pub fn cached_peer_bundle(
        &self,
        peer: &crate::types::PeerId,
    ) -> Result<Option<PublicKeyBundle>, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEER_BUNDLES_TABLE)?;

        match table.get(peer.as_str())? {
            Some(v) => {
                let bundle: PublicKeyBundle = serde_json::from_slice(v.value())
                    .map_err(|e| CourierError::Corrupt(format!("peer bundle: {}", e)))?;
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }
}
