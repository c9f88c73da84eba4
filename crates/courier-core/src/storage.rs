//! The local ledger: durable message log, outbox view, and sync cursors
//!
//! Backed by redb for ACID persistence. Every mutation commits before the
//! call returns (write-ahead semantics), so a crash mid-sync never loses an
//! acknowledged state transition. Only ciphertext is stored; plaintext is
//! derived on read through the session manager and never persisted.
//!
//! redb serializes writers, which gives the ledger its required property
//! for free: at most one outstanding mutation at a time, per conversation
//! or otherwise.

use crate::error::CourierError;
use crate::types::{Conversation, ConversationId};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

// Submodules
mod cursors;
mod messages;

use cursors::CURSORS_TABLE;
use messages::MESSAGES_TABLE;

// Table definitions
const CONVERSATIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");

/// The ledger: exclusive owner of persisted messages, the outbox view, and
/// sync cursors.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<RwLock<Database>>,
}

impl Ledger {
    /// Open or create the ledger at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CourierError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CONVERSATIONS_TABLE)?;
            let _ = write_txn.open_table(MESSAGES_TABLE)?;
            let _ = write_txn.open_table(CURSORS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Commit a write transaction, classifying an out-of-space failure.
    pub(crate) fn commit(write_txn: redb::WriteTransaction) -> Result<(), CourierError> {
        write_txn.commit().map_err(|e| {
            let msg = e.to_string();
            if msg.contains("No space left") {
                CourierError::StorageFull(msg)
            } else {
                CourierError::Commit(e)
            }
        })
    }

    pub(crate) fn db(&self) -> &Arc<RwLock<Database>> {
        &self.db
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversation Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a conversation.
    ///
    /// If a conversation with the same ID already exists, it is overwritten
    /// (participant or session changes).
    pub fn save_conversation(&self, conversation: &Conversation) -> Result<(), CourierError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONVERSATIONS_TABLE)?;
            let data = serde_json::to_vec(conversation)
                .map_err(|e| CourierError::Serialization(e.to_string()))?;
            let key = conversation.id.to_string();
            table.insert(key.as_str(), data.as_slice())?;
        }
        Self::commit(write_txn)
    }

    /// Load a conversation by ID.
    pub fn load_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;
        let key = id.to_string();

        match table.get(key.as_str())? {
            Some(v) => {
                let conversation: Conversation = serde_json::from_slice(v.value())
                    .map_err(|e| CourierError::Corrupt(format!("conversation: {}", e)))?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    /// Load all conversations.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>, CourierError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;

        let mut conversations = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let conversation: Conversation = serde_json::from_slice(value.value())
                .map_err(|e| CourierError::Corrupt(format!("conversation: {}", e)))?;
            conversations.push(conversation);
        }
        conversations.sort_by_key(|c| c.created_at);
        Ok(conversations)
    }

    /// Delete a conversation and everything it owns: messages and cursor.
    ///
    /// Local-only; the relay is unaffected.
    pub fn delete_conversation(&self, id: &ConversationId) -> Result<(), CourierError> {
        let message_ids = self.message_ids_for(id)?;

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let key = id.to_string();
            let mut conversations = write_txn.open_table(CONVERSATIONS_TABLE)?;
            let mut messages = write_txn.open_table(MESSAGES_TABLE)?;
            let mut cursors = write_txn.open_table(CURSORS_TABLE)?;

            conversations.remove(key.as_str())?;
            cursors.remove(key.as_str())?;
            for message_id in &message_ids {
                messages.remove(message_id.as_str())?;
            }
        }
        Self::commit(write_txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DeliveryState, MessageRecord, PeerId, SessionKeyId,
    };
    use tempfile::TempDir;

    fn create_test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::new(temp_dir.path().join("ledger.redb")).unwrap();
        (ledger, temp_dir)
    }

    #[test]
    fn test_ledger_can_be_created() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::new(temp_dir.path().join("ledger.redb"));
        assert!(ledger.is_ok());
    }

    #[test]
    fn test_ledger_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/path/ledger.redb");
        assert!(Ledger::new(&path).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_save_and_load_conversation() {
        let (ledger, _temp) = create_test_ledger();

        let conversation = Conversation::new(vec![
            PeerId::from_string("peer-love"),
            PeerId::from_string("peer-joy"),
        ]);
        ledger.save_conversation(&conversation).unwrap();

        let loaded = ledger.load_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(loaded, conversation);
    }

    #[test]
    fn test_load_nonexistent_conversation() {
        let (ledger, _temp) = create_test_ledger();
        assert!(ledger
            .load_conversation(&ConversationId::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_list_conversations_sorted_by_creation() {
        let (ledger, _temp) = create_test_ledger();

        for _ in 0..3 {
            let conversation = Conversation::new(vec![PeerId::from_string("peer-love")]);
            ledger.save_conversation(&conversation).unwrap();
        }

        let conversations = ledger.list_conversations().unwrap();
        assert_eq!(conversations.len(), 3);
        assert!(conversations
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_delete_conversation_removes_owned_data() {
        let (ledger, _temp) = create_test_ledger();

        let conversation = Conversation::new(vec![PeerId::from_string("peer-love")]);
        ledger.save_conversation(&conversation).unwrap();

        let mut record = MessageRecord::new_outbound(
            conversation.id,
            PeerId::from_string("peer-love"),
            vec![1, 2, 3],
            SessionKeyId::new(),
        );
        record.state = DeliveryState::Acknowledged;
        record.server_position = Some(1);
        ledger.append(&record).unwrap();
        ledger.advance_cursor(&conversation.id, 1).unwrap();

        ledger.delete_conversation(&conversation.id).unwrap();

        assert!(ledger.load_conversation(&conversation.id).unwrap().is_none());
        assert!(ledger.load_message(&record.id).unwrap().is_none());
        assert_eq!(ledger.cursor(&conversation.id).unwrap(), 0);
    }
}
