//! Sync cursors: per-conversation merge watermarks

use crate::error::CourierError;
use crate::types::{ConversationId, SyncCursor};
use redb::{ReadableTable, TableDefinition};

use super::Ledger;

/// Table for sync cursors (key: conversation id string, value: position)
pub(crate) const CURSORS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("cursors");

impl Ledger {
    // ═══════════════════════════════════════════════════════════════════════
    // Cursor Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// The conversation's cursor: last contiguous server position merged.
    ///
    /// Returns 0 when nothing has been merged yet.
    pub fn cursor(&self, conversation_id: &ConversationId) -> Result<u64, CourierError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CURSORS_TABLE)?;
        let key = conversation_id.to_string();

        Ok(table.get(key.as_str())?.map(|v| v.value()).unwrap_or(0))
    }

    /// Advance the cursor to `position`.
    ///
    /// Monotonic: a position at or below the stored value is a no-op.
    /// Returns the effective cursor after the call.
    pub fn advance_cursor(
        &self,
        conversation_id: &ConversationId,
        position: u64,
    ) -> Result<u64, CourierError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        let effective = {
            let mut table = write_txn.open_table(CURSORS_TABLE)?;
            let key = conversation_id.to_string();
            let current = table.get(key.as_str())?.map(|v| v.value()).unwrap_or(0);

            if position > current {
                table.insert(key.as_str(), position)?;
                position
            } else {
                current
            }
        };
        Self::commit(write_txn)?;
        Ok(effective)
    }

    /// Snapshot all cursors (used by the scheduler's catch-up pull).
    pub fn cursors(&self) -> Result<Vec<SyncCursor>, CourierError> {
        let conversations = self.list_conversations()?;
        let mut cursors = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            cursors.push(SyncCursor {
                conversation_id: conversation.id,
                position: self.cursor(&conversation.id)?,
            });
        }
        Ok(cursors)
    }
}
