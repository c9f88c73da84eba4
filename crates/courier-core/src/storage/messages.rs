//! Message records: append-only log, delivery state, outbox and timeline views

use crate::error::CourierError;
use crate::types::{
    ConversationId, DeliveryState, MessageId, MessageRecord, OutboxEntry,
};
use redb::{ReadableTable, TableDefinition};

use super::Ledger;

/// Table for message records (key: message id string, value: serialized record)
pub(crate) const MESSAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

impl Ledger {
    // ═══════════════════════════════════════════════════════════════════════
    // Message Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a message record to the log.
    ///
    /// The record's ciphertext is immutable from here on; only delivery
    /// state, server position, and attempt bookkeeping may change later.
    /// Appending an id that already exists is refused: the reconciler
    /// deduplicates before appending.
    pub fn append(&self, record: &MessageRecord) -> Result<MessageId, CourierError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(MESSAGES_TABLE)?;
            let key = record.id.to_string();
            if table.get(key.as_str())?.is_some() {
                return Err(CourierError::InvalidOperation(format!(
                    "message {} already appended",
                    record.id
                )));
            }
            let data = serde_json::to_vec(record)
                .map_err(|e| CourierError::Serialization(e.to_string()))?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        Self::commit(write_txn)?;
        Ok(record.id)
    }

    /// Load a message record by id.
    pub fn load_message(&self, id: &MessageId) -> Result<Option<MessageRecord>, CourierError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MESSAGES_TABLE)?;
        let key = id.to_string();

        match table.get(key.as_str())? {
            Some(v) => {
                let record: MessageRecord = serde_json::from_slice(v.value())
                    .map_err(|e| CourierError::Corrupt(format!("message record: {}", e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Transition a message's delivery state, optionally attaching the
    /// relay-assigned position.
    ///
    /// Fails with `NotFound` if the id is unknown. The ciphertext is never
    /// touched.
    pub fn mark_state(
        &self,
        id: &MessageId,
        new_state: DeliveryState,
        server_position: Option<u64>,
    ) -> Result<(), CourierError> {
        self.update_message(id, |record| {
            record.state = new_state;
            if server_position.is_some() {
                record.server_position = server_position;
            }
        })
    }

    /// Record a transmission attempt: bumps the counter and stamps the time.
    ///
    /// This is the scheduler's persisted backoff state; it survives process
    /// restarts.
    pub fn record_attempt(&self, id: &MessageId, at: i64) -> Result<(), CourierError> {
        self.update_message(id, |record| {
            record.attempts = record.attempts.saturating_add(1);
            record.last_attempt_at = Some(at);
        })
    }

    /// Reset attempt bookkeeping and return the message to `Pending`.
    ///
    /// Used by the explicit resend of a `Failed` message.
    pub fn reset_attempts(&self, id: &MessageId) -> Result<(), CourierError> {
        self.update_message(id, |record| {
            record.state = DeliveryState::Pending;
            record.attempts = 0;
            record.last_attempt_at = None;
        })
    }

    /// Read-modify-write a single record inside one transaction.
    fn update_message(
        &self,
        id: &MessageId,
        mutate: impl FnOnce(&mut MessageRecord),
    ) -> Result<(), CourierError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(MESSAGES_TABLE)?;
            let key = id.to_string();

            let mut record: MessageRecord = match table.get(key.as_str())? {
                Some(v) => serde_json::from_slice(v.value())
                    .map_err(|e| CourierError::Corrupt(format!("message record: {}", e)))?,
                None => return Err(CourierError::NotFound(id.to_string())),
            };

            mutate(&mut record);

            let data = serde_json::to_vec(&record)
                .map_err(|e| CourierError::Serialization(e.to_string()))?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        Self::commit(write_txn)
    }

    /// The conversation's outbox: `Pending` records ordered by creation
    /// time.
    ///
    /// Finite and restartable; callers re-query after any mutation.
    pub fn pending_outbox(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<OutboxEntry>, CourierError> {
        let mut pending: Vec<MessageRecord> = self
            .messages_for(conversation_id)?
            .into_iter()
            .filter(|r| r.state.awaits_transmission())
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.id.0));
        Ok(pending.into_iter().map(|message| OutboxEntry { message }).collect())
    }

    /// The merged timeline after a cursor position.
    ///
    /// Acknowledged messages order by server position; local entries whose
    /// acknowledgment is still outstanding sort provisionally by creation
    /// time at the tail and re-sort once their position resolves.
    pub fn timeline(
        &self,
        conversation_id: &ConversationId,
        after_cursor: u64,
    ) -> Result<Vec<MessageRecord>, CourierError> {
        let mut records: Vec<MessageRecord> = self
            .messages_for(conversation_id)?
            .into_iter()
            .filter(|r| match r.server_position {
                Some(position) => position > after_cursor,
                None => true,
            })
            .collect();
        records.sort_by_key(|r| (r.server_position.unwrap_or(u64::MAX), r.created_at, r.id.0));
        Ok(records)
    }

    /// Whether a message with this id already exists (reconciler dedup).
    pub fn contains_message(&self, id: &MessageId) -> Result<bool, CourierError> {
        Ok(self.load_message(id)?.is_some())
    }

    /// Acknowledged server positions above `cursor`, ascending.
    ///
    /// The reconciler walks these to advance the cursor to the maximum
    /// contiguous position.
    pub fn positions_after(
        &self,
        conversation_id: &ConversationId,
        cursor: u64,
    ) -> Result<Vec<u64>, CourierError> {
        let mut positions: Vec<u64> = self
            .messages_for(conversation_id)?
            .into_iter()
            .filter_map(|r| r.server_position)
            .filter(|p| *p > cursor)
            .collect();
        positions.sort_unstable();
        positions.dedup();
        Ok(positions)
    }

    /// All records for a conversation, unordered.
    pub(crate) fn messages_for(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageRecord>, CourierError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MESSAGES_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: MessageRecord = serde_json::from_slice(value.value())
                .map_err(|e| CourierError::Corrupt(format!("message record: {}", e)))?;
            if record.conversation_id == *conversation_id {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Keys of all records in a conversation (used by conversation delete).
    pub(crate) fn message_ids_for(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<String>, CourierError> {
        Ok(self
            .messages_for(conversation_id)?
            .into_iter()
            .map(|r| r.id.to_string())
            .collect())
    }
}
