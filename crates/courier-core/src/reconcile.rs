//! Reconciler: merges the local outbox and the remote stream into one
//! per-conversation ordered timeline
//!
//! The reconciler owns no persistent state. It reads and mutates the
//! ledger, deduplicates on `clientMessageId`, and is the sole authority on
//! ordering: relay-assigned server positions order the timeline, and the
//! per-conversation cursor only ever advances to the highest *contiguous*
//! position merged so far. A gap (position 5 arriving before 4) holds the
//! cursor until the gap fills, which bounds the catch-up pull to exactly
//! the missing range after a reconnect.
//!
//! Writes are serialized per conversation: one merge mutates a
//! conversation's records and cursor at a time.

use crate::error::{CourierError, CourierResult};
use crate::events::EngineEvent;
use crate::relay::{DeliveryReceipt, Envelope, WireFrame};
use crate::session::SessionManager;
use crate::storage::Ledger;
use crate::types::{Conversation, ConversationId, DeliveryState, MessageRecord};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

/// Merges receipts and remote envelopes into the ledger.
pub struct Reconciler {
    ledger: Ledger,
    sessions: Arc<SessionManager>,
    event_tx: broadcast::Sender<EngineEvent>,
    /// Per-conversation merge locks (one outstanding mutation at a time)
    merge_locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl Reconciler {
    /// Create a reconciler over the ledger and session manager.
    pub fn new(
        ledger: Ledger,
        sessions: Arc<SessionManager>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            ledger,
            sessions,
            event_tx,
            merge_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one live-channel frame.
    pub async fn apply_frame(&self, frame: WireFrame) -> CourierResult<()> {
        match frame {
            WireFrame::Message(envelope) => self.apply_remote(&envelope).await,
            WireFrame::Receipt(receipt) => self.apply_receipt(&receipt).await,
            WireFrame::SessionKey(proposal) => {
                let conversation_id = proposal.conversation_id;
                let record = self.sessions.accept_proposal(&proposal)?;
                match self.ledger.load_conversation(&conversation_id)? {
                    Some(mut conversation) => {
                        conversation.active_session = Some(record.id);
                        self.ledger.save_conversation(&conversation)?;
                    }
                    None => {
                        // First exchange from this peer: bootstrap the
                        // conversation from the proposal's recipient set
                        let conversation = Conversation {
                            id: conversation_id,
                            participants: proposal
                                .sealed_keys
                                .iter()
                                .map(|sk| sk.recipient.clone())
                                .collect(),
                            active_session: Some(record.id),
                            created_at: proposal.created_at,
                        };
                        self.ledger.save_conversation(&conversation)?;
                        debug!(%conversation_id, "Bootstrapped conversation from proposal");
                    }
                }
                self.emit(EngineEvent::SessionEstablished {
                    conversation_id,
                    key_id: record.id,
                });
                Ok(())
            }
        }
    }

    /// Apply a delivery receipt for a locally authored message.
    ///
    /// Transitions `Pending`/`Sent` to `Acknowledged`, records the assigned
    /// position, and advances the cursor if the position is contiguous.
    /// Duplicate receipts are idempotent.
    pub async fn apply_receipt(&self, receipt: &DeliveryReceipt) -> CourierResult<()> {
        let lock = self.merge_lock(receipt.conversation_id).await;
        let _guard = lock.lock().await;

        let Some(record) = self.ledger.load_message(&receipt.client_message_id)? else {
            // A receipt for a message this ledger never authored (another
            // device's send); the fanned-back envelope will carry it.
            debug!(client_message_id = %receipt.client_message_id,
                   "Receipt for unknown message, ignoring");
            return Ok(());
        };

        if record.state == DeliveryState::Acknowledged
            && record.server_position == Some(receipt.server_position)
        {
            return Ok(());
        }

        self.ledger.mark_state(
            &receipt.client_message_id,
            DeliveryState::Acknowledged,
            Some(receipt.server_position),
        )?;
        self.advance_cursor_contiguous(&receipt.conversation_id)?;

        self.emit(EngineEvent::MessageStateChanged {
            conversation_id: receipt.conversation_id,
            message_id: receipt.client_message_id,
            state: DeliveryState::Acknowledged,
        });
        // Acknowledgment resolves the entry's provisional timeline slot
        self.emit(EngineEvent::TimelineUpdated {
            conversation_id: receipt.conversation_id,
            merged: 1,
        });
        Ok(())
    }

    /// Merge one remote envelope.
    ///
    /// A `clientMessageId` already present locally is a self-echo (the
    /// relay fans a sender's own messages back): only the server position
    /// is attached. Anything else is appended in `Acknowledged` state after
    /// its ciphertext authenticates; ciphertext that fails authentication
    /// is preserved in `Failed` state rather than silently dropped.
    pub async fn apply_remote(&self, envelope: &Envelope) -> CourierResult<()> {
        let Some(position) = envelope.server_position else {
            return Err(CourierError::InvalidOperation(format!(
                "remote envelope {} carries no server position",
                envelope.client_message_id
            )));
        };

        let lock = self.merge_lock(envelope.conversation_id).await;
        let _guard = lock.lock().await;

        if self.ledger.contains_message(&envelope.client_message_id)? {
            // Self-echo or duplicate delivery: attach the position, keep
            // the ciphertext and everything else untouched
            self.ledger.mark_state(
                &envelope.client_message_id,
                DeliveryState::Acknowledged,
                Some(position),
            )?;
            self.advance_cursor_contiguous(&envelope.conversation_id)?;
            debug!(client_message_id = %envelope.client_message_id, position,
                   "Deduplicated remote envelope");
            self.emit(EngineEvent::TimelineUpdated {
                conversation_id: envelope.conversation_id,
                merged: 1,
            });
            return Ok(());
        }

        // Authenticate before merging; the plaintext itself is discarded
        // here and re-derived on read, never persisted
        let state = match self
            .sessions
            .decrypt(&envelope.key_id, &envelope.ciphertext)
        {
            Ok(_plaintext) => DeliveryState::Acknowledged,
            Err(CourierError::KeyExpired(_)) => {
                // The key is gone; the entry still occupies its canonical
                // slot and its bytes are kept for a later renegotiation
                warn!(conversation_id = %envelope.conversation_id,
                      key_id = %envelope.key_id,
                      "Remote envelope references an unretained key");
                self.emit(EngineEvent::SyncError {
                    conversation_id: Some(envelope.conversation_id),
                    message: format!(
                        "session key {} expired; renegotiation required",
                        envelope.key_id
                    ),
                });
                DeliveryState::Acknowledged
            }
            Err(CourierError::AuthenticationFailed(reason)) => {
                warn!(conversation_id = %envelope.conversation_id,
                      client_message_id = %envelope.client_message_id,
                      "Remote ciphertext failed authentication: {}", reason);
                self.emit(EngineEvent::SyncError {
                    conversation_id: Some(envelope.conversation_id),
                    message: format!(
                        "message {} failed authentication",
                        envelope.client_message_id
                    ),
                });
                DeliveryState::Failed
            }
            Err(e) => return Err(e),
        };

        let record = MessageRecord {
            id: envelope.client_message_id,
            conversation_id: envelope.conversation_id,
            sender: envelope.sender_id.clone(),
            ciphertext: envelope.ciphertext.clone(),
            key_id: envelope.key_id,
            created_at: envelope.client_timestamp,
            state,
            server_position: Some(position),
            attempts: 0,
            last_attempt_at: None,
        };
        self.ledger.append(&record)?;
        self.advance_cursor_contiguous(&envelope.conversation_id)?;

        self.emit(EngineEvent::TimelineUpdated {
            conversation_id: envelope.conversation_id,
            merged: 1,
        });
        Ok(())
    }

    /// Advance the cursor across every contiguous position now present.
    ///
    /// Holding at the last contiguous position keeps the watermark honest
    /// through gaps; once position `cursor + 1` lands, the cursor jumps
    /// over the whole filled run in one step.
    fn advance_cursor_contiguous(&self, conversation_id: &ConversationId) -> CourierResult<u64> {
        let mut cursor = self.ledger.cursor(conversation_id)?;
        let positions = self.ledger.positions_after(conversation_id, cursor)?;

        for position in positions {
            if position == cursor + 1 {
                cursor = position;
            } else {
                break;
            }
        }

        self.ledger.advance_cursor(conversation_id, cursor)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn merge_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.merge_locks.lock().await;
        locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{KeyStore, SessionRecord};
    use crate::types::{now_millis, MessageBody, MessageId, PeerId, SessionKeyId};
    use tempfile::TempDir;

    const WEEK_MS: i64 = 7 * 24 * 3600 * 1000;
    const DAY_MS: i64 = 24 * 3600 * 1000;

    struct Fixture {
        ledger: Ledger,
        sessions: Arc<SessionManager>,
        reconciler: Reconciler,
        events: broadcast::Receiver<EngineEvent>,
        conversation_id: ConversationId,
        key_id: SessionKeyId,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path().join("ledger.redb")).unwrap();
        let keystore = KeyStore::new(temp.path().join("keys.redb")).unwrap();
        let sessions =
            Arc::new(SessionManager::new(keystore.clone(), WEEK_MS, DAY_MS).unwrap());

        // Install a session directly; establishment is covered elsewhere
        let conversation_id = ConversationId::new();
        let now = now_millis();
        let record = SessionRecord {
            id: SessionKeyId::new(),
            conversation_id,
            key: [7u8; 32],
            created_at: now,
            expires_at: now + WEEK_MS,
            superseded_at: None,
        };
        keystore.save_session(&record).unwrap();
        keystore.set_active(&conversation_id, &record.id).unwrap();

        let (event_tx, events) = broadcast::channel(64);
        let reconciler = Reconciler::new(ledger.clone(), sessions.clone(), event_tx);

        Fixture {
            ledger,
            sessions,
            reconciler,
            events,
            conversation_id,
            key_id: record.id,
            _temp: temp,
        }
    }

    fn remote_envelope(fx: &Fixture, position: u64, sender: &str) -> Envelope {
        let body = MessageBody::text(format!("message at {}", position));
        let ciphertext = fx
            .sessions
            .encrypt(&fx.key_id, &body.to_bytes().unwrap())
            .unwrap();
        Envelope {
            conversation_id: fx.conversation_id,
            sender_id: PeerId::from_string(sender),
            ciphertext,
            key_id: fx.key_id,
            client_message_id: MessageId::new(),
            client_timestamp: now_millis(),
            server_position: Some(position),
        }
    }

    fn local_pending(fx: &Fixture, body: &str) -> MessageRecord {
        let plaintext = MessageBody::text(body).to_bytes().unwrap();
        let ciphertext = fx.sessions.encrypt(&fx.key_id, &plaintext).unwrap();
        let record = MessageRecord::new_outbound(
            fx.conversation_id,
            PeerId::from_string("peer-self"),
            ciphertext,
            fx.key_id,
        );
        fx.ledger.append(&record).unwrap();
        record
    }

    #[tokio::test]
    async fn test_receipt_acknowledges_pending() {
        let fx = fixture();
        let record = local_pending(&fx, "hi");

        fx.reconciler
            .apply_receipt(&DeliveryReceipt {
                conversation_id: fx.conversation_id,
                client_message_id: record.id,
                server_position: 1,
            })
            .await
            .unwrap();

        let loaded = fx.ledger.load_message(&record.id).unwrap().unwrap();
        assert_eq!(loaded.state, DeliveryState::Acknowledged);
        assert_eq!(loaded.server_position, Some(1));
        assert_eq!(fx.ledger.cursor(&fx.conversation_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_receipt_is_idempotent() {
        let fx = fixture();
        let record = local_pending(&fx, "hi");
        let receipt = DeliveryReceipt {
            conversation_id: fx.conversation_id,
            client_message_id: record.id,
            server_position: 1,
        };

        fx.reconciler.apply_receipt(&receipt).await.unwrap();
        fx.reconciler.apply_receipt(&receipt).await.unwrap();

        let timeline = fx.ledger.timeline(&fx.conversation_id, 0).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(fx.ledger.cursor(&fx.conversation_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_receipt_for_unknown_message_ignored() {
        let fx = fixture();
        let result = fx
            .reconciler
            .apply_receipt(&DeliveryReceipt {
                conversation_id: fx.conversation_id,
                client_message_id: MessageId::new(),
                server_position: 5,
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(fx.ledger.cursor(&fx.conversation_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_envelope_appends_acknowledged() {
        let fx = fixture();
        let envelope = remote_envelope(&fx, 1, "peer-joy");

        fx.reconciler.apply_remote(&envelope).await.unwrap();

        let timeline = fx.ledger.timeline(&fx.conversation_id, 0).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].state, DeliveryState::Acknowledged);
        assert_eq!(timeline[0].server_position, Some(1));
        assert_eq!(timeline[0].id, envelope.client_message_id);
    }

    #[tokio::test]
    async fn test_self_echo_deduplicates() {
        let fx = fixture();
        let record = local_pending(&fx, "echo me");

        // The relay fans our own message back with its assigned position
        let echo = Envelope {
            conversation_id: fx.conversation_id,
            sender_id: record.sender.clone(),
            ciphertext: record.ciphertext.clone(),
            key_id: record.key_id,
            client_message_id: record.id,
            client_timestamp: record.created_at,
            server_position: Some(1),
        };
        fx.reconciler.apply_remote(&echo).await.unwrap();

        let timeline = fx.ledger.timeline(&fx.conversation_id, 0).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].state, DeliveryState::Acknowledged);
        assert_eq!(timeline[0].server_position, Some(1));
    }

    #[tokio::test]
    async fn test_same_id_twice_never_duplicates_timeline() {
        let fx = fixture();
        let envelope = remote_envelope(&fx, 1, "peer-joy");

        fx.reconciler.apply_remote(&envelope).await.unwrap();
        fx.reconciler.apply_remote(&envelope).await.unwrap();

        let timeline = fx.ledger.timeline(&fx.conversation_id, 0).unwrap();
        assert_eq!(timeline.len(), 1);
    }

    #[tokio::test]
    async fn test_gap_holds_cursor_until_filled() {
        let fx = fixture();

        // Positions 1, 2, then 5 and 4: cursor must hold at 2
        for position in [1u64, 2, 5, 4] {
            let envelope = remote_envelope(&fx, position, "peer-joy");
            fx.reconciler.apply_remote(&envelope).await.unwrap();
        }
        assert_eq!(fx.ledger.cursor(&fx.conversation_id).unwrap(), 2);

        // Position 3 fills the gap: cursor jumps to 5 in one step
        let envelope = remote_envelope(&fx, 3, "peer-joy");
        fx.reconciler.apply_remote(&envelope).await.unwrap();
        assert_eq!(fx.ledger.cursor(&fx.conversation_id).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_out_of_order_arrival_orders_by_position() {
        let fx = fixture();

        let second = remote_envelope(&fx, 2, "peer-joy");
        let first = remote_envelope(&fx, 1, "peer-peace");
        fx.reconciler.apply_remote(&second).await.unwrap();
        fx.reconciler.apply_remote(&first).await.unwrap();

        let timeline = fx.ledger.timeline(&fx.conversation_id, 0).unwrap();
        let positions: Vec<_> = timeline.iter().filter_map(|r| r.server_position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(timeline[0].id, first.client_message_id);
    }

    #[tokio::test]
    async fn test_tampered_remote_preserved_as_failed() {
        let fx = fixture();
        let mut envelope = remote_envelope(&fx, 1, "peer-joy");
        let original_bytes = {
            let last = envelope.ciphertext.len() - 1;
            envelope.ciphertext[last] ^= 0xFF;
            envelope.ciphertext.clone()
        };

        fx.reconciler.apply_remote(&envelope).await.unwrap();

        // Never silently dropped: the raw bytes survive in Failed state
        let record = fx
            .ledger
            .load_message(&envelope.client_message_id)
            .unwrap()
            .unwrap();
        assert_eq!(record.state, DeliveryState::Failed);
        assert_eq!(record.ciphertext, original_bytes);
    }

    #[tokio::test]
    async fn test_expired_key_surfaces_and_merges() {
        let fx = fixture();

        let mut envelope = remote_envelope(&fx, 1, "peer-joy");
        envelope.key_id = SessionKeyId::new(); // a key we never had

        let mut events = fx.events;

        fx.reconciler.apply_remote(&envelope).await.unwrap();

        // The entry occupies its canonical slot regardless
        assert_eq!(fx.ledger.cursor(&fx.conversation_id).unwrap(), 1);

        // And the renegotiation need was surfaced, not swallowed
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::SyncError { message, .. } = event {
                assert!(message.contains("renegotiation"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_remote_without_position_rejected() {
        let fx = fixture();
        let mut envelope = remote_envelope(&fx, 1, "peer-joy");
        envelope.server_position = None;

        let result = fx.reconciler.apply_remote(&envelope).await;
        assert!(matches!(result, Err(CourierError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_cursor_monotone_through_duplicates_and_reordering() {
        let fx = fixture();
        let envelopes: Vec<Envelope> =
            (1..=4).map(|p| remote_envelope(&fx, p, "peer-joy")).collect();

        // Deliver out of order with duplicates, tracking the watermark
        let order = [2usize, 0, 0, 3, 1, 2, 3];
        let mut last_cursor = 0;
        for index in order {
            fx.reconciler.apply_remote(&envelopes[index]).await.unwrap();
            let cursor = fx.ledger.cursor(&fx.conversation_id).unwrap();
            assert!(cursor >= last_cursor, "cursor regressed");
            last_cursor = cursor;
        }
        assert_eq!(last_cursor, 4);
    }
}
