//! CourierEngine - the primary entry point
//!
//! The engine wires the ledger, session manager, relay transport,
//! reconciler, and scheduler together and owns the long-lived tasks: one
//! consumer draining the live channel's incoming stream, one watcher
//! mirroring live-channel state into connectivity signals, and one task
//! per in-flight send attempt. Components coordinate through the ledger as
//! the single source of truth, not through task-to-task signalling.
//!
//! # Example
//!
//! ```ignore
//! use courier_core::{CourierEngine, EngineConfig, MessageBody};
//!
//! let engine = CourierEngine::new(EngineConfig::default()).await?;
//! engine.start()?;
//!
//! let conversation = engine.create_conversation(vec![peer]).await?;
//! engine.enqueue(conversation.id, MessageBody::text("hi")).await?;
//!
//! // Later, from the job runner:
//! engine.run_scheduled_sync().await?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{CourierError, CourierResult};
use crate::events::{EngineEvent, SyncStatus};
use crate::reconcile::Reconciler;
use crate::relay::{Envelope, LiveChannel, RelayTransport, RestClient, Transport};
use crate::scheduler::SyncScheduler;
use crate::session::{KeyDirectory, KeyStore, ProposalSink, SessionManager, SessionRecord};
use crate::storage::Ledger;
use crate::types::{
    now_millis, Conversation, ConversationId, DeliveryState, MessageBody, MessageId,
    MessageRecord, PeerId,
};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One timeline entry: the persisted record plus its decrypted body.
///
/// `body` is `None` when the ciphertext cannot currently be read (expired
/// key awaiting renegotiation, or preserved corrupt bytes).
#[derive(Debug, Clone)]
pub struct TimelineItem {
    /// The underlying ledger record
    pub message: MessageRecord,
    /// Decrypted payload, derived on read and never persisted
    pub body: Option<MessageBody>,
}

impl TimelineItem {
    /// The text content, if this is a readable text message
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Some(MessageBody::Text { text }) => Some(text),
            _ => None,
        }
    }
}

/// Outcome counters for one scheduled sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote envelopes merged by the pull phase
    pub pulled: usize,
    /// Outbox entries acknowledged this run
    pub sent: usize,
    /// Outbox entries that hit a fatal rejection this run
    pub failed: usize,
    /// Attempts the watchdog released from the in-flight set
    pub released: usize,
}

/// Main entry point: the offline-first encrypted sync engine.
#[derive(Clone)]
pub struct CourierEngine {
    config: EngineConfig,
    ledger: Ledger,
    sessions: Arc<SessionManager>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<SyncScheduler>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn KeyDirectory>,
    proposals: Arc<dyn ProposalSink>,
    event_tx: broadcast::Sender<EngineEvent>,
    live: Option<Arc<LiveChannel>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CourierEngine {
    /// Create an engine against a real relay, per the configuration.
    pub async fn new(config: EngineConfig) -> CourierResult<Self> {
        let live = Arc::new(LiveChannel::new(config.ws_url(), config.receipt_timeout()));
        let rest = RestClient::new(config.relay_url.as_str(), config.request_timeout())?;
        let transport: Arc<dyn Transport> =
            Arc::new(RelayTransport::new(live.clone(), rest.clone()));
        let directory: Arc<dyn KeyDirectory> = Arc::new(rest.clone());
        let proposals: Arc<dyn ProposalSink> = Arc::new(rest);

        Self::assemble(config, transport, directory, proposals, Some(live))
    }

    /// Create an engine over an injected transport (tests, embedding).
    pub fn with_transport(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn KeyDirectory>,
        proposals: Arc<dyn ProposalSink>,
    ) -> CourierResult<Self> {
        Self::assemble(config, transport, directory, proposals, None)
    }

    fn assemble(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn KeyDirectory>,
        proposals: Arc<dyn ProposalSink>,
        live: Option<Arc<LiveChannel>>,
    ) -> CourierResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        info!(data_dir = ?config.data_dir, "Initializing CourierEngine");

        let ledger = Ledger::new(config.data_dir.join("ledger.redb"))?;
        let keystore = KeyStore::new(config.data_dir.join("keys.redb"))?;
        let sessions = Arc::new(SessionManager::new(
            keystore,
            config.session_validity_millis,
            config.key_retention_millis,
        )?);

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let reconciler = Arc::new(Reconciler::new(
            ledger.clone(),
            sessions.clone(),
            event_tx.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            ledger.clone(),
            config.backoff,
            config.watchdog_millis,
        ));

        Ok(Self {
            config,
            ledger,
            sessions,
            reconciler,
            scheduler,
            transport,
            directory,
            proposals,
            event_tx,
            live,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Our device's peer id
    pub fn peer_id(&self) -> PeerId {
        self.sessions.peer_id()
    }

    /// The configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events (timeline updates, state changes,
    /// connectivity).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Current sync status
    pub fn status(&self) -> SyncStatus {
        match &self.live {
            Some(live) if live.is_connected() => SyncStatus::Online,
            _ if self.scheduler.is_online() => SyncStatus::Online,
            _ => SyncStatus::Offline,
        }
    }

    /// Our publishable public key bundle
    pub fn public_bundle(&self) -> crate::identity::PublicKeyBundle {
        self.sessions.public_bundle()
    }

    /// Publish our public key bundle to the relay's directory.
    pub async fn publish_identity(&self) -> CourierResult<()> {
        self.sessions
            .publish_identity(self.directory.as_ref())
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversations
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a conversation with the given participants.
    ///
    /// Our own peer id is added if absent. Session establishment is
    /// attempted eagerly so messages can be authored offline later; if the
    /// relay is unreachable the handshake is retried at first enqueue.
    pub async fn create_conversation(
        &self,
        mut participants: Vec<PeerId>,
    ) -> CourierResult<Conversation> {
        let me = self.peer_id();
        if !participants.contains(&me) {
            participants.push(me);
        }

        let mut conversation = Conversation::new(participants);
        self.ledger.save_conversation(&conversation)?;
        info!(conversation_id = %conversation.id, "Created conversation");

        match self
            .sessions
            .ensure_session(
                &conversation,
                self.directory.as_ref(),
                self.proposals.as_ref(),
            )
            .await
        {
            Ok(record) => {
                conversation.active_session = Some(record.id);
                self.ledger.save_conversation(&conversation)?;
                self.emit(EngineEvent::SessionEstablished {
                    conversation_id: conversation.id,
                    key_id: record.id,
                });
            }
            Err(e) => {
                debug!(conversation_id = %conversation.id,
                       "Deferred session establishment: {}", e);
            }
        }

        Ok(conversation)
    }

    /// Load a conversation or fail with `ConversationNotFound`.
    pub fn conversation(&self, id: &ConversationId) -> CourierResult<Conversation> {
        self.ledger
            .load_conversation(id)?
            .ok_or_else(|| CourierError::ConversationNotFound(id.to_string()))
    }

    /// All conversations, oldest first.
    pub fn list_conversations(&self) -> CourierResult<Vec<Conversation>> {
        self.ledger.list_conversations()
    }

    /// Delete a conversation and everything it owns. Local only; the relay
    /// is unaffected.
    pub fn delete_conversation(&self, id: &ConversationId) -> CourierResult<()> {
        self.ledger.delete_conversation(id)
    }

    /// Add a participant. The active session key is superseded immediately
    /// and a fresh one negotiated for the new membership.
    pub async fn add_participant(
        &self,
        conversation_id: &ConversationId,
        peer: PeerId,
    ) -> CourierResult<Conversation> {
        let mut conversation = self.conversation(conversation_id)?;
        if conversation.has_participant(&peer) {
            return Ok(conversation);
        }
        conversation.participants.push(peer);
        self.rotate_for_membership(conversation).await
    }

    /// Remove a participant; same key rotation rules as adding one.
    pub async fn remove_participant(
        &self,
        conversation_id: &ConversationId,
        peer: &PeerId,
    ) -> CourierResult<Conversation> {
        let mut conversation = self.conversation(conversation_id)?;
        if !conversation.has_participant(peer) {
            return Ok(conversation);
        }
        conversation.participants.retain(|p| p != peer);
        self.rotate_for_membership(conversation).await
    }

    /// Supersede the conversation's session key and negotiate a fresh one.
    ///
    /// User-triggered renegotiation: the response to an expired-key report
    /// from a peer, or a manual "refresh encryption".
    pub async fn rotate_session(&self, conversation_id: &ConversationId) -> CourierResult<()> {
        let mut conversation = self.conversation(conversation_id)?;
        let record = self
            .sessions
            .rotate_session(
                &conversation,
                self.directory.as_ref(),
                self.proposals.as_ref(),
            )
            .await?;
        conversation.active_session = Some(record.id);
        self.ledger.save_conversation(&conversation)?;
        self.emit(EngineEvent::SessionEstablished {
            conversation_id: conversation.id,
            key_id: record.id,
        });
        Ok(())
    }

    async fn rotate_for_membership(
        &self,
        mut conversation: Conversation,
    ) -> CourierResult<Conversation> {
        conversation.active_session = None;
        self.ledger.save_conversation(&conversation)?;

        match self
            .sessions
            .rotate_session(
                &conversation,
                self.directory.as_ref(),
                self.proposals.as_ref(),
            )
            .await
        {
            Ok(record) => {
                conversation.active_session = Some(record.id);
                self.ledger.save_conversation(&conversation)?;
                self.emit(EngineEvent::SessionEstablished {
                    conversation_id: conversation.id,
                    key_id: record.id,
                });
            }
            Err(e) => {
                // The old key is already superseded; negotiation resumes at
                // the next enqueue or scheduled sync
                warn!(conversation_id = %conversation.id,
                      "Membership rotation incomplete: {}", e);
                self.emit(EngineEvent::SyncError {
                    conversation_id: Some(conversation.id),
                    message: format!("session rotation pending: {}", e),
                });
            }
        }
        Ok(conversation)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Authoring
    // ═══════════════════════════════════════════════════════════════════════

    /// Enqueue a message for delivery.
    ///
    /// Encrypts against the conversation's session key, appends a durable
    /// `Pending` outbox record, and (when online) kicks off an immediate
    /// transmission attempt. Works fully offline once a session exists.
    pub async fn enqueue(
        &self,
        conversation_id: ConversationId,
        body: MessageBody,
    ) -> CourierResult<MessageId> {
        let conversation = self.conversation(&conversation_id)?;
        let session = self.obtain_session(&conversation).await?;

        let plaintext = body.to_bytes()?;
        let ciphertext = self.sessions.encrypt(&session.id, &plaintext)?;

        let record =
            MessageRecord::new_outbound(conversation_id, self.peer_id(), ciphertext, session.id);
        self.ledger.append(&record)?;
        debug!(conversation_id = %conversation_id, message_id = %record.id, "Enqueued message");

        self.emit(EngineEvent::MessageStateChanged {
            conversation_id,
            message_id: record.id,
            state: DeliveryState::Pending,
        });
        self.emit(EngineEvent::TimelineUpdated {
            conversation_id,
            merged: 1,
        });

        if self.scheduler.is_online() {
            self.spawn_attempt(record.id);
        }
        Ok(record.id)
    }

    /// Explicitly resend a `Failed` message.
    ///
    /// The ciphertext is reused unchanged (same id, idempotent at the
    /// relay). Refused with `KeyExpired` if the producing key is no longer
    /// retained; the message must be re-authored then.
    pub async fn resend_failed(&self, message_id: &MessageId) -> CourierResult<()> {
        let record = self
            .ledger
            .load_message(message_id)?
            .ok_or_else(|| CourierError::NotFound(message_id.to_string()))?;

        if record.state != DeliveryState::Failed {
            return Err(CourierError::InvalidOperation(format!(
                "message {} is {}, only failed messages can be resent",
                message_id, record.state
            )));
        }

        // The key must still be retained for recipients to stand a chance
        self.sessions.decrypt(&record.key_id, &record.ciphertext)?;

        self.ledger.reset_attempts(message_id)?;
        self.emit(EngineEvent::MessageStateChanged {
            conversation_id: record.conversation_id,
            message_id: *message_id,
            state: DeliveryState::Pending,
        });

        if self.scheduler.is_online() {
            self.spawn_attempt(*message_id);
        }
        Ok(())
    }

    /// A valid session, establishing or falling back as connectivity allows.
    async fn obtain_session(&self, conversation: &Conversation) -> CourierResult<SessionRecord> {
        match self
            .sessions
            .ensure_session(
                conversation,
                self.directory.as_ref(),
                self.proposals.as_ref(),
            )
            .await
        {
            Ok(record) => Ok(record),
            Err(e @ (CourierError::Transport(_) | CourierError::PeerKeyUnavailable(_))) => {
                // Offline: an expired-but-unsuperseded key still encrypts;
                // rotation happens at the next online sync
                match self.sessions.active_session(&conversation.id)? {
                    Some(record) => {
                        warn!(conversation_id = %conversation.id,
                              "Using stale session key offline, rotation deferred");
                        Ok(record)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reading
    // ═══════════════════════════════════════════════════════════════════════

    /// The merged timeline after a cursor position, bodies decrypted on
    /// read.
    pub fn timeline(
        &self,
        conversation_id: &ConversationId,
        after_cursor: u64,
    ) -> CourierResult<Vec<TimelineItem>> {
        let records = self.ledger.timeline(conversation_id, after_cursor)?;
        let mut items = Vec::with_capacity(records.len());
        for message in records {
            let body = match self.sessions.decrypt(&message.key_id, &message.ciphertext) {
                Ok(plaintext) => MessageBody::from_bytes(&plaintext).ok(),
                Err(e) => {
                    debug!(message_id = %message.id, "Timeline entry unreadable: {}", e);
                    None
                }
            };
            items.push(TimelineItem { message, body });
        }
        Ok(items)
    }

    /// The conversation's cursor (highest contiguous merged position).
    pub fn cursor(&self, conversation_id: &ConversationId) -> CourierResult<u64> {
        self.ledger.cursor(conversation_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync Driving
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the long-lived tasks: the live-channel consumer and, when the
    /// engine owns a live channel, the connectivity watcher.
    pub fn start(&self) -> CourierResult<()> {
        if let Some(mut incoming) = self.transport.subscribe() {
            let reconciler = self.reconciler.clone();
            let event_tx = self.event_tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(frame) = incoming.recv().await {
                    if let Err(e) = reconciler.apply_frame(frame).await {
                        warn!("Failed to apply incoming frame: {}", e);
                        let _ = event_tx.send(EngineEvent::SyncError {
                            conversation_id: None,
                            message: e.to_string(),
                        });
                    }
                }
                debug!("Incoming frame stream ended");
            });
            self.tasks.lock().push(handle);
        }

        if let Some(live) = &self.live {
            let mut watch = live.connection_watch();
            let engine = self.clone();
            let handle = tokio::spawn(async move {
                while watch.changed().await.is_ok() {
                    let online = *watch.borrow();
                    if engine.scheduler.notify_connectivity_changed(online) {
                        engine.emit(EngineEvent::ConnectivityChanged { online });
                    }
                    if online {
                        // Opportunistic catch-up right after reconnect
                        if let Err(e) = engine.run_sync(true).await {
                            warn!("Post-reconnect sync failed: {}", e);
                        }
                    }
                }
            });
            self.tasks.lock().push(handle);
        }

        Ok(())
    }

    /// External connectivity signal (OS network monitor, job runner).
    pub async fn notify_connectivity_changed(&self, online: bool) -> CourierResult<()> {
        if self.scheduler.notify_connectivity_changed(online) {
            self.emit(EngineEvent::ConnectivityChanged { online });
        }

        if online {
            if let Some(live) = &self.live {
                if let Err(e) = live.connect().await {
                    debug!("Live channel connect failed, staying on REST: {}", e);
                }
            }
            self.run_sync(true).await?;
        } else if let Some(live) = &self.live {
            live.close();
        }
        Ok(())
    }

    /// The scheduled-sync entry point for an external job runner.
    ///
    /// One pass: watchdog sweep, key hygiene, per-conversation delta pull
    /// from the cursor, expiry-driven key rotation, then due outbox
    /// transmissions in creation order.
    pub async fn run_scheduled_sync(&self) -> CourierResult<SyncReport> {
        self.run_sync(false).await
    }

    async fn run_sync(&self, connectivity_restored: bool) -> CourierResult<SyncReport> {
        let now = now_millis();
        let mut report = SyncReport {
            released: self.scheduler.watchdog_sweep(now).len(),
            ..Default::default()
        };

        self.sessions.sweep(now)?;

        // Known conversations, plus any the relay holds for us that we
        // have not seen yet (missed session fan-out while disconnected)
        let mut conversation_ids: Vec<ConversationId> = self
            .ledger
            .list_conversations()?
            .iter()
            .map(|c| c.id)
            .collect();
        match self
            .transport
            .list_remote_conversations(&self.peer_id())
            .await
        {
            Ok(remote) => {
                for id in remote {
                    if !conversation_ids.contains(&id) {
                        debug!(conversation_id = %id, "Discovered remote conversation");
                        conversation_ids.push(id);
                    }
                }
            }
            Err(e) if e.is_retriable() => {
                debug!("Conversation discovery deferred: {}", e);
            }
            Err(e) => {
                self.emit(EngineEvent::SyncError {
                    conversation_id: None,
                    message: e.to_string(),
                });
            }
        }

        for conversation_id in conversation_ids {
            // Pull phase: only the delta after the cursor
            let cursor = self.ledger.cursor(&conversation_id)?;
            match self.transport.pull_since(&conversation_id, cursor).await {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        match self.reconciler.apply_remote(&envelope).await {
                            Ok(()) => report.pulled += 1,
                            Err(e) => {
                                warn!(conversation_id = %conversation_id,
                                      "Failed to merge pulled envelope: {}", e);
                            }
                        }
                    }
                }
                Err(e) if e.is_retriable() => {
                    debug!(conversation_id = %conversation_id,
                           "Delta pull deferred: {}", e);
                }
                Err(e) => {
                    self.emit(EngineEvent::SyncError {
                        conversation_id: Some(conversation_id),
                        message: e.to_string(),
                    });
                }
            }

            // Rotation and sending only apply to conversations we are a
            // full member of locally
            let Some(conversation) = self.ledger.load_conversation(&conversation_id)? else {
                continue;
            };

            // Rotation check: an expired active key rotates during sync
            if let Some(active) = self.sessions.active_session(&conversation_id)? {
                if !active.is_active_at(now) {
                    if let Err(e) = self
                        .sessions
                        .ensure_session(
                            &conversation,
                            self.directory.as_ref(),
                            self.proposals.as_ref(),
                        )
                        .await
                    {
                        debug!(conversation_id = %conversation_id,
                               "Scheduled rotation deferred: {}", e);
                    }
                }
            }

            // Send phase: due entries in creation order, one at a time
            let due = self
                .scheduler
                .due_entries(&conversation_id, now, connectivity_restored)?;
            for entry in due {
                match self.attempt_send(entry.id()).await? {
                    SendOutcome::Acknowledged => report.sent += 1,
                    SendOutcome::Failed => report.failed += 1,
                    SendOutcome::Deferred => {}
                }
            }
        }

        Ok(report)
    }

    /// One transmission attempt for one outbox entry.
    async fn attempt_send(&self, message_id: MessageId) -> CourierResult<SendOutcome> {
        let now = now_millis();
        if !self.scheduler.begin_attempt(message_id, now) {
            return Ok(SendOutcome::Deferred);
        }
        let outcome = self.attempt_send_locked(message_id, now).await;
        self.scheduler.finish_attempt(&message_id);
        outcome
    }

    async fn attempt_send_locked(
        &self,
        message_id: MessageId,
        now: i64,
    ) -> CourierResult<SendOutcome> {
        let Some(record) = self.ledger.load_message(&message_id)? else {
            return Ok(SendOutcome::Deferred);
        };
        if !record.state.awaits_transmission() {
            return Ok(SendOutcome::Deferred);
        }

        self.ledger.record_attempt(&message_id, now)?;
        self.ledger
            .mark_state(&message_id, DeliveryState::Sent, None)?;
        self.emit(EngineEvent::MessageStateChanged {
            conversation_id: record.conversation_id,
            message_id,
            state: DeliveryState::Sent,
        });

        let envelope = Envelope::from_record(&record);
        match self.transport.send(&envelope).await {
            Ok(receipt) => {
                self.reconciler.apply_receipt(&receipt).await?;
                Ok(SendOutcome::Acknowledged)
            }
            Err(e) if e.is_retriable() => {
                debug!(message_id = %message_id, "Send attempt deferred: {}", e);
                self.ledger
                    .mark_state(&message_id, DeliveryState::Pending, None)?;
                self.emit(EngineEvent::MessageStateChanged {
                    conversation_id: record.conversation_id,
                    message_id,
                    state: DeliveryState::Pending,
                });
                Ok(SendOutcome::Deferred)
            }
            Err(e) => {
                warn!(message_id = %message_id, "Send rejected: {}", e);
                self.ledger
                    .mark_state(&message_id, DeliveryState::Failed, None)?;
                self.emit(EngineEvent::MessageStateChanged {
                    conversation_id: record.conversation_id,
                    message_id,
                    state: DeliveryState::Failed,
                });
                self.emit(EngineEvent::SyncError {
                    conversation_id: Some(record.conversation_id),
                    message: format!("message {} rejected: {}", message_id, e),
                });
                Ok(SendOutcome::Failed)
            }
        }
    }

    fn spawn_attempt(&self, message_id: MessageId) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.attempt_send(message_id).await {
                warn!(message_id = %message_id, "Send task error: {}", e);
            }
        });
    }

    /// Stop long-lived tasks and drop the live connection.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        if let Some(live) = &self.live {
            live.close();
        }
        info!("CourierEngine shut down");
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Result of one send attempt
enum SendOutcome {
    Acknowledged,
    Deferred,
    Failed,
}
