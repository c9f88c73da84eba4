//! In-process relay shared by integration tests
//!
//! Models the real relay's observable behavior: per-conversation position
//! assignment, idempotence on `clientMessageId`, fan-out of accepted
//! envelopes to every connected client (the sender included, so the
//! self-echo path is exercised), session proposal fan-out, and a key
//! bundle directory. Each engine gets its own [`RelayClient`] whose
//! connectivity can be toggled independently; frames fanned out while a
//! client is offline are lost, exactly like a dropped live channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use courier_core::{
    ConversationId, CourierError, CourierResult, DeliveryReceipt, Envelope, KeyDirectory, PeerId,
    ProposalSink, PublicKeyBundle, SessionProposal, Transport, TransportError, WireFrame,
};

const CLIENT_CHANNEL_CAPACITY: usize = 256;

struct ClientHandle {
    tx: mpsc::Sender<WireFrame>,
    online: Arc<AtomicBool>,
}

struct RelayCore {
    bundles: Mutex<HashMap<PeerId, PublicKeyBundle>>,
    messages: Mutex<HashMap<ConversationId, Vec<Envelope>>>,
    next_position: Mutex<HashMap<ConversationId, u64>>,
    clients: Mutex<Vec<ClientHandle>>,
    reject_proposals: AtomicBool,
}

impl RelayCore {
    fn fan_out(&self, frame: &WireFrame) {
        for client in self.clients.lock().iter() {
            if client.online.load(Ordering::SeqCst) {
                // A full client queue drops frames, like a saturated socket
                let _ = client.tx.try_send(frame.clone());
            }
        }
    }
}

/// The relay itself; hand one [`RelayClient`] to each engine under test.
pub struct MemoryRelay {
    core: Arc<RelayCore>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            core: Arc::new(RelayCore {
                bundles: Mutex::new(HashMap::new()),
                messages: Mutex::new(HashMap::new()),
                next_position: Mutex::new(HashMap::new()),
                clients: Mutex::new(Vec::new()),
                reject_proposals: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new client (online by default).
    pub fn client(&self) -> Arc<RelayClient> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let online = Arc::new(AtomicBool::new(true));
        self.core.clients.lock().push(ClientHandle {
            tx,
            online: online.clone(),
        });
        Arc::new(RelayClient {
            core: self.core.clone(),
            online,
            incoming_rx: Mutex::new(Some(rx)),
        })
    }

    /// Make the relay refuse session proposals (rotation race loser).
    pub fn set_reject_proposals(&self, reject: bool) {
        self.core.reject_proposals.store(reject, Ordering::SeqCst);
    }

    /// Number of envelopes the relay accepted for a conversation.
    pub fn accepted_count(&self, conversation_id: &ConversationId) -> usize {
        self.core
            .messages
            .lock()
            .get(conversation_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

/// One engine's view of the relay.
pub struct RelayClient {
    core: Arc<RelayCore>,
    online: Arc<AtomicBool>,
    incoming_rx: Mutex<Option<mpsc::Receiver<WireFrame>>>,
}

impl RelayClient {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Transient("client offline".into()))
        }
    }
}

#[async_trait]
impl Transport for RelayClient {
    async fn send(&self, envelope: &Envelope) -> Result<DeliveryReceipt, TransportError> {
        self.check_online()?;

        let mut messages = self.core.messages.lock();
        let stored = messages.entry(envelope.conversation_id).or_default();

        // Idempotent on the client message id
        if let Some(existing) = stored
            .iter()
            .find(|e| e.client_message_id == envelope.client_message_id)
        {
            return Ok(DeliveryReceipt {
                conversation_id: envelope.conversation_id,
                client_message_id: envelope.client_message_id,
                server_position: existing.server_position.unwrap(),
            });
        }

        let position = {
            let mut counters = self.core.next_position.lock();
            let counter = counters.entry(envelope.conversation_id).or_insert(0);
            *counter += 1;
            *counter
        };

        let mut accepted = envelope.clone();
        accepted.server_position = Some(position);
        stored.push(accepted.clone());
        drop(messages);

        // Fan the accepted envelope to every connected client, sender
        // included (self-echo)
        self.core.fan_out(&WireFrame::Message(accepted));

        Ok(DeliveryReceipt {
            conversation_id: envelope.conversation_id,
            client_message_id: envelope.client_message_id,
            server_position: position,
        })
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<WireFrame>> {
        self.incoming_rx.lock().take()
    }

    async fn pull_since(
        &self,
        conversation_id: &ConversationId,
        after: u64,
    ) -> Result<Vec<Envelope>, TransportError> {
        self.check_online()?;
        let mut envelopes: Vec<Envelope> = self
            .core
            .messages
            .lock()
            .get(conversation_id)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|e| e.server_position.unwrap_or(0) > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        envelopes.sort_by_key(|e| e.server_position);
        Ok(envelopes)
    }

    async fn list_remote_conversations(
        &self,
        _peer: &PeerId,
    ) -> Result<Vec<ConversationId>, TransportError> {
        self.check_online()?;
        Ok(self.core.messages.lock().keys().copied().collect())
    }
}

#[async_trait]
impl KeyDirectory for RelayClient {
    async fn resolve(&self, peer: &PeerId) -> CourierResult<PublicKeyBundle> {
        self.check_online().map_err(CourierError::Transport)?;
        self.core
            .bundles
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| CourierError::PeerKeyUnavailable(peer.to_string()))
    }

    async fn publish(&self, peer: &PeerId, bundle: &PublicKeyBundle) -> CourierResult<()> {
        self.check_online().map_err(CourierError::Transport)?;
        self.core.bundles.lock().insert(peer.clone(), bundle.clone());
        Ok(())
    }
}

#[async_trait]
impl ProposalSink for RelayClient {
    async fn propose(&self, proposal: &SessionProposal) -> CourierResult<()> {
        self.check_online().map_err(CourierError::Transport)?;
        if self.core.reject_proposals.load(Ordering::SeqCst) {
            return Err(CourierError::HandshakeRejected(
                "conflicting proposal".to_string(),
            ));
        }
        self.core.fan_out(&WireFrame::SessionKey(proposal.clone()));
        Ok(())
    }
}
