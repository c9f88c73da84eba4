//! Relay transport: ciphertext frames to and from the untrusted relay
//!
//! Two paths move envelopes:
//!
//! - a persistent **live channel** (WebSocket) for low-latency push and
//!   receive, consumed by a long-lived engine task, and
//! - a **request/response fallback** (REST) for bulk history pulls,
//!   reconnection catch-up, and delivery while the live channel is down.
//!
//! Both sit behind the [`Transport`] capability trait; [`RelayTransport`]
//! is the policy that picks a path from current connectivity. The relay
//! never sees plaintext: an [`Envelope`] carries ciphertext plus routing
//! and idempotency metadata only.

pub mod live;
pub mod rest;

pub use live::LiveChannel;
pub use rest::RestClient;

use crate::encoding::b64;
use crate::error::TransportError;
use crate::session::SessionProposal;
use crate::types::{ConversationId, MessageId, MessageRecord, PeerId, SessionKeyId};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// The wire unit exchanged with the relay.
///
/// `client_message_id` is the idempotency key: resending an envelope with
/// the same id after a timeout must not create a duplicate at the relay.
/// `server_position` is absent on outbound frames and set by the relay on
/// everything it hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Conversation this envelope routes to
    pub conversation_id: ConversationId,
    /// Authoring participant
    pub sender_id: PeerId,
    /// Encrypted payload; the relay cannot read it
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Session key the ciphertext was produced under
    pub key_id: SessionKeyId,
    /// Client-generated idempotency key
    pub client_message_id: MessageId,
    /// Unix timestamp in milliseconds of local authorship
    pub client_timestamp: i64,
    /// Relay-assigned position (inbound frames only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_position: Option<u64>,
}

impl Envelope {
    /// Build the outbound envelope for a ledger record.
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            conversation_id: record.conversation_id,
            sender_id: record.sender.clone(),
            ciphertext: record.ciphertext.clone(),
            key_id: record.key_id,
            client_message_id: record.id,
            client_timestamp: record.created_at,
            server_position: None,
        }
    }
}

/// The relay's acknowledgment of one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Conversation the acknowledged envelope belongs to
    pub conversation_id: ConversationId,
    /// The acknowledged envelope's idempotency key
    pub client_message_id: MessageId,
    /// Position the relay assigned in the conversation's order
    pub server_position: u64,
}

/// A frame on the live channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireFrame {
    /// An envelope (outbound send or inbound delivery)
    Message(Envelope),
    /// Acknowledgment of a previously sent envelope
    Receipt(DeliveryReceipt),
    /// A session key proposal fanned out to participants
    SessionKey(SessionProposal),
}

/// Capability interface over the relay.
///
/// `subscribe` hands out the live channel's incoming frame stream: an
/// infinite, non-restartable sequence consumed by exactly one engine task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope and return the relay's receipt.
    async fn send(&self, envelope: &Envelope) -> Result<DeliveryReceipt, TransportError>;

    /// Take the incoming frame stream. Returns `None` once taken.
    fn subscribe(&self) -> Option<mpsc::Receiver<WireFrame>>;

    /// Pull the conversation's envelopes after a cursor position.
    async fn pull_since(
        &self,
        conversation_id: &ConversationId,
        after: u64,
    ) -> Result<Vec<Envelope>, TransportError>;

    /// List the conversations the relay holds for a peer.
    ///
    /// Discovery for conversations whose session key fan-out was missed
    /// while disconnected; the catch-up pull covers them afterwards.
    async fn list_remote_conversations(
        &self,
        peer: &PeerId,
    ) -> Result<Vec<ConversationId>, TransportError>;
}

/// Path-selection policy over the live channel and the REST fallback.
///
/// Sends prefer the live channel while it is connected, falling back to
/// REST on a retriable failure; bulk pulls always use REST.
pub struct RelayTransport {
    live: Arc<LiveChannel>,
    rest: RestClient,
}

impl RelayTransport {
    /// Combine a live channel and a REST client into one transport.
    pub fn new(live: Arc<LiveChannel>, rest: RestClient) -> Self {
        Self { live, rest }
    }

    /// The underlying live channel (connection management)
    pub fn live(&self) -> &Arc<LiveChannel> {
        &self.live
    }

    /// The underlying REST client (key directory, proposals)
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&self, envelope: &Envelope) -> Result<DeliveryReceipt, TransportError> {
        if self.live.is_connected() {
            match self.live.send(envelope).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_retriable() => {
                    debug!(client_message_id = %envelope.client_message_id,
                           "Live channel send failed, falling back to REST: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        self.rest.send(envelope).await
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<WireFrame>> {
        self.live.subscribe()
    }

    async fn pull_since(
        &self,
        conversation_id: &ConversationId,
        after: u64,
    ) -> Result<Vec<Envelope>, TransportError> {
        self.rest.pull_since(conversation_id, after).await
    }

    async fn list_remote_conversations(
        &self,
        peer: &PeerId,
    ) -> Result<Vec<ConversationId>, TransportError> {
        self.rest.list_conversations(peer).await
    }
}
