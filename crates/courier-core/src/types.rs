//! Core types for the Courier engine

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a conversation.
///
/// Client-generated at conversation creation. ULIDs are time-ordered and
/// globally unique, and serialize as their 26-character string form on the
/// wire and in storage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Ulid);

impl ConversationId {
    /// Create a new random ConversationId with the current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a message.
///
/// Client-generated before the first transmission attempt and never reused;
/// this is the idempotency key the relay deduplicates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    /// Create a new random MessageId with the current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a participant (a device identity).
///
/// Derived from the blake3 hash of the device's public key bundle and
/// base58-encoded; see [`crate::identity`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    /// Wrap an already-derived base58 identifier
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The raw base58 string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a symmetric session key.
///
/// Conversations and message records hold this identifier only; the key
/// material itself is owned by the session manager (see [`crate::session`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKeyId(pub Ulid);

impl SessionKeyId {
    /// Create a new random SessionKeyId
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for SessionKeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery state of a message record.
///
/// Transitions: `Pending -> Sent -> Acknowledged` on the happy path,
/// `Pending -> Failed` on a fatal transport rejection. `Failed` is terminal
/// until an explicit resend moves the record back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Authored locally, not yet transmitted (or awaiting retry)
    Pending,
    /// Handed to the live channel, receipt not yet processed
    Sent,
    /// Relay acknowledged and assigned a server position
    Acknowledged,
    /// Rejected by the relay or undecryptable; requires explicit action
    Failed,
}

impl DeliveryState {
    /// Whether this state keeps the message in the outbox for automatic retry
    pub fn awaits_transmission(&self) -> bool {
        matches!(self, DeliveryState::Pending)
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Pending => write!(f, "pending"),
            DeliveryState::Sent => write!(f, "sent"),
            DeliveryState::Acknowledged => write!(f, "acknowledged"),
            DeliveryState::Failed => write!(f, "failed"),
        }
    }
}

/// Plaintext payload of a message.
///
/// `Attachment` carries an opaque content reference plus the detached key
/// for the blob, never the blob itself; fetching and decrypting the blob is
/// the media subsystem's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessageBody {
    /// Plain text message
    Text { text: String },
    /// Reference to an externally stored encrypted blob
    #[serde(rename_all = "camelCase")]
    Attachment {
        /// Opaque reference resolvable by the media subsystem
        content_ref: String,
        /// Detached symmetric key for the blob
        blob_key: Vec<u8>,
        /// MIME type hint for rendering
        mime: String,
    },
}

impl MessageBody {
    /// Convenience constructor for a text body
    pub fn text(s: impl Into<String>) -> Self {
        MessageBody::Text { text: s.into() }
    }

    /// Serialize to the byte form that gets encrypted
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from decrypted bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A conversation and its participant set.
///
/// Holds the *identifier* of its active session key, never key material;
/// the session manager is the sole authority resolving identifiers to keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique identifier
    pub id: ConversationId,
    /// All participants, including ourselves
    pub participants: Vec<PeerId>,
    /// Identifier of the currently active session key, if established
    pub active_session: Option<SessionKeyId>,
    /// Unix timestamp in milliseconds of creation
    pub created_at: i64,
}

impl Conversation {
    /// Create a new conversation with the given participants
    pub fn new(participants: Vec<PeerId>) -> Self {
        Self {
            id: ConversationId::new(),
            participants,
            active_session: None,
            created_at: now_millis(),
        }
    }

    /// Check whether a peer participates in this conversation
    pub fn has_participant(&self, peer: &PeerId) -> bool {
        self.participants.contains(peer)
    }
}

/// A persisted message record.
///
/// The ciphertext is immutable once persisted; later mutations touch only
/// the delivery state, the server position, and the attempt bookkeeping the
/// scheduler recovers after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Client-generated unique identifier (relay idempotency key)
    pub id: MessageId,
    /// Conversation this message belongs to
    pub conversation_id: ConversationId,
    /// Authoring participant
    pub sender: PeerId,
    /// Encrypted payload (nonce-prepended AEAD output)
    pub ciphertext: Vec<u8>,
    /// Session key the ciphertext was produced under
    pub key_id: SessionKeyId,
    /// Unix timestamp in milliseconds of local creation
    pub created_at: i64,
    /// Current delivery state
    pub state: DeliveryState,
    /// Relay-assigned position, once acknowledged
    pub server_position: Option<u64>,
    /// Number of transmission attempts so far
    pub attempts: u32,
    /// Unix timestamp in milliseconds of the last attempt
    pub last_attempt_at: Option<i64>,
}

impl MessageRecord {
    /// Create a fresh locally-authored record in `Pending` state
    pub fn new_outbound(
        conversation_id: ConversationId,
        sender: PeerId,
        ciphertext: Vec<u8>,
        key_id: SessionKeyId,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender,
            ciphertext,
            key_id,
            created_at: now_millis(),
            state: DeliveryState::Pending,
            server_position: None,
            attempts: 0,
            last_attempt_at: None,
        }
    }
}

/// An outbox entry: a view over a message record awaiting transmission.
///
/// At most one in-flight transmission attempt exists per entry at a time;
/// the scheduler enforces this with its in-flight set and watchdog.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// The underlying pending record
    pub message: MessageRecord,
}

impl OutboxEntry {
    /// The entry's message id
    pub fn id(&self) -> MessageId {
        self.message.id
    }
}

/// Per-conversation watermark: the highest *contiguous* server position
/// merged so far. Monotonically non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// The conversation this cursor tracks
    pub conversation_id: ConversationId,
    /// Last contiguous server position merged; 0 means nothing merged yet
    pub position: u64,
}

/// Current Unix timestamp in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
