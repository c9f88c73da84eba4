//! Error types for the Courier engine

use thiserror::Error;

/// Main error type for Courier engine operations
#[derive(Error, Debug)]
pub enum CourierError {
    /// Conversation was not found in the ledger
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Message was not found in the ledger
    #[error("Message not found: {0}")]
    NotFound(String),

    /// The ledger device is out of space
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// Persisted data failed to load or validate
    #[error("Storage corrupt: {0}")]
    Corrupt(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A participant's public key bundle could not be resolved
    #[error("Peer key unavailable: {0}")]
    PeerKeyUnavailable(String),

    /// The relay or a peer rejected a proposed session key
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// AEAD authentication failed: wrong key or tampered ciphertext
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The referenced session key is no longer retained; renegotiate
    #[error("Session key expired: {0}")]
    KeyExpired(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Transport-level failure with retriability classification
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol version not supported
    #[error("Frame version {0} is not supported")]
    FrameVersionUnsupported(u8),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Serialization(e.to_string())
    }
}

/// Transport failure, classified for the scheduler.
///
/// `Transient` failures feed the backoff loop and never surface
/// individually; `Fatal` failures move the affected outbox entry to
/// `Failed` and stop automatic retries.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network-level failure: unreachable, reset, timed out
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// Protocol-level rejection: bad auth, malformed envelope
    #[error("Fatal transport failure: {0}")]
    Fatal(String),

    /// The live channel is not connected
    #[error("Live channel unavailable")]
    ChannelUnavailable,
}

impl TransportError {
    /// Whether the scheduler should retry with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransportError::Transient(_) | TransportError::ChannelUnavailable
        )
    }
}

/// Result type alias using CourierError
pub type CourierResult<T> = Result<T, CourierError>;
