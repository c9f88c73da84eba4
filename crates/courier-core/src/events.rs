//! Engine events and sync status
//!
//! The presentation layer observes the engine through a broadcast stream
//! of [`EngineEvent`]s: every reconciler merge, delivery state change, and
//! connectivity transition emits one, which is what makes `timeline()`
//! observable without polling.

use std::fmt;

use crate::types::{ConversationId, DeliveryState, MessageId, SessionKeyId};

/// Engine-level synchronization status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// No connectivity; outbox accumulates
    #[default]
    Offline,
    /// Connectivity restored, live channel being established
    Connecting,
    /// Live channel up, deltas flowing
    Online,
    /// Sync failed with an error message
    Error(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Offline => write!(f, "Offline"),
            SyncStatus::Connecting => write!(f, "Connecting"),
            SyncStatus::Online => write!(f, "Online"),
            SyncStatus::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

/// Events broadcast to engine subscribers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The reconciler merged new or reordered entries into a timeline
    TimelineUpdated {
        /// The affected conversation
        conversation_id: ConversationId,
        /// Number of entries merged in this batch
        merged: usize,
    },
    /// A message's delivery state changed
    MessageStateChanged {
        /// The affected conversation
        conversation_id: ConversationId,
        /// The affected message
        message_id: MessageId,
        /// The new delivery state
        state: DeliveryState,
    },
    /// A session key was established or accepted for a conversation
    SessionEstablished {
        /// The affected conversation
        conversation_id: ConversationId,
        /// The new active key's identifier
        key_id: SessionKeyId,
    },
    /// Connectivity changed
    ConnectivityChanged {
        /// Whether the engine is now online
        online: bool,
    },
    /// An error occurred during sync
    SyncError {
        /// The conversation where the error occurred (if known)
        conversation_id: Option<ConversationId>,
        /// Error message
        message: String,
    },
}

impl EngineEvent {
    /// The conversation id associated with this event, if any
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            EngineEvent::TimelineUpdated { conversation_id, .. } => Some(conversation_id),
            EngineEvent::MessageStateChanged { conversation_id, .. } => Some(conversation_id),
            EngineEvent::SessionEstablished { conversation_id, .. } => Some(conversation_id),
            EngineEvent::ConnectivityChanged { .. } => None,
            EngineEvent::SyncError { conversation_id, .. } => conversation_id.as_ref(),
        }
    }
}
