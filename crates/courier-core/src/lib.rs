//! Courier Engine Core Library
//!
//! Offline-first encrypted chat synchronization through an untrusted relay.
//!
//! ## Overview
//!
//! Courier keeps conversations readable and sendable while offline,
//! delivers messages exactly-once-in-effect through a relay that never
//! sees plaintext, and reconciles local and remote state into one
//! causally-ordered timeline per conversation.
//!
//! ## Core Principles
//!
//! - **Offline-first**: authoring and reading work with no connectivity;
//!   a durable outbox drains when the relay is reachable again
//! - **Relay-blind**: only ciphertext and routing metadata cross the wire
//! - **Single source of truth**: concurrent tasks coordinate through the
//!   local ledger, and the relay-assigned position orders the timeline
//!
//! ## Quick Start
//!
//! ```ignore
//! use courier_core::{CourierEngine, EngineConfig, MessageBody};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = CourierEngine::new(EngineConfig::default()).await?;
//!     engine.start()?;
//!
//!     let conversation = engine.create_conversation(vec![peer_id]).await?;
//!     engine.enqueue(conversation.id, MessageBody::text("hi")).await?;
//!
//!     for item in engine.timeline(&conversation.id, 0)? {
//!         println!("{:?}: {:?}", item.message.state, item.text());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
mod encoding;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod reconcile;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod types;

// Re-exports
pub use config::{BackoffConfig, EngineConfig};
pub use engine::{CourierEngine, SyncReport, TimelineItem};
pub use error::{CourierError, CourierResult, TransportError};
pub use events::{EngineEvent, SyncStatus};
pub use identity::{DeviceKeypair, PublicKeyBundle};
pub use reconcile::Reconciler;
pub use relay::{
    DeliveryReceipt, Envelope, LiveChannel, RelayTransport, RestClient, Transport, WireFrame,
};
pub use scheduler::{RetryState, SyncScheduler};
pub use session::{
    KeyDirectory, KeyStore, ProposalSink, SessionManager, SessionProposal, SessionRecord,
};
pub use storage::Ledger;
pub use types::*;
