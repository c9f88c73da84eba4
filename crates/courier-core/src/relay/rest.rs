//! REST fallback client
//!
//! Covers everything the live channel cannot: bulk history pulls,
//! reconnection catch-up, delivery while disconnected, and the key
//! directory endpoints. All routes are idempotent on their natural key
//! (`clientMessageId` for messages, peer id for key bundles), so a retried
//! request never duplicates state at the relay.

use crate::error::{CourierError, CourierResult, TransportError};
use crate::identity::PublicKeyBundle;
use crate::relay::{DeliveryReceipt, Envelope};
use crate::session::{KeyDirectory, ProposalSink, SessionProposal};
use crate::types::{ConversationId, PeerId};

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// HTTP client for the relay's REST surface.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    /// Create a client for the given relay base URL.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> CourierResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CourierError::InvalidOperation(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Deliver one envelope over REST.
    pub async fn send(&self, envelope: &Envelope) -> Result<DeliveryReceipt, TransportError> {
        let url = self.url(&format!(
            "/conversations/{}/messages",
            envelope.conversation_id
        ));
        debug!(client_message_id = %envelope.client_message_id, "REST send");

        let response = self
            .http
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        response
            .json::<DeliveryReceipt>()
            .await
            .map_err(|e| TransportError::Fatal(format!("malformed receipt: {}", e)))
    }

    /// Pull the conversation's envelopes after a cursor position.
    pub async fn pull_since(
        &self,
        conversation_id: &ConversationId,
        after: u64,
    ) -> Result<Vec<Envelope>, TransportError> {
        let url = self.url(&format!(
            "/conversations/{}/messages?after={}",
            conversation_id, after
        ));

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        response
            .json::<Vec<Envelope>>()
            .await
            .map_err(|e| TransportError::Fatal(format!("malformed envelope list: {}", e)))
    }

    /// List the conversations the relay holds for a peer.
    pub async fn list_conversations(
        &self,
        peer: &PeerId,
    ) -> Result<Vec<ConversationId>, TransportError> {
        let url = self.url(&format!("/peers/{}/conversations", peer));

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        response
            .json::<Vec<ConversationId>>()
            .await
            .map_err(|e| TransportError::Fatal(format!("malformed conversation list: {}", e)))
    }
}

#[async_trait]
impl KeyDirectory for RestClient {
    async fn resolve(&self, peer: &PeerId) -> CourierResult<PublicKeyBundle> {
        let url = self.url(&format!("/peers/{}/keys", peer));

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CourierError::Transport(classify_request_error(e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CourierError::PeerKeyUnavailable(peer.to_string()));
        }
        if !status.is_success() {
            return Err(CourierError::Transport(classify_status(status)));
        }

        response
            .json::<PublicKeyBundle>()
            .await
            .map_err(|e| CourierError::Corrupt(format!("peer bundle: {}", e)))
    }

    async fn publish(&self, peer: &PeerId, bundle: &PublicKeyBundle) -> CourierResult<()> {
        let url = self.url(&format!("/peers/{}/keys", peer));

        let response = self
            .http
            .put(&url)
            .json(bundle)
            .send()
            .await
            .map_err(|e| CourierError::Transport(classify_request_error(e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CourierError::Transport(classify_status(status)));
        }
        Ok(())
    }
}

#[async_trait]
impl ProposalSink for RestClient {
    async fn propose(&self, proposal: &SessionProposal) -> CourierResult<()> {
        let url = self.url(&format!("/conversations/{}/keys", proposal.conversation_id));

        let response = self
            .http
            .post(&url)
            .json(proposal)
            .send()
            .await
            .map_err(|e| CourierError::Transport(classify_request_error(e)))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            // Another participant's rotation won the race
            return Err(CourierError::HandshakeRejected(format!(
                "relay refused key {} for conversation {}",
                proposal.key_id, proposal.conversation_id
            )));
        }
        if !status.is_success() {
            return Err(CourierError::Transport(classify_status(status)));
        }
        Ok(())
    }
}

/// Network-level request failures are all retriable.
fn classify_request_error(e: reqwest::Error) -> TransportError {
    TransportError::Transient(e.to_string())
}

/// Map an HTTP status: server-side and throttling failures retry, other
/// rejections are protocol-level and final.
fn classify_status(status: StatusCode) -> TransportError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        TransportError::Transient(format!("relay returned {}", status))
    } else {
        TransportError::Fatal(format!("relay returned {}", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_normalized() {
        let client = RestClient::new("http://relay.test/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.url("/conversations/x/messages"),
            "http://relay.test/conversations/x/messages"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR).is_retriable());
        assert!(classify_status(StatusCode::BAD_GATEWAY).is_retriable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT).is_retriable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).is_retriable());

        assert!(!classify_status(StatusCode::BAD_REQUEST).is_retriable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED).is_retriable());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY).is_retriable());
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_transient() {
        let client =
            RestClient::new("http://127.0.0.1:1", Duration::from_millis(100)).unwrap();
        let result = client
            .pull_since(&ConversationId::new(), 0)
            .await;
        match result {
            Err(TransportError::Transient(_)) => {}
            other => panic!("Expected Transient, got: {:?}", other),
        }
    }
}
