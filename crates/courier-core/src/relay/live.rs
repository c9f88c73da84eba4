//! Persistent live channel over WebSocket
//!
//! One connection carries JSON text frames in both directions. Outbound
//! sends complete when the relay's receipt frame arrives, correlated by
//! `clientMessageId`; a receipt that misses its timeout surfaces as a
//! transient failure and the send falls back to REST (the relay
//! deduplicates on the id, so the eventual double-delivery is harmless).
//!
//! Frames that are not receipts for an in-flight send (peer messages,
//! session key fan-out, late receipts) flow into the incoming stream the
//! engine's consumer task drains.

use crate::error::TransportError;
use crate::relay::{DeliveryReceipt, Envelope, WireFrame};
use crate::types::MessageId;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Capacity for the incoming frame stream
const INCOMING_CAPACITY: usize = 256;

/// Capacity for the outbound frame queue
const OUTBOUND_CAPACITY: usize = 64;

type PendingReceipts = Arc<Mutex<HashMap<MessageId, oneshot::Sender<DeliveryReceipt>>>>;

/// The live channel: a reconnectable WebSocket to the relay.
pub struct LiveChannel {
    url: String,
    receipt_timeout: Duration,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    pending: PendingReceipts,
    incoming_tx: mpsc::Sender<WireFrame>,
    incoming_rx: Mutex<Option<mpsc::Receiver<WireFrame>>>,
}

impl LiveChannel {
    /// Create a channel for the given WebSocket URL (not yet connected).
    pub fn new(url: impl Into<String>, receipt_timeout: Duration) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        Self {
            url: url.into(),
            receipt_timeout,
            connected_tx,
            connected_rx,
            outbound: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    /// Whether the channel currently holds a connection.
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Watch connection state changes (used for reconnect-triggered pulls).
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Take the incoming frame stream.
    ///
    /// Infinite and not restartable: the stream survives reconnects, and
    /// only the first caller gets it.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<WireFrame>> {
        self.incoming_rx.lock().take()
    }

    /// Establish the WebSocket connection and spawn its reader and writer
    /// tasks. A connect failure is transient; the caller's backoff decides
    /// when to try again.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Transient(format!("connect {}: {}", self.url, e)))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        *self.outbound.lock() = Some(outbound_tx);

        // Writer task: drain the outbound queue into the socket
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if ws_tx.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Reader task: route inbound frames until the socket closes
        let pending = self.pending.clone();
        let incoming_tx = self.incoming_tx.clone();
        let connected_tx = self.connected_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Live channel read error: {}", e);
                        break;
                    }
                };
                match message {
                    Message::Text(text) => match serde_json::from_str::<WireFrame>(text.as_str())
                    {
                        Ok(frame) => {
                            Self::route_frame(frame, &pending, &incoming_tx).await;
                        }
                        Err(e) => {
                            warn!("Discarding unparseable live frame: {}", e);
                        }
                    },
                    Message::Close(_) => break,
                    // Pings are answered by tungstenite itself
                    _ => {}
                }
            }
            debug!("Live channel reader ended");
            let _ = connected_tx.send(false);
        });

        let _ = self.connected_tx.send(true);
        info!(url = %self.url, "Live channel connected");
        Ok(())
    }

    /// Route one inbound frame: receipts resolve their in-flight send,
    /// everything else feeds the incoming stream.
    async fn route_frame(
        frame: WireFrame,
        pending: &PendingReceipts,
        incoming_tx: &mpsc::Sender<WireFrame>,
    ) {
        if let WireFrame::Receipt(ref receipt) = frame {
            let waiter = pending.lock().remove(&receipt.client_message_id);
            if let Some(waiter) = waiter {
                let _ = waiter.send(receipt.clone());
                return;
            }
            // Late receipt: the sender already timed out. The reconciler
            // still wants it, so it flows down the incoming stream.
        }
        if incoming_tx.send(frame).await.is_err() {
            warn!("Incoming frame stream closed, dropping frame");
        }
    }

    /// Send one envelope and await the relay's receipt.
    pub async fn send(&self, envelope: &Envelope) -> Result<DeliveryReceipt, TransportError> {
        let outbound = self
            .outbound
            .lock()
            .clone()
            .ok_or(TransportError::ChannelUnavailable)?;

        let (receipt_tx, receipt_rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(envelope.client_message_id, receipt_tx);

        let frame = WireFrame::Message(envelope.clone());
        let json = serde_json::to_string(&frame)
            .map_err(|e| TransportError::Fatal(format!("envelope serialization: {}", e)))?;

        if outbound.send(Message::Text(json.into())).await.is_err() {
            self.pending.lock().remove(&envelope.client_message_id);
            return Err(TransportError::ChannelUnavailable);
        }

        match tokio::time::timeout(self.receipt_timeout, receipt_rx).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(_)) => {
                self.pending.lock().remove(&envelope.client_message_id);
                Err(TransportError::Transient("receipt channel dropped".into()))
            }
            Err(_) => {
                self.pending.lock().remove(&envelope.client_message_id);
                Err(TransportError::Transient(format!(
                    "no receipt within {:?}",
                    self.receipt_timeout
                )))
            }
        }
    }

    /// Drop the connection; in-flight sends resolve as transient failures.
    pub fn close(&self) {
        *self.outbound.lock() = None;
        self.pending.lock().clear();
        let _ = self.connected_tx.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationId, MessageRecord, PeerId, SessionKeyId};

    fn test_channel() -> LiveChannel {
        LiveChannel::new("ws://127.0.0.1:1/live", Duration::from_millis(50))
    }

    fn sample_envelope() -> Envelope {
        Envelope::from_record(&MessageRecord::new_outbound(
            ConversationId::new(),
            PeerId::from_string("peer-love"),
            vec![9; 32],
            SessionKeyId::new(),
        ))
    }

    #[test]
    fn test_starts_disconnected() {
        let channel = test_channel();
        assert!(!channel.is_connected());
    }

    #[test]
    fn test_subscribe_is_single_take() {
        let channel = test_channel();
        assert!(channel.subscribe().is_some());
        assert!(channel.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_send_without_connection_is_unavailable() {
        let channel = test_channel();
        let result = channel.send(&sample_envelope()).await;
        assert!(matches!(result, Err(TransportError::ChannelUnavailable)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transient() {
        let channel = test_channel();
        let result = channel.connect().await;
        match result {
            Err(TransportError::Transient(_)) => {}
            other => panic!("Expected Transient connect failure, got: {:?}", other),
        }
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_route_receipt_resolves_waiter() {
        let pending: PendingReceipts = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, mut incoming_rx) = mpsc::channel(4);

        let envelope = sample_envelope();
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(envelope.client_message_id, tx);

        let receipt = DeliveryReceipt {
            conversation_id: envelope.conversation_id,
            client_message_id: envelope.client_message_id,
            server_position: 1,
        };
        LiveChannel::route_frame(WireFrame::Receipt(receipt.clone()), &pending, &incoming_tx)
            .await;

        assert_eq!(rx.await.unwrap(), receipt);
        // Resolved receipts do not also hit the incoming stream
        assert!(incoming_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_late_receipt_feeds_incoming_stream() {
        let pending: PendingReceipts = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, mut incoming_rx) = mpsc::channel(4);

        let receipt = DeliveryReceipt {
            conversation_id: ConversationId::new(),
            client_message_id: MessageId::new(),
            server_position: 2,
        };
        LiveChannel::route_frame(WireFrame::Receipt(receipt.clone()), &pending, &incoming_tx)
            .await;

        match incoming_rx.try_recv().unwrap() {
            WireFrame::Receipt(r) => assert_eq!(r, receipt),
            other => panic!("Expected receipt frame, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_message_feeds_incoming_stream() {
        let pending: PendingReceipts = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, mut incoming_rx) = mpsc::channel(4);

        let envelope = sample_envelope();
        LiveChannel::route_frame(
            WireFrame::Message(envelope.clone()),
            &pending,
            &incoming_tx,
        )
        .await;

        match incoming_rx.try_recv().unwrap() {
            WireFrame::Message(e) => assert_eq!(e, envelope),
            other => panic!("Expected message frame, got: {:?}", other),
        }
    }
}
