//! Message transport seam.
//!
//! Connection establishment lives outside this crate. The engines only need
//! an ordered channel that can report how many bytes it still has queued.

use crate::error::TransportError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::protocol::WireMessage;

/// Outbound half of an ordered message channel.
pub trait MessageTransport: Send + Sync {
    /// Queue a message. Messages are delivered in the order they were sent.
    fn send(&self, message: WireMessage) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Bytes accepted by `send` that have not left the local buffer yet
    fn buffered_amount(&self) -> u64;

    fn is_open(&self) -> bool;
}

/// Inbound half of an ordered message channel. `None` means the peer is gone.
pub trait InboundMessages: Send {
    fn recv(&mut self) -> impl Future<Output = Option<WireMessage>> + Send;
}

impl InboundMessages for mpsc::Receiver<WireMessage> {
    async fn recv(&mut self) -> Option<WireMessage> {
        mpsc::Receiver::recv(self).await
    }
}

impl InboundMessages for mpsc::UnboundedReceiver<WireMessage> {
    async fn recv(&mut self) -> Option<WireMessage> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}

/// In-process transport. Buffered bytes are those sent but not yet received.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<WireMessage>,
    buffered: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct MemoryInbound {
    rx: mpsc::UnboundedReceiver<WireMessage>,
    buffered: Arc<AtomicU64>,
}

/// Create a connected in-memory transport pair
pub fn memory_channel() -> (MemoryTransport, MemoryInbound) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicU64::new(0));
    (
        MemoryTransport {
            tx,
            buffered: buffered.clone(),
            open: Arc::new(AtomicBool::new(true)),
        },
        MemoryInbound { rx, buffered },
    )
}

impl MemoryTransport {
    /// Stop accepting messages. Already queued messages are still delivered.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl MessageTransport for MemoryTransport {
    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let len = message.len() as u64;
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.tx.send(message).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

impl InboundMessages for MemoryInbound {
    async fn recv(&mut self) -> Option<WireMessage> {
        let message = self.rx.recv().await?;
        self.buffered
            .fetch_sub(message.len() as u64, Ordering::SeqCst);
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_buffered_amount_tracks_unreceived_bytes() {
        let (tx, mut rx) = memory_channel();
        tx.send(WireMessage::Binary(Bytes::from_static(&[0u8; 100])))
            .await
            .unwrap();
        tx.send(WireMessage::Text("hello".into())).await.unwrap();
        assert_eq!(tx.buffered_amount(), 105);

        rx.recv().await.unwrap();
        assert_eq!(tx.buffered_amount(), 5);
        assert_eq!(rx.recv().await, Some(WireMessage::Text("hello".into())));
        assert_eq!(tx.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_send() {
        let (tx, _rx) = memory_channel();
        tx.close();
        assert!(!tx.is_open());
        assert!(matches!(
            tx.send(WireMessage::Text("x".into())).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dropping_inbound_closes_transport() {
        let (tx, rx) = memory_channel();
        drop(rx);
        assert!(!tx.is_open());
    }

    #[tokio::test]
    async fn test_inbound_ends_when_transport_dropped() {
        let (tx, mut rx) = memory_channel();
        tx.send(WireMessage::Text("last".into())).await.unwrap();
        drop(tx);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
