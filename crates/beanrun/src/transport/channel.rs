//! In-memory duplex transport.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

/// Messages sent on one end appear on the other end's `recv()`.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    limit: Option<usize>,
}

impl ChannelTransport {
    /// Creates a pair of connected ends.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: tx_a,
            rx: Arc::new(Mutex::new(rx_b)),
            limit: None,
        };
        let b = Self {
            tx: tx_b,
            rx: Arc::new(Mutex::new(rx_a)),
            limit: None,
        };
        (a, b)
    }

    /// Rejects outgoing payloads larger than `bytes`.
    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if self.limit.is_some_and(|limit| payload.len() > limit) {
            return Err(transport::Error::PayloadTooLarge);
        }
        self.tx
            .send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}
