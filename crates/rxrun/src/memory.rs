//! In-process transport, used for tests and for hosting a guest in the same process.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Buffers sent on one end appear on the peer's `recv` and vice versa. Dropping
/// one end makes the peer's `recv` return `None`.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    max_len: usize,
}

impl MemoryTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_limit(usize::MAX)
    }

    /// Like `pair`, but both ends refuse buffers longer than `max_len`.
    pub fn pair_with_limit(max_len: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: tx_a,
            rx: Arc::new(Mutex::new(rx_b)),
            max_len,
        };

        let b = Self {
            tx: tx_b,
            rx: Arc::new(Mutex::new(rx_a)),
            max_len,
        };

        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if payload.len() > self.max_len {
            return Err(transport::Error::PayloadTooLarge(payload.len()));
        }
        self.tx
            .send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}
