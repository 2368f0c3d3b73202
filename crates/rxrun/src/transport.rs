//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between guest and host.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames, streams or handlers.
//!   It moves opaque buffers, one encoded frame per buffer.
//! - **Duplex**: Both directions are independent. One task reads, one task writes;
//!   multiplexing happens above this layer.

use std::fmt;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The channel refused a buffer of this size. The connection stays usable.
    PayloadTooLarge(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge(n) => write!(f, "Payload of {} bytes too large for transport", n),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for rxrpc::Error {
    fn from(e: Error) -> Self {
        rxrpc::Error::transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One end of a guest/host channel.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
///
/// # Invariants
/// - `send` delivers buffers in call order.
/// - `recv` returns `Ok(None)` once the peer has closed its sending side.
/// - Neither method interprets the payload.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, payload: &[u8]) -> Result<()>;

    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}
