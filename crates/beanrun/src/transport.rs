//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between runtimes.
//!
//! The transport knows nothing about frames, requests or components. It moves
//! opaque buffers in both directions; correlation is the peer's job.

pub mod channel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The other side is unreachable or the connection was dropped.
    ConnectionLost(String),
    PayloadTooLarge,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge => write!(f, "Payload too large for transport"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Object-safe duplex byte pipe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues one message for the other side.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next message. `Ok(None)` means the stream is closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}
