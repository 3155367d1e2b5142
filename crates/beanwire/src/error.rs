//! # Error Definitions
//!
//! Failures of the wire vocabulary itself: malformed frames and inconsistent
//! interface tables. Failures of a *call* travel inside a `Response` instead.

/// Operational failures while framing or indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A frame could not be serialized or deserialized.
    Codec(String),
    /// The frame decoded but broke the call/reply contract.
    ProtocolViolation(String),
    /// Two different signatures hash to the same fingerprint.
    FingerprintCollision { first: String, second: String },
    /// The same signature was declared twice on one interface.
    DuplicateMethod(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(msg) => write!(f, "Codec error: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::FingerprintCollision { first, second } => {
                write!(f, "Fingerprint collision between '{}' and '{}'", first, second)
            }
            Self::DuplicateMethod(sig) => write!(f, "Method declared twice: {}", sig),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
