//! # Beanwire
//!
//! The transport-neutral vocabulary shared by local callers, remote peers and
//! the container: argument values, caller principals, instance identities,
//! method fingerprints, and the request/response envelopes.
//!
//! Nothing in here knows about pools or interceptors. A `Request` built by a
//! proxy in one process can be framed, shipped, and resolved by a container in
//! another process that holds a structurally identical interface.

pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod identity;
pub mod value;

pub use envelope::Failure;
pub use envelope::FailureKind;
pub use envelope::Request;
pub use envelope::Response;
pub use error::Error;
pub use error::Result;
pub use fingerprint::Fingerprint;
pub use fingerprint::FingerprintTable;
pub use fingerprint::Interface;
pub use fingerprint::MethodSignature;
pub use frame::Frame;
pub use identity::Identity;
pub use identity::Principal;
pub use value::Value;
