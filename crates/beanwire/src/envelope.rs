//! # Request and Response Envelopes
//!
//! The shape of one invocation, independent of the path it takes. A local
//! proxy hands a `Request` straight to the dispatcher; a remote proxy frames it
//! first. Either way the caller gets back a `Response`, never a raw error.

use serde::Deserialize;
use serde::Serialize;

use crate::fingerprint::Fingerprint;
use crate::identity::Identity;
use crate::identity::Principal;
use crate::value::Value;

/// One call addressed to a component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub container_id: String,
    pub component: String,
    pub identified: bool,
    pub identity: Option<Identity>,
    pub fingerprint: Fingerprint,
    pub args: Vec<Value>,
    #[serde(default)]
    pub caller: Principal,
}

impl Request {
    pub fn new(
        container_id: impl Into<String>,
        component: impl Into<String>,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            component: component.into(),
            identified: false,
            identity: None,
            fingerprint,
            args: Vec::new(),
            caller: Principal::anonymous(),
        }
    }

    /// Addresses an identified instance.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identified = true;
        self.identity = Some(identity);
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_caller(mut self, caller: Principal) -> Self {
        self.caller = caller;
        self
    }
}

/// Category of a failed invocation.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Creating, injecting, or initializing an instance failed.
    Construction,
    /// No instance became available within the pool's bound.
    PoolExhausted,
    /// The access-control interceptor refused the caller.
    AccessDenied,
    /// The business method raised an error its component declares.
    Application,
    /// The business method raised an undeclared error.
    System,
    /// Container, component, identity, or method could not be resolved.
    NotFound,
    /// The container never became available.
    Unavailable,
    /// The remote path failed before a reply arrived.
    Transport,
    /// A frame could not be understood.
    Protocol,
    /// Container plumbing failed.
    Internal,
}

impl FailureKind {
    /// Whether the same request may succeed if sent again unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::PoolExhausted | Self::Unavailable)
    }

    /// Whether the failure was raised by the component's own code.
    pub fn is_business(self) -> bool {
        matches!(self, Self::Application | Self::System)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Construction => "construction",
            Self::PoolExhausted => "pool-exhausted",
            Self::AccessDenied => "access-denied",
            Self::Application => "application",
            Self::System => "system",
            Self::NotFound => "not-found",
            Self::Unavailable => "unavailable",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// The failure side of a `Response`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Name of the business error, for `Application` and `System` failures.
    pub error_name: Option<String>,
    pub target_identity: Option<Identity>,
    pub fingerprint: Fingerprint,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            kind,
            message: message.into(),
            error_name: None,
            target_identity: None,
            fingerprint,
        }
    }

    pub fn with_error_name(mut self, name: impl Into<String>) -> Self {
        self.error_name = Some(name.into());
        self
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.target_identity = identity;
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_name {
            Some(name) => write!(f, "{} failure ({}): {}", self.kind, name, self.message),
            None => write!(f, "{} failure: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Failure {}

/// Result of one invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Response {
    Success(Value),
    Failure(Failure),
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(f) => Some(f),
            Self::Success(_) => None,
        }
    }

    pub fn into_result(self) -> std::result::Result<Value, Failure> {
        match self {
            Self::Success(v) => Ok(v),
            Self::Failure(f) => Err(f),
        }
    }
}

impl From<Failure> for Response {
    fn from(f: Failure) -> Self {
        Self::Failure(f)
    }
}
