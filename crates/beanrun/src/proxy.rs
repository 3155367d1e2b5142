//! # Component Proxies
//!
//! A `ProxyHandle` turns method calls into `Request`s. Local handles hand the
//! request to the dispatcher; remote handles send it through a `Peer`. Both
//! return the same `Response`, so callers cannot tell the paths apart.
//!
//! The handle resolves methods against a fingerprint table built once per
//! interface, and stamps each request with the caller principal that is
//! current when the call is made.

use std::sync::Arc;

use async_trait::async_trait;

use beanwire::Failure;
use beanwire::FailureKind;
use beanwire::Fingerprint;
use beanwire::FingerprintTable;
use beanwire::Identity;
use beanwire::Interface;
use beanwire::MethodSignature;
use beanwire::Principal;
use beanwire::Request;
use beanwire::Response;
use beanwire::Value;

use crate::dispatch::Dispatcher;
use crate::peer;
use crate::peer::Peer;
use crate::security;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    UnknownMethod { interface: String, method: String },
    /// Several overloads match the name and argument count.
    AmbiguousMethod { interface: String, method: String },
    Interface(beanwire::Error),
    /// An identified component was called without an identity.
    IdentityRequired(String),
    /// The call reached the container and failed there, or never arrived.
    Failed(Failure),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownMethod { interface, method } => {
                write!(f, "'{}' has no method '{}'", interface, method)
            }
            Self::AmbiguousMethod { interface, method } => {
                write!(f, "Call to '{}' on '{}' matches several overloads", method, interface)
            }
            Self::Interface(e) => write!(f, "Interface error: {}", e),
            Self::IdentityRequired(component) => {
                write!(f, "Calls to '{}' need an instance identity", component)
            }
            Self::Failed(failure) => write!(f, "{}", failure),
        }
    }
}

impl std::error::Error for Error {}

impl From<beanwire::Error> for Error {
    fn from(e: beanwire::Error) -> Self {
        Self::Interface(e)
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Self::Failed(failure)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Delivers a request somewhere and always produces a response.
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
    async fn invoke(&self, request: Request) -> Response;
}

/// Same-process delivery through the dispatcher.
pub struct LocalInvoker {
    dispatcher: Arc<Dispatcher>,
}

impl LocalInvoker {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, request: Request) -> Response {
        self.dispatcher.route(request).await
    }
}

#[async_trait]
impl Invoker for Peer {
    async fn invoke(&self, request: Request) -> Response {
        let fingerprint = request.fingerprint;
        let identity = request.identity.clone();

        match self.call(request).await {
            Ok(response) => response,
            Err(e) => {
                let kind = match e {
                    peer::Error::Wire(_) => FailureKind::Protocol,
                    peer::Error::Transport(_) | peer::Error::Timeout | peer::Error::ChannelClosed => {
                        FailureKind::Transport
                    }
                };
                Failure::new(kind, e.to_string(), fingerprint)
                    .with_identity(identity)
                    .into()
            }
        }
    }
}

/// Names a deployed component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentRef {
    pub container_id: String,
    pub component: String,
    /// Calls must carry an instance identity.
    pub identified: bool,
}

impl ComponentRef {
    pub fn new(container_id: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            component: component.into(),
            identified: false,
        }
    }

    pub fn identified(mut self) -> Self {
        self.identified = true;
        self
    }
}

/// Where a handle sends its requests.
#[derive(Clone)]
pub enum Route {
    Local(Arc<Dispatcher>),
    Remote(Arc<Peer>),
}

pub struct ProxyBuilder;

impl ProxyBuilder {
    pub fn build(target: ComponentRef, interface: &Interface, route: Route) -> Result<ProxyHandle> {
        let table = interface.table()?;
        let (invoker, local): (Arc<dyn Invoker>, bool) = match route {
            Route::Local(dispatcher) => (Arc::new(LocalInvoker::new(dispatcher)) as Arc<dyn Invoker>, true),
            Route::Remote(peer) => (peer as Arc<dyn Invoker>, false),
        };

        Ok(ProxyHandle {
            target: Arc::new(target),
            interface: Arc::from(interface.name.as_str()),
            table: Arc::new(table),
            invoker,
            local,
            identity: None,
            caller: None,
        })
    }
}

/// Cheap to clone; clones share the method table and route.
#[derive(Clone)]
pub struct ProxyHandle {
    target: Arc<ComponentRef>,
    interface: Arc<str>,
    table: Arc<FingerprintTable>,
    invoker: Arc<dyn Invoker>,
    local: bool,
    identity: Option<Identity>,
    caller: Option<Principal>,
}

impl ProxyHandle {
    /// Sends every call as `caller` instead of the current principal.
    pub fn with_caller(mut self, caller: impl Into<Principal>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Addresses one identified instance.
    pub fn for_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn target(&self) -> &ComponentRef {
        &self.target
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Calls a method by name, picking the overload by argument count when
    /// the name is overloaded.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let fingerprint = self.resolve(method, args.len())?;
        self.invoke(fingerprint, args).await?.into_result().map_err(Error::Failed)
    }

    pub async fn call_signature(&self, signature: &MethodSignature, args: Vec<Value>) -> Result<Value> {
        let fingerprint = signature.fingerprint();
        if !self.table.contains(fingerprint) {
            return Err(self.unknown(&signature.to_string()));
        }
        self.invoke(fingerprint, args).await?.into_result().map_err(Error::Failed)
    }

    /// Sends a raw request and returns the response untouched.
    pub async fn invoke(&self, fingerprint: Fingerprint, args: Vec<Value>) -> Result<Response> {
        let caller = self.caller.clone().unwrap_or_else(security::current);
        let mut request = Request::new(&self.target.container_id, &self.target.component, fingerprint)
            .with_args(args)
            .with_caller(caller);

        if self.target.identified {
            let identity = self
                .identity
                .clone()
                .ok_or_else(|| Error::IdentityRequired(self.target.component.clone()))?;
            request = request.with_identity(identity);
        }

        Ok(self.invoker.invoke(request).await)
    }

    fn resolve(&self, method: &str, arity: usize) -> Result<Fingerprint> {
        let overloads = self.table.overloads(method);
        match overloads {
            [] => Err(self.unknown(method)),
            [only] => Ok(*only),
            _ => {
                let mut matching = overloads
                    .iter()
                    .copied()
                    .filter(|fp| self.table.get(*fp).is_some_and(|sig| sig.arity() == arity));
                match (matching.next(), matching.next()) {
                    (Some(fp), None) => Ok(fp),
                    (None, _) => Err(self.unknown(method)),
                    (Some(_), Some(_)) => Err(Error::AmbiguousMethod {
                        interface: self.interface.to_string(),
                        method: method.to_string(),
                    }),
                }
            }
        }
    }

    fn unknown(&self, method: &str) -> Error {
        Error::UnknownMethod {
            interface: self.interface.to_string(),
            method: method.to_string(),
        }
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("target", &self.target)
            .field("interface", &self.interface)
            .field("local", &self.local)
            .field("identity", &self.identity)
            .finish()
    }
}
