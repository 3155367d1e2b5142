//! # Dispatcher
//!
//! Routes requests to the factory named by `(container_id, component)`.
//!
//! Unknown names fail immediately. A container that exists but is still
//! starting is polled under a bounded `RetryPolicy`; the dispatcher never
//! waits forever for a deployment to finish.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use tracing::info;
use tracing::warn;

use beanwire::Failure;
use beanwire::FailureKind;
use beanwire::Request;
use beanwire::Response;

use crate::config::RuntimeConfig;
use crate::container::Container;
use crate::container::ContainerState;
use crate::factory::ComponentFactory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ContainerNotFound(String),
    ComponentNotFound { container: String, component: String },
    /// The container never became available within the retry policy.
    Unavailable { container: String, attempts: u32 },
    Stopped(String),
    Duplicate(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContainerNotFound(id) => write!(f, "Container not found: {}", id),
            Self::ComponentNotFound { container, component } => {
                write!(f, "Component '{}' not found in {}", component, container)
            }
            Self::Unavailable { container, attempts } => {
                write!(f, "Container {} not available after {} attempts", container, attempts)
            }
            Self::Stopped(id) => write!(f, "Container {} is stopped", id),
            Self::Duplicate(id) => write!(f, "Container {} is already registered", id),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ContainerNotFound(_) | Self::ComponentNotFound { .. } => FailureKind::NotFound,
            Self::Unavailable { .. } | Self::Stopped(_) => FailureKind::Unavailable,
            Self::Duplicate(_) => FailureKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// How to poll a container that is still starting.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    /// Growth factor applied to the interval after each attempt.
    pub backoff: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            interval: Duration::from_millis(100),
            backoff: 1.0,
            max_interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Pause after the given zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.interval.as_secs_f64() * factor;
        let cap = self.max_interval.as_secs_f64();
        if secs.is_finite() && secs < cap {
            Duration::from_secs_f64(secs)
        } else {
            self.max_interval
        }
    }
}

pub struct Dispatcher {
    containers: DashMap<String, Arc<Container>>,
    retry: RetryPolicy,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_retry(RetryPolicy::default())
    }

    pub fn with_retry(retry: RetryPolicy) -> Self {
        Self {
            containers: DashMap::new(),
            retry,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::with_retry(config.dispatch.retry_policy())
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn register(&self, container: Arc<Container>) -> Result<()> {
        let id = container.id().to_string();
        match self.containers.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::Duplicate(id)),
            Entry::Vacant(entry) => {
                entry.insert(container);
                info!(container = %id, "container registered");
                Ok(())
            }
        }
    }

    /// Removes a container and stops it.
    pub fn unregister(&self, container_id: &str) -> Option<Arc<Container>> {
        let (_, container) = self.containers.remove(container_id)?;
        container.stop();
        info!(container = %container_id, "container unregistered");
        Some(container)
    }

    pub fn container(&self, container_id: &str) -> Option<Arc<Container>> {
        self.containers.get(container_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Finds the factory for a component, waiting while its container starts.
    pub async fn resolve(&self, container_id: &str, component: &str) -> Result<Arc<ComponentFactory>> {
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 0..attempts {
            let container = self
                .container(container_id)
                .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;

            match container.state() {
                ContainerState::Available => {
                    return container.factory(component).ok_or_else(|| Error::ComponentNotFound {
                        container: container_id.to_string(),
                        component: component.to_string(),
                    });
                }
                ContainerState::Stopped => return Err(Error::Stopped(container_id.to_string())),
                ContainerState::Starting if attempt + 1 < attempts => {
                    let delay = self.retry.delay(attempt);
                    debug!(container = %container_id, attempt, ?delay, "container still starting");
                    tokio::time::sleep(delay).await;
                }
                ContainerState::Starting => {}
            }
        }

        warn!(container = %container_id, attempts, "container never became available");
        Err(Error::Unavailable {
            container: container_id.to_string(),
            attempts,
        })
    }

    /// Routes a local request.
    pub async fn route(&self, request: Request) -> Response {
        match self.resolve(&request.container_id, &request.component).await {
            Ok(factory) => factory.invoke_local(request).await,
            Err(e) => Self::unresolved(e, &request),
        }
    }

    /// Routes a request that arrived over a transport.
    pub async fn route_remote(&self, request: Request) -> Response {
        match self.resolve(&request.container_id, &request.component).await {
            Ok(factory) => factory.invoke_remote(request).await,
            Err(e) => Self::unresolved(e, &request),
        }
    }

    fn unresolved(error: Error, request: &Request) -> Response {
        debug!(container = %request.container_id, component = %request.component, error = %error, "unresolved request");
        Failure::new(error.kind(), error.to_string(), request.fingerprint)
            .with_identity(request.identity.clone())
            .into()
    }
}
