//! # Component Factory
//!
//! Owns everything that exists per component: the descriptor, the method
//! table, the materialized interceptor chain, and the instance pool. Every
//! invocation entry point returns a `Response`; failures never escape as
//! errors.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use beanwire::Failure;
use beanwire::FailureKind;
use beanwire::Fingerprint;
use beanwire::FingerprintTable;
use beanwire::Identity;
use beanwire::MethodSignature;
use beanwire::Principal;
use beanwire::Request;
use beanwire::Response;
use beanwire::Value;

use crate::bean::Bean;
use crate::bean::ConstructionError;
use crate::bean::ConstructionStage;
use crate::bean::ResourceInjector;
use crate::bean::ResourceMap;
use crate::context::InvocationContext;
use crate::context::InvocationError;
use crate::context::Origin;
use crate::context::TimerHandle;
use crate::descriptor::ComponentDescriptor;
use crate::descriptor::Lifecycle;
use crate::interceptor::InterceptorChain;
use crate::pool;
use crate::pool::InstancePool;
use crate::pool::InstanceSource;
use crate::pool::Lease;
use crate::pool::PoolConfig;
use crate::pool::PoolStats;
use crate::scope::ScopeGuard;
use crate::scope::ScopeProvider;
use crate::scope::ThreadScope;
use crate::security;
use crate::security::DeclaredAccess;
use crate::security::PermissionCheck;

#[derive(Debug)]
pub enum Error {
    Interface { component: String, source: beanwire::Error },
    Pool(pool::Error),
    /// The operation only applies to identified components.
    NotIdentified(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interface { component, source } => {
                write!(f, "Invalid interface for '{}': {}", component, source)
            }
            Self::Pool(e) => write!(f, "Pool error: {}", e),
            Self::NotIdentified(name) => write!(f, "'{}' does not have identified instances", name),
        }
    }
}

impl std::error::Error for Error {}

impl From<pool::Error> for Error {
    fn from(e: pool::Error) -> Self {
        Self::Pool(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// External services the factory consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub injector: Arc<dyn ResourceInjector>,
    pub scope: Arc<dyn ScopeProvider>,
    pub permissions: Arc<dyn PermissionCheck>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            injector: Arc::new(ResourceMap::new()),
            scope: Arc::new(ThreadScope),
            permissions: Arc::new(DeclaredAccess),
        }
    }
}

impl Collaborators {
    pub fn with_injector(mut self, injector: impl ResourceInjector + 'static) -> Self {
        self.injector = Arc::new(injector);
        self
    }

    pub fn with_scope(mut self, scope: impl ScopeProvider + 'static) -> Self {
        self.scope = Arc::new(scope);
        self
    }

    pub fn with_permissions(mut self, permissions: impl PermissionCheck + 'static) -> Self {
        self.permissions = Arc::new(permissions);
        self
    }
}

/// Builds beans for the pool: allocate, inject, post-construct, all inside
/// the component's resolution scope.
struct Builder {
    descriptor: Arc<ComponentDescriptor>,
    injector: Arc<dyn ResourceInjector>,
    scope: Arc<dyn ScopeProvider>,
}

impl InstanceSource for Builder {
    fn create(&self) -> std::result::Result<Box<dyn Bean>, ConstructionError> {
        let name = self.descriptor.name();
        let _scope = ScopeGuard::enter(self.scope.as_ref(), name);

        let mut bean = (self.descriptor.constructor())()
            .map_err(|e| ConstructionError::new(name, ConstructionStage::Allocate, e))?;

        self.injector
            .inject(name, bean.as_mut())
            .map_err(|e| ConstructionError::new(name, ConstructionStage::Inject, e))?;

        if let Some(callbacks) = bean.lifecycle() {
            callbacks
                .post_construct()
                .map_err(|e| ConstructionError::new(name, ConstructionStage::PostConstruct, e))?;
        }

        Ok(bean)
    }

    fn destroy(&self, mut bean: Box<dyn Bean>) {
        if let Some(callbacks) = bean.lifecycle() {
            if let Err(e) = callbacks.pre_destroy() {
                warn!(component = %self.descriptor.name(), error = %e, "pre-destroy failed");
            }
        }
    }
}

pub struct ComponentFactory {
    container_id: String,
    descriptor: Arc<ComponentDescriptor>,
    table: FingerprintTable,
    chain: InterceptorChain,
    builder: Arc<Builder>,
    pool: InstancePool,
    singleton: Option<Identity>,
    identities: AtomicU64,
}

impl ComponentFactory {
    pub fn new(
        container_id: impl Into<String>,
        descriptor: ComponentDescriptor,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let descriptor = Arc::new(descriptor);
        let table = descriptor.interface().table().map_err(|source| Error::Interface {
            component: descriptor.name().to_string(),
            source,
        })?;
        let chain = InterceptorChain::from_descriptor(&descriptor, collaborators.permissions);
        let builder = Arc::new(Builder {
            descriptor: Arc::clone(&descriptor),
            injector: collaborators.injector,
            scope: collaborators.scope,
        });
        let pool = InstancePool::new(PoolConfig::from_descriptor(&descriptor), builder.clone());
        let singleton = match descriptor.lifecycle() {
            Lifecycle::Singleton => Some(Identity::new(descriptor.name())),
            _ => None,
        };

        Ok(Self {
            container_id: container_id.into(),
            descriptor,
            table,
            chain,
            builder,
            pool,
            singleton,
            identities: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    pub fn table(&self) -> &FingerprintTable {
        &self.table
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Builds a fully initialized bean outside the pool.
    pub fn create_instance(&self) -> std::result::Result<Box<dyn Bean>, ConstructionError> {
        self.builder.create()
    }

    pub async fn invoke_local(&self, request: Request) -> Response {
        self.invoke(request, Origin::Local).await
    }

    /// Same as `invoke_local`, for calls that crossed a transport.
    pub async fn invoke_remote(&self, request: Request) -> Response {
        if !self.descriptor.is_remote() {
            let message = format!("'{}' has no remote view", self.name());
            return Failure::new(FailureKind::NotFound, message, request.fingerprint).into();
        }
        self.invoke(request, Origin::Remote).await
    }

    async fn invoke(&self, request: Request, origin: Origin) -> Response {
        let Request {
            fingerprint,
            identity,
            args,
            caller,
            ..
        } = request;

        let Some(method) = self.table.get(fingerprint).cloned() else {
            debug!(component = %self.name(), fingerprint = %fingerprint, "unknown method fingerprint");
            let message = format!("'{}' has no method with fingerprint {}", self.name(), fingerprint);
            return Failure::new(FailureKind::NotFound, message, fingerprint)
                .with_identity(identity)
                .into();
        };

        let target = self.target(identity.as_ref());
        self.execute(method, target.as_ref(), args, caller, origin).await
    }

    /// Runs a timer callback through the chain.
    pub async fn notify_timeout(&self, timer: TimerHandle, method: &MethodSignature) -> Response {
        let fingerprint = method.fingerprint();
        let Some(method) = self.table.get(fingerprint).cloned() else {
            let message = format!("'{}' has no timeout method {}", self.name(), method);
            return Failure::new(FailureKind::NotFound, message, fingerprint).into();
        };

        let args = match method.arity() {
            0 => Vec::new(),
            _ => vec![timer.info.clone()],
        };
        let target = self.target(timer.identity.as_ref());
        debug!(component = %self.name(), timer = timer.id, "timer fired");
        self.execute(method, target.as_ref(), args, Principal::anonymous(), Origin::Timer(timer))
            .await
    }

    /// Fires `timer` at the component's declared timeout method.
    pub async fn fire_timer(&self, timer: TimerHandle) -> Response {
        let Some(method) = self
            .descriptor
            .timeout_method()
            .and_then(|name| self.descriptor.interface().find(name))
            .cloned()
        else {
            let message = format!("'{}' has no timeout method", self.name());
            return Failure::new(FailureKind::NotFound, message, Fingerprint::UNKNOWN).into();
        };
        self.notify_timeout(timer, &method).await
    }

    fn target(&self, identity: Option<&Identity>) -> Option<Identity> {
        match self.descriptor.lifecycle() {
            Lifecycle::Pooled => None,
            Lifecycle::Identified => identity.cloned(),
            Lifecycle::Singleton => self.singleton.clone(),
        }
    }

    async fn execute(
        &self,
        method: Arc<MethodSignature>,
        identity: Option<&Identity>,
        args: Vec<Value>,
        caller: Principal,
        origin: Origin,
    ) -> Response {
        let fingerprint = method.fingerprint();
        let reported = identity.filter(|_| self.descriptor.lifecycle() == Lifecycle::Identified).cloned();

        let mut lease = match self.pool.acquire(identity).await {
            Ok(lease) => lease,
            Err(e) => return self.pool_failure(e, fingerprint, reported).into(),
        };

        let result = {
            let ctx = InvocationContext::new(&self.descriptor, &self.chain, lease.instance_mut(), Arc::clone(&method), args)
                .with_caller(caller.clone())
                .with_origin(origin);
            security::scope(caller, ctx.run()).await
        };

        match result {
            Ok(value) => {
                debug!(component = %self.name(), method = %method.name, "call completed");
                self.settle(lease, false);
                Response::Success(value)
            }
            Err(e) => {
                let failure = self.classify(&e, fingerprint, reported);
                let discard = self.should_discard(&e);
                if discard {
                    warn!(
                        component = %self.name(),
                        method = %method.name,
                        instance = %lease.instance().id(),
                        error = %e,
                        "discarding instance after failure"
                    );
                }
                self.settle(lease, discard);
                Response::Failure(failure)
            }
        }
    }

    fn settle(&self, lease: Lease, discard: bool) {
        if discard {
            self.pool.discard(lease);
        } else {
            self.pool.release(lease);
        }
    }

    fn should_discard(&self, error: &InvocationError) -> bool {
        match error {
            InvocationError::Business(e) => {
                !self.descriptor.is_application_error(&e.name) && self.descriptor.discards_on_system_error()
            }
            InvocationError::AccessDenied { .. } => false,
            InvocationError::Internal(_) => true,
        }
    }

    fn classify(&self, error: &InvocationError, fingerprint: Fingerprint, identity: Option<Identity>) -> Failure {
        let failure = match error {
            InvocationError::Business(e) if self.descriptor.is_application_error(&e.name) => {
                Failure::new(FailureKind::Application, &e.message, fingerprint).with_error_name(&e.name)
            }
            InvocationError::Business(e) => {
                Failure::new(FailureKind::System, &e.message, fingerprint).with_error_name(&e.name)
            }
            InvocationError::AccessDenied { .. } => {
                Failure::new(FailureKind::AccessDenied, error.to_string(), fingerprint)
            }
            InvocationError::Internal(msg) => {
                warn!(component = %self.name(), error = %msg, "internal invocation failure");
                Failure::new(FailureKind::Internal, msg, fingerprint)
            }
        };
        failure.with_identity(identity)
    }

    fn pool_failure(&self, error: pool::Error, fingerprint: Fingerprint, identity: Option<Identity>) -> Failure {
        let kind = match &error {
            pool::Error::Exhausted { .. } | pool::Error::Timeout { .. } => FailureKind::PoolExhausted,
            pool::Error::Construction(_) => FailureKind::Construction,
            pool::Error::Closed(_) => FailureKind::Unavailable,
            pool::Error::IdentityRequired(_) => FailureKind::NotFound,
        };
        debug!(component = %self.name(), kind = %kind, error = %error, "no instance for call");
        Failure::new(kind, error.to_string(), fingerprint).with_identity(identity)
    }

    /// Mints an identity and creates its instance.
    pub async fn new_identity(&self) -> Result<Identity> {
        if self.descriptor.lifecycle() != Lifecycle::Identified {
            return Err(Error::NotIdentified(self.name().to_string()));
        }
        let n = self.identities.fetch_add(1, Ordering::Relaxed);
        let identity = Identity::new(format!("{}/{}/{}", self.container_id, self.name(), n));
        let lease = self.pool.acquire(Some(&identity)).await?;
        self.pool.release(lease);
        info!(component = %self.name(), identity = %identity, "identity created");
        Ok(identity)
    }

    /// Destroys the instance bound to `identity`.
    pub async fn remove(&self, identity: &Identity) -> Result<bool> {
        if self.descriptor.lifecycle() != Lifecycle::Identified {
            return Err(Error::NotIdentified(self.name().to_string()));
        }
        Ok(self.pool.remove(identity).await?)
    }

    pub fn sweep_expired(&self) -> usize {
        self.pool.sweep_expired()
    }

    pub fn warm_up(&self) -> Result<usize> {
        Ok(self.pool.warm_up()?)
    }

    /// Starts sweeping expired identified instances in the background.
    /// Returns `None` without an idle timeout or outside a runtime.
    pub fn spawn_reaper(&self) -> Option<JoinHandle<()>> {
        let every = self.descriptor.idle_timeout()?;
        tokio::runtime::Handle::try_current().ok()?;
        Some(self.pool.spawn_reaper(every))
    }

    pub fn shutdown(&self) {
        info!(container = %self.container_id, component = %self.name(), "shutting down component");
        self.pool.close();
    }
}

impl std::fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("container_id", &self.container_id)
            .field("component", &self.name())
            .field("chain", &self.chain)
            .finish()
    }
}
