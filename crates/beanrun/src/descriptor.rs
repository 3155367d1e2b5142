//! # Component Descriptor
//!
//! Static, read-only metadata for one component type, assembled at deployment
//! time with a fluent builder and owned by the component's factory afterwards.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use beanwire::Interface;
use beanwire::Principal;

use crate::bean::Constructor;
use crate::config::ComponentOverrides;
use crate::interceptor::Interceptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidBounds { component: String, details: String },
    /// `DiscardOnReturn` was configured on a component without identified instances.
    DiscardRequiresIdentified(String),
    /// `RunAs` was configured without a run-as principal.
    MissingRunAs(String),
    UnknownTimeoutMethod { component: String, method: String },
    Interface { component: String, source: beanwire::Error },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBounds { component, details } => {
                write!(f, "Invalid pool bounds for '{}': {}", component, details)
            }
            Self::DiscardRequiresIdentified(name) => {
                write!(f, "Discard-on-return requires identified instances ('{}')", name)
            }
            Self::MissingRunAs(name) => write!(f, "Run-as interceptor without a run-as principal ('{}')", name),
            Self::UnknownTimeoutMethod { component, method } => {
                write!(f, "Timeout method '{}' is not part of '{}'", method, component)
            }
            Self::Interface { component, source } => {
                write!(f, "Invalid interface for '{}': {}", component, source)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// How instances of a component are retained between calls.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Lifecycle {
    /// Anonymous, interchangeable, reused after successful calls.
    Pooled,
    /// Bound to a caller identity and retained across calls.
    Identified,
    /// One retained instance, calls serialized.
    Singleton,
}

impl Lifecycle {
    /// Whether instances are kept per key rather than in a shared idle set.
    pub fn is_keyed(self) -> bool {
        !matches!(self, Self::Pooled)
    }
}

/// Pool sizing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolBounds {
    /// Instances created up front by `warm_up`.
    pub min: usize,
    /// Upper bound on live instances (`active + idle`).
    pub max: usize,
    /// Idle instances kept after release; extras are destroyed.
    pub spare: usize,
    /// Callers allowed to wait for an instance at once.
    pub max_waiters: usize,
}

impl Default for PoolBounds {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            spare: 10,
            max_waiters: 64,
        }
    }
}

impl PoolBounds {
    pub fn validate(&self, component: &str) -> Result<()> {
        let invalid = |details: String| Error::InvalidBounds {
            component: component.to_string(),
            details,
        };

        if self.max == 0 {
            return Err(invalid("max must be greater than 0".into()));
        }
        if self.min > self.max {
            return Err(invalid(format!("min ({}) exceeds max ({})", self.min, self.max)));
        }
        if self.spare > self.max {
            return Err(invalid(format!("spare ({}) exceeds max ({})", self.spare, self.max)));
        }
        Ok(())
    }
}

/// Who may call a method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessRule {
    PermitAll,
    DenyAll,
    Allow(HashSet<Principal>),
    Deny(HashSet<Principal>),
}

impl AccessRule {
    pub fn allow<I, P>(principals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Principal>,
    {
        Self::Allow(principals.into_iter().map(Into::into).collect())
    }

    pub fn deny<I, P>(principals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Principal>,
    {
        Self::Deny(principals.into_iter().map(Into::into).collect())
    }

    pub fn permits(&self, caller: &Principal) -> bool {
        match self {
            Self::PermitAll => true,
            Self::DenyAll => false,
            Self::Allow(set) => set.contains(caller),
            Self::Deny(set) => !set.contains(caller),
        }
    }
}

/// Per-method access rules with a component-wide default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessRules {
    default: AccessRule,
    methods: HashMap<String, AccessRule>,
}

impl Default for AccessRules {
    fn default() -> Self {
        Self {
            default: AccessRule::PermitAll,
            methods: HashMap::new(),
        }
    }
}

impl AccessRules {
    pub fn rule_for(&self, method: &str) -> &AccessRule {
        self.methods.get(method).unwrap_or(&self.default)
    }

    pub fn permits(&self, caller: &Principal, method: &str) -> bool {
        self.rule_for(method).permits(caller)
    }
}

/// One position in a component's interceptor ordering.
#[derive(Clone)]
pub enum InterceptorSpec {
    AccessControl,
    RunAs,
    /// Discard the identified instance after these methods return normally.
    /// An empty list applies to every method.
    DiscardOnReturn { methods: Vec<String> },
    Custom(Arc<dyn Interceptor>),
}

impl std::fmt::Debug for InterceptorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessControl => write!(f, "AccessControl"),
            Self::RunAs => write!(f, "RunAs"),
            Self::DiscardOnReturn { methods } => write!(f, "DiscardOnReturn({:?})", methods),
            Self::Custom(i) => write!(f, "Custom({})", i.name()),
        }
    }
}

/// Immutable metadata for one component type.
pub struct ComponentDescriptor {
    name: String,
    lifecycle: Lifecycle,
    interface: Interface,
    constructor: Constructor,
    timeout: Duration,
    bounds: PoolBounds,
    idle_timeout: Option<Duration>,
    run_as: Option<Principal>,
    access: AccessRules,
    interceptors: Vec<InterceptorSpec>,
    application_errors: HashSet<String>,
    timeout_method: Option<String>,
    remote: bool,
    discard_on_system_error: bool,
}

impl ComponentDescriptor {
    pub fn builder(
        name: impl Into<String>,
        lifecycle: Lifecycle,
        interface: Interface,
        constructor: Constructor,
    ) -> DescriptorBuilder {
        DescriptorBuilder::new(name, lifecycle, interface, constructor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn constructor(&self) -> &Constructor {
        &self.constructor
    }

    /// Longest a caller waits for an instance.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn bounds(&self) -> PoolBounds {
        self.bounds
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn run_as(&self) -> Option<&Principal> {
        self.run_as.as_ref()
    }

    pub fn access(&self) -> &AccessRules {
        &self.access
    }

    pub fn interceptors(&self) -> &[InterceptorSpec] {
        &self.interceptors
    }

    pub fn is_application_error(&self, name: &str) -> bool {
        self.application_errors.contains(name)
    }

    pub fn timeout_method(&self) -> Option<&str> {
        self.timeout_method.as_deref()
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn discards_on_system_error(&self) -> bool {
        self.discard_on_system_error
    }

    /// Applies deployment-time overrides and re-validates the bounds.
    pub fn with_overrides(mut self, overrides: &ComponentOverrides) -> Result<Self> {
        if let Some(min) = overrides.min {
            self.bounds.min = min;
        }
        if let Some(max) = overrides.max {
            self.bounds.max = max;
        }
        if let Some(spare) = overrides.spare {
            self.bounds.spare = spare;
        }
        if let Some(max_waiters) = overrides.max_waiters {
            self.bounds.max_waiters = max_waiters;
        }
        if let Some(ms) = overrides.timeout_ms {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.idle_timeout_ms {
            self.idle_timeout = Some(Duration::from_millis(ms));
        }
        self.validate_bounds()?;
        Ok(self)
    }

    fn validate_bounds(&self) -> Result<()> {
        self.bounds.validate(&self.name)?;
        if self.lifecycle == Lifecycle::Singleton && self.bounds.max != 1 {
            return Err(Error::InvalidBounds {
                component: self.name.clone(),
                details: "singleton components hold exactly one instance".into(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle)
            .field("interface", &self.interface.name)
            .field("timeout", &self.timeout)
            .field("bounds", &self.bounds)
            .field("run_as", &self.run_as)
            .field("interceptors", &self.interceptors)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Fluent builder for `ComponentDescriptor`.
pub struct DescriptorBuilder {
    descriptor: ComponentDescriptor,
}

impl DescriptorBuilder {
    pub fn new(
        name: impl Into<String>,
        lifecycle: Lifecycle,
        interface: Interface,
        constructor: Constructor,
    ) -> Self {
        let bounds = match lifecycle {
            Lifecycle::Singleton => PoolBounds {
                min: 0,
                max: 1,
                spare: 1,
                ..PoolBounds::default()
            },
            _ => PoolBounds::default(),
        };

        Self {
            descriptor: ComponentDescriptor {
                name: name.into(),
                lifecycle,
                interface,
                constructor,
                timeout: Duration::from_secs(30),
                bounds,
                idle_timeout: None,
                run_as: None,
                access: AccessRules::default(),
                interceptors: Vec::new(),
                application_errors: HashSet::new(),
                timeout_method: None,
                remote: true,
                discard_on_system_error: !matches!(lifecycle, Lifecycle::Singleton),
            },
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = timeout;
        self
    }

    pub fn bounds(mut self, bounds: PoolBounds) -> Self {
        self.descriptor.bounds = bounds;
        self
    }

    pub fn max(mut self, max: usize) -> Self {
        self.descriptor.bounds.max = max;
        self.descriptor.bounds.spare = self.descriptor.bounds.spare.min(max);
        self
    }

    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.descriptor.idle_timeout = Some(idle);
        self
    }

    pub fn run_as(mut self, principal: impl Into<Principal>) -> Self {
        self.descriptor.run_as = Some(principal.into());
        self
    }

    pub fn default_access(mut self, rule: AccessRule) -> Self {
        self.descriptor.access.default = rule;
        self
    }

    pub fn access(mut self, method: impl Into<String>, rule: AccessRule) -> Self {
        self.descriptor.access.methods.insert(method.into(), rule);
        self
    }

    /// Appends the next interceptor in call order.
    pub fn interceptor(mut self, spec: InterceptorSpec) -> Self {
        self.descriptor.interceptors.push(spec);
        self
    }

    pub fn application_error(mut self, name: impl Into<String>) -> Self {
        self.descriptor.application_errors.insert(name.into());
        self
    }

    pub fn timeout_method(mut self, method: impl Into<String>) -> Self {
        self.descriptor.timeout_method = Some(method.into());
        self
    }

    /// Hides the component from `invoke_remote`.
    pub fn local_only(mut self) -> Self {
        self.descriptor.remote = false;
        self
    }

    pub fn discard_on_system_error(mut self, discard: bool) -> Self {
        self.descriptor.discard_on_system_error = discard;
        self
    }

    pub fn build(self) -> Result<ComponentDescriptor> {
        let d = self.descriptor;

        d.validate_bounds()?;

        for spec in &d.interceptors {
            match spec {
                InterceptorSpec::DiscardOnReturn { .. } if d.lifecycle != Lifecycle::Identified => {
                    return Err(Error::DiscardRequiresIdentified(d.name.clone()));
                }
                InterceptorSpec::RunAs if d.run_as.is_none() => {
                    return Err(Error::MissingRunAs(d.name.clone()));
                }
                _ => {}
            }
        }

        if let Some(method) = &d.timeout_method {
            if d.interface.find(method).is_none() {
                return Err(Error::UnknownTimeoutMethod {
                    component: d.name.clone(),
                    method: method.clone(),
                });
            }
        }

        d.interface.table().map_err(|source| Error::Interface {
            component: d.name.clone(),
            source,
        })?;

        Ok(d)
    }
}
