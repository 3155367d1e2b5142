//! # Component Capabilities
//!
//! A component is a `Bean`: something that can run a business method. The
//! optional lifecycle and injection capabilities are exposed through small
//! accessor methods instead of a trait hierarchy, so each component opts into
//! exactly the capabilities it has.

use std::any::Any;
use std::sync::Arc;

use beanwire::MethodSignature;
use beanwire::Value;

/// Boxed error raised by component code outside of business methods.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Typed resources available for injection.
pub type Resources = anymap::Map<dyn anymap::any::Any + Send + Sync>;

/// Error raised by a business method.
///
/// The component names the error; its descriptor decides whether that name is
/// a declared application error or an unexpected system error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeanError {
    pub name: String,
    pub message: String,
}

impl BeanError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// The method was called with arguments it cannot accept.
    pub fn bad_arguments(method: &MethodSignature, args: &[Value]) -> Self {
        let found: Vec<&str> = args.iter().map(Value::type_name).collect();
        Self::new(
            "BadArguments",
            format!("{} called with ({})", method, found.join(",")),
        )
    }

    /// The bean does not implement the method.
    pub fn unsupported(method: &MethodSignature) -> Self {
        Self::new("UnsupportedMethod", format!("{} is not implemented", method))
    }
}

impl std::fmt::Display for BeanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for BeanError {}

/// A live component object.
#[async_trait::async_trait]
pub trait Bean: Send + 'static {
    /// Runs one business method.
    async fn invoke(&mut self, method: &MethodSignature, args: Vec<Value>) -> Result<Value, BeanError>;

    /// Lifecycle callbacks, if the component declares any.
    fn lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        None
    }

    /// Injection target, if the component declares dependencies.
    fn injectable(&mut self) -> Option<&mut dyn Injectable> {
        None
    }
}

/// Post-construct and pre-destroy callbacks. Each runs at most once per instance.
pub trait Lifecycle: Send {
    fn post_construct(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn pre_destroy(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Receives declared dependencies before post-construct.
pub trait Injectable: Send {
    fn inject(&mut self, resources: &Resources) -> Result<(), BoxError>;
}

/// Allocates a fresh, uninitialized bean.
pub type Constructor = Arc<dyn Fn() -> Result<Box<dyn Bean>, BoxError> + Send + Sync>;

/// Wraps a typed allocation function as a `Constructor`.
pub fn constructor<B, F>(f: F) -> Constructor
where
    B: Bean,
    F: Fn() -> Result<B, BoxError> + Send + Sync + 'static,
{
    Arc::new(move || f().map(|bean| Box::new(bean) as Box<dyn Bean>))
}

/// Fills an instance's dependencies. Consumed by the factory during construction.
pub trait ResourceInjector: Send + Sync {
    fn inject(&self, component: &str, bean: &mut dyn Bean) -> Result<(), BoxError>;
}

/// Injects from a typed resource map.
pub struct ResourceMap {
    resources: Resources,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self {
            resources: Resources::new(),
        }
    }

    pub fn insert<T: Any + Send + Sync>(mut self, resource: T) -> Self {
        self.resources.insert(resource);
        self
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.resources.get::<T>()
    }
}

impl Default for ResourceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceInjector for ResourceMap {
    fn inject(&self, _component: &str, bean: &mut dyn Bean) -> Result<(), BoxError> {
        match bean.injectable() {
            Some(target) => target.inject(&self.resources),
            None => Ok(()),
        }
    }
}

/// Which construction step failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstructionStage {
    Allocate,
    Inject,
    PostConstruct,
}

impl std::fmt::Display for ConstructionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allocate => write!(f, "allocate"),
            Self::Inject => write!(f, "inject"),
            Self::PostConstruct => write!(f, "post-construct"),
        }
    }
}

/// An instance could not be brought to a usable state.
#[derive(Debug)]
pub struct ConstructionError {
    pub component: String,
    pub stage: ConstructionStage,
    pub source: BoxError,
}

impl ConstructionError {
    pub fn new(component: impl Into<String>, stage: ConstructionStage, source: BoxError) -> Self {
        Self {
            component: component.into(),
            stage,
            source,
        }
    }
}

impl std::fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to {} '{}': {}", self.stage, self.component, self.source)
    }
}

impl std::error::Error for ConstructionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
