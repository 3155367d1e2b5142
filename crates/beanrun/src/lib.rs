//! # Beanrun
//!
//! A managed-component runtime. Components are deployed into containers,
//! instantiated through per-component pools, and called through an ordered
//! interceptor chain. Callers hold proxies that work the same whether the
//! container is in-process or behind a transport.

pub mod bean;
pub mod config;
pub mod container;
pub mod context;
pub mod descriptor;
pub mod dispatch;
pub mod endpoint;
pub mod factory;
pub mod interceptor;
pub mod peer;
pub mod pool;
pub mod proxy;
pub mod scope;
pub mod security;
pub mod telemetry;
pub mod transport;

pub use bean::Bean;
pub use bean::BeanError;
pub use container::Container;
pub use context::InvocationContext;
pub use context::InvocationError;
pub use descriptor::ComponentDescriptor;
pub use descriptor::InterceptorSpec;
pub use descriptor::Lifecycle;
pub use dispatch::Dispatcher;
pub use endpoint::Endpoint;
pub use factory::ComponentFactory;
pub use interceptor::Interceptor;
pub use peer::Peer;
pub use proxy::ComponentRef;
pub use proxy::ProxyBuilder;
pub use proxy::ProxyHandle;
pub use proxy::Route;

#[cfg(test)]
mod testkit;
