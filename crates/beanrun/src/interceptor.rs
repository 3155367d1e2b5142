//! # Interceptors
//!
//! Behavior wrapped around every business method call. A component's chain is
//! materialized once from its descriptor and shared by all of its calls.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use beanwire::Principal;
use beanwire::Value;

use crate::context::InvocationContext;
use crate::context::InvocationError;
use crate::descriptor::ComponentDescriptor;
use crate::descriptor::InterceptorSpec;
use crate::security;
use crate::security::PermissionCheck;

/// One position in a chain. Call `ctx.proceed()` to continue, or return
/// without it to short-circuit.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn intercept(&self, ctx: &mut InvocationContext<'_>) -> Result<Value, InvocationError>;
}

/// The ordered interceptors of one component.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    /// Builds the chain in the order the descriptor lists it.
    pub fn from_descriptor(descriptor: &ComponentDescriptor, permissions: Arc<dyn PermissionCheck>) -> Self {
        let interceptors = descriptor
            .interceptors()
            .iter()
            .filter_map(|spec| -> Option<Arc<dyn Interceptor>> {
                match spec {
                    InterceptorSpec::AccessControl => Some(Arc::new(AccessControl::new(Arc::clone(&permissions)))),
                    InterceptorSpec::RunAs => descriptor
                        .run_as()
                        .map(|principal| Arc::new(RunAs::new(principal.clone())) as Arc<dyn Interceptor>),
                    InterceptorSpec::DiscardOnReturn { methods } => {
                        Some(Arc::new(DiscardOnReturn::new(methods.iter().cloned())))
                    }
                    InterceptorSpec::Custom(interceptor) => Some(Arc::clone(interceptor)),
                }
            })
            .collect();

        Self { interceptors }
    }

    pub fn get(&self, position: usize) -> Option<&Arc<dyn Interceptor>> {
        self.interceptors.get(position)
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Rejects callers the permission check does not allow.
pub struct AccessControl {
    permissions: Arc<dyn PermissionCheck>,
}

impl AccessControl {
    pub fn new(permissions: Arc<dyn PermissionCheck>) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Interceptor for AccessControl {
    fn name(&self) -> &str {
        "access-control"
    }

    async fn intercept(&self, ctx: &mut InvocationContext<'_>) -> Result<Value, InvocationError> {
        let run_as = ctx.descriptor().run_as().is_some();
        let allowed = self
            .permissions
            .check(ctx.caller(), ctx.descriptor(), ctx.method(), run_as);

        if !allowed {
            warn!(
                component = %ctx.descriptor().name(),
                method = %ctx.method().name,
                caller = %ctx.caller(),
                "access denied"
            );
            return Err(InvocationError::AccessDenied {
                caller: ctx.caller().clone(),
                method: ctx.method().name.clone(),
            });
        }

        ctx.proceed().await
    }
}

/// Runs the rest of the chain as a fixed principal.
pub struct RunAs {
    principal: Principal,
}

impl RunAs {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }
}

#[async_trait]
impl Interceptor for RunAs {
    fn name(&self) -> &str {
        "run-as"
    }

    async fn intercept(&self, ctx: &mut InvocationContext<'_>) -> Result<Value, InvocationError> {
        let previous = ctx.replace_caller(self.principal.clone());
        let result = security::scope(self.principal.clone(), ctx.proceed()).await;
        ctx.replace_caller(previous);
        result
    }
}

/// Discards an identified instance once a removing method returns normally.
pub struct DiscardOnReturn {
    /// Empty means every method.
    methods: HashSet<String>,
}

impl DiscardOnReturn {
    pub fn new(methods: impl IntoIterator<Item = String>) -> Self {
        Self {
            methods: methods.into_iter().collect(),
        }
    }

    fn applies_to(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

#[async_trait]
impl Interceptor for DiscardOnReturn {
    fn name(&self) -> &str {
        "discard-on-return"
    }

    async fn intercept(&self, ctx: &mut InvocationContext<'_>) -> Result<Value, InvocationError> {
        let result = ctx.proceed().await;
        if result.is_ok() && self.applies_to(&ctx.method().name) {
            debug!(
                component = %ctx.descriptor().name(),
                identity = ?ctx.instance().identity(),
                "instance removed by its method"
            );
            ctx.mark_for_discard();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AccessRule;
    use crate::descriptor::Lifecycle;
    use crate::security::DeclaredAccess;
    use crate::testkit;

    fn run_with<'a>(
        descriptor: &'a ComponentDescriptor,
        chain: &'a InterceptorChain,
        instance: &'a mut crate::pool::Instance,
        method: &str,
        args: Vec<Value>,
        caller: &str,
    ) -> InvocationContext<'a> {
        InvocationContext::new(descriptor, chain, instance, testkit::method(method), args)
            .with_caller(Principal::new(caller))
    }

    #[tokio::test]
    async fn test_access_control_denies_without_proceeding() {
        let events = testkit::events();
        let descriptor = testkit::probe_descriptor("probe", Lifecycle::Pooled, &events)
            .access("count", AccessRule::allow(["alice"]))
            .interceptor(InterceptorSpec::AccessControl)
            .build()
            .unwrap();
        let chain = InterceptorChain::from_descriptor(&descriptor, Arc::new(DeclaredAccess));
        let mut instance = testkit::probe_instance(&events);

        let denied = run_with(&descriptor, &chain, &mut instance, "count", Vec::new(), "mallory")
            .run()
            .await;
        assert_eq!(
            denied,
            Err(InvocationError::AccessDenied {
                caller: Principal::new("mallory"),
                method: "count".into(),
            })
        );
        assert_eq!(testkit::count(&events, "call:count"), 0);

        let allowed = run_with(&descriptor, &chain, &mut instance, "count", Vec::new(), "alice")
            .run()
            .await;
        assert_eq!(allowed, Ok(Value::S64(1)));
    }

    struct RecordingCheck {
        seen: parking_lot::Mutex<Vec<(String, String, bool)>>,
    }

    impl PermissionCheck for RecordingCheck {
        fn check(
            &self,
            caller: &Principal,
            _descriptor: &ComponentDescriptor,
            method: &beanwire::MethodSignature,
            run_as: bool,
        ) -> bool {
            self.seen
                .lock()
                .push((caller.name().to_string(), method.name.clone(), run_as));
            true
        }
    }

    #[tokio::test]
    async fn test_access_control_passes_run_as_flag() {
        let events = testkit::events();
        let descriptor = testkit::probe_descriptor("probe", Lifecycle::Pooled, &events)
            .run_as("system")
            .interceptor(InterceptorSpec::AccessControl)
            .build()
            .unwrap();
        let check = Arc::new(RecordingCheck {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let chain = InterceptorChain::from_descriptor(&descriptor, check.clone());
        let mut instance = testkit::probe_instance(&events);

        run_with(&descriptor, &chain, &mut instance, "count", Vec::new(), "bob")
            .run()
            .await
            .unwrap();
        assert_eq!(*check.seen.lock(), vec![("bob".to_string(), "count".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_run_as_swaps_and_restores_identity() {
        let events = testkit::events();
        let descriptor = testkit::probe_descriptor("probe", Lifecycle::Pooled, &events)
            .run_as("system")
            .interceptor(InterceptorSpec::RunAs)
            .build()
            .unwrap();
        let chain = InterceptorChain::from_descriptor(&descriptor, Arc::new(DeclaredAccess));
        let mut instance = testkit::probe_instance(&events);

        let seen = security::scope(Principal::new("alice"), async {
            let seen = run_with(&descriptor, &chain, &mut instance, "whoami", Vec::new(), "alice")
                .run()
                .await;
            assert_eq!(security::current().name(), "alice");
            seen
        })
        .await;
        assert_eq!(seen, Ok(Value::from("system")));
        assert!(security::current().is_anonymous());
    }

    #[tokio::test]
    async fn test_run_as_restores_identity_after_failure() {
        let events = testkit::events();
        let descriptor = testkit::probe_descriptor("probe", Lifecycle::Pooled, &events)
            .run_as("system")
            .interceptor(InterceptorSpec::RunAs)
            .build()
            .unwrap();
        let chain = InterceptorChain::from_descriptor(&descriptor, Arc::new(DeclaredAccess));
        let mut instance = testkit::probe_instance(&events);

        security::scope(Principal::new("alice"), async {
            let mut ctx = run_with(&descriptor, &chain, &mut instance, "fail", vec![Value::from("Boom")], "alice");
            assert!(ctx.proceed().await.is_err());
            assert_eq!(ctx.caller().name(), "alice");
            assert_eq!(security::current().name(), "alice");
        })
        .await;
    }

    #[tokio::test]
    async fn test_discard_on_return_marks_only_on_success() {
        let events = testkit::events();
        let descriptor = testkit::probe_descriptor("cart", Lifecycle::Identified, &events)
            .interceptor(InterceptorSpec::DiscardOnReturn { methods: Vec::new() })
            .build()
            .unwrap();
        let chain = InterceptorChain::from_descriptor(&descriptor, Arc::new(DeclaredAccess));

        let mut failed = testkit::probe_instance(&events);
        let result = run_with(&descriptor, &chain, &mut failed, "fail", vec![Value::from("Boom")], "alice")
            .run()
            .await;
        assert!(result.is_err());
        assert!(!failed.is_marked_for_discard());

        let mut removed = testkit::probe_instance(&events);
        run_with(&descriptor, &chain, &mut removed, "remove", Vec::new(), "alice")
            .run()
            .await
            .unwrap();
        assert!(removed.is_marked_for_discard());
    }

    #[tokio::test]
    async fn test_discard_on_return_limited_to_named_methods() {
        let events = testkit::events();
        let descriptor = testkit::probe_descriptor("cart", Lifecycle::Identified, &events)
            .interceptor(InterceptorSpec::DiscardOnReturn {
                methods: vec!["remove".into()],
            })
            .build()
            .unwrap();
        let chain = InterceptorChain::from_descriptor(&descriptor, Arc::new(DeclaredAccess));
        let mut instance = testkit::probe_instance(&events);

        run_with(&descriptor, &chain, &mut instance, "count", Vec::new(), "alice")
            .run()
            .await
            .unwrap();
        assert!(!instance.is_marked_for_discard());

        run_with(&descriptor, &chain, &mut instance, "remove", Vec::new(), "alice")
            .run()
            .await
            .unwrap();
        assert!(instance.is_marked_for_discard());
    }

    #[test]
    fn test_chain_follows_descriptor_order() {
        let events = testkit::events();
        let descriptor = testkit::probe_descriptor("cart", Lifecycle::Identified, &events)
            .run_as("system")
            .interceptor(InterceptorSpec::RunAs)
            .interceptor(InterceptorSpec::AccessControl)
            .interceptor(InterceptorSpec::DiscardOnReturn { methods: Vec::new() })
            .build()
            .unwrap();
        let chain = InterceptorChain::from_descriptor(&descriptor, Arc::new(DeclaredAccess));
        assert_eq!(chain.names(), vec!["run-as", "access-control", "discard-on-return"]);
    }
}
