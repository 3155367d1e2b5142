//! # Invocation Context
//!
//! Transient state for one call while it moves through a component's
//! interceptor chain. Positions `0..N` are interceptors; position `N` is the
//! business method itself.
//!
//! `proceed()` enters the next position. Each position may be entered once;
//! entering it again without `reset()` is reported as an internal failure
//! instead of running the rest of the chain twice.

use std::sync::Arc;

use futures::future::BoxFuture;

use beanwire::Identity;
use beanwire::MethodSignature;
use beanwire::Principal;
use beanwire::Value;

use crate::bean::BeanError;
use crate::descriptor::ComponentDescriptor;
use crate::interceptor::InterceptorChain;
use crate::pool::Instance;

/// Typed values interceptors hand to each other during one call.
pub type ContextData = anymap::Map<dyn anymap::any::Any + Send + Sync>;

/// Why a call did not produce a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationError {
    AccessDenied { caller: Principal, method: String },
    /// Raised by the business method.
    Business(BeanError),
    /// Misuse of the chain or another runtime fault.
    Internal(String),
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessDenied { caller, method } => {
                write!(f, "'{}' may not call '{}'", caller, method)
            }
            Self::Business(e) => write!(f, "{}", e),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<BeanError> for InvocationError {
    fn from(e: BeanError) -> Self {
        Self::Business(e)
    }
}

pub type Result<T> = std::result::Result<T, InvocationError>;

/// A scheduled callback addressed to a component.
#[derive(Clone, Debug, PartialEq)]
pub struct TimerHandle {
    pub id: u64,
    pub info: Value,
    /// Target instance for identified components.
    pub identity: Option<Identity>,
}

impl TimerHandle {
    pub fn new(id: u64, info: impl Into<Value>) -> Self {
        Self {
            id,
            info: info.into(),
            identity: None,
        }
    }

    pub fn for_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Where a call came from.
#[derive(Clone, Debug, PartialEq)]
pub enum Origin {
    Local,
    Remote,
    Timer(TimerHandle),
}

pub struct InvocationContext<'a> {
    descriptor: &'a ComponentDescriptor,
    chain: &'a InterceptorChain,
    instance: &'a mut Instance,
    method: Arc<MethodSignature>,
    args: Vec<Value>,
    caller: Principal,
    origin: Origin,
    cursor: Option<usize>,
    entered: Vec<bool>,
    data: ContextData,
}

impl<'a> InvocationContext<'a> {
    pub fn new(
        descriptor: &'a ComponentDescriptor,
        chain: &'a InterceptorChain,
        instance: &'a mut Instance,
        method: Arc<MethodSignature>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            descriptor,
            chain,
            instance,
            method,
            args,
            caller: Principal::anonymous(),
            origin: Origin::Local,
            cursor: None,
            entered: vec![false; chain.len() + 1],
            data: ContextData::new(),
        }
    }

    pub fn with_caller(mut self, caller: Principal) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Runs the whole chain from the first position.
    pub async fn run(mut self) -> Result<Value> {
        self.proceed().await
    }

    /// Enters the next position in the chain.
    pub fn proceed(&mut self) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let chain = self.chain;
            let level = self.cursor.map_or(0, |c| c + 1);

            if level > chain.len() {
                return Err(InvocationError::Internal(format!(
                    "proceed() past the business method of '{}'",
                    self.method.name
                )));
            }
            if self.entered[level] {
                return Err(InvocationError::Internal(format!(
                    "proceed() called twice from position {} of '{}'",
                    level.saturating_sub(1),
                    self.method.name
                )));
            }
            self.entered[level] = true;

            let previous = self.cursor.replace(level);
            let result = match chain.get(level) {
                Some(interceptor) => interceptor.intercept(self).await,
                None => self.invoke_target().await,
            };
            self.cursor = previous;
            result
        })
    }

    /// Allows the positions after the current one to run again.
    pub fn reset(&mut self) {
        let from = self.cursor.map_or(0, |c| c + 1);
        for flag in &mut self.entered[from..] {
            *flag = false;
        }
    }

    async fn invoke_target(&mut self) -> Result<Value> {
        let method = Arc::clone(&self.method);
        let args = self.args.clone();
        self.instance
            .bean_mut()
            .invoke(&method, args)
            .await
            .map_err(InvocationError::Business)
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        self.descriptor
    }

    pub fn method(&self) -> &MethodSignature {
        &self.method
    }

    pub fn parameters(&self) -> &[Value] {
        &self.args
    }

    pub fn set_parameters(&mut self, args: Vec<Value>) {
        self.args = args;
    }

    pub fn caller(&self) -> &Principal {
        &self.caller
    }

    /// Swaps the caller principal, returning the previous one.
    pub fn replace_caller(&mut self, caller: Principal) -> Principal {
        std::mem::replace(&mut self.caller, caller)
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn instance(&self) -> &Instance {
        self.instance
    }

    /// Requests that the target instance be discarded once the call settles.
    pub fn mark_for_discard(&mut self) {
        self.instance.mark_for_discard();
    }

    /// Current chain position, `None` before the first `proceed()`.
    pub fn position(&self) -> Option<usize> {
        self.cursor
    }

    pub fn data(&self) -> &ContextData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ContextData {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::descriptor::InterceptorSpec;
    use crate::descriptor::Lifecycle;
    use crate::interceptor::Interceptor;
    use crate::security::DeclaredAccess;
    use crate::testkit;

    /// Records entry and exit around `proceed()`.
    struct Trace {
        name: &'static str,
        events: testkit::Events,
    }

    #[async_trait]
    impl Interceptor for Trace {
        fn name(&self) -> &str {
            self.name
        }

        async fn intercept(&self, ctx: &mut InvocationContext<'_>) -> Result<Value> {
            self.events.lock().push(format!("{}>", self.name));
            let result = ctx.proceed().await;
            self.events.lock().push(format!("<{}", self.name));
            result
        }
    }

    struct Twice {
        reset: bool,
    }

    #[async_trait]
    impl Interceptor for Twice {
        fn name(&self) -> &str {
            "twice"
        }

        async fn intercept(&self, ctx: &mut InvocationContext<'_>) -> Result<Value> {
            ctx.proceed().await?;
            if self.reset {
                ctx.reset();
            }
            ctx.proceed().await
        }
    }

    struct Cached;

    #[async_trait]
    impl Interceptor for Cached {
        fn name(&self) -> &str {
            "cached"
        }

        async fn intercept(&self, _ctx: &mut InvocationContext<'_>) -> Result<Value> {
            Ok(Value::from("cached"))
        }
    }

    #[derive(Debug, PartialEq)]
    struct Ticket(u32);

    struct Stamp;

    #[async_trait]
    impl Interceptor for Stamp {
        fn name(&self) -> &str {
            "stamp"
        }

        async fn intercept(&self, ctx: &mut InvocationContext<'_>) -> Result<Value> {
            ctx.data_mut().insert(Ticket(7));
            ctx.set_parameters(vec![Value::from("rewritten")]);
            ctx.proceed().await
        }
    }

    struct Check;

    #[async_trait]
    impl Interceptor for Check {
        fn name(&self) -> &str {
            "check"
        }

        async fn intercept(&self, ctx: &mut InvocationContext<'_>) -> Result<Value> {
            match ctx.data().get::<Ticket>() {
                Some(Ticket(7)) => ctx.proceed().await,
                _ => Err(InvocationError::Internal("ticket missing".into())),
            }
        }
    }

    fn chain_of(specs: Vec<Arc<dyn Interceptor>>, events: &testkit::Events) -> (ComponentDescriptor, InterceptorChain) {
        let mut builder = testkit::probe_descriptor("probe", Lifecycle::Pooled, events);
        for spec in specs {
            builder = builder.interceptor(InterceptorSpec::Custom(spec));
        }
        let descriptor = builder.build().unwrap();
        let chain = InterceptorChain::from_descriptor(&descriptor, Arc::new(DeclaredAccess));
        (descriptor, chain)
    }

    #[tokio::test]
    async fn test_chain_runs_in_declared_order() {
        let events = testkit::events();
        let (descriptor, chain) = chain_of(
            vec![
                Arc::new(Trace { name: "a", events: events.clone() }),
                Arc::new(Trace { name: "b", events: events.clone() }),
            ],
            &events,
        );
        let mut instance = testkit::probe_instance(&events);

        let ctx = InvocationContext::new(&descriptor, &chain, &mut instance, testkit::method("echo"), vec![Value::from("hi")]);
        assert_eq!(ctx.run().await.unwrap(), Value::from("hi"));
        assert_eq!(*events.lock(), vec!["a>", "b>", "call:echo", "<b", "<a"]);
    }

    #[tokio::test]
    async fn test_empty_chain_calls_business_method() {
        let events = testkit::events();
        let (descriptor, chain) = chain_of(Vec::new(), &events);
        let mut instance = testkit::probe_instance(&events);

        let ctx = InvocationContext::new(&descriptor, &chain, &mut instance, testkit::method("count"), Vec::new());
        assert_eq!(ctx.run().await.unwrap(), Value::S64(1));
    }

    #[tokio::test]
    async fn test_second_proceed_is_internal_failure() {
        let events = testkit::events();
        let (descriptor, chain) = chain_of(vec![Arc::new(Twice { reset: false })], &events);
        let mut instance = testkit::probe_instance(&events);

        let ctx = InvocationContext::new(&descriptor, &chain, &mut instance, testkit::method("count"), Vec::new());
        let err = ctx.run().await.unwrap_err();
        assert!(matches!(err, InvocationError::Internal(_)));
        assert_eq!(testkit::count(&events, "call:count"), 1);
    }

    #[tokio::test]
    async fn test_reset_allows_proceeding_again() {
        let events = testkit::events();
        let (descriptor, chain) = chain_of(vec![Arc::new(Twice { reset: true })], &events);
        let mut instance = testkit::probe_instance(&events);

        let ctx = InvocationContext::new(&descriptor, &chain, &mut instance, testkit::method("count"), Vec::new());
        assert_eq!(ctx.run().await.unwrap(), Value::S64(2));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_business_method() {
        let events = testkit::events();
        let (descriptor, chain) = chain_of(vec![Arc::new(Cached)], &events);
        let mut instance = testkit::probe_instance(&events);

        let ctx = InvocationContext::new(&descriptor, &chain, &mut instance, testkit::method("count"), Vec::new());
        assert_eq!(ctx.run().await.unwrap(), Value::from("cached"));
        assert_eq!(testkit::count(&events, "call:count"), 0);
    }

    #[tokio::test]
    async fn test_interceptors_share_data_and_parameters() {
        let events = testkit::events();
        let (descriptor, chain) = chain_of(vec![Arc::new(Stamp), Arc::new(Check)], &events);
        let mut instance = testkit::probe_instance(&events);

        let ctx = InvocationContext::new(&descriptor, &chain, &mut instance, testkit::method("echo"), vec![Value::from("original")]);
        assert_eq!(ctx.run().await.unwrap(), Value::from("rewritten"));
    }

    #[tokio::test]
    async fn test_business_failure_passes_through() {
        let events = testkit::events();
        let (descriptor, chain) = chain_of(Vec::new(), &events);
        let mut instance = testkit::probe_instance(&events);

        let ctx = InvocationContext::new(&descriptor, &chain, &mut instance, testkit::method("fail"), vec![Value::from("Declined")]);
        match ctx.run().await {
            Err(InvocationError::Business(e)) => assert_eq!(e.name, "Declined"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
