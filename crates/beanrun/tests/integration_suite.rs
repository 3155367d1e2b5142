use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use beanrun::Bean;
use beanrun::BeanError;
use beanrun::ComponentDescriptor;
use beanrun::ComponentRef;
use beanrun::Container;
use beanrun::Dispatcher;
use beanrun::Endpoint;
use beanrun::InterceptorSpec;
use beanrun::Lifecycle;
use beanrun::Peer;
use beanrun::ProxyBuilder;
use beanrun::ProxyHandle;
use beanrun::Route;
use beanrun::bean::constructor;
use beanrun::descriptor::AccessRule;
use beanrun::proxy;
use beanrun::transport::Transport;
use beanrun::transport::channel::ChannelTransport;

use beanwire::FailureKind;
use beanwire::Interface;
use beanwire::MethodSignature;
use beanwire::Value;

// --- Fixtures ---

fn calculator_interface() -> Interface {
    Interface::new("Calculator")
        .method("add", &["s64", "s64"], "s64")
        .method("add", &["s64", "s64", "s64"], "s64")
        .method("div", &["s64", "s64"], "s64")
        .method("reset", &[], "unit")
}

struct Calculator;

#[async_trait::async_trait]
impl Bean for Calculator {
    async fn invoke(&mut self, method: &MethodSignature, args: Vec<Value>) -> Result<Value, BeanError> {
        let numbers: Option<Vec<i64>> = args.iter().map(Value::as_s64).collect();
        let Some(numbers) = numbers else {
            return Err(BeanError::bad_arguments(method, &args));
        };
        match (method.name.as_str(), numbers.as_slice()) {
            ("add", values) => Ok(Value::S64(values.iter().sum())),
            ("div", [_, 0]) => Err(BeanError::new("DivideByZero", "division by zero")),
            ("div", [a, b]) => Ok(Value::S64(a / b)),
            ("reset", []) => Ok(Value::Unit),
            _ => Err(BeanError::unsupported(method)),
        }
    }
}

fn calculator() -> ComponentDescriptor {
    ComponentDescriptor::builder("calculator", Lifecycle::Pooled, calculator_interface(), constructor(|| Ok(Calculator)))
        .max(4)
        .application_error("DivideByZero")
        .access("reset", AccessRule::allow(["admin"]))
        .interceptor(InterceptorSpec::AccessControl)
        .build()
        .expect("calculator descriptor")
}

fn tally_interface() -> Interface {
    Interface::new("Tally")
        .method("bump", &[], "s64")
        .method("close", &[], "s64")
}

/// Identified bean that notices overlapping calls on the same instance.
struct Tally {
    count: i64,
    inside: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Bean for Tally {
    async fn invoke(&mut self, method: &MethodSignature, _args: Vec<Value>) -> Result<Value, BeanError> {
        if self.inside.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.count += 1;
        self.inside.fetch_sub(1, Ordering::SeqCst);

        match method.name.as_str() {
            "bump" | "close" => Ok(Value::S64(self.count)),
            _ => Err(BeanError::unsupported(method)),
        }
    }
}

struct Overlap {
    inside: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
}

fn tally(overlap: &Overlap) -> ComponentDescriptor {
    let inside = overlap.inside.clone();
    let overlaps = overlap.overlaps.clone();
    ComponentDescriptor::builder(
        "tally",
        Lifecycle::Identified,
        tally_interface(),
        constructor(move || {
            Ok(Tally {
                count: 0,
                inside: inside.clone(),
                overlaps: overlaps.clone(),
            })
        }),
    )
    .interceptor(InterceptorSpec::DiscardOnReturn {
        methods: vec!["close".into()],
    })
    .build()
    .expect("tally descriptor")
}

struct World {
    dispatcher: Arc<Dispatcher>,
    container: Arc<Container>,
    overlap: Overlap,
}

fn world() -> anyhow::Result<World> {
    let overlap = Overlap {
        inside: Arc::new(AtomicUsize::new(0)),
        overlaps: Arc::new(AtomicUsize::new(0)),
    };

    let container = Arc::new(Container::new("app"));
    container.deploy(calculator())?;
    container.deploy(tally(&overlap))?;
    container.start()?;

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register(container.clone())?;

    Ok(World {
        dispatcher,
        container,
        overlap,
    })
}

/// Serves `dispatcher` on one end of a channel and returns a peer on the other.
fn connect(dispatcher: &Arc<Dispatcher>) -> (Arc<Peer>, Arc<dyn Transport>) {
    let (client, server) = ChannelTransport::pair();
    let server: Arc<dyn Transport> = Arc::new(server);
    Endpoint::new(dispatcher.clone()).serve(server.clone());
    let peer = Peer::new("app-server", Box::new(client)).with_timeout(Duration::from_secs(5));
    (Arc::new(peer), server)
}

fn failure_kind(result: proxy::Result<Value>) -> FailureKind {
    match result {
        Err(proxy::Error::Failed(failure)) => failure.kind,
        other => panic!("expected a failure, got {:?}", other),
    }
}

// --- Test 1: Local Proxy Call ---

#[tokio::test]
async fn test_local_proxy_call() -> anyhow::Result<()> {
    let world = world()?;
    let calc = ProxyBuilder::build(
        ComponentRef::new("app", "calculator"),
        &calculator_interface(),
        Route::Local(world.dispatcher.clone()),
    )?;

    assert!(calc.is_local());
    assert_eq!(calc.call("add", vec![Value::S64(2), Value::S64(3)]).await?, Value::S64(5));
    assert_eq!(
        calc.call("add", vec![Value::S64(1), Value::S64(2), Value::S64(3)]).await?,
        Value::S64(6)
    );
    Ok(())
}

// --- Test 2: Remote Proxy Call ---

#[tokio::test]
async fn test_remote_proxy_call() -> anyhow::Result<()> {
    let world = world()?;
    let (peer, _server) = connect(&world.dispatcher);
    let calc = ProxyBuilder::build(ComponentRef::new("app", "calculator"), &calculator_interface(), Route::Remote(peer))?;

    assert!(!calc.is_local());
    assert_eq!(calc.call("div", vec![Value::S64(9), Value::S64(3)]).await?, Value::S64(3));
    Ok(())
}

// --- Test 3: Local And Remote Answers Match ---

#[tokio::test]
async fn test_local_and_remote_agree() -> anyhow::Result<()> {
    let world = world()?;
    let (peer, _server) = connect(&world.dispatcher);
    let interface = calculator_interface();
    let target = ComponentRef::new("app", "calculator");

    let local = ProxyBuilder::build(target.clone(), &interface, Route::Local(world.dispatcher.clone()))?;
    let remote = ProxyBuilder::build(target, &interface, Route::Remote(peer))?;

    let calls: Vec<(&str, Vec<Value>)> = vec![
        ("add", vec![Value::S64(4), Value::S64(5)]),
        ("div", vec![Value::S64(1), Value::S64(0)]),
        ("div", vec![Value::from("x"), Value::S64(1)]),
        ("reset", vec![]),
    ];
    for (method, args) in calls {
        let a = local.call(method, args.clone()).await;
        let b = remote.call(method, args).await;
        assert_eq!(a, b, "local and remote differ for {}", method);
    }
    Ok(())
}

// --- Test 4: Application And System Errors ---

#[tokio::test]
async fn test_error_classification() -> anyhow::Result<()> {
    let world = world()?;
    let calc = ProxyBuilder::build(
        ComponentRef::new("app", "calculator"),
        &calculator_interface(),
        Route::Local(world.dispatcher.clone()),
    )?;

    let declared = calc.call("div", vec![Value::S64(1), Value::S64(0)]).await;
    let Err(proxy::Error::Failed(failure)) = declared else {
        panic!("expected an application failure");
    };
    assert_eq!(failure.kind, FailureKind::Application);
    assert_eq!(failure.error_name.as_deref(), Some("DivideByZero"));

    let before = world.container.factory("calculator").map(|f| f.stats().destroyed);
    let undeclared = calc.call("div", vec![Value::from("x"), Value::S64(1)]).await;
    assert_eq!(failure_kind(undeclared), FailureKind::System);
    let after = world.container.factory("calculator").map(|f| f.stats().destroyed);
    assert_eq!(after, before.map(|n| n + 1));
    Ok(())
}

// --- Test 5: Access Control Over Both Routes ---

#[tokio::test]
async fn test_access_control() -> anyhow::Result<()> {
    let world = world()?;
    let (peer, _server) = connect(&world.dispatcher);
    let interface = calculator_interface();
    let target = ComponentRef::new("app", "calculator");

    let local = ProxyBuilder::build(target.clone(), &interface, Route::Local(world.dispatcher.clone()))?;
    let remote = ProxyBuilder::build(target, &interface, Route::Remote(peer))?.with_caller("guest");

    assert_eq!(failure_kind(local.call("reset", vec![]).await), FailureKind::AccessDenied);
    assert_eq!(failure_kind(remote.call("reset", vec![]).await), FailureKind::AccessDenied);
    assert_eq!(local.with_caller("admin").call("reset", vec![]).await?, Value::Unit);
    Ok(())
}

// --- Test 6: Identified Instances Serialize Concurrent Calls ---

#[tokio::test]
async fn test_identified_calls_are_serialized() -> anyhow::Result<()> {
    let world = world()?;
    let factory = world.container.factory("tally").expect("tally deployed");
    let identity = factory.new_identity().await?;

    let handle = ProxyBuilder::build(
        ComponentRef::new("app", "tally").identified(),
        &tally_interface(),
        Route::Local(world.dispatcher.clone()),
    )?
    .for_identity(identity);

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.call("bump", vec![]).await })
        })
        .collect();

    let mut seen = Vec::new();
    for call in calls {
        seen.push(call.await??.as_s64().unwrap_or_default());
    }
    seen.sort();

    assert_eq!(seen, (1..=8).collect::<Vec<i64>>());
    assert_eq!(world.overlap.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(factory.stats().created, 1);
    Ok(())
}

// --- Test 7: Discard On Return Ends The Identity ---

#[tokio::test]
async fn test_discard_on_return() -> anyhow::Result<()> {
    let world = world()?;
    let factory = world.container.factory("tally").expect("tally deployed");
    let identity = factory.new_identity().await?;
    let (peer, _server) = connect(&world.dispatcher);

    let handle = ProxyBuilder::build(
        ComponentRef::new("app", "tally").identified(),
        &tally_interface(),
        Route::Remote(peer),
    )?
    .for_identity(identity);

    assert_eq!(handle.call("bump", vec![]).await?, Value::S64(1));
    assert_eq!(handle.call("close", vec![]).await?, Value::S64(2));
    assert_eq!(factory.stats().destroyed, 1);

    // The next call gets a fresh instance for the same identity.
    assert_eq!(handle.call("bump", vec![]).await?, Value::S64(1));
    Ok(())
}

// --- Test 8: Identity Required ---

#[tokio::test]
async fn test_identified_handle_without_identity() -> anyhow::Result<()> {
    let world = world()?;
    let handle = ProxyBuilder::build(
        ComponentRef::new("app", "tally").identified(),
        &tally_interface(),
        Route::Local(world.dispatcher.clone()),
    )?;

    let result = handle.call("bump", vec![]).await;
    assert_eq!(result, Err(proxy::Error::IdentityRequired("tally".into())));
    Ok(())
}

// --- Test 9: Local-Only Components Stay Local ---

#[tokio::test]
async fn test_local_only_component() -> anyhow::Result<()> {
    let container = Arc::new(Container::new("ops"));
    container.deploy(
        ComponentDescriptor::builder(
            "admin-calculator",
            Lifecycle::Pooled,
            calculator_interface(),
            constructor(|| Ok(Calculator)),
        )
        .local_only()
        .build()?,
    )?;
    container.start()?;

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register(container)?;
    let (peer, _server) = connect(&dispatcher);

    let target = ComponentRef::new("ops", "admin-calculator");
    let interface = calculator_interface();
    let local = ProxyBuilder::build(target.clone(), &interface, Route::Local(dispatcher.clone()))?;
    let remote = ProxyBuilder::build(target, &interface, Route::Remote(peer))?;

    assert_eq!(local.call("add", vec![Value::S64(1), Value::S64(1)]).await?, Value::S64(2));
    assert_eq!(
        failure_kind(remote.call("add", vec![Value::S64(1), Value::S64(1)]).await),
        FailureKind::NotFound
    );
    Ok(())
}

// --- Test 10: Transport Loss ---

#[tokio::test]
async fn test_transport_loss_surfaces_as_transport_failure() -> anyhow::Result<()> {
    let (client, server) = ChannelTransport::pair();
    drop(server);
    let peer = Arc::new(Peer::new("gone", Box::new(client)));
    let calc: ProxyHandle =
        ProxyBuilder::build(ComponentRef::new("app", "calculator"), &calculator_interface(), Route::Remote(peer))?;

    let result = calc.call("add", vec![Value::S64(1), Value::S64(2)]).await;
    assert_eq!(failure_kind(result), FailureKind::Transport);
    Ok(())
}

// --- Test 11: Unregistered Container ---

#[tokio::test]
async fn test_unregistered_container_is_not_found() -> anyhow::Result<()> {
    let world = world()?;
    let (peer, _server) = connect(&world.dispatcher);
    let calc = ProxyBuilder::build(ComponentRef::new("nowhere", "calculator"), &calculator_interface(), Route::Remote(peer))?;

    assert_eq!(failure_kind(calc.call("add", vec![Value::S64(1), Value::S64(2)]).await), FailureKind::NotFound);

    world.dispatcher.unregister("app");
    let local = ProxyBuilder::build(
        ComponentRef::new("app", "calculator"),
        &calculator_interface(),
        Route::Local(world.dispatcher.clone()),
    )?;
    assert_eq!(failure_kind(local.call("add", vec![Value::S64(1), Value::S64(2)]).await), FailureKind::NotFound);
    Ok(())
}
