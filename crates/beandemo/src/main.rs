//! Deploys a pooled calculator and an identified shopping cart, then calls
//! both through a local proxy and through a remote proxy on an in-memory
//! channel.
//!
//! Usage: `beandemo [config.toml]`. Set `BEANRUN_LOG=debug` for call traces.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing::warn;

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
use beanrun::Route;
use beanrun::bean::constructor;
use beanrun::config::RuntimeConfig;
use beanrun::descriptor::AccessRule;
use beanrun::telemetry;
use beanrun::transport::Transport;
use beanrun::transport::channel::ChannelTransport;

use beanwire::Interface;
use beanwire::MethodSignature;
use beanwire::Value;

const CONTAINER: &str = "shop";

fn calculator_interface() -> Interface {
    Interface::new("Calculator")
        .method("add", &["s64", "s64"], "s64")
        .method("div", &["s64", "s64"], "s64")
}

struct Calculator;

#[async_trait::async_trait]
impl Bean for Calculator {
    async fn invoke(&mut self, method: &MethodSignature, args: Vec<Value>) -> Result<Value, BeanError> {
        match (method.name.as_str(), args.as_slice()) {
            ("add", [Value::S64(a), Value::S64(b)]) => Ok(Value::S64(a + b)),
            ("div", [Value::S64(_), Value::S64(0)]) => Err(BeanError::new("DivideByZero", "cannot divide by zero")),
            ("div", [Value::S64(a), Value::S64(b)]) => Ok(Value::S64(a / b)),
            _ => Err(BeanError::bad_arguments(method, &args)),
        }
    }
}

fn cart_interface() -> Interface {
    Interface::new("Cart")
        .method("add", &["string"], "u64")
        .method("items", &[], "list")
        .method("checkout", &[], "list")
}

#[derive(Default)]
struct Cart {
    items: Vec<String>,
}

#[async_trait::async_trait]
impl Bean for Cart {
    async fn invoke(&mut self, method: &MethodSignature, args: Vec<Value>) -> Result<Value, BeanError> {
        match (method.name.as_str(), args.as_slice()) {
            ("add", [Value::String(item)]) => {
                self.items.push(item.clone());
                Ok(Value::U64(self.items.len() as u64))
            }
            ("items", []) | ("checkout", []) => {
                Ok(Value::List(self.items.iter().cloned().map(Value::String).collect()))
            }
            _ => Err(BeanError::bad_arguments(method, &args)),
        }
    }
}

fn deploy(config: RuntimeConfig) -> anyhow::Result<Arc<Container>> {
    let container = Arc::new(Container::new(CONTAINER).with_config(config));

    container.deploy(
        ComponentDescriptor::builder("calculator", Lifecycle::Pooled, calculator_interface(), constructor(|| Ok(Calculator)))
            .max(4)
            .application_error("DivideByZero")
            .access("div", AccessRule::deny(["guest"]))
            .interceptor(InterceptorSpec::AccessControl)
            .build()?,
    )?;

    container.deploy(
        ComponentDescriptor::builder("cart", Lifecycle::Identified, cart_interface(), constructor(|| Ok(Cart::default())))
            .idle_timeout(Duration::from_secs(600))
            .interceptor(InterceptorSpec::DiscardOnReturn {
                methods: vec!["checkout".into()],
            })
            .build()?,
    )?;

    container.start()?;
    Ok(container)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => RuntimeConfig::default(),
    };
    telemetry::init(&config.logging);

    let dispatcher = Arc::new(Dispatcher::from_config(&config));
    let call_timeout = config.remote.call_timeout();
    let container = deploy(config)?;
    dispatcher.register(container.clone())?;
    info!(components = ?container.components(), "container ready");

    // Remote side: an endpoint serving the dispatcher over an in-memory channel.
    let (client, server) = ChannelTransport::pair();
    let server: Arc<dyn Transport> = Arc::new(server);
    let endpoint = Endpoint::new(dispatcher.clone()).serve(server);
    let peer = Arc::new(Peer::new(CONTAINER, Box::new(client)).with_timeout(call_timeout));

    let calculator = ComponentRef::new(CONTAINER, "calculator");
    let local = ProxyBuilder::build(calculator.clone(), &calculator_interface(), Route::Local(dispatcher.clone()))?;
    let remote = ProxyBuilder::build(calculator, &calculator_interface(), Route::Remote(peer.clone()))?;

    let sum = local.call("add", vec![Value::S64(40), Value::S64(2)]).await?;
    info!(?sum, "local add");
    let quotient = remote.call("div", vec![Value::S64(84), Value::S64(2)]).await?;
    info!(?quotient, "remote div");

    if let Err(e) = remote.call("div", vec![Value::S64(1), Value::S64(0)]).await {
        warn!(error = %e, "remote div by zero");
    }
    if let Err(e) = remote.clone().with_caller("guest").call("div", vec![Value::S64(4), Value::S64(2)]).await {
        warn!(error = %e, "guest div");
    }

    let carts = container.factory("cart").context("cart is not deployed")?;
    let identity = carts.new_identity().await?;
    let cart = ProxyBuilder::build(
        ComponentRef::new(CONTAINER, "cart").identified(),
        &cart_interface(),
        Route::Remote(peer),
    )?
    .for_identity(identity.clone());

    cart.call("add", vec![Value::from("apples")]).await?;
    cart.call("add", vec![Value::from("pears")]).await?;
    let order = cart.call("checkout", vec![]).await?;
    info!(%identity, ?order, stats = ?carts.stats(), "checked out");

    dispatcher.unregister(CONTAINER);
    endpoint.abort();
    Ok(())
}
