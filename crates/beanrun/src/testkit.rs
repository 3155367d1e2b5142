//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use beanwire::Interface;
use beanwire::MethodSignature;
use beanwire::Value;

use crate::bean::Bean;
use crate::bean::BeanError;
use crate::bean::BoxError;
use crate::bean::Lifecycle as Callbacks;
use crate::bean::constructor;
use crate::descriptor::DescriptorBuilder;
use crate::descriptor::Lifecycle;
use crate::pool::Instance;
use crate::pool::InstanceId;
use crate::security;

pub type Events = Arc<Mutex<Vec<String>>>;

pub fn events() -> Events {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn probe_interface() -> Interface {
    Interface::new("Probe")
        .method("echo", &["string"], "string")
        .method("whoami", &[], "string")
        .method("fail", &["string"], "unit")
        .method("count", &[], "s64")
        .method("slow", &["u64"], "unit")
        .method("remove", &[], "unit")
        .method("expire", &[], "unit")
}

/// Test bean that records what happens to it.
pub struct Probe {
    events: Events,
    calls: i64,
}

impl Probe {
    pub fn new(events: Events) -> Self {
        Self { events, calls: 0 }
    }
}

#[async_trait::async_trait]
impl Bean for Probe {
    async fn invoke(&mut self, method: &MethodSignature, args: Vec<Value>) -> Result<Value, BeanError> {
        self.events.lock().push(format!("call:{}", method.name));
        match (method.name.as_str(), args.as_slice()) {
            ("echo", [value]) => Ok(value.clone()),
            ("whoami", []) => Ok(Value::from(security::current().name())),
            ("fail", [Value::String(name)]) => Err(BeanError::new(name.as_str(), "requested failure")),
            ("count", []) => {
                self.calls += 1;
                Ok(Value::S64(self.calls))
            }
            ("slow", [Value::U64(ms)]) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(Value::Unit)
            }
            ("remove", []) | ("expire", []) => Ok(Value::Unit),
            (_, args) if method.arity() != args.len() => Err(BeanError::bad_arguments(method, args)),
            _ => Err(BeanError::unsupported(method)),
        }
    }

    fn lifecycle(&mut self) -> Option<&mut dyn Callbacks> {
        Some(self)
    }
}

impl Callbacks for Probe {
    fn post_construct(&mut self) -> Result<(), BoxError> {
        self.events.lock().push("post-construct".into());
        Ok(())
    }

    fn pre_destroy(&mut self) -> Result<(), BoxError> {
        self.events.lock().push("pre-destroy".into());
        Ok(())
    }
}

pub fn probe_descriptor(name: &str, lifecycle: Lifecycle, events: &Events) -> DescriptorBuilder {
    let events = events.clone();
    DescriptorBuilder::new(
        name,
        lifecycle,
        probe_interface(),
        constructor(move || Ok(Probe::new(events.clone()))),
    )
    .application_error("Declined")
}

pub fn probe_instance(events: &Events) -> Instance {
    Instance::new(InstanceId(1), Box::new(Probe::new(events.clone())), None)
}

pub fn method(name: &str) -> Arc<MethodSignature> {
    let interface = probe_interface();
    let found = interface.find(name).cloned().unwrap_or_else(|| panic!("no method {}", name));
    Arc::new(found)
}

pub fn count(events: &Events, event: &str) -> usize {
    events.lock().iter().filter(|e| e.as_str() == event).count()
}
