//! # Container
//!
//! A named deployment unit holding the factories of its components. The
//! dispatcher only routes to a container once it reports `Available`.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::descriptor;
use crate::descriptor::ComponentDescriptor;
use crate::factory;
use crate::factory::Collaborators;
use crate::factory::ComponentFactory;

/// Strong type for container identifiers.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Starting,
    Available,
    Stopped,
}

#[derive(Debug)]
pub enum Error {
    Duplicate { container: ContainerId, component: String },
    Descriptor(descriptor::Error),
    Factory(factory::Error),
    Stopped(ContainerId),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate { container, component } => {
                write!(f, "'{}' is already deployed in {}", component, container)
            }
            Self::Descriptor(e) => write!(f, "Descriptor error: {}", e),
            Self::Factory(e) => write!(f, "Factory error: {}", e),
            Self::Stopped(id) => write!(f, "Container {} is stopped", id),
        }
    }
}

impl std::error::Error for Error {}

impl From<descriptor::Error> for Error {
    fn from(e: descriptor::Error) -> Self {
        Self::Descriptor(e)
    }
}

impl From<factory::Error> for Error {
    fn from(e: factory::Error) -> Self {
        Self::Factory(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Container {
    id: ContainerId,
    state: RwLock<ContainerState>,
    factories: DashMap<String, Arc<ComponentFactory>>,
    config: RuntimeConfig,
    collaborators: Collaborators,
}

impl Container {
    /// Creates an empty container in the `Starting` state.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ContainerId(id.into()),
            state: RwLock::new(ContainerState::Starting),
            factories: DashMap::new(),
            config: RuntimeConfig::default(),
            collaborators: Collaborators::default(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn state(&self) -> ContainerState {
        *self.state.read()
    }

    /// Adds a component, applying any configured overrides first.
    pub fn deploy(&self, descriptor: ComponentDescriptor) -> Result<Arc<ComponentFactory>> {
        // Held until the factory is registered so `stop` cannot miss it.
        let state = self.state.read();
        if *state == ContainerState::Stopped {
            return Err(Error::Stopped(self.id.clone()));
        }

        let descriptor = match self.config.overrides(descriptor.name()) {
            Some(overrides) => descriptor.with_overrides(overrides)?,
            None => descriptor,
        };

        let name = descriptor.name().to_string();
        let entry = match self.factories.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Duplicate {
                    container: self.id.clone(),
                    component: name,
                });
            }
            Entry::Vacant(entry) => entry,
        };

        let factory = Arc::new(ComponentFactory::new(
            self.id.as_str(),
            descriptor,
            self.collaborators.clone(),
        )?);
        entry.insert(Arc::clone(&factory));
        drop(state);
        info!(container = %self.id, component = %name, "component deployed");
        Ok(factory)
    }

    pub fn factory(&self, component: &str) -> Option<Arc<ComponentFactory>> {
        self.factories.get(component).map(|entry| Arc::clone(entry.value()))
    }

    pub fn components(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Warms up every pool, then opens the container to calls. Starting an
    /// available container does nothing.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            ContainerState::Stopped => return Err(Error::Stopped(self.id.clone())),
            ContainerState::Available => return Ok(()),
            ContainerState::Starting => {}
        }
        for factory in self.all() {
            let created = factory.warm_up()?;
            if created > 0 {
                info!(container = %self.id, component = %factory.name(), created, "pool warmed up");
            }
            if factory.spawn_reaper().is_some() {
                debug!(container = %self.id, component = %factory.name(), "idle reaper started");
            }
        }
        *state = ContainerState::Available;
        drop(state);
        info!(container = %self.id, "container available");
        Ok(())
    }

    /// Refuses further calls and shuts down every component.
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == ContainerState::Stopped {
                return;
            }
            *state = ContainerState::Stopped;
        }
        for factory in self.all() {
            factory.shutdown();
        }
        warn!(container = %self.id, "container stopped");
    }

    /// Destroys expired identified instances across all components.
    pub fn sweep_expired(&self) -> usize {
        self.all().iter().map(|factory| factory.sweep_expired()).sum()
    }

    fn all(&self) -> Vec<Arc<ComponentFactory>> {
        self.factories.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("components", &self.components())
            .finish()
    }
}
